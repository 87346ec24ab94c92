pub mod analysis;
pub mod bugsniper_config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod testing;
pub mod util;
pub mod workspace;
