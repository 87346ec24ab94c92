//! Job lifecycle: persistence, the concurrent dispatcher, approval and the
//! HTTP surface.

pub mod api;
pub mod approval;
pub mod db;
pub mod dispatcher;
pub mod github;
pub mod models;
pub mod server;
