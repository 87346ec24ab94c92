//! CLI command implementations.
//!
//! | Module    | Commands handled                           |
//! |-----------|--------------------------------------------|
//! | `serve`   | `Serve`                                    |
//! | `jobs`    | `Analyze`, `Status`, `Approve`, `Jobs`     |
//! | `config`  | `Config`                                   |

pub mod config;
pub mod jobs;
pub mod serve;

use std::sync::Arc;

use anyhow::{Context, Result};

use bugsniper::analysis::generator;
use bugsniper::bugsniper_config::BugsniperConfig;
use bugsniper::jobs::db::{DbHandle, JobDb};
use bugsniper::jobs::dispatcher::{DispatchConfig, Dispatcher};
use bugsniper::testing::PytestAdapter;
use bugsniper::workspace::{GitSnapshotProvider, WorkspaceManager};

pub use config::cmd_config;
pub use jobs::{cmd_analyze, cmd_approve, cmd_jobs, cmd_status};
pub use serve::cmd_serve;

/// Open the job database named by the configuration.
pub fn open_db(config: &BugsniperConfig) -> Result<DbHandle> {
    let path = config.db_path();
    let db = JobDb::new(&path)
        .with_context(|| format!("Failed to open job database at {}", path.display()))?;
    Ok(DbHandle::new(db))
}

/// Wire a dispatcher with the production collaborators.
pub fn build_dispatcher(config: &BugsniperConfig, db: DbHandle) -> Result<Arc<Dispatcher>> {
    let toml = &config.toml;
    let text_generator = generator::from_config(&toml.generator)?;
    tracing::debug!(generator = text_generator.name(), "generator ready");

    let dispatch = DispatchConfig {
        generator_timeout: toml.generator.timeout(),
        test_timeout: toml.tests.task_timeout(),
        validate_patches: toml.tests.validate_patches,
        prompt_limits: toml.generator.prompt_limits(),
    };

    Ok(Arc::new(Dispatcher::new(
        db,
        WorkspaceManager::new(toml.workspace.root()),
        Arc::new(GitSnapshotProvider),
        text_generator,
        Arc::new(PytestAdapter::new(toml.tests.clone())),
        dispatch,
    )))
}
