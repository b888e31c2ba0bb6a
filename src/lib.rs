#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

//! Storage and database core of a scientific-data archive server.
//!
//! Incoming files are written to a staging area on the target volume,
//! registered in the metadata database, then promoted to their final
//! archive path. [`Archive`] wires the pieces together; each piece is also
//! usable on its own.

pub mod backlog;
pub mod config;
pub mod database;
mod error;
pub mod model;
pub mod resources;
pub mod staging;
pub mod testing;
pub mod version;

use std::sync::Arc;

use backlog::BackLogPolicy;
use config::Config;
use database::driver::DbDriver;
use database::Database;
use resources::DiskResources;
use staging::StagingManager;

pub use error::{ArchiveError, ArchiveResult};

/// The archive core.
#[derive(Debug)]
pub struct Archive {
    /// The configuration.
    config: Config,

    /// Handle to the metadata database.
    database: Database,

    /// Write-access serialization for mutexed storage sets.
    resources: DiskResources,

    /// Staging-area management.
    staging: StagingManager,

    /// Disposition of failed ingests.
    back_log: BackLogPolicy,
}

impl Archive {
    pub fn new(config: Config, driver: Arc<dyn DbDriver>) -> Self {
        let database = Database::new(driver, &config.database);
        let resources = DiskResources::new(&config.storage_sets);
        let staging = StagingManager::new(config.mime_types.clone());
        let back_log = BackLogPolicy::new(&config.back_log);

        Self {
            config,
            database,
            resources,
            staging,
            back_log,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn resources(&self) -> &DiskResources {
        &self.resources
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    pub fn back_log(&self) -> &BackLogPolicy {
        &self.back_log
    }

    /// Shuts down the database pool.
    pub async fn close(&self) {
        self.database.close().await;
    }
}
