//! Archive configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Configuration for the archive core.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Database connection.
    pub database: DatabaseConfig,

    /// Storage-set definitions.
    ///
    /// Each set pairs a Main disk slot with an optional Replication slot;
    /// the pair hosts one logical copy-pair of archived files.
    #[serde(rename = "storage-sets")]
    #[serde(default = "Vec::new")]
    pub storage_sets: Vec<StorageSetConfig>,

    /// Back-log buffering of failed ingests.
    #[serde(rename = "back-log")]
    #[serde(default = "Default::default")]
    pub back_log: BackLogConfig,

    /// Mime-type to filename-extension mappings.
    #[serde(rename = "mime-types")]
    #[serde(default = "Vec::new")]
    pub mime_types: Vec<MimeTypeMapping>,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum number of pooled connections.
    #[serde(rename = "max-connections")]
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Statements executed once on every new physical connection, for
    /// session-level settings.
    #[serde(rename = "session-sql")]
    #[serde(default = "Vec::new")]
    pub session_sql: Vec<String>,

    /// Whether the files table names its ignore column `file_ignore`
    /// (current) or `ignore` (legacy installations).
    #[serde(rename = "use-file-ignore")]
    #[serde(default = "default_use_file_ignore")]
    pub use_file_ignore: bool,

    /// Whether to bind parameters through prepared statements.
    ///
    /// Disable only for drivers or tests that cannot bind parameters;
    /// the fallback renders values into the SQL text unescaped.
    #[serde(rename = "prepared-statements")]
    #[serde(default = "default_prepared_statements")]
    pub prepared_statements: bool,
}

/// One storage set.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSetConfig {
    /// Slot ID of the Main disk.
    #[serde(rename = "main-slot")]
    pub main_slot: String,

    /// Slot ID of the Replication disk, if the set replicates.
    #[serde(rename = "replication-slot")]
    #[serde(default)]
    pub replication_slot: Option<String>,

    /// Whether write access to this set's disks must be serialized.
    #[serde(default)]
    pub mutex: bool,
}

/// Back-log buffering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackLogConfig {
    /// Whether qualifying failed ingests are buffered for later retry
    /// instead of discarded.
    #[serde(default)]
    pub enabled: bool,

    /// Directory holding buffered data files and their request contexts.
    #[serde(default = "default_back_log_directory")]
    pub directory: PathBuf,
}

/// Maps a mime-type to the filename extension it implies.
#[derive(Debug, Clone, Deserialize)]
pub struct MimeTypeMapping {
    #[serde(rename = "mime-type")]
    pub mime_type: String,
    pub extension: String,
}

impl Default for BackLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_back_log_directory(),
        }
    }
}

fn default_max_connections() -> usize {
    6
}

fn default_use_file_ignore() -> bool {
    true
}

fn default_prepared_statements() -> bool {
    true
}

fn default_back_log_directory() -> PathBuf {
    PathBuf::from("back-log")
}

pub fn load_config_from_path(path: &Path) -> Config {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path).expect("Failed to read configuration file");
    toml::from_str(&config).expect("Invalid configuration file")
}

pub fn load_config_from_str(s: &str) -> Config {
    toml::from_str(s).expect("Invalid configuration file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = load_config_from_str(
            r#"
            [database]

            [[storage-sets]]
            main-slot = "slot-1"
            replication-slot = "slot-2"
            mutex = true
            "#,
        );

        assert_eq!(config.database.max_connections, 6);
        assert!(config.database.use_file_ignore);
        assert!(config.database.prepared_statements);
        assert!(!config.back_log.enabled);
        assert_eq!(config.storage_sets.len(), 1);
        assert_eq!(
            config.storage_sets[0].replication_slot.as_deref(),
            Some("slot-2")
        );
    }

    #[test]
    fn test_full_config() {
        let config = load_config_from_str(
            r#"
            [database]
            max-connections = 2
            session-sql = ["SET search_path TO archive"]
            use-file-ignore = false
            prepared-statements = false

            [back-log]
            enabled = true
            directory = "/srv/archive/back-log"

            [[mime-types]]
            mime-type = "application/x-cfits"
            extension = "fits"
            "#,
        );

        assert_eq!(config.database.max_connections, 2);
        assert!(!config.database.use_file_ignore);
        assert!(config.back_log.enabled);
        assert_eq!(config.mime_types[0].extension, "fits");
    }
}
