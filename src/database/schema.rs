//! Canonical metadata table layouts.
//!
//! Every component that builds SQL or decodes result rows shares these
//! layouts. Column positions are load-bearing: the snapshot feature
//! persists rows as positional tuples keyed by these exact indices, so an
//! existing column must never move or disappear. New columns may only be
//! appended at the end.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// The ordered column layout of one table (or query projection).
#[derive(Debug)]
pub struct TableLayout {
    table: &'static str,
    /// Alias-qualified column names, e.g. `nf.file_id`.
    columns: &'static [&'static str],
}

impl TableLayout {
    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The qualified name of the column at `index`.
    pub fn qualified_name(&self, index: usize) -> Option<&'static str> {
        self.columns.get(index).copied()
    }

    /// The bare (alias-stripped) name of the column at `index`.
    pub fn column_name(&self, index: usize) -> Option<&'static str> {
        self.columns.get(index).map(|c| strip_alias(c))
    }

    /// The index of a column, by qualified or bare name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| *c == name || strip_alias(c) == name)
    }

    fn joined(&self, substitute: Option<(&str, String)>, qualified: bool) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let name = match &substitute {
                    Some((from, to)) if c == from => to.clone(),
                    _ => c.to_string(),
                };
                if qualified {
                    name
                } else {
                    strip_alias(&name).to_string()
                }
            })
            .collect();
        cols.join(", ")
    }
}

fn strip_alias(column: &str) -> &str {
    match column.split_once('.') {
        Some((_, bare)) => bare,
        None => column,
    }
}

pub const FILES: TableLayout = TableLayout {
    table: "ngas_files",
    columns: &[
        "nf.disk_id",
        "nf.file_name",
        "nf.file_id",
        "nf.file_version",
        "nf.format",
        "nf.file_size",
        "nf.uncompressed_file_size",
        "nf.compression",
        "nf.ingestion_date",
        "nf.file_ignore",
        "nf.checksum",
        "nf.checksum_plugin",
        "nf.file_status",
        "nf.creation_date",
        "nf.io_time",
        "nf.ingestion_rate",
        "nf.container_id",
    ],
};

/// Symbolic indices into the files layout.
pub mod files {
    pub const DISK_ID: usize = 0;
    pub const FILE_NAME: usize = 1;
    pub const FILE_ID: usize = 2;
    pub const FILE_VERSION: usize = 3;
    pub const FORMAT: usize = 4;
    pub const FILE_SIZE: usize = 5;
    pub const UNCOMPRESSED_FILE_SIZE: usize = 6;
    pub const COMPRESSION: usize = 7;
    pub const INGESTION_DATE: usize = 8;
    pub const FILE_IGNORE: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const CHECKSUM_PLUGIN: usize = 11;
    pub const FILE_STATUS: usize = 12;
    pub const CREATION_DATE: usize = 13;
    pub const IO_TIME: usize = 14;
    pub const INGESTION_RATE: usize = 15;
    pub const CONTAINER_ID: usize = 16;
}

pub const DISKS: TableLayout = TableLayout {
    table: "ngas_disks",
    columns: &[
        "nd.disk_id",
        "nd.archive",
        "nd.logical_name",
        "nd.host_id",
        "nd.slot_id",
        "nd.mounted",
        "nd.mount_point",
        "nd.number_of_files",
        "nd.available_mb",
        "nd.bytes_stored",
        "nd.type",
        "nd.capacity_mb",
        "nd.manufacturer",
        "nd.installation_date",
        "nd.checksum",
        "nd.total_disk_write_time",
        "nd.completed",
        "nd.completion_date",
        "nd.last_check",
        "nd.last_host_id",
    ],
};

/// Symbolic indices into the disks layout.
pub mod disks {
    pub const DISK_ID: usize = 0;
    pub const ARCHIVE: usize = 1;
    pub const LOGICAL_NAME: usize = 2;
    pub const HOST_ID: usize = 3;
    pub const SLOT_ID: usize = 4;
    pub const MOUNTED: usize = 5;
    pub const MOUNT_POINT: usize = 6;
    pub const NUMBER_OF_FILES: usize = 7;
    pub const AVAILABLE_MB: usize = 8;
    pub const BYTES_STORED: usize = 9;
    pub const TYPE: usize = 10;
    pub const CAPACITY_MB: usize = 11;
    pub const MANUFACTURER: usize = 12;
    pub const INSTALLATION_DATE: usize = 13;
    pub const CHECKSUM: usize = 14;
    pub const TOTAL_DISK_WRITE_TIME: usize = 15;
    pub const COMPLETED: usize = 16;
    pub const COMPLETION_DATE: usize = 17;
    pub const LAST_CHECK: usize = 18;
    pub const LAST_HOST_ID: usize = 19;
}

pub const HOSTS: TableLayout = TableLayout {
    table: "ngas_hosts",
    columns: &[
        "nh.host_id",
        "nh.domain",
        "nh.ip_address",
        "nh.mac_address",
        "nh.n_slots",
        "nh.cluster_name",
        "nh.installation_date",
        "nh.srv_version",
        "nh.srv_port",
        "nh.srv_archive",
        "nh.srv_retrieve",
        "nh.srv_process",
        "nh.srv_remove",
        "nh.srv_data_checking",
        "nh.srv_state",
        "nh.srv_suspended",
        "nh.srv_req_wake_up_srv",
        "nh.srv_req_wake_up_time",
    ],
};

/// Symbolic indices into the hosts layout.
pub mod hosts {
    pub const HOST_ID: usize = 0;
    pub const DOMAIN: usize = 1;
    pub const IP_ADDRESS: usize = 2;
    pub const MAC_ADDRESS: usize = 3;
    pub const N_SLOTS: usize = 4;
    pub const CLUSTER_NAME: usize = 5;
    pub const INSTALLATION_DATE: usize = 6;
    pub const SRV_VERSION: usize = 7;
    pub const SRV_PORT: usize = 8;
    pub const SRV_ARCHIVE: usize = 9;
    pub const SRV_RETRIEVE: usize = 10;
    pub const SRV_PROCESS: usize = 11;
    pub const SRV_REMOVE: usize = 12;
    pub const SRV_DATA_CHECKING: usize = 13;
    pub const SRV_STATE: usize = 14;
    pub const SRV_SUSPENDED: usize = 15;
    pub const SRV_REQ_WAKE_UP_SRV: usize = 16;
    pub const SRV_REQ_WAKE_UP_TIME: usize = 17;
}

pub const SUBSCRIBERS: TableLayout = TableLayout {
    table: "ngas_subscribers",
    columns: &[
        "ns.host_id",
        "ns.srv_port",
        "ns.subscr_prio",
        "ns.subscr_id",
        "ns.subscr_url",
        "ns.subscr_start_date",
        "ns.subscr_filter_plugin",
        "ns.subscr_filter_plugin_pars",
        "ns.last_file_ingestion_date",
        "ns.concurrent_threads",
    ],
};

/// Symbolic indices into the subscribers layout.
pub mod subscribers {
    pub const HOST_ID: usize = 0;
    pub const SRV_PORT: usize = 1;
    pub const PRIORITY: usize = 2;
    pub const ID: usize = 3;
    pub const URL: usize = 4;
    pub const START_DATE: usize = 5;
    pub const FILTER_PLUGIN: usize = 6;
    pub const FILTER_PLUGIN_PARS: usize = 7;
    pub const LAST_INGESTION_DATE: usize = 8;
    pub const CONCURRENT_THREADS: usize = 9;
}

pub const MIRRORING_QUEUE: TableLayout = TableLayout {
    table: "ngas_mirroring_queue",
    columns: &[
        "mq.instance_id",
        "mq.file_id",
        "mq.file_version",
        "mq.ingestion_date",
        "mq.srv_list_id",
        "mq.xml_file_info",
        "mq.status",
        "mq.message",
        "mq.last_activity_time",
        "mq.scheduling_time",
    ],
};

/// Symbolic indices into the mirroring-queue layout.
pub mod mirroring_queue {
    pub const INSTANCE_ID: usize = 0;
    pub const FILE_ID: usize = 1;
    pub const FILE_VERSION: usize = 2;
    pub const INGESTION_DATE: usize = 3;
    pub const SRV_LIST_ID: usize = 4;
    pub const XML_FILE_INFO: usize = 5;
    pub const STATUS: usize = 6;
    pub const MESSAGE: usize = 7;
    pub const LAST_ACTIVITY_TIME: usize = 8;
    pub const SCHEDULING_TIME: usize = 9;
}

/// Projection used by full-archive consistency scans (files joined with
/// their hosting disks).
pub const SUMMARY1: TableLayout = TableLayout {
    table: "summary1",
    columns: &[
        "nd.slot_id",
        "nd.mount_point",
        "nf.file_name",
        "nf.checksum",
        "nf.checksum_plugin",
        "nf.file_id",
        "nf.file_version",
        "nf.file_size",
        "nf.file_status",
        "nd.disk_id",
        "nf.file_ignore",
        "nd.host_id",
    ],
};

/// Symbolic indices into the Summary 1 projection.
pub mod summary1 {
    pub const SLOT_ID: usize = 0;
    pub const MOUNT_POINT: usize = 1;
    pub const FILE_NAME: usize = 2;
    pub const CHECKSUM: usize = 3;
    pub const CHECKSUM_PLUGIN: usize = 4;
    pub const FILE_ID: usize = 5;
    pub const FILE_VERSION: usize = 6;
    pub const FILE_SIZE: usize = 7;
    pub const FILE_STATUS: usize = 8;
    pub const DISK_ID: usize = 9;
    pub const FILE_IGNORE: usize = 10;
    pub const HOST_ID: usize = 11;
}

/// Projection used when listing retrievable files.
pub const SUMMARY2: TableLayout = TableLayout {
    table: "summary2",
    columns: &[
        "nf.file_id",
        "nd.mount_point",
        "nf.file_name",
        "nf.file_version",
        "nf.ingestion_date",
        "nf.format",
        "nd.disk_id",
    ],
};

/// Symbolic indices into the Summary 2 projection.
pub mod summary2 {
    pub const FILE_ID: usize = 0;
    pub const MOUNT_POINT: usize = 1;
    pub const FILE_NAME: usize = 2;
    pub const FILE_VERSION: usize = 3;
    pub const INGESTION_DATE: usize = 4;
    pub const FORMAT: usize = 5;
    pub const DISK_ID: usize = 6;
}

lazy_static! {
    static ref FILES_NAME_MAP: HashMap<&'static str, usize> = build_name_map(&FILES);
}

fn build_name_map(layout: &TableLayout) -> HashMap<&'static str, usize> {
    layout
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| (strip_alias(c), i))
        .collect()
}

/// Resolves the historically ambiguous ignore-column name and renders the
/// shared column lists.
///
/// Some combinations of old server versions and database engines named the
/// same files-table field `ignore` instead of `file_ignore`. The active
/// physical name comes from configuration and is substituted wherever the
/// column appears in generated SQL; the symbolic index is unaffected.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    file_ignore_column: &'static str,
}

impl SchemaCatalog {
    pub fn new(use_file_ignore: bool) -> Self {
        Self {
            file_ignore_column: if use_file_ignore { "file_ignore" } else { "ignore" },
        }
    }

    pub fn file_ignore_column(&self) -> &'static str {
        self.file_ignore_column
    }

    fn ignore_substitution(&self) -> Option<(&'static str, String)> {
        Some(("nf.file_ignore", format!("nf.{}", self.file_ignore_column)))
    }

    pub fn files_columns(&self) -> String {
        FILES.joined(self.ignore_substitution(), true)
    }

    /// Files columns without the `nf.` alias, for INSERT column lists.
    pub fn files_columns_unqualified(&self) -> String {
        FILES.joined(self.ignore_substitution(), false)
    }

    pub fn disks_columns(&self) -> String {
        DISKS.joined(None, true)
    }

    pub fn hosts_columns(&self) -> String {
        HOSTS.joined(None, true)
    }

    pub fn subscribers_columns(&self) -> String {
        SUBSCRIBERS.joined(None, true)
    }

    pub fn mirroring_queue_columns(&self) -> String {
        MIRRORING_QUEUE.joined(None, true)
    }

    /// Mirroring-queue columns without the `mq.` alias.
    pub fn mirroring_queue_columns_unqualified(&self) -> String {
        MIRRORING_QUEUE.joined(None, false)
    }

    pub fn summary1_columns(&self) -> String {
        SUMMARY1.joined(self.ignore_substitution(), true)
    }

    pub fn summary2_columns(&self) -> String {
        SUMMARY2.joined(None, true)
    }

    /// Name→index lookup for the files table, accepting either physical
    /// name of the ignore column.
    pub fn files_index_of(&self, name: &str) -> Option<usize> {
        if name == self.file_ignore_column || name == "file_ignore" {
            return Some(files::FILE_IGNORE);
        }
        FILES_NAME_MAP.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_index_stable() {
        // Guards the snapshot compatibility contract: repeated catalog
        // constructions must agree on existing column positions.
        for _ in 0..3 {
            let catalog = SchemaCatalog::new(true);
            assert_eq!(FILES.index_of("nf.file_id"), Some(files::FILE_ID));
            assert_eq!(catalog.files_index_of("file_id"), Some(2));
        }
        assert_eq!(files::FILE_ID, 2);
        assert_eq!(files::FILE_VERSION, 3);
        assert_eq!(files::CONTAINER_ID, FILES.len() - 1);
    }

    #[test]
    fn test_ignore_column_substitution() {
        let legacy = SchemaCatalog::new(false);
        assert!(legacy.files_columns().contains("nf.ignore"));
        assert!(!legacy.files_columns().contains("nf.file_ignore"));
        assert!(legacy.summary1_columns().contains("nf.ignore"));

        let current = SchemaCatalog::new(true);
        assert!(current.files_columns().contains("nf.file_ignore"));
        assert_eq!(current.files_index_of("ignore"), None);
        assert_eq!(legacy.files_index_of("ignore"), Some(files::FILE_IGNORE));
    }

    #[test]
    fn test_unqualified_columns() {
        let catalog = SchemaCatalog::new(true);
        let cols = catalog.files_columns_unqualified();
        assert!(cols.starts_with("disk_id, file_name, file_id"));
        assert!(!cols.contains("nf."));
    }

    #[test]
    fn test_layout_maps_roundtrip() {
        for layout in [&FILES, &DISKS, &HOSTS, &SUBSCRIBERS, &MIRRORING_QUEUE] {
            for i in 0..layout.len() {
                let name = layout.column_name(i).unwrap();
                assert_eq!(layout.index_of(name), Some(i), "{} col {}", layout.table(), name);
            }
        }
    }
}
