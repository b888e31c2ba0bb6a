//! Archive metadata records.
//!
//! Row packing and unpacking is keyed by the positional indices published
//! in [`crate::database::schema`]; see the append-only note there.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::driver::{SqlRow, SqlValue};
use crate::database::schema::{self, files};
use crate::error::{ArchiveError, ArchiveResult};

/// File is archived and healthy.
pub const FILE_STATUS_OK: &str = "00000000";

/// A consistency check of the file is in progress.
pub const FILE_STATUS_CHECK_ACTIVE: &str = "01000000";

const ISO8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Renders a timestamp the way the metadata tables store them.
pub fn to_iso8601(t: DateTime<Utc>) -> String {
    t.format(ISO8601_FORMAT).to_string()
}

/// Parses a stored timestamp.
pub fn from_iso8601(s: &str) -> ArchiveResult<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, ISO8601_FORMAT).map_err(|e| {
        ArchiveError::DatabaseError(anyhow::anyhow!("bad timestamp {:?}: {}", s, e))
    })?;
    Ok(naive.and_utc())
}

/// One row of the files table.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub disk_id: String,
    pub file_name: String,
    pub file_id: String,
    pub file_version: u32,
    pub format: String,
    pub file_size: u64,
    pub uncompressed_file_size: u64,
    pub compression: Option<String>,
    pub ingestion_date: Option<DateTime<Utc>>,
    pub ignore: bool,
    pub checksum: Option<String>,
    pub checksum_plugin: Option<String>,
    pub file_status: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub io_time: f64,
    pub ingestion_rate: Option<f64>,
    pub container_id: Option<String>,
}

impl FileRecord {
    /// Packs the record positionally, per the files layout.
    pub fn to_row(&self) -> SqlRow {
        let mut row = vec![SqlValue::Null; schema::FILES.len()];
        row[files::DISK_ID] = SqlValue::Text(self.disk_id.clone());
        row[files::FILE_NAME] = SqlValue::Text(self.file_name.clone());
        row[files::FILE_ID] = SqlValue::Text(self.file_id.clone());
        row[files::FILE_VERSION] = SqlValue::Int(self.file_version as i64);
        row[files::FORMAT] = SqlValue::Text(self.format.clone());
        row[files::FILE_SIZE] = SqlValue::Int(self.file_size as i64);
        row[files::UNCOMPRESSED_FILE_SIZE] = SqlValue::Int(self.uncompressed_file_size as i64);
        row[files::COMPRESSION] = opt_text(&self.compression);
        row[files::INGESTION_DATE] = opt_timestamp(&self.ingestion_date);
        row[files::FILE_IGNORE] = SqlValue::Int(self.ignore as i64);
        row[files::CHECKSUM] = opt_text(&self.checksum);
        row[files::CHECKSUM_PLUGIN] = opt_text(&self.checksum_plugin);
        row[files::FILE_STATUS] = SqlValue::Text(self.file_status.clone());
        row[files::CREATION_DATE] = opt_timestamp(&self.creation_date);
        row[files::IO_TIME] = SqlValue::Float(self.io_time);
        row[files::INGESTION_RATE] = match self.ingestion_rate {
            Some(rate) => SqlValue::Float(rate),
            None => SqlValue::Null,
        };
        row[files::CONTAINER_ID] = opt_text(&self.container_id);
        row
    }

    /// Unpacks a row selected with the files column list.
    pub fn from_row(row: &SqlRow) -> ArchiveResult<Self> {
        if row.len() < schema::FILES.len() {
            return Err(ArchiveError::DatabaseError(anyhow::anyhow!(
                "files row has {} columns, expected {}",
                row.len(),
                schema::FILES.len()
            )));
        }
        Ok(Self {
            disk_id: get_text(row, files::DISK_ID)?,
            file_name: get_text(row, files::FILE_NAME)?,
            file_id: get_text(row, files::FILE_ID)?,
            file_version: get_int(row, files::FILE_VERSION)? as u32,
            format: get_text(row, files::FORMAT)?,
            file_size: get_int(row, files::FILE_SIZE)? as u64,
            uncompressed_file_size: get_int(row, files::UNCOMPRESSED_FILE_SIZE)? as u64,
            compression: get_opt_text(row, files::COMPRESSION),
            ingestion_date: get_opt_timestamp(row, files::INGESTION_DATE)?,
            ignore: get_int(row, files::FILE_IGNORE)? != 0,
            checksum: get_opt_text(row, files::CHECKSUM),
            checksum_plugin: get_opt_text(row, files::CHECKSUM_PLUGIN),
            file_status: get_text(row, files::FILE_STATUS)?,
            creation_date: get_opt_timestamp(row, files::CREATION_DATE)?,
            io_time: get_float(row, files::IO_TIME)?,
            ingestion_rate: match row.get(files::INGESTION_RATE) {
                Some(SqlValue::Float(rate)) => Some(*rate),
                Some(SqlValue::Int(rate)) => Some(*rate as f64),
                _ => None,
            },
            container_id: get_opt_text(row, files::CONTAINER_ID),
        })
    }
}

/// One row of the disks table.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskRecord {
    pub disk_id: String,
    pub archive: String,
    pub logical_name: String,
    pub host_id: String,
    pub slot_id: String,
    pub mounted: bool,
    pub mount_point: PathBuf,
    pub number_of_files: u64,
    pub available_mb: u64,
    pub bytes_stored: u64,
    pub disk_type: String,
    pub capacity_mb: u64,
    pub manufacturer: Option<String>,
    pub installation_date: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub total_disk_write_time: f64,
    pub completed: bool,
    pub completion_date: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_host_id: Option<String>,
}

impl DiskRecord {
    /// Latches the disk as completed.
    ///
    /// Completion is one-way: once a disk is completed new files must go
    /// to a different disk in the same storage set, so there is no
    /// `uncomplete`.
    pub fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            self.completion_date = Some(Utc::now());
        }
    }

    pub fn to_row(&self) -> SqlRow {
        use crate::database::schema::disks;

        let mut row = vec![SqlValue::Null; schema::DISKS.len()];
        row[disks::DISK_ID] = SqlValue::Text(self.disk_id.clone());
        row[disks::ARCHIVE] = SqlValue::Text(self.archive.clone());
        row[disks::LOGICAL_NAME] = SqlValue::Text(self.logical_name.clone());
        row[disks::HOST_ID] = SqlValue::Text(self.host_id.clone());
        row[disks::SLOT_ID] = SqlValue::Text(self.slot_id.clone());
        row[disks::MOUNTED] = SqlValue::Int(self.mounted as i64);
        row[disks::MOUNT_POINT] = SqlValue::Text(self.mount_point.display().to_string());
        row[disks::NUMBER_OF_FILES] = SqlValue::Int(self.number_of_files as i64);
        row[disks::AVAILABLE_MB] = SqlValue::Int(self.available_mb as i64);
        row[disks::BYTES_STORED] = SqlValue::Int(self.bytes_stored as i64);
        row[disks::TYPE] = SqlValue::Text(self.disk_type.clone());
        row[disks::CAPACITY_MB] = SqlValue::Int(self.capacity_mb as i64);
        row[disks::MANUFACTURER] = opt_text(&self.manufacturer);
        row[disks::INSTALLATION_DATE] = opt_timestamp(&self.installation_date);
        row[disks::CHECKSUM] = opt_text(&self.checksum);
        row[disks::TOTAL_DISK_WRITE_TIME] = SqlValue::Float(self.total_disk_write_time);
        row[disks::COMPLETED] = SqlValue::Int(self.completed as i64);
        row[disks::COMPLETION_DATE] = opt_timestamp(&self.completion_date);
        row[disks::LAST_CHECK] = opt_timestamp(&self.last_check);
        row[disks::LAST_HOST_ID] = opt_text(&self.last_host_id);
        row
    }

    pub fn from_row(row: &SqlRow) -> ArchiveResult<Self> {
        use crate::database::schema::disks;

        if row.len() < schema::DISKS.len() {
            return Err(ArchiveError::DatabaseError(anyhow::anyhow!(
                "disks row has {} columns, expected {}",
                row.len(),
                schema::DISKS.len()
            )));
        }
        Ok(Self {
            disk_id: get_text(row, disks::DISK_ID)?,
            archive: get_text(row, disks::ARCHIVE)?,
            logical_name: get_text(row, disks::LOGICAL_NAME)?,
            host_id: get_text(row, disks::HOST_ID)?,
            slot_id: get_text(row, disks::SLOT_ID)?,
            mounted: get_int(row, disks::MOUNTED)? != 0,
            mount_point: PathBuf::from(get_text(row, disks::MOUNT_POINT)?),
            number_of_files: get_int(row, disks::NUMBER_OF_FILES)? as u64,
            available_mb: get_int(row, disks::AVAILABLE_MB)? as u64,
            bytes_stored: get_int(row, disks::BYTES_STORED)? as u64,
            disk_type: get_text(row, disks::TYPE)?,
            capacity_mb: get_int(row, disks::CAPACITY_MB)? as u64,
            manufacturer: get_opt_text(row, disks::MANUFACTURER),
            installation_date: get_opt_timestamp(row, disks::INSTALLATION_DATE)?,
            checksum: get_opt_text(row, disks::CHECKSUM),
            total_disk_write_time: get_float(row, disks::TOTAL_DISK_WRITE_TIME)?,
            completed: get_int(row, disks::COMPLETED)? != 0,
            completion_date: get_opt_timestamp(row, disks::COMPLETION_DATE)?,
            last_check: get_opt_timestamp(row, disks::LAST_CHECK)?,
            last_host_id: get_opt_text(row, disks::LAST_HOST_ID),
        })
    }
}

/// Transient per-ingest state.
///
/// Owned exclusively by the handling task for the lifetime of one request.
/// Serialized next to the staged data when an ingest is back-log buffered,
/// so the recovery process can replay the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub mime_type: String,
    pub expected_size: u64,
    pub bytes_received: u64,
    pub staging_filename: PathBuf,
    pub target_disk: String,
    pub no_replication: bool,
}

fn opt_text(value: &Option<String>) -> SqlValue {
    match value {
        Some(v) => SqlValue::Text(v.clone()),
        None => SqlValue::Null,
    }
}

fn opt_timestamp(value: &Option<DateTime<Utc>>) -> SqlValue {
    match value {
        Some(t) => SqlValue::Text(to_iso8601(*t)),
        None => SqlValue::Null,
    }
}

fn get_text(row: &SqlRow, index: usize) -> ArchiveResult<String> {
    match row.get(index) {
        Some(SqlValue::Text(v)) => Ok(v.clone()),
        other => Err(column_error(index, "text", other)),
    }
}

fn get_opt_text(row: &SqlRow, index: usize) -> Option<String> {
    match row.get(index) {
        Some(SqlValue::Text(v)) => Some(v.clone()),
        _ => None,
    }
}

fn get_int(row: &SqlRow, index: usize) -> ArchiveResult<i64> {
    match row.get(index) {
        Some(SqlValue::Int(v)) => Ok(*v),
        other => Err(column_error(index, "integer", other)),
    }
}

fn get_float(row: &SqlRow, index: usize) -> ArchiveResult<f64> {
    match row.get(index) {
        Some(SqlValue::Float(v)) => Ok(*v),
        Some(SqlValue::Int(v)) => Ok(*v as f64),
        other => Err(column_error(index, "float", other)),
    }
}

fn get_opt_timestamp(row: &SqlRow, index: usize) -> ArchiveResult<Option<DateTime<Utc>>> {
    match row.get(index) {
        Some(SqlValue::Text(v)) => Ok(Some(from_iso8601(v)?)),
        _ => Ok(None),
    }
}

fn column_error(index: usize, expected: &str, got: Option<&SqlValue>) -> ArchiveError {
    ArchiveError::DatabaseError(anyhow::anyhow!(
        "column {} is not {}: {:?}",
        index,
        expected,
        got
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FileRecord {
        FileRecord {
            disk_id: "disk-001".to_string(),
            file_name: "saf/2003-09-01/1/file.fits".to_string(),
            file_id: "file-abc".to_string(),
            file_version: 2,
            format: "application/x-cfits".to_string(),
            file_size: 1024,
            uncompressed_file_size: 4096,
            compression: Some("gzip".to_string()),
            ingestion_date: Some(from_iso8601("2003-09-01T12:00:00.000").unwrap()),
            ignore: false,
            checksum: Some("1307c742".to_string()),
            checksum_plugin: Some("crc32".to_string()),
            file_status: FILE_STATUS_OK.to_string(),
            creation_date: Some(from_iso8601("2003-09-01T11:59:59.500").unwrap()),
            io_time: 0.25,
            ingestion_rate: Some(4096.0),
            container_id: None,
        }
    }

    #[test]
    fn test_file_record_roundtrip() {
        let record = sample_record();
        let row = record.to_row();
        assert_eq!(row.len(), schema::FILES.len());
        assert_eq!(
            row[files::FILE_ID],
            SqlValue::Text("file-abc".to_string())
        );
        assert_eq!(row[files::FILE_VERSION], SqlValue::Int(2));

        let unpacked = FileRecord::from_row(&row).unwrap();
        assert_eq!(unpacked, record);
    }

    #[test]
    fn test_short_row_rejected() {
        let row = vec![SqlValue::Text("disk-001".to_string())];
        assert!(FileRecord::from_row(&row).is_err());
    }

    #[test]
    fn test_disk_completion_latch() {
        let row = {
            let mut record = sample_disk();
            record.complete();
            let first_completion = record.completion_date;
            record.complete();
            assert_eq!(record.completion_date, first_completion);
            record.to_row()
        };
        let unpacked = DiskRecord::from_row(&row).unwrap();
        assert!(unpacked.completed);
        assert!(unpacked.completion_date.is_some());
    }

    #[test]
    fn test_timestamp_format() {
        let t = from_iso8601("2010-04-13T19:13:23.123").unwrap();
        assert_eq!(to_iso8601(t), "2010-04-13T19:13:23.123");
    }

    fn sample_disk() -> DiskRecord {
        DiskRecord {
            disk_id: "disk-001".to_string(),
            archive: "main".to_string(),
            logical_name: "M-000001".to_string(),
            host_id: "host-a".to_string(),
            slot_id: "slot-1".to_string(),
            mounted: true,
            mount_point: PathBuf::from("/srv/archive/volume1"),
            number_of_files: 10,
            available_mb: 50_000,
            bytes_stored: 123_456_789,
            disk_type: "MAGNETIC".to_string(),
            capacity_mb: 100_000,
            manufacturer: None,
            installation_date: None,
            checksum: None,
            total_disk_write_time: 12.5,
            completed: false,
            completion_date: None,
            last_check: None,
            last_host_id: None,
        }
    }
}
