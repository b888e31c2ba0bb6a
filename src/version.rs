//! File version allocation and record insertion.

use crate::database::driver::SqlValue;
use crate::database::Database;
use crate::error::{ArchiveError, ArchiveResult};
use crate::model::FileRecord;

/// Attempts to insert a record before giving up on version contention.
const VERSION_RETRY_LIMIT: u32 = 10;

/// Returns the next free version for a file ID.
///
/// Versions start at 1; a file ID with no recorded versions gets 1. The
/// result is only a candidate: two concurrent ingests of the same file ID
/// can both observe the same maximum, and the unique constraint on
/// (disk_id, file_id, file_version) decides the loser. Use
/// [`insert_file_record`] for a raceless insert.
pub async fn next_version(db: &Database, file_id: &str) -> ArchiveResult<u32> {
    let sql = "SELECT max(file_version) FROM ngas_files WHERE file_id={0}";
    let rows = db
        .query(sql, &[SqlValue::Text(file_id.to_string())])
        .await?;
    match rows.first().and_then(|r| r.first()) {
        Some(SqlValue::Int(max)) if *max >= 1 => Ok(*max as u32 + 1),
        _ => Ok(1),
    }
}

/// Inserts a file record, allocating its version if unset.
///
/// A record with version 0 gets the next free version. When a concurrent
/// ingest wins the same version the insert trips the unique constraint;
/// the version is bumped and the insert retried, up to a bounded number of
/// attempts. Returns the record as inserted, with the version that stuck.
pub async fn insert_file_record(db: &Database, record: &FileRecord) -> ArchiveResult<FileRecord> {
    let mut record = record.clone();
    if record.file_version == 0 {
        record.file_version = next_version(db, &record.file_id).await?;
    }

    let columns = db.catalog().files_columns_unqualified();
    let placeholders: Vec<String> = (0..record.to_row().len())
        .map(|i| format!("{{{}}}", i))
        .collect();
    let sql = format!(
        "INSERT INTO ngas_files ({}) VALUES ({})",
        columns,
        placeholders.join(", ")
    );

    for attempt in 0..VERSION_RETRY_LIMIT {
        match db.query(&sql, &record.to_row()).await {
            Ok(_) => {
                tracing::info!(
                    "Archived file record: {}/{} version {}",
                    record.disk_id,
                    record.file_id,
                    record.file_version
                );
                return Ok(record);
            }
            Err(ArchiveError::ConstraintViolation(e)) => {
                tracing::debug!(
                    "Version {} of file {} taken (attempt {}): {}",
                    record.file_version,
                    record.file_id,
                    attempt + 1,
                    e
                );
                record.file_version += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Err(ArchiveError::DuplicateVersion {
        disk_id: record.disk_id.clone(),
        file_id: record.file_id.clone(),
        version: record.file_version,
    })
}
