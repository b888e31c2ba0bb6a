//! Back-log buffering of failed ingests.
//!
//! When an ingest fails after the data has been fully received, the staged
//! data can be kept in the back-log directory together with a snapshot of
//! the request context, so a later recovery pass can finish the ingest
//! without the client resending. Only failures with intact data and a
//! retryable cause qualify; everything else is discarded.

use std::path::PathBuf;

use tokio::fs;

use crate::config::BackLogConfig;
use crate::error::{ArchiveError, ArchiveResult};
use crate::model::RequestContext;

/// Extension of the context snapshot written next to a buffered file.
pub const CONTEXT_EXT: &str = "context";

/// What to do with a failed ingest's staged data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the data for a later retry.
    Buffer,
    /// Remove the staged data.
    Discard,
}

#[derive(Debug)]
pub struct BackLogPolicy {
    enabled: bool,
    directory: PathBuf,
}

impl BackLogPolicy {
    pub fn new(config: &BackLogConfig) -> Self {
        Self {
            enabled: config.enabled,
            directory: config.directory.clone(),
        }
    }

    /// Decides whether a failed ingest qualifies for buffering.
    ///
    /// Buffering requires all of: buffering enabled, the staged data
    /// either untouched or complete, and a failure cause that a retry
    /// could plausibly clear.
    pub fn decide(&self, ctx: &RequestContext, error: &ArchiveError) -> Disposition {
        if !self.enabled {
            return Disposition::Discard;
        }
        let data_intact = ctx.bytes_received == 0 || ctx.bytes_received == ctx.expected_size;
        if !data_intact {
            return Disposition::Discard;
        }
        let retryable = matches!(
            error,
            ArchiveError::DbCommunicationFailure(_)
                | ArchiveError::StagingAreaFailure(_)
                | ArchiveError::BackLogBufferFailure(_)
                | ArchiveError::FileMoveFailure(_)
        );
        if retryable {
            Disposition::Buffer
        } else {
            Disposition::Discard
        }
    }

    /// Moves the staged data into the back-log directory and writes the
    /// request context beside it. Returns the buffered data path.
    pub async fn buffer(&self, ctx: &RequestContext) -> ArchiveResult<PathBuf> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(ArchiveError::back_log_buffer_failure)?;

        let basename = ctx
            .staging_filename
            .file_name()
            .ok_or_else(|| {
                ArchiveError::BackLogBufferFailure(anyhow::anyhow!(
                    "staging path {:?} has no file name",
                    ctx.staging_filename
                ))
            })?;
        let data_path = self.directory.join(basename);

        if fs::rename(&ctx.staging_filename, &data_path).await.is_err() {
            fs::copy(&ctx.staging_filename, &data_path)
                .await
                .map_err(ArchiveError::back_log_buffer_failure)?;
            fs::remove_file(&ctx.staging_filename)
                .await
                .map_err(ArchiveError::back_log_buffer_failure)?;
        }

        let mut snapshot = ctx.clone();
        snapshot.staging_filename = data_path.clone();
        let serialized = serde_json::to_vec_pretty(&snapshot)
            .map_err(ArchiveError::back_log_buffer_failure)?;
        let context_path = data_path.with_extension(CONTEXT_EXT);
        fs::write(&context_path, serialized)
            .await
            .map_err(ArchiveError::back_log_buffer_failure)?;

        tracing::warn!(
            "Ingest back-log buffered: {:?} (context: {:?})",
            data_path,
            context_path
        );
        Ok(data_path)
    }

    /// Removes the staged data of a failed ingest.
    pub async fn discard(&self, ctx: &RequestContext) -> ArchiveResult<()> {
        match fs::remove_file(&ctx.staging_filename).await {
            Ok(()) => {
                tracing::info!("Removed staging file: {:?}", ctx.staging_filename);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Settles a failed ingest one way or the other, returning what
    /// happened to the staged data.
    pub async fn settle(
        &self,
        ctx: &RequestContext,
        error: &ArchiveError,
    ) -> ArchiveResult<Disposition> {
        let disposition = self.decide(ctx, error);
        match disposition {
            Disposition::Buffer => {
                self.buffer(ctx).await?;
            }
            Disposition::Discard => {
                self.discard(ctx).await?;
            }
        }
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: bool, directory: PathBuf) -> BackLogPolicy {
        BackLogPolicy::new(&BackLogConfig { enabled, directory })
    }

    fn ctx(bytes_received: u64, expected_size: u64) -> RequestContext {
        RequestContext {
            mime_type: "application/x-cfits".to_string(),
            expected_size,
            bytes_received,
            staging_filename: PathBuf::from("/tmp/none"),
            target_disk: "disk-001".to_string(),
            no_replication: false,
        }
    }

    fn comm_error() -> ArchiveError {
        ArchiveError::DbCommunicationFailure(anyhow::anyhow!("connection reset"))
    }

    #[test]
    fn test_disabled_always_discards() {
        let policy = policy(false, PathBuf::from("back-log"));
        assert_eq!(
            policy.decide(&ctx(100, 100), &comm_error()),
            Disposition::Discard
        );
    }

    #[test]
    fn test_complete_data_with_retryable_error_buffers() {
        let policy = policy(true, PathBuf::from("back-log"));
        assert_eq!(
            policy.decide(&ctx(100, 100), &comm_error()),
            Disposition::Buffer
        );
        // Nothing received yet also counts as intact.
        assert_eq!(
            policy.decide(&ctx(0, 100), &comm_error()),
            Disposition::Buffer
        );
    }

    #[test]
    fn test_complete_data_with_move_failure_buffers() {
        let policy = policy(true, PathBuf::from("back-log"));
        let error = ArchiveError::FileMoveFailure(anyhow::anyhow!("rename failed"));
        assert_eq!(policy.decide(&ctx(100, 100), &error), Disposition::Buffer);
    }

    #[test]
    fn test_partial_data_discards() {
        let policy = policy(true, PathBuf::from("back-log"));
        assert_eq!(
            policy.decide(&ctx(42, 100), &comm_error()),
            Disposition::Discard
        );
    }

    #[test]
    fn test_non_retryable_error_discards() {
        let policy = policy(true, PathBuf::from("back-log"));
        let error = ArchiveError::DuplicateVersion {
            disk_id: "disk-001".to_string(),
            file_id: "file-abc".to_string(),
            version: 2,
        };
        assert_eq!(policy.decide(&ctx(100, 100), &error), Disposition::Discard);
    }

    #[tokio::test]
    async fn test_buffer_writes_data_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let back_log = dir.path().join("back-log");
        let policy = policy(true, back_log.clone());

        let staged = dir.path().join("token-obs.fits");
        tokio::fs::write(&staged, b"payload").await.unwrap();

        let mut context = ctx(7, 7);
        context.staging_filename = staged.clone();

        let buffered = policy.buffer(&context).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(buffered, back_log.join("token-obs.fits"));
        assert_eq!(tokio::fs::read(&buffered).await.unwrap(), b"payload");

        let snapshot: RequestContext = serde_json::from_slice(
            &tokio::fs::read(buffered.with_extension(CONTEXT_EXT))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot.staging_filename, buffered);
        assert_eq!(snapshot.bytes_received, 7);
    }

    #[tokio::test]
    async fn test_settle_discards_missing_file_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(true, dir.path().join("back-log"));

        let mut context = ctx(42, 100);
        context.staging_filename = dir.path().join("gone.fits");

        let disposition = policy.settle(&context, &comm_error()).await.unwrap();
        assert_eq!(disposition, Disposition::Discard);
    }
}
