//! Staging-area management for incoming files.
//!
//! Incoming data is always written to a staging area on the target volume
//! first, then promoted to its archive path once the metadata transaction
//! has committed. Keeping the staging area on the same volume makes the
//! promotion a rename in the common case.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use tokio::fs::{self, OpenOptions};

use crate::config::MimeTypeMapping;
use crate::error::{ArchiveError, ArchiveResult};

/// Directory under a volume mount point that holds in-flight files.
pub const STAGING_DIR: &str = "staging";

/// Directory under a volume mount point that holds quarantined files.
pub const BAD_FILES_DIR: &str = "bad-files";

lazy_static! {
    static ref UNSAFE_NAME_CHARS: Regex = Regex::new(r"[?=&]").unwrap();
}

#[derive(Debug)]
pub struct StagingManager {
    mime_types: Vec<MimeTypeMapping>,
}

impl StagingManager {
    pub fn new(mime_types: Vec<MimeTypeMapping>) -> Self {
        Self { mime_types }
    }

    /// Reserves a unique staging path on the volume for an incoming file.
    ///
    /// The original name's basename is sanitized, given the extension its
    /// mime-type implies if missing, and prefixed with a fresh token so
    /// concurrent ingests of the same name cannot collide. The file is
    /// created empty as part of the reservation.
    pub async fn staging_path(
        &self,
        mount_point: &Path,
        mime_type: &str,
        original_name: &str,
    ) -> ArchiveResult<PathBuf> {
        let basename = Path::new(original_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(original_name);
        let sanitized = UNSAFE_NAME_CHARS.replace_all(basename, "_");
        let named = self.check_add_ext(mime_type, &sanitized);

        let staging_dir = mount_point.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir)
            .await
            .map_err(ArchiveError::staging_area_failure)?;

        loop {
            let token = uuid::Uuid::new_v4().simple().to_string();
            let candidate = staging_dir.join(format!("{}-{}", token, named));
            let created = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await;
            match created {
                Ok(_) => {
                    tracing::debug!("Reserved staging file: {:?}", candidate);
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ArchiveError::staging_area_failure(e)),
            }
        }
    }

    /// Appends the extension the mime-type implies, unless the name
    /// already carries it.
    fn check_add_ext(&self, mime_type: &str, name: &str) -> String {
        let mapping = self
            .mime_types
            .iter()
            .find(|m| m.mime_type.eq_ignore_ascii_case(mime_type));
        let Some(mapping) = mapping else {
            tracing::info!("No extension mapping for mime-type: {}", mime_type);
            return name.to_string();
        };
        if mapping.extension.is_empty() {
            return name.to_string();
        }
        let suffix = format!(".{}", mapping.extension);
        if name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
            return name.to_string();
        }
        format!("{}{}", name, suffix)
    }

    /// Verifies the volume holding `target` has room for `size` bytes.
    ///
    /// Checked before any data is written so a doomed ingest fails with
    /// nothing on disk.
    pub fn preflight(&self, target: &Path, size: u64) -> ArchiveResult<()> {
        let probe = nearest_existing_dir(target);
        let available =
            fs4::available_space(&probe).map_err(|e| ArchiveError::IoError { error: e })?;
        if size > available {
            return Err(ArchiveError::InsufficientSpace {
                path: target.to_path_buf(),
                needed: size,
                available,
            });
        }
        Ok(())
    }

    /// Moves a staged file to its final archive path, returning the time
    /// the move took.
    ///
    /// Same-volume moves are a rename. Cross-volume moves re-check space
    /// on the target volume, then copy and delete. An existing target
    /// (a re-archive of the same version) is made writable and replaced.
    pub async fn promote(&self, src: &Path, dst: &Path) -> ArchiveResult<Duration> {
        let start = Instant::now();

        let parent = dst.parent().ok_or_else(|| {
            ArchiveError::FileMoveFailure(anyhow::anyhow!("target {:?} has no parent", dst))
        })?;
        fs::create_dir_all(parent)
            .await
            .map_err(ArchiveError::file_move_failure)?;

        if let Ok(existing) = fs::metadata(dst).await {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = existing.permissions();
            perms.set_mode(0o644);
            fs::set_permissions(dst, perms)
                .await
                .map_err(ArchiveError::file_move_failure)?;
        }

        if same_device(src, parent).await? {
            fs::rename(src, dst)
                .await
                .map_err(ArchiveError::file_move_failure)?;
        } else {
            let size = fs::metadata(src)
                .await
                .map_err(ArchiveError::file_move_failure)?
                .len();
            self.preflight(dst, size)?;
            fs::copy(src, dst)
                .await
                .map_err(ArchiveError::file_move_failure)?;
            fs::remove_file(src)
                .await
                .map_err(ArchiveError::file_move_failure)?;
        }

        let elapsed = start.elapsed();
        tracing::info!(
            "File moved: {:?} -> {:?} ({:.6}s)",
            src,
            dst,
            elapsed.as_secs_f64()
        );
        Ok(elapsed)
    }

    /// Moves a corrupt or rejected file into the volume's bad-files
    /// directory, returning its new path.
    pub async fn quarantine(
        &self,
        mount_point: &Path,
        src: &Path,
        reason_prefix: &str,
    ) -> ArchiveResult<PathBuf> {
        let bad_dir = mount_point.join(BAD_FILES_DIR);
        fs::create_dir_all(&bad_dir)
            .await
            .map_err(ArchiveError::quarantine_failure)?;

        let basename = src
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let token = uuid::Uuid::new_v4().simple().to_string();
        let dst = bad_dir.join(format!("{}-{}-{}", reason_prefix, token, basename));

        if fs::rename(src, &dst).await.is_err() {
            fs::copy(src, &dst)
                .await
                .map_err(ArchiveError::quarantine_failure)?;
            fs::remove_file(src)
                .await
                .map_err(ArchiveError::quarantine_failure)?;
        }

        tracing::warn!("File quarantined: {:?} -> {:?}", src, dst);
        Ok(dst)
    }
}

/// Walks up from `path` to the closest directory that exists.
fn nearest_existing_dir(path: &Path) -> PathBuf {
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if parent.as_os_str().is_empty() => break,
            Some(parent) => probe = parent,
            None => break,
        }
    }
    if probe.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        probe.to_path_buf()
    }
}

async fn same_device(a: &Path, b: &Path) -> ArchiveResult<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta_a = fs::metadata(a)
        .await
        .map_err(ArchiveError::file_move_failure)?;
    let meta_b = fs::metadata(b)
        .await
        .map_err(ArchiveError::file_move_failure)?;
    Ok(meta_a.dev() == meta_b.dev())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StagingManager {
        StagingManager::new(vec![MimeTypeMapping {
            mime_type: "application/x-cfits".to_string(),
            extension: "fits".to_string(),
        }])
    }

    #[tokio::test]
    async fn test_staging_path_is_unique_and_created() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let first = manager
            .staging_path(mount.path(), "application/x-cfits", "obs-1.fits")
            .await
            .unwrap();
        let second = manager
            .staging_path(mount.path(), "application/x-cfits", "obs-1.fits")
            .await
            .unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(first.starts_with(mount.path().join(STAGING_DIR)));
    }

    #[tokio::test]
    async fn test_staging_path_sanitizes_and_adds_extension() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let path = manager
            .staging_path(mount.path(), "application/x-cfits", "obs?a=1&b=2")
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();

        assert!(name.ends_with("obs_a_1_b_2.fits"));
        assert!(!name.contains('?'));
        assert!(!name.contains('&'));
    }

    #[tokio::test]
    async fn test_unknown_mime_type_keeps_name() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let path = manager
            .staging_path(mount.path(), "application/octet-stream", "blob.bin")
            .await
            .unwrap();
        assert!(path.to_str().unwrap().ends_with("blob.bin"));
    }

    #[test]
    fn test_check_add_ext_is_case_insensitive() {
        let manager = manager();
        assert_eq!(
            manager.check_add_ext("application/x-cfits", "obs.FITS"),
            "obs.FITS"
        );
        assert_eq!(
            manager.check_add_ext("application/x-cfits", "obs"),
            "obs.fits"
        );
    }

    #[tokio::test]
    async fn test_preflight_rejects_oversized_writes_nothing() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();
        let target = mount.path().join("volume").join("obs.fits");

        let result = manager.preflight(&target, u64::MAX);
        match result {
            Err(ArchiveError::InsufficientSpace { needed, .. }) => {
                assert_eq!(needed, u64::MAX);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
        assert!(!target.exists());
        assert!(!mount.path().join("volume").exists());
    }

    #[tokio::test]
    async fn test_promote_same_volume() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let src = manager
            .staging_path(mount.path(), "application/x-cfits", "obs.fits")
            .await
            .unwrap();
        tokio::fs::write(&src, b"payload").await.unwrap();

        let dst = mount.path().join("saf").join("2003-09-01").join("obs.fits");
        manager.promote(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_promote_replaces_readonly_target() {
        use std::os::unix::fs::PermissionsExt;

        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let dst = mount.path().join("obs.fits");
        tokio::fs::write(&dst, b"old").await.unwrap();
        let mut perms = tokio::fs::metadata(&dst).await.unwrap().permissions();
        perms.set_mode(0o444);
        tokio::fs::set_permissions(&dst, perms).await.unwrap();

        let src = mount.path().join("incoming.fits");
        tokio::fs::write(&src, b"new").await.unwrap();

        manager.promote(&src, &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_quarantine_moves_with_prefix() {
        let mount = tempfile::tempdir().unwrap();
        let manager = manager();

        let src = mount.path().join("broken.fits");
        tokio::fs::write(&src, b"garbage").await.unwrap();

        let dst = manager
            .quarantine(mount.path(), &src, "BAD-FILE")
            .await
            .unwrap();

        assert!(!src.exists());
        assert!(dst.starts_with(mount.path().join(BAD_FILES_DIR)));
        let name = dst.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("BAD-FILE-"));
        assert!(name.ends_with("broken.fits"));
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"garbage");
    }
}
