//! Filesystem side of the control plane: artifact layout, atomic writes,
//! content hashing and database backups.

use crate::domain::error::{AppError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

fn io_err(msg: impl Into<String>) -> AppError {
    AppError::IoError(msg.into())
}

/// On-disk layout rooted at the configured data directory:
/// `runs/<run_id>/` for worker workspaces, `versions/<version_id>/` for
/// registered artifacts, `evaluations/<eval_id>/` for evaluation output.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    runs: PathBuf,
    versions: PathBuf,
    evaluations: PathBuf,
}

impl ArtifactLayout {
    pub fn new(data_dir: &Path) -> Self {
        let root = data_dir.join("artifacts");
        Self {
            runs: root.join("runs"),
            versions: root.join("versions"),
            evaluations: root.join("evaluations"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.runs, &self.versions, &self.evaluations] {
            ensure_dir(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs.join(run_id)
    }

    pub fn version_dir(&self, version_id: &str) -> PathBuf {
        self.versions.join(version_id)
    }

    pub fn evaluation_dir(&self, eval_id: &str) -> PathBuf {
        self.evaluations.join(eval_id)
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| io_err(format!("Failed to create dir {}: {e}", path.display())))?;
    Ok(())
}

/// Write via a temp file in the same directory, then rename into place.
/// Readers never observe a half-written file. When the destination exists it
/// is moved aside first (rename cannot replace on Windows).
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    {
        let mut file = fs::File::create(&tmp)
            .map_err(|e| io_err(format!("Failed to create {}: {e}", tmp.display())))?;
        file.write_all(bytes)
            .map_err(|e| io_err(format!("Failed to write {}: {e}", tmp.display())))?;
        file.sync_all().ok();
    }

    if path.exists() {
        let displaced = path.with_extension(format!("old-{}", Uuid::new_v4()));
        fs::rename(path, &displaced)
            .map_err(|e| io_err(format!("Failed to displace {}: {e}", path.display())))?;
        fs::rename(&tmp, path)
            .map_err(|e| io_err(format!("Failed to install {}: {e}", path.display())))?;
        let _ = fs::remove_file(&displaced);
    } else {
        fs::rename(&tmp, path)
            .map_err(|e| io_err(format!("Failed to install {}: {e}", path.display())))?;
    }
    Ok(())
}

/// Streaming SHA-256 of a file, hex-encoded. Used both to fingerprint
/// registered artifacts and to verify them before promotion.
pub fn sha256_hex_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| io_err(format!("Failed to open {} for hashing: {e}", path.display())))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| io_err(format!("Failed to read {} for hashing: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn dir_size_bytes(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in list_dir(dir)? {
        let meta = entry
            .metadata()
            .map_err(|e| io_err(format!("Failed to stat {}: {e}", entry.path().display())))?;
        if meta.is_dir() {
            total += dir_size_bytes(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn list_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    fs::read_dir(dir)
        .map_err(|e| io_err(format!("Failed to read dir {}: {e}", dir.display())))?
        .map(|entry| entry.map_err(|e| io_err(format!("Failed dir entry: {e}"))))
        .collect()
}

/// Retention for database backups. Tagged backups (those taken right before
/// a promotion or rollback) are exempt from the rolling limit.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    pub max_daily_backups: usize,
    pub prefix: String,
}

impl BackupConfig {
    pub fn new(data_dir: &Path, max_daily_backups: usize) -> Self {
        Self {
            backup_dir: data_dir.join("backups"),
            max_daily_backups,
            prefix: "control_db".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub backup_path: PathBuf,
    pub size_bytes: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub is_tagged: bool,
    pub modified: Option<SystemTime>,
}

const TAGGED_MARKERS: [&str; 3] = ["pre_promote", "pre_rollback", "pre_restore"];

fn is_tagged(file_name: &str) -> bool {
    TAGGED_MARKERS.iter().any(|m| file_name.contains(m))
}

/// Copy the database file into the backup directory. The name carries a
/// timestamp and an optional reason tag so tagged backups can be told apart
/// from rolling daily ones.
pub fn backup_db(db_path: &Path, config: &BackupConfig, reason: Option<&str>) -> Result<BackupResult> {
    ensure_dir(&config.backup_dir)?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let suffix = reason.map(|r| format!("_{r}")).unwrap_or_default();
    let backup_path = config
        .backup_dir
        .join(format!("{}_{}{}.db", config.prefix, timestamp, suffix));

    let bytes = fs::read(db_path)
        .map_err(|e| io_err(format!("Failed to read {} for backup: {e}", db_path.display())))?;
    atomic_write_bytes(&backup_path, &bytes)?;

    Ok(BackupResult {
        backup_path,
        size_bytes: bytes.len() as u64,
        timestamp,
    })
}

pub fn backup_before_promotion(
    db_path: &Path,
    config: &BackupConfig,
    version_id: &str,
) -> Result<BackupResult> {
    let tag = format!("pre_promote_{}", short_id(version_id));
    backup_db(db_path, config, Some(&tag))
}

pub fn backup_before_rollback(
    db_path: &Path,
    config: &BackupConfig,
    model_id: &str,
) -> Result<BackupResult> {
    let tag = format!("pre_rollback_{}", short_id(model_id));
    backup_db(db_path, config, Some(&tag))
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Take a rolling backup unless one already exists for the current UTC day,
/// then enforce retention. Meant to be called once at startup.
pub fn ensure_daily_backup(db_path: &Path, config: &BackupConfig) -> Result<Option<BackupResult>> {
    ensure_dir(&config.backup_dir)?;

    let today = format!("{}_{}", config.prefix, chrono::Utc::now().format("%Y%m%d"));
    let has_today = list_dir(&config.backup_dir)?.iter().any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        entry.path().is_file() && name.starts_with(&today) && !is_tagged(&name)
    });

    let created = if has_today {
        None
    } else {
        Some(backup_db(db_path, config, Some("daily"))?)
    };

    let _ = cleanup_old_backups(config)?;
    Ok(created)
}

/// Keep the newest `max_daily_backups` rolling backups, delete the rest.
/// Tagged backups are never touched.
pub fn cleanup_old_backups(config: &BackupConfig) -> Result<Vec<PathBuf>> {
    let mut deleted = Vec::new();
    if !config.backup_dir.exists() {
        return Ok(deleted);
    }

    let mut rolling: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in list_dir(&config.backup_dir)? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&config.prefix) || is_tagged(&name) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| io_err(format!("Failed to stat {}: {e}", path.display())))?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        rolling.push((path, mtime));
    }

    rolling.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in rolling.into_iter().skip(config.max_daily_backups) {
        if fs::remove_file(&path).is_ok() {
            deleted.push(path);
        }
    }

    Ok(deleted)
}

pub fn list_backups(config: &BackupConfig) -> Result<Vec<BackupInfo>> {
    let mut backups = Vec::new();
    if !config.backup_dir.exists() {
        return Ok(backups);
    }

    for entry in list_dir(&config.backup_dir)? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if !name.starts_with(&config.prefix) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| io_err(format!("Failed to stat {}: {e}", path.display())))?;
        backups.push(BackupInfo {
            size_bytes: meta.len(),
            is_tagged: is_tagged(&name),
            modified: meta.modified().ok(),
            file_name: name,
            path,
        });
    }

    backups.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(backups)
}

/// Replace the live database with a backup. The displaced database is backed
/// up first, and that backup is returned so the restore itself can be undone.
pub fn restore_from_backup(
    backup_path: &Path,
    db_path: &Path,
    config: &BackupConfig,
) -> Result<BackupResult> {
    let pre_restore = backup_db(db_path, config, Some("pre_restore"))?;

    let bytes = fs::read(backup_path)
        .map_err(|e| io_err(format!("Failed to read backup {}: {e}", backup_path.display())))?;
    atomic_write_bytes(db_path, &bytes)?;

    Ok(pre_restore)
}

#[derive(Debug, Clone)]
pub struct RunRetentionPolicy {
    pub max_age_days: u64,
    pub max_runs: usize,
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub deleted_run_ids: Vec<String>,
    pub freed_bytes: u64,
}

/// Best-effort removal of old run workspaces. `protected_run_ids` must
/// include every run whose version is registered or active.
pub fn cleanup_old_runs(
    layout: &ArtifactLayout,
    policy: &RunRetentionPolicy,
    protected_run_ids: &HashSet<String>,
) -> Result<CleanupReport> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(policy.max_age_days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut entries: Vec<(String, SystemTime)> = Vec::new();
    for entry in list_dir(layout.runs_dir())? {
        let meta = entry
            .metadata()
            .map_err(|e| io_err(format!("Failed to stat {}: {e}", entry.path().display())))?;
        if !meta.is_dir() {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().to_string();
        entries.push((run_id, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
    }

    // Oldest first, so the over-limit check drops the stalest workspaces.
    entries.sort_by_key(|(_, t)| *t);
    let keep_from = entries.len().saturating_sub(policy.max_runs);

    let mut report = CleanupReport {
        deleted_run_ids: Vec::new(),
        freed_bytes: 0,
    };

    for (idx, (run_id, mtime)) in entries.into_iter().enumerate() {
        if protected_run_ids.contains(&run_id) {
            continue;
        }
        if mtime >= cutoff && idx >= keep_from {
            continue;
        }

        let run_dir = layout.run_dir(&run_id);
        let size = dir_size_bytes(&run_dir).unwrap_or(0);
        if fs::remove_dir_all(&run_dir).is_ok() {
            report.deleted_run_ids.push(run_id);
            report.freed_bytes += size;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("distill-store-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = temp_dir();
        let path = dir.join("file.txt");
        atomic_write_bytes(&path, b"one").unwrap();
        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_hash_is_stable() {
        let dir = temp_dir();
        let path = dir.join("artifact.bin");
        fs::write(&path, b"weights").unwrap();
        let first = sha256_hex_file(&path).unwrap();
        let second = sha256_hex_file(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn backup_tags_survive_non_ascii_ids() {
        // The tag keeps the first eight characters even when the id holds
        // multi-byte ones.
        assert_eq!(short_id("modèle-été-v1"), "modèle-é");
        assert_eq!(short_id("m1"), "m1");

        let dir = temp_dir();
        let db_path = dir.join("training.db");
        fs::write(&db_path, b"db-bytes").unwrap();
        let config = BackupConfig {
            backup_dir: dir.join("backups"),
            max_daily_backups: 1,
            prefix: "control_db".to_string(),
        };
        backup_before_rollback(&db_path, &config, "modèle-été-v1").unwrap();
        assert_eq!(list_backups(&config).unwrap().len(), 1);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn backup_retention_spares_tagged() {
        let dir = temp_dir();
        let db_path = dir.join("training.db");
        fs::write(&db_path, b"db-bytes").unwrap();

        let config = BackupConfig {
            backup_dir: dir.join("backups"),
            max_daily_backups: 1,
            prefix: "control_db".to_string(),
        };

        backup_db(&db_path, &config, Some("daily")).unwrap();
        backup_before_promotion(&db_path, &config, "version-abcdef").unwrap();
        backup_before_rollback(&db_path, &config, "model-123456").unwrap();

        cleanup_old_backups(&config).unwrap();
        let remaining = list_backups(&config).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining.iter().filter(|b| b.is_tagged).count(), 2);
        fs::remove_dir_all(&dir).unwrap();
    }
}
