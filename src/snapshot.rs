//! Timestamp-named copies of persisted data directories.
//!
//! A snapshot is written to a hidden staging directory and renamed into place
//! once complete, so the store never exposes a half-written snapshot. Every
//! snapshot carries a `manifest.json` recording its sources and a SHA-256
//! digest per file; restore verifies the digests before touching any target.
//!
//! Restore replaces each target directory atomically: the snapshot copy is
//! staged next to the target, the target is renamed aside, the staged copy is
//! renamed in, and only then is the old tree removed.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::config::DataDir;
use crate::constants::{SNAPSHOT_ID_FORMAT, SNAPSHOT_MANIFEST};
use crate::error::StackError;

/// One source directory captured in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSource {
    pub name: String,
    pub original_path: PathBuf,
    /// Relative file path to hex SHA-256 digest.
    pub files: BTreeMap<String, String>,
}

/// An immutable copy of one or more data directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<SnapshotSource>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Snapshot {
    pub fn source(&self, name: &str) -> Option<&SnapshotSource> {
        self.sources.iter().find(|source| source.name == name)
    }

    fn source_dir(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Creates, lists and restores snapshots under a single store directory.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    store: PathBuf,
}

fn snapshot_err(path: &Path) -> impl Fn(io::Error) -> StackError + '_ {
    move |source| StackError::Snapshot {
        path: path.display().to_string(),
        source,
    }
}

impl SnapshotManager {
    pub fn new(store: impl Into<PathBuf>) -> Self {
        Self {
            store: store.into(),
        }
    }

    /// Copies every directory into a new timestamp-named snapshot.
    ///
    /// Reads are not exclusive: a service writing concurrently may leave the
    /// copy inconsistent.
    pub fn backup(&self, directories: &[DataDir]) -> Result<Snapshot, StackError> {
        if directories.is_empty() {
            return Err(StackError::Config(
                "no data directories configured for backup".into(),
            ));
        }
        for dir in directories {
            if !dir.path.is_dir() {
                return Err(StackError::Snapshot {
                    path: dir.path.display().to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "data directory missing"),
                });
            }
        }

        fs::create_dir_all(&self.store).map_err(snapshot_err(&self.store))?;

        let created_at = Utc::now();
        let id = self.unique_id(&created_at);
        let staging = self.store.join(format!(".{id}.partial"));
        let final_path = self.store.join(&id);

        let result = self.write_snapshot(&staging, &id, created_at, directories);
        let mut snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        fs::rename(&staging, &final_path).map_err(|err| {
            let _ = fs::remove_dir_all(&staging);
            snapshot_err(&final_path)(err)
        })?;
        snapshot.path = final_path;

        info!(
            "Created snapshot '{}' of {} director{}",
            snapshot.id,
            snapshot.sources.len(),
            if snapshot.sources.len() == 1 { "y" } else { "ies" }
        );
        Ok(snapshot)
    }

    fn unique_id(&self, created_at: &DateTime<Utc>) -> String {
        let base = created_at.format(SNAPSHOT_ID_FORMAT).to_string();
        let taken = |candidate: &str| {
            self.store.join(candidate).exists()
                || self.store.join(format!(".{candidate}.partial")).exists()
        };

        if !taken(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or(base)
    }

    fn write_snapshot(
        &self,
        staging: &Path,
        id: &str,
        created_at: DateTime<Utc>,
        directories: &[DataDir],
    ) -> Result<Snapshot, StackError> {
        fs::create_dir_all(staging).map_err(snapshot_err(staging))?;

        let mut sources = Vec::with_capacity(directories.len());
        for dir in directories {
            debug!("Copying '{}' from {:?}", dir.name, dir.path);
            let mut files = BTreeMap::new();
            copy_tree(&dir.path, &staging.join(&dir.name), Path::new(""), &mut files)?;
            sources.push(SnapshotSource {
                name: dir.name.clone(),
                original_path: dir.path.clone(),
                files,
            });
        }

        let snapshot = Snapshot {
            id: id.to_string(),
            created_at,
            sources,
            path: staging.to_path_buf(),
        };

        let manifest_path = staging.join(SNAPSHOT_MANIFEST);
        let manifest = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| snapshot_err(&manifest_path)(io::Error::other(err)))?;
        fs::write(&manifest_path, manifest).map_err(snapshot_err(&manifest_path))?;

        Ok(snapshot)
    }

    /// Loads a snapshot's manifest by id.
    pub fn load(&self, id: &str) -> Result<Snapshot, StackError> {
        if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\\') {
            return Err(StackError::Config(format!("invalid snapshot id '{id}'")));
        }

        let path = self.store.join(id);
        let manifest_path = path.join(SNAPSHOT_MANIFEST);
        let contents = fs::read_to_string(&manifest_path).map_err(snapshot_err(&manifest_path))?;
        let mut snapshot: Snapshot =
            serde_json::from_str(&contents).map_err(|err| StackError::SnapshotCorrupt {
                id: id.to_string(),
                reason: format!("unreadable manifest: {err}"),
            })?;
        snapshot.path = path;
        Ok(snapshot)
    }

    /// All complete snapshots in the store, oldest first.
    pub fn list(&self) -> Result<Vec<Snapshot>, StackError> {
        if !self.store.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.store).map_err(snapshot_err(&self.store))? {
            let entry = entry.map_err(snapshot_err(&self.store))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.load(&name) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!("Ignoring unreadable snapshot '{name}': {err}"),
            }
        }

        snapshots.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(snapshots)
    }

    /// Recomputes every digest and compares it with the manifest.
    pub fn verify(&self, snapshot: &Snapshot) -> Result<(), StackError> {
        for source in &snapshot.sources {
            let root = snapshot.source_dir(&source.name);
            let mut actual = BTreeMap::new();
            digest_tree(&root, Path::new(""), &mut actual)?;
            if actual != source.files {
                return Err(StackError::SnapshotCorrupt {
                    id: snapshot.id.clone(),
                    reason: format!("contents of '{}' do not match manifest", source.name),
                });
            }
        }
        Ok(())
    }

    /// Fails with [`StackError::PreconditionViolated`] naming every directory
    /// whose `used_by` list includes a service in `active`.
    pub fn ensure_not_in_use(
        directories: &[DataDir],
        active: &HashSet<String>,
    ) -> Result<(), StackError> {
        let mut in_use = Vec::new();
        for dir in directories {
            let users: Vec<&str> = dir
                .used_by
                .iter()
                .filter(|service| active.contains(*service))
                .map(String::as_str)
                .collect();
            if !users.is_empty() {
                in_use.push(format!("'{}' (in use by {})", dir.name, users.join(", ")));
            }
        }
        if !in_use.is_empty() {
            return Err(StackError::PreconditionViolated(format!(
                "cannot restore directories still in use: {}",
                in_use.join("; ")
            )));
        }
        Ok(())
    }

    /// Replaces each directory with its copy from `snapshot`.
    ///
    /// Fails with [`StackError::PreconditionViolated`] before modifying anything
    /// if a directory is used by a service in `active`. Each directory is either
    /// fully replaced or left untouched.
    pub fn restore(
        &self,
        snapshot: &Snapshot,
        directories: &[DataDir],
        active: &HashSet<String>,
    ) -> Result<(), StackError> {
        Self::ensure_not_in_use(directories, active)?;

        for dir in directories {
            if snapshot.source(&dir.name).is_none() {
                return Err(StackError::Snapshot {
                    path: snapshot.path.display().to_string(),
                    source: io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("snapshot '{}' has no copy of '{}'", snapshot.id, dir.name),
                    ),
                });
            }
        }

        self.verify(snapshot)?;

        for dir in directories {
            replace_dir(&snapshot.source_dir(&dir.name), &dir.path, &snapshot.id)?;
            info!("Restored '{}' from snapshot '{}'", dir.name, snapshot.id);
        }

        Ok(())
    }
}

/// Swaps `target` for a fresh copy of `source`, leaving `target` intact on failure.
fn replace_dir(source: &Path, target: &Path, id: &str) -> Result<(), StackError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(snapshot_err(parent))?;

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "data".to_string());
    let staged = parent.join(format!(".{file_name}.restore-{id}"));
    let displaced = parent.join(format!(".{file_name}.displaced-{id}"));

    if staged.exists() {
        fs::remove_dir_all(&staged).map_err(snapshot_err(&staged))?;
    }

    let mut ignored = BTreeMap::new();
    if let Err(err) = copy_tree(source, &staged, Path::new(""), &mut ignored) {
        let _ = fs::remove_dir_all(&staged);
        return Err(err);
    }

    let had_target = target.exists();
    if had_target {
        if let Err(err) = fs::rename(target, &displaced) {
            let _ = fs::remove_dir_all(&staged);
            return Err(snapshot_err(target)(err));
        }
    }

    if let Err(err) = fs::rename(&staged, target) {
        if had_target {
            let _ = fs::rename(&displaced, target);
        }
        let _ = fs::remove_dir_all(&staged);
        return Err(snapshot_err(target)(err));
    }

    if had_target && let Err(err) = fs::remove_dir_all(&displaced) {
        warn!("Failed to remove displaced copy {:?}: {err}", displaced);
    }

    Ok(())
}

/// Recursively copies `src` into `dst`, recording file digests keyed by relative path.
fn copy_tree(
    src: &Path,
    dst: &Path,
    relative: &Path,
    digests: &mut BTreeMap<String, String>,
) -> Result<(), StackError> {
    fs::create_dir_all(dst).map_err(snapshot_err(dst))?;

    let mut entries: Vec<_> = fs::read_dir(src)
        .map_err(snapshot_err(src))?
        .collect::<Result<_, _>>()
        .map_err(snapshot_err(src))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type().map_err(snapshot_err(&from))?;

        if file_type.is_symlink() {
            let link = fs::read_link(&from).map_err(snapshot_err(&from))?;
            std::os::unix::fs::symlink(&link, &to).map_err(snapshot_err(&to))?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to, &rel, digests)?;
        } else {
            fs::copy(&from, &to).map_err(snapshot_err(&from))?;
            digests.insert(rel.to_string_lossy().to_string(), hash_file(&to)?);
        }
    }

    Ok(())
}

/// Digests every regular file below `root`.
fn digest_tree(
    root: &Path,
    relative: &Path,
    digests: &mut BTreeMap<String, String>,
) -> Result<(), StackError> {
    let dir = root.join(relative);
    for entry in fs::read_dir(&dir).map_err(snapshot_err(&dir))? {
        let entry = entry.map_err(snapshot_err(&dir))?;
        let path = entry.path();
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type().map_err(snapshot_err(&path))?;

        if file_type.is_dir() {
            digest_tree(root, &rel, digests)?;
        } else if file_type.is_file() {
            digests.insert(rel.to_string_lossy().to_string(), hash_file(&path)?);
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<String, StackError> {
    let mut file = File::open(path).map_err(snapshot_err(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(snapshot_err(path))?;
    Ok(format!("{:x}", hasher.finalize()))
}
