//! Persistent volumes shared across execution contexts.
//!
//! A volume is a committed store on disk plus any number of mounts, one per
//! execution context. Writes land in the mount and become visible to other
//! contexts only after the writer calls [`VolumeMount::commit`] and the
//! reader calls [`VolumeMount::reload`]. A mount that has not reloaded may
//! serve stale data; nothing detects or invalidates that.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use kiln_types::{KilnError, KilnResult, VolumeError};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const STORE_DIR: &str = "store";
const VERSION_FILE: &str = "VERSION";
const COPY_BUFFER: usize = 64 * 1024;

/// SHA-256 of a file's contents.
type FileDigest = [u8; 32];

/// Commit/reload lock per store root, shared by every handle in the process.
fn store_lock(root: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    LOCKS
        .get_or_init(DashMap::new)
        .entry(root.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Run blocking file work off the async runtime.
pub(crate) async fn run_blocking<T, F>(what: &str, f: F) -> KilnResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> KilnResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal(format!("{what} task failed: {e}")))?
}

/// Directory of one execution context. Removed with its contents on drop.
#[derive(Debug)]
pub struct ContextDir {
    path: PathBuf,
}

impl ContextDir {
    /// Create a fresh, uniquely named context under `contexts_dir`.
    pub fn create<P: AsRef<Path>>(contexts_dir: P) -> KilnResult<Self> {
        let path = contexts_dir.as_ref().join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ContextDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed context {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean up context {}: {}", self.path.display(), e),
        }
    }
}

/// Handle to a named volume.
#[derive(Debug, Clone)]
pub struct Volume {
    name: String,
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Volume {
    /// Look up a volume under `volumes_dir`, creating it when allowed.
    pub fn from_name<P: AsRef<Path>>(
        volumes_dir: P,
        name: &str,
        create_if_missing: bool,
    ) -> KilnResult<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(VolumeError::InvalidName {
                name: name.to_string(),
            }
            .into());
        }

        let root = volumes_dir.as_ref().join(name);
        let store = root.join(STORE_DIR);
        if !store.is_dir() {
            if !create_if_missing {
                return Err(VolumeError::NotFound {
                    name: name.to_string(),
                }
                .into());
            }
            std::fs::create_dir_all(&store)?;
            info!("Created volume {} at {}", name, root.display());
        }

        Ok(Self {
            name: name.to_string(),
            lock: store_lock(&root),
            root,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR)
    }

    /// Number of commits the store has received.
    pub fn version(&self) -> KilnResult<u64> {
        let path = self.root.join(VERSION_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| {
                KilnError::from(VolumeError::ReloadFailed {
                    name: self.name.clone(),
                    message: format!("corrupt version file: {e}"),
                })
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Mount the volume at `path` and load its committed state.
    pub fn mount<P: AsRef<Path>>(&self, path: P) -> KilnResult<VolumeMount> {
        self.mount_at(path.as_ref().to_path_buf(), None)
    }

    /// Mount the volume inside a fresh execution context directory. The
    /// context is removed once the last handle to the mount is dropped.
    pub fn mount_in_new_context<P: AsRef<Path>>(&self, contexts_dir: P) -> KilnResult<VolumeMount> {
        let context = ContextDir::create(contexts_dir)?;
        let path = context.path().join(&self.name);
        self.mount_at(path, Some(context))
    }

    /// [`Volume::mount_in_new_context`] on a blocking thread.
    pub async fn mount_in_new_context_async(
        &self,
        contexts_dir: impl Into<PathBuf>,
    ) -> KilnResult<VolumeMount> {
        let volume = self.clone();
        let contexts_dir = contexts_dir.into();
        run_blocking("mount", move || volume.mount_in_new_context(contexts_dir)).await
    }

    fn mount_at(&self, path: PathBuf, context: Option<ContextDir>) -> KilnResult<VolumeMount> {
        std::fs::create_dir_all(&path)?;
        let mount = VolumeMount {
            state: Arc::new(MountState {
                volume: self.clone(),
                path,
                observed_version: AtomicU64::new(0),
                baseline: Mutex::new(HashMap::new()),
                context,
            }),
        };
        mount.reload()?;
        Ok(mount)
    }
}

#[derive(Debug)]
struct MountState {
    volume: Volume,
    path: PathBuf,
    observed_version: AtomicU64,
    /// Digest of every file as the store last handed it to this mount,
    /// keyed by path relative to the mount.
    baseline: Mutex<HashMap<PathBuf, FileDigest>>,
    context: Option<ContextDir>,
}

/// A volume as seen from one execution context. Clones share the same mount.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    state: Arc<MountState>,
}

impl VolumeMount {
    pub fn path(&self) -> &Path {
        &self.state.path
    }

    pub fn volume(&self) -> &Volume {
        &self.state.volume
    }

    /// Execution context owning this mount, if it was mounted into one.
    pub fn context_dir(&self) -> Option<&Path> {
        self.state.context.as_ref().map(ContextDir::path)
    }

    /// Store version this mount last reloaded or committed.
    pub fn observed_version(&self) -> u64 {
        self.state.observed_version.load(Ordering::Acquire)
    }

    /// Persist the files this mount created or changed since it last
    /// reloaded. Files it only received from the store are left alone, so
    /// concurrent writers never roll back each other's commits; two writers
    /// of the same file resolve to the last commit. Deletions are not
    /// propagated.
    pub fn commit(&self) -> KilnResult<u64> {
        let volume = &self.state.volume;
        let _guard = volume.lock.lock();
        let name = &volume.name;
        let commit_failed = |e: std::io::Error| VolumeError::CommitFailed {
            name: name.clone(),
            message: e.to_string(),
        };

        let mut baseline = self.state.baseline.lock();
        let copied = commit_changes(&self.state.path, &volume.store_dir(), &mut baseline)
            .map_err(commit_failed)?;

        let version = volume.version()? + 1;
        write_version(&volume.root, version).map_err(commit_failed)?;
        self.state.observed_version.store(version, Ordering::Release);

        info!("Committed {} changed files to volume {} (version {})", copied, name, version);
        Ok(version)
    }

    /// Bring the mount up to date with every commit made so far.
    pub fn reload(&self) -> KilnResult<u64> {
        let volume = &self.state.volume;
        let _guard = volume.lock.lock();
        let name = &volume.name;

        let version = volume.version()?;
        let mut baseline = self.state.baseline.lock();
        let copied = reload_store(&volume.store_dir(), &self.state.path, &mut baseline)
            .map_err(|e| VolumeError::ReloadFailed {
                name: name.clone(),
                message: e.to_string(),
            })?;
        self.state.observed_version.store(version, Ordering::Release);

        debug!("Reloaded volume {} at version {} ({} files)", name, version, copied);
        Ok(version)
    }

    /// [`VolumeMount::commit`] on a blocking thread.
    pub async fn commit_async(&self) -> KilnResult<u64> {
        let mount = self.clone();
        run_blocking("commit", move || mount.commit()).await
    }

    /// [`VolumeMount::reload`] on a blocking thread.
    pub async fn reload_async(&self) -> KilnResult<u64> {
        let mount = self.clone();
        run_blocking("reload", move || mount.reload()).await
    }
}

fn write_version(root: &Path, version: u64) -> std::io::Result<()> {
    let tmp = root.join(format!("{VERSION_FILE}.tmp"));
    std::fs::write(&tmp, version.to_string())?;
    std::fs::rename(tmp, root.join(VERSION_FILE))
}

/// Regular files under `root` (following symlinks) with their relative paths.
fn files_under(root: &Path) -> impl Iterator<Item = std::io::Result<(PathBuf, PathBuf)>> + '_ {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(std::io::Error::other(e))),
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .map_err(std::io::Error::other);
            Some(relative.map(|relative| (entry.path().to_path_buf(), relative)))
        })
}

/// Copy `from` to `to`, creating parent directories, and return the digest of
/// the bytes copied.
fn copy_file_hashed(from: &Path, to: &Path) -> std::io::Result<FileDigest> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut reader = File::open(from)?;
    let mut writer = File::create(to)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    std::fs::set_permissions(to, std::fs::metadata(from)?.permissions())?;

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

fn file_digest(path: &Path) -> std::io::Result<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Copy every store file into the mount and record what was handed over.
fn reload_store(
    store: &Path,
    mount: &Path,
    baseline: &mut HashMap<PathBuf, FileDigest>,
) -> std::io::Result<u64> {
    let mut copied = 0;
    std::fs::create_dir_all(mount)?;
    for file in files_under(store) {
        let (source, relative) = file?;
        let digest = copy_file_hashed(&source, &mount.join(&relative))?;
        baseline.insert(relative, digest);
        copied += 1;
    }
    Ok(copied)
}

/// Copy mount files whose contents differ from the baseline into the store.
fn commit_changes(
    mount: &Path,
    store: &Path,
    baseline: &mut HashMap<PathBuf, FileDigest>,
) -> std::io::Result<u64> {
    let mut copied = 0;
    std::fs::create_dir_all(store)?;
    for file in files_under(mount) {
        let (source, relative) = file?;
        if let Some(known) = baseline.get(&relative) {
            if *known == file_digest(&source)? {
                continue;
            }
        }
        let digest = copy_file_hashed(&source, &store.join(&relative))?;
        baseline.insert(relative, digest);
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_volume_is_an_error_unless_created() {
        let temp_dir = tempdir().unwrap();

        let missing = Volume::from_name(temp_dir.path(), "weights", false);
        assert!(matches!(
            missing,
            Err(KilnError::Volume(VolumeError::NotFound { .. }))
        ));

        let created = Volume::from_name(temp_dir.path(), "weights", true).unwrap();
        assert_eq!(created.name(), "weights");
        assert_eq!(created.version().unwrap(), 0);
        assert!(Volume::from_name(temp_dir.path(), "weights", false).is_ok());
    }

    #[test]
    fn rejects_path_like_names() {
        let temp_dir = tempdir().unwrap();
        for name in ["", "a/b", ".."] {
            assert!(Volume::from_name(temp_dir.path(), name, true).is_err());
        }
    }

    #[test]
    fn reload_observes_prior_commits() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path().join("volumes"), "model", true).unwrap();

        let writer = volume.mount(temp_dir.path().join("ctx-a")).unwrap();
        let reader = volume.mount(temp_dir.path().join("ctx-b")).unwrap();

        std::fs::create_dir_all(writer.path().join("steps_10_rank_4")).unwrap();
        std::fs::write(writer.path().join("steps_10_rank_4/weights.bin"), b"abc").unwrap();

        // not committed yet: invisible everywhere else
        reader.reload().unwrap();
        assert!(!reader.path().join("steps_10_rank_4/weights.bin").exists());

        let version = writer.commit().unwrap();
        assert_eq!(version, 1);

        // committed but the reader has not reloaded: stale view is allowed
        assert!(!reader.path().join("steps_10_rank_4/weights.bin").exists());
        assert_eq!(reader.observed_version(), 0);

        assert_eq!(reader.reload().unwrap(), 1);
        let contents = std::fs::read(reader.path().join("steps_10_rank_4/weights.bin")).unwrap();
        assert_eq!(contents, b"abc");
    }

    #[test]
    fn last_commit_wins() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path(), "model", true).unwrap();
        let a = volume.mount_in_new_context(temp_dir.path().join("contexts")).unwrap();
        let b = volume.mount_in_new_context(temp_dir.path().join("contexts")).unwrap();
        assert_ne!(a.path(), b.path());

        std::fs::write(a.path().join("config.json"), "a").unwrap();
        std::fs::write(b.path().join("config.json"), "b").unwrap();
        a.commit().unwrap();
        b.commit().unwrap();

        let fresh = volume.mount(temp_dir.path().join("fresh")).unwrap();
        assert_eq!(fresh.observed_version(), 2);
        assert_eq!(std::fs::read_to_string(fresh.path().join("config.json")).unwrap(), "b");
    }

    #[test]
    fn commit_leaves_files_other_writers_changed() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path().join("volumes"), "model", true).unwrap();
        let contexts = temp_dir.path().join("contexts");

        let seed = volume.mount_in_new_context(&contexts).unwrap();
        std::fs::create_dir_all(seed.path().join("steps_2000")).unwrap();
        std::fs::write(seed.path().join("steps_2000/w.bin"), "old").unwrap();
        seed.commit().unwrap();

        let a = volume.mount_in_new_context(&contexts).unwrap();
        let b = volume.mount_in_new_context(&contexts).unwrap();

        std::fs::write(a.path().join("steps_2000/w.bin"), "new").unwrap();
        a.commit().unwrap();

        std::fs::create_dir_all(b.path().join("steps_3000")).unwrap();
        std::fs::write(b.path().join("steps_3000/w.bin"), "other").unwrap();
        b.commit().unwrap();

        let reader = volume.mount(temp_dir.path().join("reader")).unwrap();
        assert_eq!(reader.observed_version(), 3);
        assert_eq!(
            std::fs::read_to_string(reader.path().join("steps_2000/w.bin")).unwrap(),
            "new"
        );
        assert_eq!(
            std::fs::read_to_string(reader.path().join("steps_3000/w.bin")).unwrap(),
            "other"
        );
    }

    #[test]
    fn context_is_removed_with_its_last_mount() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path().join("volumes"), "model", true).unwrap();
        let contexts = temp_dir.path().join("contexts");

        let mount = volume.mount_in_new_context(&contexts).unwrap();
        let context = mount.context_dir().unwrap().to_path_buf();
        assert!(context.starts_with(&contexts));
        assert!(mount.path().starts_with(&context));

        let clone = mount.clone();
        drop(mount);
        assert!(context.is_dir());
        drop(clone);
        assert!(!context.exists());
        assert_eq!(std::fs::read_dir(&contexts).unwrap().count(), 0);

        // plain mounts own no context
        let plain = volume.mount(temp_dir.path().join("plain")).unwrap();
        assert!(plain.context_dir().is_none());
    }

    #[tokio::test]
    async fn async_commit_and_reload() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path().join("volumes"), "model", true).unwrap();
        let contexts = temp_dir.path().join("contexts");

        let writer = volume.mount_in_new_context_async(&contexts).await.unwrap();
        let reader = volume.mount_in_new_context_async(&contexts).await.unwrap();
        std::fs::write(writer.path().join("weights.bin"), "abc").unwrap();

        assert_eq!(writer.commit_async().await.unwrap(), 1);
        assert_eq!(reader.reload_async().await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(reader.path().join("weights.bin")).unwrap(), "abc");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_files_are_committed_as_files() {
        let temp_dir = tempdir().unwrap();
        let volume = Volume::from_name(temp_dir.path().join("volumes"), "weights", true).unwrap();
        let writer = volume.mount(temp_dir.path().join("writer")).unwrap();

        let blob = temp_dir.path().join("blob");
        std::fs::write(&blob, "ckpt").unwrap();
        std::os::unix::fs::symlink(&blob, writer.path().join("boltz1_conf.ckpt")).unwrap();
        writer.commit().unwrap();

        let reader = volume.mount(temp_dir.path().join("reader")).unwrap();
        assert_eq!(
            std::fs::read_to_string(reader.path().join("boltz1_conf.ckpt")).unwrap(),
            "ckpt"
        );
    }
}
