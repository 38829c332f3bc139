//! Single-host directory backend.
//!
//! The snapshot text lives in a per-user keyed store and every read-modify-write
//! runs under a named cross-process lock. Both collaborators are traits so the
//! backing technology can be swapped; file-backed and in-memory versions ship here.
//!
//! Every access prunes entries whose port is no longer bound on this host.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::{debug, instrument};

use crate::config::LocalStoreConfig;
use crate::core::snapshot::{validate_handle, Directory};
use crate::directory::{select_endpoint, DirectoryStore, RegisterOptions};
use crate::error::{constants, IpcError, Result};
use crate::sweep::{prune_unbound, BoundPorts, PortTable, SystemPortTable};
use crate::utils::metrics::global_metrics;

/// Key under which the snapshot is stored and after which the lock is named
pub const DIRECTORY_KEY: &str = "handle-ipc.endpoints";

/// Application folder inside the per-user data directory
const APP_DIR: &str = "handle-ipc";

/// Held lock; released on drop
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Lock shared by every process of the user that touches the directory
pub trait NamedLock: Send + Sync {
    /// Block until the lock is held.
    fn acquire(&self) -> Result<LockGuard>;
}

/// Persistent per-user string storage
pub trait KeyedStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

/// Advisory lock on `<dir>/<name>.lock`
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.lock")),
        }
    }
}

impl NamedLock for FileLock {
    fn acquire(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;
        file.lock_exclusive()
            .map_err(|e| IpcError::LockFailed(format!("{}: {e}", self.path.display())))?;
        Ok(LockGuard::new(move || {
            let _ = FileExt::unlock(&file);
        }))
    }
}

/// Snapshot text stored as `<dir>/<key>.snapshot`
#[derive(Debug, Clone)]
pub struct FileKeyedStore {
    dir: PathBuf,
}

impl FileKeyedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.snapshot"))
    }
}

impl KeyedStore for FileKeyedStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("snapshot.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// In-process lock for stores shared only within one process
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl NamedLock for MemoryLock {
    fn acquire(&self) -> Result<LockGuard> {
        let (held, released) = &*self.state;
        let mut guard = held
            .lock()
            .map_err(|_| IpcError::LockFailed(constants::ERR_LOCK_POISONED.to_string()))?;
        while *guard {
            guard = released
                .wait(guard)
                .map_err(|_| IpcError::LockFailed(constants::ERR_LOCK_POISONED.to_string()))?;
        }
        *guard = true;
        drop(guard);

        let state = Arc::clone(&self.state);
        Ok(LockGuard::new(move || {
            let (held, released) = &*state;
            if let Ok(mut guard) = held.lock() {
                *guard = false;
            }
            released.notify_one();
        }))
    }
}

/// In-process keyed strings
#[derive(Debug, Default)]
pub struct MemoryKeyedStore {
    values: Mutex<HashMap<String, String>>,
}

impl KeyedStore for MemoryKeyedStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| IpcError::LockFailed(constants::ERR_LOCK_POISONED.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| IpcError::LockFailed(constants::ERR_LOCK_POISONED.to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

struct LocalInner {
    key: String,
    lock: Arc<dyn NamedLock>,
    store: Arc<dyn KeyedStore>,
    ports: Arc<dyn PortTable>,
}

impl LocalInner {
    /// Read and prune against `bound`. Returns the directory and whether
    /// anything was dropped. Must be called with the lock held.
    fn read_pruned(&self, bound: &BoundPorts) -> Result<(Directory, bool)> {
        let text = self.store.read(&self.key)?.unwrap_or_default();
        let mut directory = Directory::parse(&text)?;
        let dropped = prune_unbound(&mut directory, bound);
        if dropped > 0 {
            global_metrics().pruned(dropped as u64);
        }
        Ok((directory, dropped > 0))
    }

    /// Read and prune; persists the pruned directory if anything was dropped.
    /// Must be called with the lock held.
    fn load_pruned(&self) -> Result<Directory> {
        let (directory, changed) = self.read_pruned(&self.ports.bound_ports()?)?;
        if changed {
            self.store.write(&self.key, &directory.to_snapshot())?;
        }
        Ok(directory)
    }

    fn get_all(&self) -> Result<Directory> {
        let _guard = self.lock.acquire()?;
        self.load_pruned()
    }

    fn set_all(&self, directory: &Directory) -> Result<()> {
        let _guard = self.lock.acquire()?;
        self.store.write(&self.key, &directory.to_snapshot())
    }

    fn register(&self, handle: &str, options: &RegisterOptions) -> Result<SocketAddr> {
        let _guard = self.lock.acquire()?;
        // nothing is written unless an endpoint could be chosen
        let bound = self.ports.bound_ports()?;
        let endpoint = select_endpoint(options, &bound)?;
        let (mut directory, _) = self.read_pruned(&bound)?;
        directory.insert(handle, endpoint);
        self.store.write(&self.key, &directory.to_snapshot())?;
        debug!(handle, endpoint = %endpoint, "Registered receiver locally");
        Ok(endpoint)
    }

    fn lookup(&self, handle: &str) -> Result<Vec<SocketAddr>> {
        Ok(self.get_all()?.endpoints(handle))
    }
}

/// Directory persisted on this host
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalInner>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Assemble a store from explicit collaborators.
    pub fn with_backends(
        key: impl Into<String>,
        lock: Arc<dyn NamedLock>,
        store: Arc<dyn KeyedStore>,
        ports: Arc<dyn PortTable>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                key: key.into(),
                lock,
                store,
                ports,
            }),
        }
    }

    /// File-backed store in `dir`, shared by every process using the same directory.
    pub fn open_in(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self::with_backends(
            DIRECTORY_KEY,
            Arc::new(FileLock::new(&dir, DIRECTORY_KEY)),
            Arc::new(FileKeyedStore::new(dir)),
            Arc::new(SystemPortTable),
        ))
    }

    /// File-backed store in the configured or per-user default location.
    pub fn open(config: &LocalStoreConfig) -> Result<Self> {
        match &config.directory {
            Some(dir) => Self::open_in(dir.clone()),
            None => Self::open_in(default_store_dir()?),
        }
    }

    /// Store visible only inside this process.
    pub fn in_memory() -> Self {
        Self::with_backends(
            DIRECTORY_KEY,
            Arc::new(MemoryLock::default()),
            Arc::new(MemoryKeyedStore::default()),
            Arc::new(SystemPortTable),
        )
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| IpcError::LockFailed(format!("Directory task failed: {e}")))?
    }
}

/// Per-user location: the runtime dir when the platform has one, else local data.
pub fn default_store_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| IpcError::ConfigError(constants::ERR_NO_USER_DIRECTORY.to_string()))
}

#[async_trait]
impl DirectoryStore for LocalStore {
    async fn get_all(&self) -> Result<Directory> {
        self.run_blocking(|inner| inner.get_all()).await
    }

    async fn set_all(&self, directory: &Directory) -> Result<()> {
        let directory = directory.clone();
        self.run_blocking(move |inner| inner.set_all(&directory))
            .await
    }

    #[instrument(skip(self, options))]
    async fn register(&self, handle: &str, options: &RegisterOptions) -> Result<SocketAddr> {
        validate_handle(handle)?;
        let handle = handle.to_string();
        let options = options.clone();
        self.run_blocking(move |inner| inner.register(&handle, &options))
            .await
    }

    async fn lookup(&self, handle: &str) -> Result<Vec<SocketAddr>> {
        let handle = handle.to_string();
        self.run_blocking(move |inner| inner.lookup(&handle)).await
    }

    fn select_endpoint(&self, options: &RegisterOptions) -> Result<SocketAddr> {
        select_endpoint(options, &self.inner.ports.bound_ports()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::FixedPortTable;
    use std::collections::HashSet;

    fn store_with_ports(ports: HashSet<u16>) -> LocalStore {
        LocalStore::with_backends(
            DIRECTORY_KEY,
            Arc::new(MemoryLock::default()),
            Arc::new(MemoryKeyedStore::default()),
            Arc::new(FixedPortTable(ports)),
        )
    }

    #[tokio::test]
    async fn test_lookup_prunes_unbound_ports() {
        let store = store_with_ports(HashSet::from([9000]));
        store
            .set_all(&Directory::parse("A*10.0.0.1-9000+9001+,;").unwrap())
            .await
            .unwrap();

        let endpoints = store.lookup("A").await.unwrap();
        assert_eq!(endpoints, vec!["10.0.0.1:9000".parse().unwrap()]);
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_records_endpoint() {
        let store = store_with_ports(HashSet::new());
        let options = RegisterOptions::default().with_ip("127.0.0.1".parse().unwrap());
        let endpoint = store.register("A", &options).await.unwrap();

        // FixedPortTable does not see the endpoint bound, so read the raw snapshot
        let text = store.inner.store.read(DIRECTORY_KEY).unwrap().unwrap();
        assert!(Directory::parse(&text).unwrap().contains("A", endpoint));
    }

    #[tokio::test]
    async fn test_failed_register_keeps_stale_entries() {
        let store = store_with_ports(HashSet::from([7000]));
        let seeded = "A*10.0.0.1-9000+,;";
        store.inner.store.write(DIRECTORY_KEY, seeded).unwrap();

        let options = RegisterOptions::default()
            .with_ip("127.0.0.1".parse().unwrap())
            .with_allowed_ports([7000]);
        assert!(matches!(
            store.register("B", &options).await,
            Err(IpcError::PortExhaustion)
        ));

        let text = store.inner.store.read(DIRECTORY_KEY).unwrap().unwrap();
        assert_eq!(text, seeded);
    }

    #[tokio::test]
    async fn test_register_rejects_reserved_handle() {
        let store = store_with_ports(HashSet::new());
        assert!(matches!(
            store.register("a;b", &RegisterOptions::default()).await,
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_memory_lock_serializes() {
        let lock = MemoryLock::default();
        let counter = Arc::new(Mutex::new(0u32));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.acquire().unwrap();
                        let value = *counter.lock().unwrap();
                        std::thread::yield_now();
                        *counter.lock().unwrap() = value + 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 400);
    }
}
