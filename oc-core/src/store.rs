use std::collections::BTreeMap;
use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cache_abi::COOKIE_LEN;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::arch::HostArch;
use crate::config::ObjCacheMode;
use crate::format::{CacheRecord, FormatCookie, SerializationConfig};
use crate::wire::{
    IndexEntry, WireError, WireResult, decode_index_entries, decode_record, encode_index_header,
    encode_record, split_cookie, split_index_header,
};

#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadOnly,
    EmptyValue(u64),
    IncompletePair,
    EntryOutsideRanges(u64),
    Wire(WireError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            StoreError::ReadOnly => write!(f, "object cache store is read-only"),
            StoreError::EmptyValue(key) => write!(f, "refusing to store empty value for {key:#x}"),
            StoreError::IncompletePair => write!(f, "object cache index or data file is missing"),
            StoreError::EntryOutsideRanges(entry) => {
                write!(f, "entry {entry:#x} lies outside the record's guest ranges")
            }
            StoreError::Wire(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Wire(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WireError> for StoreError {
    fn from(err: WireError) -> Self {
        StoreError::Wire(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Flat key-value persistence keyed by guest entry address.
pub trait KvStore {
    fn load(&self, key: u64) -> StoreResult<Option<Vec<u8>>>;
    fn store(&mut self, key: u64, bytes: &[u8]) -> StoreResult<()>;
    fn remove(&mut self, key: u64) -> StoreResult<bool>;
    fn keys(&self) -> Vec<u64>;
    /// Drops every entry, leaving a valid empty store.
    fn clear(&mut self) -> StoreResult<()>;
}

impl<T: KvStore + ?Sized> KvStore for Box<T> {
    fn load(&self, key: u64) -> StoreResult<Option<Vec<u8>>> {
        (**self).load(key)
    }

    fn store(&mut self, key: u64, bytes: &[u8]) -> StoreResult<()> {
        (**self).store(key, bytes)
    }

    fn remove(&mut self, key: u64) -> StoreResult<bool> {
        (**self).remove(key)
    }

    fn keys(&self) -> Vec<u64> {
        (**self).keys()
    }

    fn clear(&mut self) -> StoreResult<()> {
        (**self).clear()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<u64, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn load(&self, key: u64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(&key).cloned())
    }

    fn store(&mut self, key: u64, bytes: &[u8]) -> StoreResult<()> {
        if bytes.is_empty() {
            return Err(StoreError::EmptyValue(key));
        }
        self.entries.insert(key, bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: u64) -> StoreResult<bool> {
        Ok(self.entries.remove(&key).is_some())
    }

    fn keys(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Index and data file pair for one host architecture.
///
/// Mutations hold an advisory lock on a sibling file, re-read the index, and
/// append at the data file's current length.
#[derive(Debug)]
pub struct FileStore {
    index_path: PathBuf,
    data_path: PathBuf,
    lock_path: PathBuf,
    writable: bool,
    config: SerializationConfig,
    entries: BTreeMap<u64, (u64, u64)>,
}

impl FileStore {
    pub fn index_path_for(dir: &Path, arch: HostArch) -> PathBuf {
        dir.join(format!("objcache-{}.idx", arch.name()))
    }

    pub fn data_path_for(dir: &Path, arch: HostArch) -> PathBuf {
        dir.join(format!("objcache-{}.dat", arch.name()))
    }

    fn lock_path_for(dir: &Path, arch: HostArch) -> PathBuf {
        dir.join(format!("objcache-{}.lock", arch.name()))
    }

    pub fn open(
        dir: impl AsRef<Path>,
        arch: HostArch,
        config: SerializationConfig,
        writable: bool,
    ) -> StoreResult<Self> {
        let mut store = Self::empty(dir.as_ref(), arch, config, writable);
        let _lock = if writable {
            Some(PairLock::acquire(&store.lock_path)?)
        } else {
            None
        };

        match store.read_pair() {
            Ok(Some(entries)) => {
                info!(
                    "object cache opened path={} entries={} config=[{config}]",
                    store.index_path.display(),
                    entries.len()
                );
                store.entries = entries;
                return Ok(store);
            }
            Ok(None) => debug!("no object cache at path={}", store.index_path.display()),
            Err(err @ StoreError::Io { .. }) => return Err(err),
            Err(err) => warn!(
                "discarding object cache path={} reason={err}",
                store.index_path.display()
            ),
        }

        if writable {
            store.recreate()?;
        }
        Ok(store)
    }

    /// Strict read-only open that adopts the pair's own serialization config.
    pub fn open_existing(dir: impl AsRef<Path>, arch: HostArch) -> StoreResult<Self> {
        let index_path = Self::index_path_for(dir.as_ref(), arch);
        let index = fs::read(&index_path).map_err(io_error(&index_path))?;
        let (config, _) = split_index_header(&index)?;
        let mut store = Self::empty(dir.as_ref(), arch, config, false);
        store.entries = store.read_pair()?.ok_or(StoreError::IncompletePair)?;
        Ok(store)
    }

    fn empty(dir: &Path, arch: HostArch, config: SerializationConfig, writable: bool) -> Self {
        Self {
            index_path: Self::index_path_for(dir, arch),
            data_path: Self::data_path_for(dir, arch),
            lock_path: Self::lock_path_for(dir, arch),
            writable,
            config,
            entries: BTreeMap::new(),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn config(&self) -> &SerializationConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Reads the index before the data file length; writers append data
    // before the index entry that points at it.
    fn read_pair(&self) -> StoreResult<Option<BTreeMap<u64, (u64, u64)>>> {
        let index = read_optional(&self.index_path)?;
        let data = read_data_head(&self.data_path)?;
        match (index, data) {
            (Some(index), Some((head, data_len))) => {
                Ok(Some(parse_file_pair(&index, &head, data_len, &self.config)?))
            }
            (None, None) => Ok(None),
            _ => Err(StoreError::IncompletePair),
        }
    }

    // Caller holds the pair lock.
    fn refresh(&mut self) -> StoreResult<()> {
        self.entries = self.read_pair()?.ok_or(StoreError::IncompletePair)?;
        Ok(())
    }

    fn recreate(&mut self) -> StoreResult<()> {
        write_bytes_to_disk(&self.index_path, &encode_index_header(&self.config))?;
        write_bytes_to_disk(&self.data_path, &FormatCookie::DATA.to_bytes())?;
        self.entries.clear();
        Ok(())
    }

    fn append_index(&self, entry: IndexEntry) -> StoreResult<()> {
        let mut file = open_append(&self.index_path)?;
        file.write_all(&entry.to_bytes())
            .map_err(io_error(&self.index_path))
    }
}

impl KvStore for FileStore {
    fn load(&self, key: u64) -> StoreResult<Option<Vec<u8>>> {
        let Some(&(offset, len)) = self.entries.get(&key) else {
            return Ok(None);
        };
        let mut file = fs::File::open(&self.data_path).map_err(io_error(&self.data_path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(io_error(&self.data_path))?;
        let mut bytes = vec![0u8; len as usize];
        file.read_exact(&mut bytes)
            .map_err(io_error(&self.data_path))?;
        Ok(Some(bytes))
    }

    fn store(&mut self, key: u64, bytes: &[u8]) -> StoreResult<()> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        if bytes.is_empty() {
            return Err(StoreError::EmptyValue(key));
        }
        let _lock = PairLock::acquire(&self.lock_path)?;
        self.refresh()?;

        let mut data = open_append(&self.data_path)?;
        let offset = data
            .metadata()
            .map_err(io_error(&self.data_path))?
            .len();
        data.write_all(bytes).map_err(io_error(&self.data_path))?;
        let len = bytes.len() as u64;
        self.append_index(IndexEntry {
            guest_entry: key,
            data_offset: offset,
            data_len: len,
        })?;
        self.entries.insert(key, (offset, len));
        Ok(())
    }

    fn remove(&mut self, key: u64) -> StoreResult<bool> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        let _lock = PairLock::acquire(&self.lock_path)?;
        self.refresh()?;
        if !self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.append_index(IndexEntry::tombstone(key))?;
        self.entries.remove(&key);
        Ok(true)
    }

    fn keys(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    fn clear(&mut self) -> StoreResult<()> {
        if !self.writable {
            self.entries.clear();
            return Ok(());
        }
        let _lock = PairLock::acquire(&self.lock_path)?;
        self.recreate()
    }
}

fn parse_file_pair(
    index: &[u8],
    data_head: &[u8],
    data_len: u64,
    expected: &SerializationConfig,
) -> WireResult<BTreeMap<u64, (u64, u64)>> {
    let (found, index) = split_index_header(index)?;
    if found != *expected {
        return Err(WireError::SerializationMismatch {
            expected: *expected,
            found,
        });
    }
    split_cookie(data_head, FormatCookie::DATA)?;

    let mut entries = BTreeMap::new();
    for entry in decode_index_entries(index)? {
        if entry.is_tombstone() {
            entries.remove(&entry.guest_entry);
            continue;
        }
        let in_bounds = entry.data_offset >= COOKIE_LEN as u64
            && entry
                .data_offset
                .checked_add(entry.data_len)
                .is_some_and(|end| end <= data_len);
        if !in_bounds {
            return Err(WireError::DataOutOfBounds {
                guest_entry: entry.guest_entry,
                data_offset: entry.data_offset,
                data_len: entry.data_len,
            });
        }
        entries.insert(entry.guest_entry, (entry.data_offset, entry.data_len));
    }
    Ok(entries)
}

fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path)(source)),
    }
}

// Leading cookie bytes and total length of the data file.
fn read_data_head(path: &Path) -> StoreResult<Option<(Vec<u8>, u64)>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path)(source)),
    };
    let len = file.metadata().map_err(io_error(path))?.len();
    let mut head = Vec::with_capacity(COOKIE_LEN);
    file.take(COOKIE_LEN as u64)
        .read_to_end(&mut head)
        .map_err(io_error(path))?;
    Ok(Some((head, len)))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + use<> {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

fn create_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    Ok(())
}

fn write_bytes_to_disk(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    create_parent(path)?;

    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    fs::write(&temp_path, bytes).map_err(io_error(&temp_path))?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&temp_path, path).map_err(io_error(path))
}

fn open_append(path: &Path) -> StoreResult<fs::File> {
    fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(io_error(path))
}

/// Exclusive advisory lock over one index/data pair, released on drop.
struct PairLock {
    file: fs::File,
}

impl PairLock {
    fn acquire(path: &Path) -> StoreResult<Self> {
        create_parent(path)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_error(path))?;
        lock_exclusive(&file).map_err(io_error(path))?;
        Ok(Self { file })
    }
}

impl Drop for PairLock {
    fn drop(&mut self) {
        if let Err(err) = unlock(&self.file) {
            warn!("failed to release object cache lock: {err}");
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &fs::File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    loop {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &fs::File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn lock_exclusive(file: &fs::File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LockFileEx};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        LockFileEx(
            file.as_raw_handle() as _,
            LOCKFILE_EXCLUSIVE_LOCK,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    };
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(file: &fs::File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        UnlockFileEx(
            file.as_raw_handle() as _,
            0,
            u32::MAX,
            u32::MAX,
            &mut overlapped,
        )
    };
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock_exclusive(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

/// Decoded view over a [`KvStore`]. One undecodable record drops the whole
/// cache on open.
pub struct ObjectCache<S: KvStore> {
    arch: HostArch,
    mode: ObjCacheMode,
    store: Mutex<S>,
    records: RwLock<BTreeMap<u64, Arc<CacheRecord>>>,
}

impl<S: KvStore> ObjectCache<S> {
    pub fn open(arch: HostArch, mode: ObjCacheMode, mut store: S) -> Self {
        let mut records = BTreeMap::new();
        if mode.loads() {
            match load_all(arch, &store) {
                Ok(loaded) => records = loaded,
                Err(err) => {
                    error!("object cache rejected, recompiling from scratch reason={err}");
                    if mode.stores()
                        && let Err(err) = store.clear()
                    {
                        warn!("failed to clear rejected object cache: {err}");
                    }
                }
            }
        }
        debug!(
            "object cache ready arch={arch} mode={mode:?} records={}",
            records.len()
        );
        Self {
            arch,
            mode,
            store: Mutex::new(store),
            records: RwLock::new(records),
        }
    }

    pub fn arch(&self) -> HostArch {
        self.arch
    }

    pub fn mode(&self) -> ObjCacheMode {
        self.mode
    }

    pub fn lookup(&self, guest_entry: u64) -> Option<Arc<CacheRecord>> {
        let record = self.records.read().get(&guest_entry).cloned();
        if record.is_none() {
            debug!("object cache miss entry={guest_entry:#x}");
        }
        record
    }

    /// Adds a freshly compiled record. Persists it only in read-write mode.
    pub fn insert(&self, guest_entry: u64, record: CacheRecord) -> StoreResult<()> {
        if !self.mode.loads() {
            return Ok(());
        }
        if !record.covers(guest_entry) {
            return Err(StoreError::EntryOutsideRanges(guest_entry));
        }
        if self.mode.stores() {
            let bytes = encode_record(&record)?;
            self.store.lock().store(guest_entry, &bytes)?;
        }
        self.records.write().insert(guest_entry, Arc::new(record));
        Ok(())
    }

    /// Drops every record covering any byte of `[begin, end)`. Returns the
    /// number removed.
    pub fn invalidate_range(&self, begin: u64, end: u64) -> StoreResult<usize> {
        let mut records = self.records.write();
        let doomed = records
            .iter()
            .filter(|(_, record)| record.overlaps(begin, end))
            .map(|(guest_entry, _)| *guest_entry)
            .collect::<Vec<_>>();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut store = self.store.lock();
        for guest_entry in &doomed {
            records.remove(guest_entry);
            if self.mode.stores() {
                store.remove(*guest_entry)?;
            }
        }
        info!(
            "object cache invalidated range={begin:#x}..{end:#x} records={}",
            doomed.len()
        );
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn entries(&self) -> Vec<(u64, Arc<CacheRecord>)> {
        self.records
            .read()
            .iter()
            .map(|(guest_entry, record)| (*guest_entry, Arc::clone(record)))
            .collect()
    }
}

fn load_all(arch: HostArch, store: &impl KvStore) -> StoreResult<BTreeMap<u64, Arc<CacheRecord>>> {
    let mut records = BTreeMap::new();
    for guest_entry in store.keys() {
        let Some(bytes) = store.load(guest_entry)? else {
            continue;
        };
        let record = decode_record(arch, &bytes)?;
        records.insert(guest_entry, Arc::new(record));
    }
    Ok(records)
}
