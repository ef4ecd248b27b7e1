use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::arch::HostArch;
use crate::config::{CacheConfig, ConfigError};
use crate::format::CompiledFragment;
use crate::install::{InstallError, InstallResult, install_with_reset};
use crate::memory::{CodeBuffer, InstalledFragment, MemoryError, SharedCodeBuffer};
use crate::resolve::{NamedSymbolTable, ResolutionContext, ThunkResolver};
use crate::store::{FileStore, KvStore, MemoryStore, ObjectCache, StoreError, StoreResult};
use crate::symbols::JitSymbols;

pub type DynStore = Box<dyn KvStore + Send>;

#[derive(Debug)]
pub enum RuntimeError {
    Config(ConfigError),
    Store(StoreError),
    Memory(MemoryError),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Config(err) => write!(f, "config: {err}"),
            RuntimeError::Store(err) => write!(f, "object cache store: {err}"),
            RuntimeError::Memory(err) => write!(f, "code buffer: {err}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Config(err) => Some(err),
            RuntimeError::Store(err) => Some(err),
            RuntimeError::Memory(err) => Some(err),
        }
    }
}

impl From<ConfigError> for RuntimeError {
    fn from(err: ConfigError) -> Self {
        RuntimeError::Config(err)
    }
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Store(err)
    }
}

impl From<MemoryError> for RuntimeError {
    fn from(err: MemoryError) -> Self {
        RuntimeError::Memory(err)
    }
}

#[derive(Debug)]
pub enum InstallOutcome {
    Installed(InstalledFragment),
    Miss,
    /// The record exists but cannot run in this process; compile afresh.
    Uninstallable(InstallError),
}

pub struct CacheRuntime {
    config: CacheConfig,
    arch: HostArch,
    symbols: NamedSymbolTable,
    cache: ObjectCache<DynStore>,
    code: SharedCodeBuffer,
    perf: Option<Mutex<JitSymbols>>,
}

impl CacheRuntime {
    pub fn from_config(
        config: CacheConfig,
        arch: HostArch,
        symbols: NamedSymbolTable,
    ) -> Result<Self, RuntimeError> {
        let store: DynStore = match (&config.cache_dir, config.mode.loads()) {
            (Some(dir), true) => Box::new(FileStore::open(
                dir,
                arch,
                config.serialization,
                config.mode.stores(),
            )?),
            _ => Box::new(MemoryStore::new()),
        };
        let cache = ObjectCache::open(arch, config.mode, store);
        let code = SharedCodeBuffer::new(CodeBuffer::new(arch, config.code_buffer_size)?);

        let perf = if config.perf_map {
            match JitSymbols::open_default() {
                Ok(mut map) => {
                    let (base, len) =
                        code.with_buffer(|buffer| (buffer.address_of(0), buffer.capacity()));
                    map.register_code_buffer(base, len);
                    Some(Mutex::new(map))
                }
                Err(err) => {
                    warn!("perf map unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        info!(
            "object cache runtime ready arch={arch} mode={:?} records={} code_buffer={}",
            config.mode,
            cache.len(),
            config.code_buffer_size
        );
        Ok(Self {
            config,
            arch,
            symbols,
            cache,
            code,
            perf,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn arch(&self) -> HostArch {
        self.arch
    }

    pub fn symbols(&self) -> &NamedSymbolTable {
        &self.symbols
    }

    pub fn cache(&self) -> &ObjectCache<DynStore> {
        &self.cache
    }

    pub fn code_buffer(&self) -> &SharedCodeBuffer {
        &self.code
    }

    pub fn context<'a>(
        &'a self,
        guest_entry: u64,
        thunks: &'a dyn ThunkResolver,
    ) -> ResolutionContext<'a> {
        ResolutionContext::new(guest_entry, &self.symbols, thunks)
    }

    pub fn is_live(&self, installed: &InstalledFragment) -> bool {
        self.code.is_live(installed)
    }

    pub fn install_cached(&self, guest_entry: u64, thunks: &dyn ThunkResolver) -> InstallOutcome {
        let Some(record) = self.cache.lookup(guest_entry) else {
            return InstallOutcome::Miss;
        };
        let ctx = self.context(guest_entry, thunks);
        match install_with_reset(&self.code, &record.fragment, &ctx) {
            Ok(installed) => {
                self.register_perf(guest_entry, &installed);
                InstallOutcome::Installed(installed)
            }
            Err(err) => {
                debug!("cached fragment not installable entry={guest_entry:#x} reason={err}");
                InstallOutcome::Uninstallable(err)
            }
        }
    }

    /// Installs a freshly compiled fragment and records it in the cache.
    /// Failing to persist the record does not fail the install.
    pub fn install_fresh(
        &self,
        compiled: CompiledFragment,
        thunks: &dyn ThunkResolver,
    ) -> InstallResult<InstalledFragment> {
        let ctx = self.context(compiled.guest_entry, thunks);
        let installed = install_with_reset(&self.code, &compiled.record.fragment, &ctx)?;
        self.register_perf(compiled.guest_entry, &installed);
        if let Err(err) = self.cache.insert(compiled.guest_entry, compiled.record) {
            warn!(
                "failed to cache fragment entry={:#x} reason={err}",
                compiled.guest_entry
            );
        }
        Ok(installed)
    }

    pub fn invalidate_range(&self, begin: u64, end: u64) -> StoreResult<usize> {
        self.cache.invalidate_range(begin, end)
    }

    fn register_perf(&self, guest_entry: u64, installed: &InstalledFragment) {
        if let Some(perf) = &self.perf {
            perf.lock()
                .register_fragment(installed.address, installed.len, guest_entry);
        }
    }
}
