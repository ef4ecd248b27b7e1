pub mod arch;
pub mod config;
pub mod emit;
pub mod format;
pub mod install;
pub mod memory;
pub mod regalloc;
pub mod reloc;
pub mod resolve;
pub mod runtime;
pub mod store;
pub mod symbols;
pub mod wire;

pub use arch::HostArch;
pub use config::{CacheConfig, ConfigError, ObjCacheMode};
pub use emit::{CodeCursor, EmitError, EmitResult, FragmentEmitter, PendingLiteral};
pub use format::{
    CacheRecord, CodeFragment, CompiledFragment, FormatCookie, GuestRange, SerializationConfig,
    SmcChecks,
};
pub use install::{InstallError, InstallResult, apply_relocations, install, install_with_reset};
pub use memory::{
    CodeBuffer, ExecutableRegion, InstalledFragment, MemoryError, Reservation, SharedCodeBuffer,
};
pub use regalloc::{PhysicalRegister, RegAllocError, RegisterAllocationData};
pub use reloc::{
    NamedSymbol, Relocation, RelocationError, RelocationKind, RelocationLedger, ThunkHash,
    validate_relocations,
};
pub use resolve::{NamedSymbolTable, NoThunks, ResolutionContext, ThunkResolver, ThunkTable};
pub use runtime::{CacheRuntime, InstallOutcome, RuntimeError};
pub use store::{FileStore, KvStore, MemoryStore, ObjectCache, StoreError, StoreResult};
pub use symbols::JitSymbols;
pub use wire::{
    INDEX_HEADER_LEN, IndexEntry, WireError, WireResult, decode_index_entries, decode_record,
    describe_record, encode_index_header, encode_record, split_cookie, split_index_header,
};
