use cache_abi::{
    LITERAL_WIDTH, RELOC_GUEST_ADDRESS_LITERAL, RELOC_GUEST_ADDRESS_MOVE, RELOC_NAMED_SYMBOL_LITERAL,
    RELOC_NAMED_THUNK_MOVE, SYMBOL_DISPATCHER_LOOP_TOP, SYMBOL_EXIT_FUNCTION_LINKER,
    SYMBOL_SIGNAL_RETURN_HANDLER, SYMBOL_THREAD_STOP_HANDLER, THUNK_HASH_LEN,
};
use sha2::{Digest, Sha256};

use crate::arch::HostArch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamedSymbol {
    ExitFunctionLinker,
    DispatcherLoopTop,
    ThreadStopHandler,
    SignalReturnHandler,
}

impl NamedSymbol {
    pub const ALL: [NamedSymbol; cache_abi::NAMED_SYMBOL_COUNT] = [
        NamedSymbol::ExitFunctionLinker,
        NamedSymbol::DispatcherLoopTop,
        NamedSymbol::ThreadStopHandler,
        NamedSymbol::SignalReturnHandler,
    ];

    pub fn id(self) -> u32 {
        match self {
            NamedSymbol::ExitFunctionLinker => SYMBOL_EXIT_FUNCTION_LINKER,
            NamedSymbol::DispatcherLoopTop => SYMBOL_DISPATCHER_LOOP_TOP,
            NamedSymbol::ThreadStopHandler => SYMBOL_THREAD_STOP_HANDLER,
            NamedSymbol::SignalReturnHandler => SYMBOL_SIGNAL_RETURN_HANDLER,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|symbol| symbol.id() == id)
    }

    pub fn name(self) -> &'static str {
        cache_abi::named_symbol_by_id(self.id())
            .map(|desc| desc.name)
            .unwrap_or("<unnamed>")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThunkHash([u8; THUNK_HASH_LEN]);

impl ThunkHash {
    pub const fn from_bytes(bytes: [u8; THUNK_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn for_symbol(library: &str, function: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(library.as_bytes());
        hasher.update(b":");
        hasher.update(function.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; THUNK_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ThunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThunkHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ThunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    NamedSymbolLiteral,
    GuestAddressLiteral,
    NamedThunkMove,
    GuestAddressMove,
}

impl RelocationKind {
    pub fn tag(self) -> u8 {
        match self {
            RelocationKind::NamedSymbolLiteral => RELOC_NAMED_SYMBOL_LITERAL,
            RelocationKind::GuestAddressLiteral => RELOC_GUEST_ADDRESS_LITERAL,
            RelocationKind::NamedThunkMove => RELOC_NAMED_THUNK_MOVE,
            RelocationKind::GuestAddressMove => RELOC_GUEST_ADDRESS_MOVE,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            RELOC_NAMED_SYMBOL_LITERAL => Some(RelocationKind::NamedSymbolLiteral),
            RELOC_GUEST_ADDRESS_LITERAL => Some(RelocationKind::GuestAddressLiteral),
            RELOC_NAMED_THUNK_MOVE => Some(RelocationKind::NamedThunkMove),
            RELOC_GUEST_ADDRESS_MOVE => Some(RelocationKind::GuestAddressMove),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        cache_abi::relocation_kind_by_tag(self.tag())
            .map(|desc| desc.name)
            .unwrap_or("<unknown>")
    }

    pub fn is_move(self) -> bool {
        matches!(
            self,
            RelocationKind::NamedThunkMove | RelocationKind::GuestAddressMove
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relocation {
    NamedSymbolLiteral {
        offset: u32,
        symbol: NamedSymbol,
    },
    GuestAddressLiteral {
        offset: u32,
        delta: i64,
    },
    NamedThunkMove {
        offset: u32,
        hash: ThunkHash,
        register: u8,
    },
    GuestAddressMove {
        offset: u32,
        delta: i64,
        register: u8,
    },
}

impl Relocation {
    pub fn kind(&self) -> RelocationKind {
        match self {
            Relocation::NamedSymbolLiteral { .. } => RelocationKind::NamedSymbolLiteral,
            Relocation::GuestAddressLiteral { .. } => RelocationKind::GuestAddressLiteral,
            Relocation::NamedThunkMove { .. } => RelocationKind::NamedThunkMove,
            Relocation::GuestAddressMove { .. } => RelocationKind::GuestAddressMove,
        }
    }

    pub fn offset(&self) -> u32 {
        match self {
            Relocation::NamedSymbolLiteral { offset, .. }
            | Relocation::GuestAddressLiteral { offset, .. }
            | Relocation::NamedThunkMove { offset, .. }
            | Relocation::GuestAddressMove { offset, .. } => *offset,
        }
    }

    pub fn register(&self) -> Option<u8> {
        match self {
            Relocation::NamedThunkMove { register, .. }
            | Relocation::GuestAddressMove { register, .. } => Some(*register),
            _ => None,
        }
    }

    pub fn patch_width(&self, arch: HostArch) -> usize {
        if self.kind().is_move() {
            arch.move_width()
        } else {
            LITERAL_WIDTH
        }
    }
}

pub fn guest_delta(guest_entry: u64, guest_address: u64) -> i64 {
    guest_address.wrapping_sub(guest_entry) as i64
}

pub fn guest_address(guest_entry: u64, delta: i64) -> u64 {
    guest_entry.wrapping_add_signed(delta)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocationError {
    OutOfBounds {
        index: usize,
        offset: u32,
        width: usize,
        code_len: usize,
    },
    Overlap {
        first: usize,
        second: usize,
    },
    InvalidRegister {
        index: usize,
        register: u8,
    },
}

impl std::fmt::Display for RelocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocationError::OutOfBounds {
                index,
                offset,
                width,
                code_len,
            } => write!(
                f,
                "relocation #{index} at offset {offset} (width {width}) exceeds code length {code_len}",
            ),
            RelocationError::Overlap { first, second } => {
                write!(f, "relocations #{first} and #{second} overlap")
            }
            RelocationError::InvalidRegister { index, register } => {
                write!(f, "relocation #{index} names invalid register {register}")
            }
        }
    }
}

impl std::error::Error for RelocationError {}

pub fn validate_relocations(
    arch: HostArch,
    code_len: usize,
    relocations: &[Relocation],
) -> Result<(), RelocationError> {
    let mut spans = Vec::with_capacity(relocations.len());
    for (index, relocation) in relocations.iter().enumerate() {
        if let Some(register) = relocation.register()
            && arch.check_register(register).is_err()
        {
            return Err(RelocationError::InvalidRegister { index, register });
        }
        let offset = relocation.offset();
        let width = relocation.patch_width(arch);
        let start = offset as usize;
        let end = start.checked_add(width).filter(|end| *end <= code_len);
        let Some(end) = end else {
            return Err(RelocationError::OutOfBounds {
                index,
                offset,
                width,
                code_len,
            });
        };
        spans.push((start, end, index));
    }

    spans.sort_unstable();
    for pair in spans.windows(2) {
        let (_, prev_end, prev_index) = pair[0];
        let (next_start, _, next_index) = pair[1];
        if next_start < prev_end {
            return Err(RelocationError::Overlap {
                first: prev_index.min(next_index),
                second: prev_index.max(next_index),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelocationLedger {
    entries: Vec<Relocation>,
}

impl RelocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, relocation: Relocation) {
        self.entries.push(relocation);
    }

    pub fn entries(&self) -> &[Relocation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<Relocation> {
        self.entries
    }
}
