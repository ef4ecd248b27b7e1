use cache_abi::LITERAL_WIDTH;
use tracing::debug;

use crate::arch::HostArch;
use crate::format::{CacheRecord, CodeFragment, CompiledFragment, GuestRange};
use crate::reloc::{
    NamedSymbol, Relocation, RelocationError, RelocationLedger, ThunkHash, guest_address,
    guest_delta, validate_relocations,
};
use crate::resolve::ResolutionContext;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmitError {
    RegisterOutOfRange { arch: HostArch, register: u8 },
    MoveTooWide { arch: HostArch, len: usize },
    PatchOutOfBounds { offset: usize, width: usize, len: usize },
    DisplacementOverflow,
    MisalignedLiteral { site: usize, target: usize },
    FragmentTooLarge(usize),
    NoGuestRanges,
    InvalidRange { begin: u64, end: u64 },
    Relocation(RelocationError),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::RegisterOutOfRange { arch, register } => {
                write!(f, "register {register} is not addressable on {arch}")
            }
            EmitError::MoveTooWide { arch, len } => write!(
                f,
                "{arch} move encoding of {len} bytes exceeds the fixed width {}",
                arch.move_width()
            ),
            EmitError::PatchOutOfBounds { offset, width, len } => write!(
                f,
                "patch of {width} bytes at offset {offset} exceeds code length {len}",
            ),
            EmitError::DisplacementOverflow => write!(f, "pc-relative displacement overflow"),
            EmitError::MisalignedLiteral { site, target } => write!(
                f,
                "literal at offset {target} is not reachable from load at offset {site}",
            ),
            EmitError::FragmentTooLarge(len) => write!(f, "fragment too large: {len} bytes"),
            EmitError::NoGuestRanges => write!(f, "fragment covers no guest range"),
            EmitError::InvalidRange { begin, end } => {
                write!(f, "invalid guest range [{begin:#x}, {end:#x})")
            }
            EmitError::Relocation(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EmitError {}

impl From<RelocationError> for EmitError {
    fn from(err: RelocationError) -> Self {
        EmitError::Relocation(err)
    }
}

pub type EmitResult<T> = Result<T, EmitError>;

pub struct CodeCursor<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> CodeCursor<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write(&mut self, data: &[u8]) -> EmitResult<()> {
        let end = self
            .position
            .checked_add(data.len())
            .filter(|end| *end <= self.bytes.len())
            .ok_or(EmitError::PatchOutOfBounds {
                offset: self.position,
                width: data.len(),
                len: self.bytes.len(),
            })?;
        self.bytes[self.position..end].copy_from_slice(data);
        self.position = end;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> EmitResult<()> {
        self.write(&value.to_le_bytes())
    }

    /// Runs `f` with the cursor moved to `position`; the previous position is
    /// restored whatever `f` returns.
    pub fn scoped<R>(&mut self, position: usize, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.position;
        self.position = position;
        let result = f(self);
        self.position = saved;
        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LiteralValue {
    Symbol(NamedSymbol),
    Guest { delta: i64 },
}

#[must_use = "a pending literal must be placed before the fragment is finished"]
#[derive(Debug, PartialEq, Eq)]
pub struct PendingLiteral {
    value: LiteralValue,
    load_sites: Vec<usize>,
}

pub struct FragmentEmitter<'a> {
    arch: HostArch,
    context: ResolutionContext<'a>,
    code: Vec<u8>,
    ranges: Vec<GuestRange>,
    ledger: RelocationLedger,
}

impl<'a> FragmentEmitter<'a> {
    pub fn new(arch: HostArch, context: ResolutionContext<'a>) -> Self {
        Self {
            arch,
            context,
            code: Vec::with_capacity(256),
            ranges: Vec::new(),
            ledger: RelocationLedger::new(),
        }
    }

    pub fn arch(&self) -> HostArch {
        self.arch
    }

    pub fn guest_entry(&self) -> u64 {
        self.context.guest_entry
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn relocations(&self) -> &[Relocation] {
        self.ledger.entries()
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn emit_nops(&mut self, len: usize) {
        self.arch.emit_nops(&mut self.code, len);
    }

    pub fn add_range(&mut self, begin: u64, end: u64) -> EmitResult<()> {
        if end <= begin {
            return Err(EmitError::InvalidRange { begin, end });
        }
        self.ranges.push(GuestRange::new(begin, end));
        Ok(())
    }

    fn current_offset(&self) -> EmitResult<u32> {
        u32::try_from(self.code.len()).map_err(|_| EmitError::FragmentTooLarge(self.code.len()))
    }

    pub fn load_guest_address(&mut self, register: u8, guest_address: u64) -> EmitResult<()> {
        let offset = self.current_offset()?;
        self.arch
            .emit_padded_move(&mut self.code, register, guest_address)?;
        self.ledger.record(Relocation::GuestAddressMove {
            offset,
            delta: guest_delta(self.context.guest_entry, guest_address),
            register,
        });
        Ok(())
    }

    /// Loads the host address of a thunk into `register`. An unregistered
    /// thunk leaves a zero placeholder; installing the fragment then fails.
    pub fn load_thunk_address(&mut self, register: u8, hash: ThunkHash) -> EmitResult<()> {
        let offset = self.current_offset()?;
        let value = match self.context.thunks.lookup(&hash) {
            Some(address) => address,
            None => {
                debug!("thunk not registered at emission hash={hash}");
                0
            }
        };
        self.arch.emit_padded_move(&mut self.code, register, value)?;
        self.ledger.record(Relocation::NamedThunkMove {
            offset,
            hash,
            register,
        });
        Ok(())
    }

    pub fn named_symbol_literal(&self, symbol: NamedSymbol) -> PendingLiteral {
        PendingLiteral {
            value: LiteralValue::Symbol(symbol),
            load_sites: Vec::new(),
        }
    }

    pub fn guest_address_literal(&self, guest_address: u64) -> PendingLiteral {
        PendingLiteral {
            value: LiteralValue::Guest {
                delta: guest_delta(self.context.guest_entry, guest_address),
            },
            load_sites: Vec::new(),
        }
    }

    pub fn emit_literal_load(
        &mut self,
        register: u8,
        literal: &mut PendingLiteral,
    ) -> EmitResult<()> {
        let site = self.arch.emit_literal_load(&mut self.code, register)?;
        literal.load_sites.push(site);
        Ok(())
    }

    /// Writes the literal word at the current position, which the caller has
    /// reserved out of the instruction stream. Returns its fragment offset.
    pub fn place_literal(&mut self, literal: PendingLiteral) -> EmitResult<u32> {
        let offset = self.current_offset()?;
        let (value, relocation) = match literal.value {
            LiteralValue::Symbol(symbol) => (
                self.context.symbols.lookup(symbol),
                Relocation::NamedSymbolLiteral { offset, symbol },
            ),
            LiteralValue::Guest { delta } => (
                guest_address(self.context.guest_entry, delta),
                Relocation::GuestAddressLiteral { offset, delta },
            ),
        };
        self.code.extend_from_slice(&value.to_le_bytes());
        for site in literal.load_sites {
            self.arch
                .patch_literal_load(&mut self.code, site, offset as usize)?;
        }
        self.ledger.record(relocation);
        Ok(offset)
    }

    pub fn place_literal_inline(&mut self, literal: PendingLiteral) -> EmitResult<u32> {
        self.arch.emit_jump_over(&mut self.code, LITERAL_WIDTH)?;
        self.place_literal(literal)
    }

    /// Freezes the ledger. Nothing can be added to or removed from the
    /// fragment's relocations afterwards.
    pub fn finish(self) -> EmitResult<CompiledFragment> {
        if self.ranges.is_empty() {
            return Err(EmitError::NoGuestRanges);
        }
        let relocations = self.ledger.into_entries();
        validate_relocations(self.arch, self.code.len(), &relocations)?;
        Ok(CompiledFragment {
            guest_entry: self.context.guest_entry,
            record: CacheRecord::new(self.ranges, CodeFragment::new(self.code, relocations)),
        })
    }
}
