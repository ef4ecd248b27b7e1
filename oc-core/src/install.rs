use tracing::{debug, warn};

use crate::arch::HostArch;
use crate::emit::{CodeCursor, EmitError};
use crate::format::CodeFragment;
use crate::memory::{
    CodeBuffer, InstalledFragment, MemoryError, Reservation, SharedCodeBuffer,
};
use crate::reloc::{Relocation, RelocationError, ThunkHash, validate_relocations};
use crate::resolve::ResolutionContext;

const MAX_INSTALL_ATTEMPTS: usize = 4;

#[derive(Debug)]
pub enum InstallError {
    CapacityExhausted { needed: usize, remaining: usize },
    FragmentTooLarge { len: usize, capacity: usize },
    UnresolvedThunk { index: usize, hash: ThunkHash },
    RelocationOutOfBounds(RelocationError),
    Patch(EmitError),
    Memory(MemoryError),
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::CapacityExhausted { needed, remaining } => write!(
                f,
                "code buffer exhausted: need {needed} bytes, {remaining} remaining"
            ),
            InstallError::FragmentTooLarge { len, capacity } => write!(
                f,
                "fragment of {len} bytes exceeds code buffer capacity {capacity}"
            ),
            InstallError::UnresolvedThunk { index, hash } => {
                write!(f, "relocation #{index} names unregistered thunk {hash}")
            }
            InstallError::RelocationOutOfBounds(err) => write!(f, "{err}"),
            InstallError::Patch(err) => write!(f, "patch failed: {err}"),
            InstallError::Memory(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstallError::RelocationOutOfBounds(err) => Some(err),
            InstallError::Patch(err) => Some(err),
            InstallError::Memory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RelocationError> for InstallError {
    fn from(err: RelocationError) -> Self {
        InstallError::RelocationOutOfBounds(err)
    }
}

impl From<EmitError> for InstallError {
    fn from(err: EmitError) -> Self {
        InstallError::Patch(err)
    }
}

impl From<MemoryError> for InstallError {
    fn from(err: MemoryError) -> Self {
        InstallError::Memory(err)
    }
}

pub type InstallResult<T> = Result<T, InstallError>;

impl InstallError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, InstallError::CapacityExhausted { .. })
    }
}

/// Rewrites every recorded site in `code` with the value `ctx` resolves for
/// it, in ledger order. Stops at the first unresolved thunk; the caller must
/// then discard `code`.
pub fn apply_relocations(
    arch: HostArch,
    code: &mut [u8],
    relocations: &[Relocation],
    ctx: &ResolutionContext<'_>,
) -> InstallResult<()> {
    let mut cursor = CodeCursor::new(code);
    for (index, relocation) in relocations.iter().enumerate() {
        let value = ctx.resolve(relocation).map_err(|hash| {
            debug!("thunk unresolved at install index={index} hash={hash}");
            InstallError::UnresolvedThunk { index, hash }
        })?;
        let offset = relocation.offset() as usize;
        match relocation.register() {
            Some(register) => {
                let bytes = arch.padded_move_bytes(register, value)?;
                cursor.scoped(offset, |c| c.write(&bytes))?;
            }
            None => cursor.scoped(offset, |c| c.write_u64(value))?,
        }
    }
    Ok(())
}

impl CodeFragment {
    pub fn relocated(&self, arch: HostArch, ctx: &ResolutionContext<'_>) -> InstallResult<Vec<u8>> {
        validate_relocations(arch, self.code.len(), &self.relocations)?;
        let mut code = self.code.clone();
        apply_relocations(arch, &mut code, &self.relocations, ctx)?;
        Ok(code)
    }
}

/// Relocates `fragment` against `ctx` and copies it into `buffer`.
///
/// All patching happens on a private copy, so a failed resolution leaves the
/// buffer untouched. A full buffer reports [`InstallError::CapacityExhausted`]
/// and the caller decides when to reset.
pub fn install(
    fragment: &CodeFragment,
    ctx: &ResolutionContext<'_>,
    buffer: &mut CodeBuffer,
) -> InstallResult<InstalledFragment> {
    let len = fragment.byte_len();
    if len > buffer.capacity() {
        return Err(InstallError::FragmentTooLarge {
            len,
            capacity: buffer.capacity(),
        });
    }
    let code = fragment.relocated(buffer.arch(), ctx)?;

    let offset = match buffer.reserve(len) {
        Reservation::Offset(offset) => offset,
        Reservation::NeedsReset => {
            return Err(InstallError::CapacityExhausted {
                needed: len,
                remaining: buffer.remaining(),
            });
        }
    };
    if buffer.write(offset, &code).is_none() {
        buffer.rollback(offset);
        return Err(InstallError::CapacityExhausted {
            needed: len,
            remaining: buffer.remaining(),
        });
    }
    if let Err(err) = buffer.sync(offset, len) {
        buffer.rollback(offset);
        return Err(err.into());
    }

    Ok(InstalledFragment {
        address: buffer.address_of(offset),
        offset,
        len,
        generation: buffer.generation(),
    })
}

/// Installs into a shared buffer, resetting the generation when it is full.
/// Only the first thread to see a full generation resets it; the others
/// retry against the fresh one.
pub fn install_with_reset(
    shared: &SharedCodeBuffer,
    fragment: &CodeFragment,
    ctx: &ResolutionContext<'_>,
) -> InstallResult<InstalledFragment> {
    let mut last_err = None;
    for _ in 0..MAX_INSTALL_ATTEMPTS {
        let (result, observed) = {
            let mut buffer = shared.lock();
            let observed = buffer.generation();
            (install(fragment, ctx, &mut buffer), observed)
        };
        match result {
            Err(err) if err.is_capacity() => {
                if !shared.reset_if_generation(observed) {
                    debug!("code buffer already reset by another thread generation={observed}");
                }
                last_err = Some(err);
            }
            other => return other,
        }
    }
    warn!("giving up install after {MAX_INSTALL_ATTEMPTS} attempts");
    Err(last_err.unwrap_or(InstallError::CapacityExhausted {
        needed: fragment.byte_len(),
        remaining: 0,
    }))
}
