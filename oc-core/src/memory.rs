use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::arch::HostArch;

pub const FRAGMENT_ALIGN: usize = 16;

#[derive(Debug)]
pub enum MemoryError {
    ZeroLength,
    Os {
        op: &'static str,
        source: std::io::Error,
    },
    Unsupported,
}

impl MemoryError {
    fn last_os(op: &'static str) -> Self {
        MemoryError::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::ZeroLength => write!(f, "executable region length must be non-zero"),
            MemoryError::Os { op, source } => write!(f, "{op} failed: {source}"),
            MemoryError::Unsupported => write!(
                f,
                "executable memory allocation not implemented for this platform"
            ),
        }
    }
}

impl std::error::Error for MemoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemoryError::Os { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Anonymous mapping that stays writable and, where the platform allows it,
/// executable for its whole lifetime.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    len: usize,
    executable: bool,
}

// The region is plain memory; exclusive access is enforced by `&mut self`.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    pub fn allocate(len: usize) -> Result<Self, MemoryError> {
        if len == 0 {
            return Err(MemoryError::ZeroLength);
        }
        let (ptr, executable) = alloc_executable_region(len)?;
        let ptr = NonNull::new(ptr).ok_or(MemoryError::Unsupported)?;
        Ok(Self {
            ptr,
            len,
            executable,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn base_address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Gives `f` a writable view, toggling the per-thread JIT write
    /// protection on platforms that have it.
    pub fn with_writable<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        #[cfg(target_os = "macos")]
        {
            let use_write_protect = unsafe { pthread_jit_write_protect_supported_np() } != 0;
            if use_write_protect {
                unsafe { pthread_jit_write_protect_np(0) };
            }
            let result = f(bytes);
            if use_write_protect {
                unsafe { pthread_jit_write_protect_np(1) };
            }
            result
        }
        #[cfg(not(target_os = "macos"))]
        {
            f(bytes)
        }
    }

    pub fn sync_instruction_cache(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        if len == 0 || offset.saturating_add(len) > self.len {
            return Ok(());
        }
        let start = unsafe { self.ptr.as_ptr().add(offset) };
        flush_instruction_cache(start, len)
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        if let Err(err) = free_executable_region(self.ptr.as_ptr(), self.len) {
            warn!("failed to release code buffer: {err}");
        }
    }
}

impl std::fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("len", &self.len)
            .field("executable", &self.executable)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    Offset(usize),
    NeedsReset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstalledFragment {
    pub address: u64,
    pub offset: usize,
    pub len: usize,
    pub generation: u64,
}

#[derive(Debug)]
pub struct CodeBuffer {
    arch: HostArch,
    region: ExecutableRegion,
    cursor: usize,
    generation: u64,
    reset_count: u64,
}

impl CodeBuffer {
    pub fn new(arch: HostArch, capacity: usize) -> Result<Self, MemoryError> {
        let mut region = ExecutableRegion::allocate(capacity)?;
        region.with_writable(|bytes| arch.trap_fill(bytes));
        if !region.is_executable() {
            warn!("code buffer mapped without execute permission capacity={capacity}");
        }
        Ok(Self {
            arch,
            region,
            cursor: 0,
            generation: 0,
            reset_count: 0,
        })
    }

    pub fn arch(&self) -> HostArch {
        self.arch
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }

    pub fn reserve(&mut self, len: usize) -> Reservation {
        let start = self.cursor.next_multiple_of(FRAGMENT_ALIGN);
        match start.checked_add(len) {
            Some(end) if end <= self.capacity() => {
                if start > self.cursor {
                    let (arch, cursor) = (self.arch, self.cursor);
                    self.region
                        .with_writable(|bytes| arch.trap_fill(&mut bytes[cursor..start]));
                }
                self.cursor = end;
                Reservation::Offset(start)
            }
            _ => Reservation::NeedsReset,
        }
    }

    pub fn rollback(&mut self, offset: usize) {
        if offset >= self.cursor {
            return;
        }
        let (arch, end) = (self.arch, self.cursor);
        self.region
            .with_writable(|bytes| arch.trap_fill(&mut bytes[offset..end]));
        self.cursor = offset;
    }

    /// Starts a new generation. Every fragment installed before this call is
    /// dead.
    pub fn reset(&mut self) {
        let (arch, used) = (self.arch, self.cursor);
        self.region
            .with_writable(|bytes| arch.trap_fill(&mut bytes[..used]));
        self.cursor = 0;
        self.generation += 1;
        self.reset_count += 1;
        info!(
            "code buffer reset generation={} resets={} discarded_bytes={used}",
            self.generation, self.reset_count
        );
    }

    pub fn is_live(&self, installed: &InstalledFragment) -> bool {
        installed.generation == self.generation
            && installed.offset.saturating_add(installed.len) <= self.cursor
    }

    pub fn address_of(&self, offset: usize) -> u64 {
        self.region.base_address() + offset as u64
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.region.bytes().get(offset..end)
    }

    pub fn installed_bytes(&self, installed: &InstalledFragment) -> Option<&[u8]> {
        if !self.is_live(installed) {
            return None;
        }
        self.bytes(installed.offset, installed.len)
    }

    pub(crate) fn write(&mut self, offset: usize, code: &[u8]) -> Option<()> {
        let end = offset.checked_add(code.len())?;
        if end > self.cursor {
            return None;
        }
        self.region
            .with_writable(|bytes| bytes[offset..end].copy_from_slice(code));
        Some(())
    }

    pub(crate) fn sync(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        self.region.sync_instruction_cache(offset, len)
    }
}

#[derive(Debug)]
pub struct SharedCodeBuffer {
    inner: Mutex<CodeBuffer>,
    generation: AtomicU64,
}

impl SharedCodeBuffer {
    pub fn new(buffer: CodeBuffer) -> Self {
        let generation = AtomicU64::new(buffer.generation());
        Self {
            inner: Mutex::new(buffer),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_live(&self, installed: &InstalledFragment) -> bool {
        installed.generation == self.generation()
    }

    pub fn reset_count(&self) -> u64 {
        self.inner.lock().reset_count()
    }

    pub fn with_buffer<R>(&self, f: impl FnOnce(&CodeBuffer) -> R) -> R {
        f(&self.inner.lock())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CodeBuffer> {
        self.inner.lock()
    }

    /// Resets the buffer only if it is still in generation `observed`.
    /// Returns `false` when another thread got there first.
    pub fn reset_if_generation(&self, observed: u64) -> bool {
        let mut buffer = self.inner.lock();
        if buffer.generation() != observed {
            return false;
        }
        buffer.reset();
        self.generation.store(buffer.generation(), Ordering::Release);
        true
    }
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> Result<(*mut u8, bool), MemoryError> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(MemoryError::last_os("VirtualAlloc"));
    }
    Ok((ptr, true))
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(MemoryError::last_os("VirtualFree"));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn flush_instruction_cache(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{Diagnostics::Debug::FlushInstructionCache, Threading::GetCurrentProcess},
    };

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(MemoryError::last_os("FlushInstructionCache"));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> Result<(*mut u8, bool), MemoryError> {
    let map = |prot| unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    let ptr = map(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);
    if ptr != libc::MAP_FAILED {
        return Ok((ptr as *mut u8, true));
    }
    // W^X kernels refuse RWX mappings
    let ptr = map(libc::PROT_READ | libc::PROT_WRITE);
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::last_os("mmap"));
    }
    Ok((ptr as *mut u8, false))
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> Result<(*mut u8, bool), MemoryError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::last_os("mmap(MAP_JIT)"));
    }
    Ok((ptr as *mut u8, true))
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(MemoryError::last_os("munmap"));
    }
    Ok(())
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn flush_instruction_cache(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(len) as *mut libc::c_char,
        );
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn flush_instruction_cache(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) };
    Ok(())
}

#[cfg(all(
    unix,
    not(target_os = "macos"),
    not(all(target_os = "linux", target_arch = "aarch64"))
))]
fn flush_instruction_cache(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_executable_region(_len: usize) -> Result<(*mut u8, bool), MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn flush_instruction_cache(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_aligns_and_reports_exhaustion() {
        let mut buffer = CodeBuffer::new(HostArch::X86_64, 64).expect("buffer should map");
        assert_eq!(buffer.reserve(10), Reservation::Offset(0));
        assert_eq!(buffer.reserve(10), Reservation::Offset(16));
        assert_eq!(buffer.used(), 26);
        assert_eq!(buffer.reserve(40), Reservation::NeedsReset);
        assert_eq!(buffer.reserve(32), Reservation::Offset(32));
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn reset_trap_fills_and_bumps_generation() {
        let mut buffer = CodeBuffer::new(HostArch::X86_64, 32).expect("buffer should map");
        let Reservation::Offset(offset) = buffer.reserve(4) else {
            panic!("reservation should fit");
        };
        buffer.write(offset, &[1, 2, 3, 4]).expect("write fits");
        let installed = InstalledFragment {
            address: buffer.address_of(offset),
            offset,
            len: 4,
            generation: buffer.generation(),
        };
        assert!(buffer.is_live(&installed));
        assert_eq!(buffer.installed_bytes(&installed), Some(&[1u8, 2, 3, 4][..]));

        buffer.reset();
        assert!(!buffer.is_live(&installed));
        assert_eq!(buffer.generation(), 1);
        assert_eq!(buffer.reset_count(), 1);
        assert_eq!(buffer.bytes(0, 4), Some(&[0xCCu8; 4][..]));
    }

    #[test]
    fn rollback_discards_tail() {
        let mut buffer = CodeBuffer::new(HostArch::Aarch64, 64).expect("buffer should map");
        assert_eq!(buffer.reserve(16), Reservation::Offset(0));
        assert_eq!(buffer.reserve(8), Reservation::Offset(16));
        buffer.write(16, &[0xFF; 8]).expect("write fits");
        buffer.rollback(16);
        assert_eq!(buffer.used(), 16);
        assert_eq!(buffer.bytes(16, 8), Some(&[0u8; 8][..]));
        assert!(buffer.write(16, &[1]).is_none());
    }

    #[test]
    fn only_one_resetter_per_generation() {
        let shared =
            SharedCodeBuffer::new(CodeBuffer::new(HostArch::X86_64, 32).expect("buffer should map"));
        let observed = shared.generation();
        assert!(shared.reset_if_generation(observed));
        assert!(!shared.reset_if_generation(observed));
        assert_eq!(shared.generation(), observed + 1);
        assert_eq!(shared.reset_count(), 1);
    }

    #[test]
    fn zero_length_region_is_rejected() {
        assert!(matches!(
            ExecutableRegion::allocate(0),
            Err(MemoryError::ZeroLength)
        ));
    }
}
