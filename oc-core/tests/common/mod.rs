#![allow(dead_code, unused_imports)]

pub use objcache::{
    CacheRecord, CodeBuffer, CodeFragment, CompiledFragment, FragmentEmitter, GuestRange,
    HostArch, NamedSymbol, NamedSymbolTable, NoThunks, Relocation, ResolutionContext,
    SharedCodeBuffer, ThunkHash, ThunkTable,
};

pub const ENTRY_A: u64 = 0x400000;
pub const ENTRY_B: u64 = 0x500000;

pub fn symbols() -> NamedSymbolTable {
    NamedSymbolTable::from_fn(|symbol| 0x7000_0000 + u64::from(symbol.id()) * 0x100)
}

/// 32 bytes of no-ops with a single guest-address move at offset 4.
pub fn guest_move_fragment() -> CodeFragment {
    CodeFragment::new(
        vec![0x90; 32],
        vec![Relocation::GuestAddressMove {
            offset: 4,
            delta: 0x10,
            register: 0,
        }],
    )
}

pub fn thunk_hash() -> ThunkHash {
    ThunkHash::for_symbol("libc", "memcpy")
}

/// Fragment touching every relocation kind, compiled against `ENTRY_A`.
pub fn compile_mixed(arch: HostArch, symbols: &NamedSymbolTable, thunks: &ThunkTable) -> CompiledFragment {
    let ctx = ResolutionContext::new(ENTRY_A, symbols, thunks);
    let mut emitter = FragmentEmitter::new(arch, ctx);
    emitter.emit_nops(4);
    emitter
        .load_guest_address(1, ENTRY_A + 0x20)
        .expect("guest move encodes");
    emitter
        .load_thunk_address(2, thunk_hash())
        .expect("thunk move encodes");
    let mut exit = emitter.named_symbol_literal(NamedSymbol::ExitFunctionLinker);
    emitter
        .emit_literal_load(3, &mut exit)
        .expect("literal load encodes");
    let mut target = emitter.guest_address_literal(ENTRY_A - 0x40);
    emitter
        .emit_literal_load(4, &mut target)
        .expect("literal load encodes");
    emitter
        .place_literal_inline(exit)
        .expect("literal places");
    emitter
        .place_literal_inline(target)
        .expect("literal places");
    emitter
        .add_range(ENTRY_A, ENTRY_A + 0x30)
        .expect("range is valid");
    emitter.finish().expect("fragment finishes")
}

pub fn shared_buffer(arch: HostArch, capacity: usize) -> SharedCodeBuffer {
    SharedCodeBuffer::new(CodeBuffer::new(arch, capacity).expect("code buffer allocates"))
}
