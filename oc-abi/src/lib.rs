#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedSymbolDesc {
    pub id: u32,
    pub name: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocationKindDesc {
    pub tag: u8,
    pub name: &'static str,
    pub payload_len: usize,
}

// bump on any change to the record layout, relocation payloads or named symbols
pub const FORMAT_VERSION: u32 = 1;

pub const COOKIE_LEN: usize = 8;
pub const INDEX_COOKIE_TAG: [u8; 4] = *b"OCXI";
pub const DATA_COOKIE_TAG: [u8; 4] = *b"OCXD";

// [max_inst_per_block u32][flags u32][smc_checks u8][reserved 3]
pub const SERIALIZATION_CONFIG_LEN: usize = 12;

pub const CODEGEN_MULTI_BLOCK: u32 = 1 << 0;
pub const CODEGEN_TSO_ENABLED: u32 = 1 << 1;
pub const CODEGEN_PARANOID_TSO: u32 = 1 << 2;
pub const CODEGEN_ABI_LOCAL_FLAGS: u32 = 1 << 3;
pub const CODEGEN_ABI_NO_PF: u32 = 1 << 4;
pub const CODEGEN_STATIC_REGISTER_ALLOCATION: u32 = 1 << 5;
pub const CODEGEN_IS_64BIT_MODE: u32 = 1 << 6;
pub const CODEGEN_X87_REDUCED_PRECISION: u32 = 1 << 7;
pub const CODEGEN_KNOWN_FLAGS: u32 = (1 << 8) - 1;

pub const SMC_CHECKS_NONE: u8 = 0;
pub const SMC_CHECKS_MTRACK: u8 = 1;
pub const SMC_CHECKS_FULL: u8 = 2;

pub const ARCH_X86_64: u8 = 1;
pub const ARCH_AARCH64: u8 = 2;

pub const LITERAL_WIDTH: usize = 8;
// REX + opcode + imm64
pub const X86_64_MOVE_WIDTH: usize = 10;
// movz + 3 x movk
pub const AARCH64_MOVE_WIDTH: usize = 16;

pub const THUNK_HASH_LEN: usize = 32;

pub const RELOC_NAMED_SYMBOL_LITERAL: u8 = 0;
pub const RELOC_GUEST_ADDRESS_LITERAL: u8 = 1;
pub const RELOC_NAMED_THUNK_MOVE: u8 = 2;
pub const RELOC_GUEST_ADDRESS_MOVE: u8 = 3;

pub const RELOCATION_KINDS: [RelocationKindDesc; 4] = [
    RelocationKindDesc {
        tag: RELOC_NAMED_SYMBOL_LITERAL,
        name: "named-symbol-literal",
        // offset u32 + symbol id u32
        payload_len: 8,
    },
    RelocationKindDesc {
        tag: RELOC_GUEST_ADDRESS_LITERAL,
        name: "guest-address-literal",
        // offset u32 + delta i64
        payload_len: 12,
    },
    RelocationKindDesc {
        tag: RELOC_NAMED_THUNK_MOVE,
        name: "named-thunk-move",
        // offset u32 + digest + register u8
        payload_len: 4 + THUNK_HASH_LEN + 1,
    },
    RelocationKindDesc {
        tag: RELOC_GUEST_ADDRESS_MOVE,
        name: "guest-address-move",
        // offset u32 + delta i64 + register u8
        payload_len: 13,
    },
];

pub const SYMBOL_EXIT_FUNCTION_LINKER: u32 = 0;
pub const SYMBOL_DISPATCHER_LOOP_TOP: u32 = 1;
pub const SYMBOL_THREAD_STOP_HANDLER: u32 = 2;
pub const SYMBOL_SIGNAL_RETURN_HANDLER: u32 = 3;

pub const NAMED_SYMBOL_COUNT: usize = 4;

pub const NAMED_SYMBOLS: [NamedSymbolDesc; NAMED_SYMBOL_COUNT] = [
    NamedSymbolDesc {
        id: SYMBOL_EXIT_FUNCTION_LINKER,
        name: "exit-function-linker",
    },
    NamedSymbolDesc {
        id: SYMBOL_DISPATCHER_LOOP_TOP,
        name: "dispatcher-loop-top",
    },
    NamedSymbolDesc {
        id: SYMBOL_THREAD_STOP_HANDLER,
        name: "thread-stop-handler",
    },
    NamedSymbolDesc {
        id: SYMBOL_SIGNAL_RETURN_HANDLER,
        name: "signal-return-handler",
    },
];

pub fn named_symbol_by_id(id: u32) -> Option<&'static NamedSymbolDesc> {
    NAMED_SYMBOLS.iter().find(|desc| desc.id == id)
}

pub fn relocation_kind_by_tag(tag: u8) -> Option<&'static RelocationKindDesc> {
    RELOCATION_KINDS.iter().find(|desc| desc.tag == tag)
}

pub fn arch_name(arch: u8) -> Option<&'static str> {
    match arch {
        ARCH_X86_64 => Some("x86_64"),
        ARCH_AARCH64 => Some("aarch64"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_ids_are_dense_and_unique() {
        for (index, desc) in NAMED_SYMBOLS.iter().enumerate() {
            assert_eq!(desc.id as usize, index);
            assert_eq!(named_symbol_by_id(desc.id), Some(desc));
        }
        assert!(named_symbol_by_id(NAMED_SYMBOL_COUNT as u32).is_none());
    }

    #[test]
    fn relocation_tags_resolve() {
        for desc in &RELOCATION_KINDS {
            assert_eq!(relocation_kind_by_tag(desc.tag), Some(desc));
        }
        assert!(relocation_kind_by_tag(0xFF).is_none());
    }

    #[test]
    fn cookie_tags_differ() {
        assert_ne!(INDEX_COOKIE_TAG, DATA_COOKIE_TAG);
    }
}
