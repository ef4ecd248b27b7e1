use cache_abi::{
    CODEGEN_ABI_LOCAL_FLAGS, CODEGEN_ABI_NO_PF, CODEGEN_IS_64BIT_MODE, CODEGEN_KNOWN_FLAGS,
    CODEGEN_MULTI_BLOCK, CODEGEN_PARANOID_TSO, CODEGEN_STATIC_REGISTER_ALLOCATION,
    CODEGEN_TSO_ENABLED, CODEGEN_X87_REDUCED_PRECISION, COOKIE_LEN, DATA_COOKIE_TAG,
    FORMAT_VERSION, INDEX_COOKIE_TAG, SERIALIZATION_CONFIG_LEN, SMC_CHECKS_FULL,
    SMC_CHECKS_MTRACK, SMC_CHECKS_NONE,
};
use serde::Deserialize;

use crate::reloc::Relocation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestRange {
    pub begin: u64,
    pub end: u64,
}

impl GuestRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn overlaps(&self, begin: u64, end: u64) -> bool {
        self.begin < end && begin < self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        self.begin <= address && address < self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeFragment {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

impl CodeFragment {
    pub fn new(code: Vec<u8>, relocations: Vec<Relocation>) -> Self {
        Self { code, relocations }
    }

    pub fn byte_len(&self) -> usize {
        self.code.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub ranges: Vec<GuestRange>,
    pub fragment: CodeFragment,
}

impl CacheRecord {
    pub fn new(ranges: Vec<GuestRange>, fragment: CodeFragment) -> Self {
        Self { ranges, fragment }
    }

    pub fn overlaps(&self, begin: u64, end: u64) -> bool {
        self.ranges.iter().any(|range| range.overlaps(begin, end))
    }

    pub fn covers(&self, guest_entry: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(guest_entry))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledFragment {
    pub guest_entry: u64,
    pub record: CacheRecord,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatCookie {
    pub tag: [u8; 4],
    pub version: u32,
}

impl FormatCookie {
    pub const INDEX: FormatCookie = FormatCookie {
        tag: INDEX_COOKIE_TAG,
        version: FORMAT_VERSION,
    };

    pub const DATA: FormatCookie = FormatCookie {
        tag: DATA_COOKIE_TAG,
        version: FORMAT_VERSION,
    };

    pub fn to_bytes(self) -> [u8; COOKIE_LEN] {
        let mut out = [0u8; COOKIE_LEN];
        out[..4].copy_from_slice(&self.tag);
        out[4..].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        Self {
            tag: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

impl std::fmt::Display for FormatCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/v{}",
            String::from_utf8_lossy(&self.tag),
            self.version
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmcChecks {
    None,
    #[default]
    Mtrack,
    Full,
}

impl SmcChecks {
    pub fn tag(self) -> u8 {
        match self {
            SmcChecks::None => SMC_CHECKS_NONE,
            SmcChecks::Mtrack => SMC_CHECKS_MTRACK,
            SmcChecks::Full => SMC_CHECKS_FULL,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            SMC_CHECKS_NONE => Some(SmcChecks::None),
            SMC_CHECKS_MTRACK => Some(SmcChecks::Mtrack),
            SMC_CHECKS_FULL => Some(SmcChecks::Full),
            _ => None,
        }
    }
}

/// Code-generation settings cached code was compiled under. Written after
/// the index cookie; a pair written under other settings is discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct SerializationConfig {
    pub max_inst_per_block: u32,
    pub multi_block: bool,
    pub tso_enabled: bool,
    pub paranoid_tso: bool,
    pub abi_local_flags: bool,
    pub abi_no_pf: bool,
    pub static_register_allocation: bool,
    pub is_64bit_mode: bool,
    pub x87_reduced_precision: bool,
    pub smc_checks: SmcChecks,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            max_inst_per_block: 5000,
            multi_block: true,
            tso_enabled: true,
            paranoid_tso: false,
            abi_local_flags: false,
            abi_no_pf: false,
            static_register_allocation: true,
            is_64bit_mode: true,
            x87_reduced_precision: false,
            smc_checks: SmcChecks::Mtrack,
        }
    }
}

const FLAG_FIELDS: [u32; 8] = [
    CODEGEN_MULTI_BLOCK,
    CODEGEN_TSO_ENABLED,
    CODEGEN_PARANOID_TSO,
    CODEGEN_ABI_LOCAL_FLAGS,
    CODEGEN_ABI_NO_PF,
    CODEGEN_STATIC_REGISTER_ALLOCATION,
    CODEGEN_IS_64BIT_MODE,
    CODEGEN_X87_REDUCED_PRECISION,
];

impl SerializationConfig {
    fn flag_values(&self) -> [bool; 8] {
        [
            self.multi_block,
            self.tso_enabled,
            self.paranoid_tso,
            self.abi_local_flags,
            self.abi_no_pf,
            self.static_register_allocation,
            self.is_64bit_mode,
            self.x87_reduced_precision,
        ]
    }

    pub fn flags(&self) -> u32 {
        FLAG_FIELDS
            .iter()
            .zip(self.flag_values())
            .filter(|(_, set)| *set)
            .fold(0, |flags, (bit, _)| flags | bit)
    }

    pub fn to_bytes(self) -> [u8; SERIALIZATION_CONFIG_LEN] {
        let mut out = [0u8; SERIALIZATION_CONFIG_LEN];
        out[..4].copy_from_slice(&self.max_inst_per_block.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags().to_le_bytes());
        out[8] = self.smc_checks.tag();
        out
    }

    pub fn from_bytes(bytes: [u8; SERIALIZATION_CONFIG_LEN]) -> Option<Self> {
        let max_inst_per_block = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if flags & !CODEGEN_KNOWN_FLAGS != 0 || bytes[9..].iter().any(|byte| *byte != 0) {
            return None;
        }
        let smc_checks = SmcChecks::from_tag(bytes[8])?;
        let has = |bit: u32| flags & bit != 0;
        Some(Self {
            max_inst_per_block,
            multi_block: has(CODEGEN_MULTI_BLOCK),
            tso_enabled: has(CODEGEN_TSO_ENABLED),
            paranoid_tso: has(CODEGEN_PARANOID_TSO),
            abi_local_flags: has(CODEGEN_ABI_LOCAL_FLAGS),
            abi_no_pf: has(CODEGEN_ABI_NO_PF),
            static_register_allocation: has(CODEGEN_STATIC_REGISTER_ALLOCATION),
            is_64bit_mode: has(CODEGEN_IS_64BIT_MODE),
            x87_reduced_precision: has(CODEGEN_X87_REDUCED_PRECISION),
            smc_checks,
        })
    }
}

impl std::fmt::Display for SerializationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_inst={} flags={:#04x} smc={:?}",
            self.max_inst_per_block,
            self.flags(),
            self.smc_checks
        )
    }
}
