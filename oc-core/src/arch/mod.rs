use cache_abi::{ARCH_AARCH64, ARCH_X86_64};

use crate::emit::{EmitError, EmitResult};

mod aarch64;
mod x86_64;

pub(crate) trait ArchEncoder {
    const MOVE_WIDTH: usize;
    const MAX_REGISTER: u8;

    fn emit_natural_move(code: &mut Vec<u8>, register: u8, value: u64);
    fn emit_nops(code: &mut Vec<u8>, len: usize);
    fn emit_literal_load(code: &mut Vec<u8>, register: u8) -> usize;
    fn patch_literal_load(code: &mut [u8], site: usize, target: usize) -> EmitResult<()>;
    fn emit_jump_over(code: &mut Vec<u8>, len: usize) -> EmitResult<()>;
    fn trap_fill(region: &mut [u8]);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostArch {
    X86_64,
    Aarch64,
}

impl HostArch {
    pub const ALL: [HostArch; 2] = [HostArch::X86_64, HostArch::Aarch64];

    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(HostArch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(HostArch::Aarch64)
        } else {
            None
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            HostArch::X86_64 => ARCH_X86_64,
            HostArch::Aarch64 => ARCH_AARCH64,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            ARCH_X86_64 => Some(HostArch::X86_64),
            ARCH_AARCH64 => Some(HostArch::Aarch64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        cache_abi::arch_name(self.tag()).unwrap_or("unknown")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|arch| arch.name() == name)
    }

    pub fn move_width(self) -> usize {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::MOVE_WIDTH,
            HostArch::Aarch64 => aarch64::Aarch64Encoder::MOVE_WIDTH,
        }
    }

    pub fn max_register(self) -> u8 {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::MAX_REGISTER,
            HostArch::Aarch64 => aarch64::Aarch64Encoder::MAX_REGISTER,
        }
    }

    pub fn check_register(self, register: u8) -> EmitResult<()> {
        if register > self.max_register() {
            return Err(EmitError::RegisterOutOfRange {
                arch: self,
                register,
            });
        }
        Ok(())
    }

    /// Emits the shortest move for `value`, then pads with no-ops up to
    /// [`HostArch::move_width`] so the sequence can later be overwritten with
    /// any other value in place.
    pub fn emit_padded_move(self, code: &mut Vec<u8>, register: u8, value: u64) -> EmitResult<()> {
        self.check_register(register)?;
        let start = code.len();
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::emit_natural_move(code, register, value),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::emit_natural_move(code, register, value),
        }
        let natural = code.len() - start;
        let width = self.move_width();
        if natural > width {
            return Err(EmitError::MoveTooWide {
                arch: self,
                len: natural,
            });
        }
        self.emit_nops(code, width - natural);
        Ok(())
    }

    pub fn padded_move_bytes(self, register: u8, value: u64) -> EmitResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.move_width());
        self.emit_padded_move(&mut bytes, register, value)?;
        Ok(bytes)
    }

    pub fn emit_nops(self, code: &mut Vec<u8>, len: usize) {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::emit_nops(code, len),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::emit_nops(code, len),
        }
    }

    pub fn emit_literal_load(self, code: &mut Vec<u8>, register: u8) -> EmitResult<usize> {
        self.check_register(register)?;
        Ok(match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::emit_literal_load(code, register),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::emit_literal_load(code, register),
        })
    }

    pub fn patch_literal_load(self, code: &mut [u8], site: usize, target: usize) -> EmitResult<()> {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::patch_literal_load(code, site, target),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::patch_literal_load(code, site, target),
        }
    }

    pub fn emit_jump_over(self, code: &mut Vec<u8>, len: usize) -> EmitResult<()> {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::emit_jump_over(code, len),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::emit_jump_over(code, len),
        }
    }

    pub fn trap_fill(self, region: &mut [u8]) {
        match self {
            HostArch::X86_64 => x86_64::X86_64Encoder::trap_fill(region),
            HostArch::Aarch64 => aarch64::Aarch64Encoder::trap_fill(region),
        }
    }
}

impl std::fmt::Display for HostArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_VALUES: [u64; 6] = [
        0,
        0x10,
        0xAAAA_0000,
        0xFFFF_FFFF_FFFF_FFF0,
        0x0000_7FFF_1234_5678,
        0x1234_5678_9ABC_DEF0,
    ];

    #[test]
    fn padded_move_width_is_value_independent() {
        for arch in HostArch::ALL {
            for register in [0, arch.max_register()] {
                for value in SAMPLE_VALUES {
                    let bytes = arch
                        .padded_move_bytes(register, value)
                        .expect("move should encode");
                    assert_eq!(
                        bytes.len(),
                        arch.move_width(),
                        "{arch} r{register} value={value:#x}"
                    );
                }
            }
        }
    }

    #[test]
    fn padded_move_rejects_out_of_range_register() {
        for arch in HostArch::ALL {
            let err = arch
                .padded_move_bytes(arch.max_register() + 1, 1)
                .expect_err("register should be rejected");
            assert!(matches!(err, EmitError::RegisterOutOfRange { .. }));
        }
    }

    #[test]
    fn tags_and_names_round_trip() {
        for arch in HostArch::ALL {
            assert_eq!(HostArch::from_tag(arch.tag()), Some(arch));
            assert_eq!(HostArch::from_name(arch.name()), Some(arch));
        }
        assert_eq!(HostArch::from_tag(0), None);
    }
}
