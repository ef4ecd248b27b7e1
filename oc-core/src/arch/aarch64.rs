use cache_abi::AARCH64_MOVE_WIDTH;

use super::ArchEncoder;
use crate::emit::{EmitError, EmitResult};

pub(super) struct Aarch64Encoder;

const NOP: u32 = 0xD503201F;
const UDF: u32 = 0x00000000;

impl ArchEncoder for Aarch64Encoder {
    const MOVE_WIDTH: usize = AARCH64_MOVE_WIDTH;
    // x31 is sp/xzr depending on the instruction
    const MAX_REGISTER: u8 = 30;

    fn emit_natural_move(code: &mut Vec<u8>, register: u8, value: u64) {
        let parts = [
            (value & 0xFFFF) as u16,
            ((value >> 16) & 0xFFFF) as u16,
            ((value >> 32) & 0xFFFF) as u16,
            ((value >> 48) & 0xFFFF) as u16,
        ];

        let Some(first_index) = parts.iter().position(|part| *part != 0) else {
            emit_u32(code, 0xD2800000_u32 | (register as u32)); // movz xN, #0
            return;
        };

        emit_u32(
            code,
            0xD2800000_u32
                | ((first_index as u32) << 21)
                | ((parts[first_index] as u32) << 5)
                | (register as u32),
        );

        for (i, part) in parts.iter().enumerate() {
            if i == first_index || *part == 0 {
                continue;
            }
            emit_u32(
                code,
                0xF2800000_u32 | ((i as u32) << 21) | ((*part as u32) << 5) | (register as u32),
            );
        }
    }

    fn emit_nops(code: &mut Vec<u8>, len: usize) {
        debug_assert_eq!(len % 4, 0, "aarch64 padding must be instruction aligned");
        for _ in 0..len / 4 {
            emit_u32(code, NOP);
        }
    }

    fn emit_literal_load(code: &mut Vec<u8>, register: u8) -> usize {
        let site = code.len();
        emit_u32(code, 0x58000000_u32 | (register as u32)); // ldr xN, literal
        site
    }

    fn patch_literal_load(code: &mut [u8], site: usize, target: usize) -> EmitResult<()> {
        let insn = read_u32(code, site)?;
        let rel = (target as i64) - (site as i64);
        if rel % 4 != 0 {
            return Err(EmitError::MisalignedLiteral { site, target });
        }
        let imm19 = rel / 4;
        if !(-(1 << 18)..(1 << 18)).contains(&imm19) {
            return Err(EmitError::DisplacementOverflow);
        }
        let insn = (insn & !(0x7FFFF << 5)) | (((imm19 as u32) & 0x7FFFF) << 5);
        code[site..site + 4].copy_from_slice(&insn.to_le_bytes());
        Ok(())
    }

    fn emit_jump_over(code: &mut Vec<u8>, len: usize) -> EmitResult<()> {
        if len % 4 != 0 {
            return Err(EmitError::MisalignedLiteral {
                site: code.len(),
                target: code.len() + 4 + len,
            });
        }
        let imm26 = (len / 4 + 1) as u32;
        if imm26 >= 1 << 25 {
            return Err(EmitError::DisplacementOverflow);
        }
        emit_u32(code, 0x14000000_u32 | imm26); // b .+4+len
        Ok(())
    }

    fn trap_fill(region: &mut [u8]) {
        let word = UDF.to_le_bytes();
        for (index, byte) in region.iter_mut().enumerate() {
            *byte = word[index % 4];
        }
    }
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn read_u32(code: &[u8], offset: usize) -> EmitResult<u32> {
    let bytes = code
        .get(offset..offset + 4)
        .ok_or(EmitError::PatchOutOfBounds {
            offset,
            width: 4,
            len: code.len(),
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn move_uses_movz_then_movk_for_nonzero_halfwords() {
        let mut code = Vec::new();
        Aarch64Encoder::emit_natural_move(&mut code, 3, 0x0000_0001_0000_0010);
        assert_eq!(words(&code), vec![0xD2800203, 0xF2C00023]);

        let mut zero = Vec::new();
        Aarch64Encoder::emit_natural_move(&mut zero, 0, 0);
        assert_eq!(words(&zero), vec![0xD2800000]);
    }

    #[test]
    fn full_width_move_needs_no_padding() {
        let mut code = Vec::new();
        Aarch64Encoder::emit_natural_move(&mut code, 1, 0x1234_5678_9ABC_DEF0);
        assert_eq!(code.len(), AARCH64_MOVE_WIDTH);
    }

    #[test]
    fn literal_load_encodes_word_offset() {
        let mut code = Vec::new();
        let site = Aarch64Encoder::emit_literal_load(&mut code, 2);
        emit_u32(&mut code, NOP);
        Aarch64Encoder::patch_literal_load(&mut code, site, 8).expect("patch should fit");
        assert_eq!(words(&code)[0], 0x58000000 | (2 << 5) | 2);
        assert!(matches!(
            Aarch64Encoder::patch_literal_load(&mut code, site, 6),
            Err(EmitError::MisalignedLiteral { .. })
        ));
    }

    #[test]
    fn jump_over_skips_literal_word() {
        let mut code = Vec::new();
        Aarch64Encoder::emit_jump_over(&mut code, 8).expect("jump should encode");
        assert_eq!(words(&code), vec![0x14000003]);
    }
}
