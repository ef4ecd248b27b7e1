use cache_abi::X86_64_MOVE_WIDTH;

use super::ArchEncoder;
use crate::emit::{EmitError, EmitResult};

pub(super) struct X86_64Encoder;

// Recommended multi-byte NOP forms, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

impl ArchEncoder for X86_64Encoder {
    const MOVE_WIDTH: usize = X86_64_MOVE_WIDTH;
    const MAX_REGISTER: u8 = 15;

    fn emit_natural_move(code: &mut Vec<u8>, register: u8, value: u64) {
        let rex_b = (register >> 3) & 1;
        let low = register & 7;
        if let Ok(imm) = u32::try_from(value) {
            if rex_b != 0 {
                code.push(0x41); // REX.B
            }
            code.push(0xB8 + low); // mov r32, imm32
            code.extend_from_slice(&imm.to_le_bytes());
        } else if let Ok(imm) = i32::try_from(value as i64) {
            code.push(0x48 | rex_b); // REX.W
            code.push(0xC7); // mov r/m64, simm32
            code.push(0xC0 | low);
            code.extend_from_slice(&imm.to_le_bytes());
        } else {
            code.push(0x48 | rex_b); // REX.W
            code.push(0xB8 + low); // mov r64, imm64
            code.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn emit_nops(code: &mut Vec<u8>, mut len: usize) {
        while len > 0 {
            let chunk = len.min(NOPS.len());
            code.extend_from_slice(NOPS[chunk - 1]);
            len -= chunk;
        }
    }

    fn emit_literal_load(code: &mut Vec<u8>, register: u8) -> usize {
        let rex_r = (register >> 3) & 1;
        code.push(0x48 | (rex_r << 2)); // REX.W
        code.push(0x8B); // mov r64, [rip + disp32]
        code.push(0x05 | ((register & 7) << 3));
        let disp = code.len();
        code.extend_from_slice(&[0, 0, 0, 0]);
        disp
    }

    fn patch_literal_load(code: &mut [u8], site: usize, target: usize) -> EmitResult<()> {
        patch_rel32(code, site, target)
    }

    fn emit_jump_over(code: &mut Vec<u8>, len: usize) -> EmitResult<()> {
        let rel = i8::try_from(len).map_err(|_| EmitError::DisplacementOverflow)?;
        code.push(0xEB); // jmp rel8
        code.push(rel as u8);
        Ok(())
    }

    fn trap_fill(region: &mut [u8]) {
        region.fill(0xCC); // int3
    }
}

fn patch_rel32(code: &mut [u8], disp_offset: usize, target: usize) -> EmitResult<()> {
    let end = disp_offset
        .checked_add(4)
        .filter(|end| *end <= code.len())
        .ok_or(EmitError::PatchOutOfBounds {
            offset: disp_offset,
            width: 4,
            len: code.len(),
        })?;
    let rel = (target as i64) - (end as i64);
    let rel = i32::try_from(rel).map_err(|_| EmitError::DisplacementOverflow)?;
    code[disp_offset..end].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}
