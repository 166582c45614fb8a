//! Command validator: walks a raw payload record by record before it
//! ever reaches a ring, checking each opcode's declared size and
//! opcode-specific rules against a kernel-owned copy.

extern crate alloc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::wire::{CommandHeader, Opcode};

const MAX_DMA_SIZE_BYTES: u32 = 16 * 1024 * 1024;
const MAX_DRAW_VERTEX_COUNT: u32 = 65_536;

/// Authorization the kernel-side caller has already established for
/// this submission. Deliberately *not* read from the wire header's
/// `FLAG_PRIVILEGED` bit — that bit is attacker-controlled payload
/// content and must never gate a privileged operation on its own.
pub struct ValidationContext {
    pub privileged: bool,
}

struct OpcodeBounds {
    min: u8,
    max: u8,
}

fn bounds(op: Opcode) -> OpcodeBounds {
    match op {
        Opcode::Nop => OpcodeBounds { min: 1, max: 1 },
        Opcode::Draw => OpcodeBounds { min: 5, max: 8 },
        Opcode::Compute => OpcodeBounds { min: 4, max: 8 },
        Opcode::Dma => OpcodeBounds { min: 4, max: 5 },
        Opcode::Fence => OpcodeBounds { min: 3, max: 3 },
        Opcode::Wait => OpcodeBounds { min: 2, max: 3 },
        Opcode::RegWrite | Opcode::RegRead => OpcodeBounds { min: 3, max: 3 },
    }
}

/// Walk `payload` record by record, checking each header's declared
/// size against its opcode's bounds and the opcode-specific rules,
/// and return a validated, kernel-owned copy with any unprivileged
/// `REG_WRITE`/`REG_READ` record rewritten to a same-length NOP.
/// Returns an error at the first violation with no partial mutation
/// visible to the caller (the copy is built from the input, never the
/// input itself).
pub fn validate(payload: &[u32], ctx: &ValidationContext) -> Result<Vec<u32>> {
    let mut out = payload.to_vec();
    let mut pos = 0usize;

    while pos < out.len() {
        let header = CommandHeader(out[pos]);
        let opcode = Opcode::from_u8(header.opcode()).ok_or(Error::InvalidArgument)?;
        let size = header.size_dwords() as usize;
        let b = bounds(opcode);
        if size < b.min as usize || size > b.max as usize {
            return Err(Error::InvalidArgument);
        }
        if pos + size > out.len() {
            return Err(Error::InvalidArgument);
        }

        match opcode {
            Opcode::Draw => validate_draw(&out[pos..pos + size])?,
            Opcode::Dma => validate_dma(&out[pos..pos + size])?,
            Opcode::Fence => validate_fence(&out[pos..pos + size])?,
            Opcode::RegWrite | Opcode::RegRead => {
                if !ctx.privileged {
                    rewrite_to_nop(&mut out[pos..pos + size], size as u8);
                }
            }
            Opcode::Nop | Opcode::Compute | Opcode::Wait => {}
        }

        pos += size;
    }
    Ok(out)
}

fn validate_draw(record: &[u32]) -> Result<()> {
    let vertex_count = record[1];
    let instance_count = record[2];
    let first_vertex = record[3];
    if vertex_count == 0 || vertex_count > MAX_DRAW_VERTEX_COUNT {
        return Err(Error::InvalidArgument);
    }
    if instance_count == 0 {
        return Err(Error::InvalidArgument);
    }
    if first_vertex == 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn validate_dma(record: &[u32]) -> Result<()> {
    let src = record[1];
    let dst = record[2];
    let size = record[3];
    if size == 0 || size > MAX_DMA_SIZE_BYTES {
        return Err(Error::InvalidArgument);
    }
    if src % 4 != 0 || dst % 4 != 0 || size % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn validate_fence(record: &[u32]) -> Result<()> {
    let addr = record[1];
    if addr % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn rewrite_to_nop(record: &mut [u32], size: u8) {
    record[0] = CommandHeader::new(Opcode::Nop as u8, size, 0).0;
    for dw in &mut record[1..] {
        *dw = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    fn ctx(privileged: bool) -> ValidationContext {
        ValidationContext { privileged }
    }

    #[test]
    fn nop_passes_unchanged() {
        let payload = wire::nop();
        let out = validate(&payload, &ctx(false)).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn valid_draw_record_passes() {
        let header = CommandHeader::new(Opcode::Draw as u8, 5, 0).0;
        let payload = [header, 100, 1, 1, 0];
        validate(&payload, &ctx(false)).unwrap();
    }

    #[test]
    fn draw_rejects_zero_vertex_count() {
        let header = CommandHeader::new(Opcode::Draw as u8, 5, 0).0;
        let payload = [header, 0, 1, 1, 0];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn draw_rejects_oversized_vertex_count() {
        let header = CommandHeader::new(Opcode::Draw as u8, 5, 0).0;
        let payload = [header, MAX_DRAW_VERTEX_COUNT + 1, 1, 1, 0];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn dma_rejects_misaligned_addresses() {
        let header = CommandHeader::new(Opcode::Dma as u8, 4, 0).0;
        let payload = [header, 0x1001, 0x2000, 64];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn dma_rejects_oversized_transfer() {
        let header = CommandHeader::new(Opcode::Dma as u8, 4, 0).0;
        let payload = [header, 0x1000, 0x2000, MAX_DMA_SIZE_BYTES + 4];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn fence_rejects_misaligned_address() {
        let payload = wire::fence(0x1001, 5);
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn reg_write_is_rewritten_to_nop_without_privilege() {
        let header = CommandHeader::new(Opcode::RegWrite as u8, 3, 0).0;
        let payload = [header, 0x0008, 0xFFFF_FFFF];
        let out = validate(&payload, &ctx(false)).unwrap();
        let parsed = CommandHeader(out[0]);
        assert_eq!(Opcode::from_u8(parsed.opcode()), Some(Opcode::Nop));
        assert_eq!(parsed.size_dwords(), 3);
        assert_eq!(out[1], 0);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn reg_write_is_preserved_with_privilege() {
        let header = CommandHeader::new(Opcode::RegWrite as u8, 3, 0).0;
        let payload = [header, 0x0008, 0xFFFF_FFFF];
        let out = validate(&payload, &ctx(true)).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn rejects_record_claiming_more_size_than_remaining_payload() {
        let header = CommandHeader::new(Opcode::Fence as u8, 3, 0).0;
        let payload = [header, 0x1000];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let payload = [0xFF_u32];
        assert_eq!(validate(&payload, &ctx(false)), Err(Error::InvalidArgument));
    }
}
