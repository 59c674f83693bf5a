// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec for the fixed-layout extended-state buffer.
//!
//! The buffer layout (legacy FPU/SSE area, header, and extended component
//! areas) is an external hardware ABI.  Every offset is pinned in
//! [`offsets`] and verified by tests; nothing here may be reordered or
//! derived at runtime.

use byteorder::{ByteOrder, LE};

use hvf_api::XSAVE_AREA_LEN;

use crate::cpu::{FpuState, GuestCpuState};

/// Byte offsets of each semantic field within the extended-state buffer.
pub mod offsets {
    /// FPU control word
    pub const FCW: usize = 0;
    /// FPU status word
    pub const FSW: usize = 2;
    /// Abridged tag byte
    pub const FTW: usize = 4;
    /// Last FPU opcode
    pub const FOP: usize = 6;
    /// Last FPU instruction pointer
    pub const FIP: usize = 8;
    /// Last FPU data pointer
    pub const FDP: usize = 16;
    pub const MXCSR: usize = 24;
    /// x87 register bank: 8 registers in 16-byte slots
    pub const ST_REGS: usize = 32;
    /// XMM register bank: 16 registers, 16 bytes each
    pub const XMM_REGS: usize = 160;
    /// State-component bitmap in the buffer header
    pub const XSTATE_BV: usize = 512;
    /// High halves of the YMM registers: 16 x 16 bytes
    pub const YMM_HI: usize = 576;
    /// Bound registers: 4 x 16 bytes
    pub const BND_REGS: usize = 960;
    /// Bound configuration/status: 16 bytes
    pub const BND_CSR: usize = 1024;
    /// Opmask registers: 8 x 8 bytes
    pub const OPMASK: usize = 1088;
    /// High 256 bits of ZMM0-ZMM15: 16 x 32 bytes
    pub const ZMM_HI: usize = 1152;
    /// ZMM16-ZMM31: 16 x 64 bytes
    pub const HI16_ZMM: usize = 1664;
}

const FSW_TOP_SHIFT: u16 = 11;
const FSW_TOP_MASK: u16 = 7 << FSW_TOP_SHIFT;

/// The extended-state buffer in the host's transfer format.
pub struct XsaveArea(pub Box<[u8; XSAVE_AREA_LEN]>);

impl Default for XsaveArea {
    fn default() -> Self {
        Self(Box::new([0u8; XSAVE_AREA_LEN]))
    }
}

fn put_bank<const N: usize>(buf: &mut [u8], off: usize, regs: &[[u8; N]]) {
    for (i, reg) in regs.iter().enumerate() {
        let at = off + i * N;
        buf[at..at + N].copy_from_slice(reg);
    }
}

fn get_bank<const N: usize>(buf: &[u8], off: usize, regs: &mut [[u8; N]]) {
    for (i, reg) in regs.iter_mut().enumerate() {
        let at = off + i * N;
        reg.copy_from_slice(&buf[at..at + N]);
    }
}

/// Packs the guest FPU/SIMD state into a zero-filled buffer.
///
/// The status word's TOP field is synthesized from the separately-tracked
/// top-of-stack, and the abridged tag byte is built by negating each
/// register's "empty" flag.
pub fn pack(cpu: &GuestCpuState) -> XsaveArea {
    use offsets::*;

    let mut area = XsaveArea::default();
    let buf = &mut area.0[..];
    let fpu = &cpu.fpu;

    LE::write_u16(&mut buf[FCW..FCW + 2], fpu.fcw);
    let fsw =
        (fpu.fsw & !FSW_TOP_MASK) | (((fpu.top & 7) as u16) << FSW_TOP_SHIFT);
    LE::write_u16(&mut buf[FSW..FSW + 2], fsw);

    let mut ftw = 0u8;
    for (x, empty) in fpu.ftw_empty.iter().enumerate() {
        ftw |= (!*empty as u8) << x;
    }
    buf[FTW] = ftw;

    LE::write_u16(&mut buf[FOP..FOP + 2], fpu.fop);
    LE::write_u64(&mut buf[FIP..FIP + 8], fpu.fip);
    LE::write_u64(&mut buf[FDP..FDP + 8], fpu.fdp);
    LE::write_u32(&mut buf[MXCSR..MXCSR + 4], fpu.mxcsr);

    put_bank(buf, ST_REGS, &fpu.st);
    put_bank(buf, XMM_REGS, &fpu.xmm);
    put_bank(buf, YMM_HI, &fpu.ymm_hi);
    put_bank(buf, ZMM_HI, &fpu.zmm_hi);
    put_bank(buf, HI16_ZMM, &fpu.zmm_hi16);
    put_bank(buf, BND_REGS, &fpu.bnd);
    buf[BND_CSR..BND_CSR + 16].copy_from_slice(&fpu.bndcsr);
    for (i, mask) in fpu.opmask.iter().enumerate() {
        let at = OPMASK + i * 8;
        LE::write_u64(&mut buf[at..at + 8], *mask);
    }

    LE::write_u64(&mut buf[XSTATE_BV..XSTATE_BV + 8], fpu.xstate_bv);

    area
}

/// Unpacks a buffer into the guest FPU/SIMD state, recomputing the
/// top-of-stack from the status word.
pub fn unpack(area: &XsaveArea, cpu: &mut GuestCpuState) {
    use offsets::*;

    let buf = &area.0[..];
    let fpu = &mut cpu.fpu;

    fpu.fcw = LE::read_u16(&buf[FCW..FCW + 2]);
    // TOP is tracked in its own field; the status word keeps the rest.
    let fsw = LE::read_u16(&buf[FSW..FSW + 2]);
    fpu.top = ((fsw >> FSW_TOP_SHIFT) & 7) as u8;
    fpu.fsw = fsw & !FSW_TOP_MASK;

    let ftw = buf[FTW];
    for (x, empty) in fpu.ftw_empty.iter_mut().enumerate() {
        *empty = (ftw >> x) & 1 == 0;
    }

    fpu.fop = LE::read_u16(&buf[FOP..FOP + 2]);
    fpu.fip = LE::read_u64(&buf[FIP..FIP + 8]);
    fpu.fdp = LE::read_u64(&buf[FDP..FDP + 8]);
    fpu.mxcsr = LE::read_u32(&buf[MXCSR..MXCSR + 4]);

    get_bank(buf, ST_REGS, &mut fpu.st);
    get_bank(buf, XMM_REGS, &mut fpu.xmm);
    get_bank(buf, YMM_HI, &mut fpu.ymm_hi);
    get_bank(buf, ZMM_HI, &mut fpu.zmm_hi);
    get_bank(buf, HI16_ZMM, &mut fpu.zmm_hi16);
    get_bank(buf, BND_REGS, &mut fpu.bnd);
    fpu.bndcsr.copy_from_slice(&buf[BND_CSR..BND_CSR + 16]);
    for (i, mask) in fpu.opmask.iter_mut().enumerate() {
        let at = OPMASK + i * 8;
        *mask = LE::read_u64(&buf[at..at + 8]);
    }

    fpu.xstate_bv = LE::read_u64(&buf[XSTATE_BV..XSTATE_BV + 8]);
}
