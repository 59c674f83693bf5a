// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation between the guest segment cache and the host's packed
//! segment-descriptor fields, plus descriptor-table and control-register
//! synchronization.

use std::io::Result;

use hvf_api::*;

use crate::cpu::bits::*;
use crate::cpu::{GuestCpuState, SegmentCache};
use crate::vmm::VcpuHdl;

/// A segment register in the host's representation: selector, base, limit,
/// and the packed access-rights word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HostSegment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

/// "Segment unusable" flag in the access-rights word.
pub const AR_UNUSABLE: u32 = 1 << 16;

/// One access-rights field: its position in the guest descriptor-cache flag
/// word and in the host's packed word.  The table drives both directions of
/// the translation; the positions are fixed by the descriptor format and the
/// virtualization architecture respectively.
struct ArField {
    guest_shift: u32,
    host_shift: u32,
    width: u32,
}

const AR_FIELDS: &[ArField] = &[
    // type
    ArField { guest_shift: DESC_TYPE_SHIFT, host_shift: 0, width: 4 },
    // descriptor type (code/data vs. system)
    ArField { guest_shift: DESC_S_SHIFT, host_shift: 4, width: 1 },
    // descriptor privilege level
    ArField { guest_shift: DESC_DPL_SHIFT, host_shift: 5, width: 2 },
    // present
    ArField { guest_shift: DESC_P_SHIFT, host_shift: 7, width: 1 },
    // available for system software
    ArField { guest_shift: DESC_AVL_SHIFT, host_shift: 12, width: 1 },
    // long mode
    ArField { guest_shift: DESC_L_SHIFT, host_shift: 13, width: 1 },
    // default operation size
    ArField { guest_shift: DESC_B_SHIFT, host_shift: 14, width: 1 },
    // granularity
    ArField { guest_shift: DESC_G_SHIFT, host_shift: 15, width: 1 },
];

/// Packs descriptor-cache flags into the host access-rights word.
pub fn pack_access_rights(flags: u32) -> u32 {
    AR_FIELDS.iter().fold(0, |ar, f| {
        let mask = (1 << f.width) - 1;
        ar | (((flags >> f.guest_shift) & mask) << f.host_shift)
    })
}

/// Unpacks a host access-rights word into descriptor-cache flags.
pub fn unpack_access_rights(ar: u32) -> u32 {
    AR_FIELDS.iter().fold(0, |flags, f| {
        let mask = (1 << f.width) - 1;
        flags | (((ar >> f.host_shift) & mask) << f.guest_shift)
    })
}

/// Converts a guest segment cache into the host representation.
///
/// A null selector outside real mode marks the segment unusable, except on
/// the task register: TR is architecturally usable immediately after reset
/// despite holding a null selector.
pub fn to_host(
    seg: &SegmentCache,
    is_task_reg: bool,
    real_mode: bool,
) -> HostSegment {
    let mut out = HostSegment {
        selector: seg.selector,
        base: seg.base,
        limit: seg.limit,
        access_rights: 0,
    };

    if seg.selector == 0 && !real_mode && !is_task_reg {
        out.access_rights = AR_UNUSABLE;
        return out;
    }
    out.access_rights = pack_access_rights(seg.flags);
    out
}

/// Converts a host segment back into the guest cache representation.
pub fn to_guest(seg: &HostSegment) -> SegmentCache {
    SegmentCache {
        selector: seg.selector,
        base: seg.base,
        limit: seg.limit,
        flags: unpack_access_rights(seg.access_rights),
    }
}

/// Segment registers addressable in the host control structure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegReg {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
    Ldtr,
}

struct SegFields {
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
}

const fn seg_fields(reg: SegReg) -> SegFields {
    match reg {
        SegReg::Cs => SegFields {
            selector: VMCS_GUEST_CS_SELECTOR,
            base: VMCS_GUEST_CS_BASE,
            limit: VMCS_GUEST_CS_LIMIT,
            access_rights: VMCS_GUEST_CS_AR,
        },
        SegReg::Ds => SegFields {
            selector: VMCS_GUEST_DS_SELECTOR,
            base: VMCS_GUEST_DS_BASE,
            limit: VMCS_GUEST_DS_LIMIT,
            access_rights: VMCS_GUEST_DS_AR,
        },
        SegReg::Es => SegFields {
            selector: VMCS_GUEST_ES_SELECTOR,
            base: VMCS_GUEST_ES_BASE,
            limit: VMCS_GUEST_ES_LIMIT,
            access_rights: VMCS_GUEST_ES_AR,
        },
        SegReg::Fs => SegFields {
            selector: VMCS_GUEST_FS_SELECTOR,
            base: VMCS_GUEST_FS_BASE,
            limit: VMCS_GUEST_FS_LIMIT,
            access_rights: VMCS_GUEST_FS_AR,
        },
        SegReg::Gs => SegFields {
            selector: VMCS_GUEST_GS_SELECTOR,
            base: VMCS_GUEST_GS_BASE,
            limit: VMCS_GUEST_GS_LIMIT,
            access_rights: VMCS_GUEST_GS_AR,
        },
        SegReg::Ss => SegFields {
            selector: VMCS_GUEST_SS_SELECTOR,
            base: VMCS_GUEST_SS_BASE,
            limit: VMCS_GUEST_SS_LIMIT,
            access_rights: VMCS_GUEST_SS_AR,
        },
        SegReg::Tr => SegFields {
            selector: VMCS_GUEST_TR_SELECTOR,
            base: VMCS_GUEST_TR_BASE,
            limit: VMCS_GUEST_TR_LIMIT,
            access_rights: VMCS_GUEST_TR_AR,
        },
        SegReg::Ldtr => SegFields {
            selector: VMCS_GUEST_LDTR_SELECTOR,
            base: VMCS_GUEST_LDTR_BASE,
            limit: VMCS_GUEST_LDTR_LIMIT,
            access_rights: VMCS_GUEST_LDTR_AR,
        },
    }
}

/// Writes one segment's four control-structure fields.
pub fn write_segment(
    hdl: &dyn VcpuHdl,
    reg: SegReg,
    seg: &HostSegment,
) -> Result<()> {
    let f = seg_fields(reg);
    hdl.write_vmcs(f.selector, seg.selector as u64)?;
    hdl.write_vmcs(f.base, seg.base)?;
    hdl.write_vmcs(f.limit, seg.limit as u64)?;
    hdl.write_vmcs(f.access_rights, seg.access_rights as u64)?;
    Ok(())
}

/// Reads one segment's four control-structure fields.
pub fn read_segment(hdl: &dyn VcpuHdl, reg: SegReg) -> Result<HostSegment> {
    let f = seg_fields(reg);
    Ok(HostSegment {
        selector: hdl.read_vmcs(f.selector)? as u16,
        base: hdl.read_vmcs(f.base)?,
        limit: hdl.read_vmcs(f.limit)? as u32,
        access_rights: hdl.read_vmcs(f.access_rights)? as u32,
    })
}

/// Writes segment, descriptor-table, and control-register state into the
/// host context.
pub fn put_segments(hdl: &dyn VcpuHdl, cpu: &GuestCpuState) -> Result<()> {
    hdl.write_vmcs(VMCS_GUEST_IDTR_LIMIT, cpu.idt.limit as u64)?;
    hdl.write_vmcs(VMCS_GUEST_IDTR_BASE, cpu.idt.base)?;
    hdl.write_vmcs(VMCS_GUEST_GDTR_LIMIT, cpu.gdt.limit as u64)?;
    hdl.write_vmcs(VMCS_GUEST_GDTR_BASE, cpu.gdt.base)?;

    hdl.write_vmcs(VMCS_GUEST_CR3, cpu.cr3)?;
    hdl.write_reg(hv_x86_reg::HV_X86_CR2, cpu.cr2)?;
    hdl.write_vmcs(VMCS_GUEST_IA32_EFER, cpu.efer)?;
    hdl.write_vmcs(VMCS_GUEST_CR4, cpu.cr4)?;
    hdl.write_vmcs(VMCS_GUEST_CR0, cpu.cr0)?;

    let real_mode = cpu.is_real_mode();
    let segs = [
        (SegReg::Cs, &cpu.cs),
        (SegReg::Ds, &cpu.ds),
        (SegReg::Es, &cpu.es),
        (SegReg::Ss, &cpu.ss),
        (SegReg::Fs, &cpu.fs),
        (SegReg::Gs, &cpu.gs),
        (SegReg::Tr, &cpu.tr),
        (SegReg::Ldtr, &cpu.ldtr),
    ];
    for (reg, seg) in segs {
        let is_tr = reg == SegReg::Tr;
        write_segment(hdl, reg, &to_host(seg, is_tr, real_mode))?;
    }
    Ok(())
}

/// Reads segment, descriptor-table, and control-register state back out of
/// the host context.
pub fn get_segments(hdl: &dyn VcpuHdl, cpu: &mut GuestCpuState) -> Result<()> {
    cpu.cs = to_guest(&read_segment(hdl, SegReg::Cs)?);
    cpu.ds = to_guest(&read_segment(hdl, SegReg::Ds)?);
    cpu.es = to_guest(&read_segment(hdl, SegReg::Es)?);
    cpu.fs = to_guest(&read_segment(hdl, SegReg::Fs)?);
    cpu.gs = to_guest(&read_segment(hdl, SegReg::Gs)?);
    cpu.ss = to_guest(&read_segment(hdl, SegReg::Ss)?);
    cpu.tr = to_guest(&read_segment(hdl, SegReg::Tr)?);
    cpu.ldtr = to_guest(&read_segment(hdl, SegReg::Ldtr)?);

    cpu.idt.limit = hdl.read_vmcs(VMCS_GUEST_IDTR_LIMIT)? as u32;
    cpu.idt.base = hdl.read_vmcs(VMCS_GUEST_IDTR_BASE)?;
    cpu.gdt.limit = hdl.read_vmcs(VMCS_GUEST_GDTR_LIMIT)? as u32;
    cpu.gdt.base = hdl.read_vmcs(VMCS_GUEST_GDTR_BASE)?;

    cpu.cr0 = hdl.read_vmcs(VMCS_GUEST_CR0)?;
    cpu.cr2 = hdl.read_reg(hv_x86_reg::HV_X86_CR2)?;
    cpu.cr3 = hdl.read_vmcs(VMCS_GUEST_CR3)?;
    cpu.cr4 = hdl.read_vmcs(VMCS_GUEST_CR4)?;
    cpu.efer = hdl.read_vmcs(VMCS_GUEST_IA32_EFER)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::bits::*;

    fn sample_seg() -> SegmentCache {
        SegmentCache {
            selector: 0x10,
            base: 0xffff_0000,
            limit: 0xf_ffff,
            // type=0xb, S=1, DPL=3, P=1, AVL=1, L=0, B=1, G=1
            flags: (0xb << DESC_TYPE_SHIFT)
                | (1 << DESC_S_SHIFT)
                | (3 << DESC_DPL_SHIFT)
                | (1 << DESC_P_SHIFT)
                | (1 << DESC_AVL_SHIFT)
                | (1 << DESC_B_SHIFT)
                | (1 << DESC_G_SHIFT),
        }
    }

    #[test]
    fn access_rights_round_trip() {
        let seg = sample_seg();
        let host = to_host(&seg, false, false);
        assert_eq!(to_guest(&host), seg);
    }

    #[test]
    fn access_rights_bit_positions() {
        let seg = sample_seg();
        let host = to_host(&seg, false, false);
        // Packed word checked bit-for-bit against the architectural layout
        assert_eq!(
            host.access_rights,
            0xb | (1 << 4) | (3 << 5) | (1 << 7) | (1 << 12) | (1 << 14) | (1 << 15)
        );
    }

    #[test]
    fn every_flag_field_round_trips() {
        // Walk each table entry in isolation
        for (shift, width) in [
            (DESC_TYPE_SHIFT, 4),
            (DESC_S_SHIFT, 1),
            (DESC_DPL_SHIFT, 2),
            (DESC_P_SHIFT, 1),
            (DESC_AVL_SHIFT, 1),
            (DESC_L_SHIFT, 1),
            (DESC_B_SHIFT, 1),
            (DESC_G_SHIFT, 1),
        ] {
            let mask = ((1u32 << width) - 1) << shift;
            assert_eq!(unpack_access_rights(pack_access_rights(mask)), mask);
        }
    }

    #[test]
    fn null_selector_unusable_outside_real_mode() {
        let seg = SegmentCache { selector: 0, flags: 0xffff_ffff, ..Default::default() };
        let host = to_host(&seg, false, false);
        assert_eq!(host.access_rights, AR_UNUSABLE);
    }

    #[test]
    fn null_selector_usable_in_real_mode() {
        let seg = SegmentCache { selector: 0, ..Default::default() };
        let host = to_host(&seg, false, true);
        assert_eq!(host.access_rights & AR_UNUSABLE, 0);
    }

    #[test]
    fn null_task_register_stays_usable() {
        // TR holds a null selector right after reset but must stay usable
        let seg = SegmentCache { selector: 0, ..Default::default() };
        let host = to_host(&seg, true, false);
        assert_eq!(host.access_rights & AR_UNUSABLE, 0);
    }

    #[test]
    fn segment_sync_round_trip() {
        use crate::vmm::testhdl::TestHdl;

        let hdl = TestHdl::new();
        let mut cpu = GuestCpuState::new(true);
        cpu.cr0 = CR0_PE;
        cpu.cs = sample_seg();
        cpu.tr = SegmentCache { selector: 0, base: 0x1000, limit: 0x67, flags: 0xb << DESC_TYPE_SHIFT };
        cpu.gdt = crate::cpu::DtableReg { base: 0xfee0_0000, limit: 0x7f };
        cpu.cr3 = 0xdead_b000;
        cpu.efer = 0x500;

        put_segments(&hdl, &cpu).unwrap();

        let mut out = GuestCpuState::new(true);
        get_segments(&hdl, &mut out).unwrap();
        assert_eq!(out.cs, cpu.cs);
        assert_eq!(out.tr.base, cpu.tr.base);
        assert_eq!(out.gdt, cpu.gdt);
        assert_eq!(out.cr3, cpu.cr3);
        assert_eq!(out.efer, cpu.efer);
        assert_eq!(out.cr0, cpu.cr0);
    }
}
