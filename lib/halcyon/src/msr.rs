// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization of the fixed model-specific register set.

use std::io::Result;

use hvf_api::*;

use crate::cpu::GuestCpuState;
use crate::vmm::VcpuHdl;

/// Writes the synchronized MSR set into the host context.
///
/// The long-mode-only registers are skipped on a vCPU without 64-bit mode
/// support; FS.base and GS.base are sourced from the segment caches rather
/// than separate MSR storage.
pub fn put_msrs(hdl: &dyn VcpuHdl, cpu: &GuestCpuState) -> Result<()> {
    hdl.write_msr(MSR_IA32_SYSENTER_CS, cpu.sysenter_cs)?;
    hdl.write_msr(MSR_IA32_SYSENTER_ESP, cpu.sysenter_esp)?;
    hdl.write_msr(MSR_IA32_SYSENTER_EIP, cpu.sysenter_eip)?;

    hdl.write_msr(MSR_STAR, cpu.star)?;

    if cpu.long_mode {
        hdl.write_msr(MSR_CSTAR, cpu.cstar)?;
        hdl.write_msr(MSR_KERNELGSBASE, cpu.kernel_gs_base)?;
        hdl.write_msr(MSR_FMASK, cpu.fmask)?;
        hdl.write_msr(MSR_LSTAR, cpu.lstar)?;
    }

    hdl.write_msr(MSR_GSBASE, cpu.gs.base)?;
    hdl.write_msr(MSR_FSBASE, cpu.fs.base)?;

    hdl.sync_tsc(cpu.tsc)?;
    Ok(())
}

/// Reads the synchronized MSR set back from the host context.
///
/// The guest-visible TSC is computed from the host cycle counter plus the
/// host's offset field, not read as a raw MSR.
pub fn get_msrs(hdl: &dyn VcpuHdl, cpu: &mut GuestCpuState) -> Result<()> {
    cpu.sysenter_cs = hdl.read_msr(MSR_IA32_SYSENTER_CS)?;
    cpu.sysenter_esp = hdl.read_msr(MSR_IA32_SYSENTER_ESP)?;
    cpu.sysenter_eip = hdl.read_msr(MSR_IA32_SYSENTER_EIP)?;

    cpu.star = hdl.read_msr(MSR_STAR)?;

    if cpu.long_mode {
        cpu.cstar = hdl.read_msr(MSR_CSTAR)?;
        cpu.kernel_gs_base = hdl.read_msr(MSR_KERNELGSBASE)?;
        cpu.fmask = hdl.read_msr(MSR_FMASK)?;
        cpu.lstar = hdl.read_msr(MSR_LSTAR)?;
    }

    cpu.tsc =
        hdl.host_tsc().wrapping_add(hdl.read_vmcs(VMCS_TSC_OFFSET)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::testhdl::TestHdl;
    use std::sync::atomic::Ordering;

    #[test]
    fn fixed_set_round_trips() {
        let hdl = TestHdl::new();
        let mut cpu = GuestCpuState::new(true);
        cpu.sysenter_cs = 0x10;
        cpu.sysenter_esp = 0x2000;
        cpu.sysenter_eip = 0x3000;
        cpu.star = 0x23_0008_0000_0000;
        cpu.lstar = 0xffff_8000_0010_0000;
        cpu.cstar = 0xffff_8000_0020_0000;
        cpu.fmask = 0x4_7700;
        cpu.kernel_gs_base = 0xffff_8800_0000_0000;

        put_msrs(&hdl, &cpu).unwrap();

        let mut out = GuestCpuState::new(true);
        get_msrs(&hdl, &mut out).unwrap();
        assert_eq!(out.sysenter_cs, cpu.sysenter_cs);
        assert_eq!(out.sysenter_esp, cpu.sysenter_esp);
        assert_eq!(out.sysenter_eip, cpu.sysenter_eip);
        assert_eq!(out.star, cpu.star);
        assert_eq!(out.lstar, cpu.lstar);
        assert_eq!(out.cstar, cpu.cstar);
        assert_eq!(out.fmask, cpu.fmask);
        assert_eq!(out.kernel_gs_base, cpu.kernel_gs_base);
    }

    #[test]
    fn long_mode_registers_skipped_without_support() {
        let hdl = TestHdl::new();
        let mut cpu = GuestCpuState::new(false);
        cpu.lstar = 0x1234;
        cpu.cstar = 0x5678;

        put_msrs(&hdl, &cpu).unwrap();
        assert_eq!(hdl.msr_value(MSR_LSTAR), 0);
        assert_eq!(hdl.msr_value(MSR_CSTAR), 0);

        hdl.seed_msr(MSR_LSTAR, 0xdead);
        let mut out = GuestCpuState::new(false);
        get_msrs(&hdl, &mut out).unwrap();
        assert_eq!(out.lstar, 0);
    }

    #[test]
    fn segment_bases_feed_fs_gs_msrs() {
        let hdl = TestHdl::new();
        let mut cpu = GuestCpuState::new(true);
        cpu.fs.base = 0x7fff_1000;
        cpu.gs.base = 0x7fff_2000;

        put_msrs(&hdl, &cpu).unwrap();
        assert_eq!(hdl.msr_value(MSR_FSBASE), 0x7fff_1000);
        assert_eq!(hdl.msr_value(MSR_GSBASE), 0x7fff_2000);
    }

    #[test]
    fn guest_tsc_tracks_host_offset() {
        let hdl = TestHdl::new();
        hdl.tsc.store(1_000_000, Ordering::Relaxed);
        hdl.seed_vmcs(VMCS_TSC_OFFSET, 500);

        let mut cpu = GuestCpuState::new(true);
        get_msrs(&hdl, &mut cpu).unwrap();
        assert_eq!(cpu.tsc, 1_000_500);
    }

    #[test]
    fn put_reconciles_guest_tsc() {
        let hdl = TestHdl::new();
        let mut cpu = GuestCpuState::new(true);
        cpu.tsc = 42_000;
        put_msrs(&hdl, &cpu).unwrap();
        assert_eq!(hdl.synced_tsc.load(Ordering::Relaxed), 42_000);
    }
}
