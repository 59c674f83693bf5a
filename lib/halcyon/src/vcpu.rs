// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual CPU functionality.

use std::io::Result;
use std::sync::Arc;

use hvf_api::hv_x86_reg::{self, *};

use crate::cpu::{GuestCpuState, IntrReq, IntrRequests};
use crate::events::VcpuPlatform;
use crate::vmm::VcpuHdl;
use crate::xsave::{self, XsaveArea};
use crate::{events, intr, msr, segments};

const DR_REGS: [hv_x86_reg; 8] = [
    HV_X86_DR0, HV_X86_DR1, HV_X86_DR2, HV_X86_DR3, HV_X86_DR4, HV_X86_DR5,
    HV_X86_DR6, HV_X86_DR7,
];

/// A handle to a virtual CPU.
///
/// Pairs one guest CPU with one host hardware-virtualization context for the
/// VM's lifetime.  All host calls are issued from the thread driving this
/// vCPU; only the request bits in [`Vcpu::irqs`] may be touched from
/// elsewhere.
pub struct Vcpu {
    hdl: Arc<dyn VcpuHdl>,
    pub id: i32,
    pub irqs: IntrRequests,
    pub(crate) platform: Arc<dyn VcpuPlatform>,
    pub(crate) log: slog::Logger,
}

impl Vcpu {
    /// Creates a handle to a virtual CPU.
    pub fn new(
        hdl: Arc<dyn VcpuHdl>,
        id: i32,
        platform: Arc<dyn VcpuPlatform>,
        log: &slog::Logger,
    ) -> Arc<Self> {
        let log = log.new(slog::o!("component" => "vcpu", "id" => id));
        Arc::new(Self { hdl, id, irqs: IntrRequests::new(), platform, log })
    }

    /// ID of the virtual CPU.
    pub fn cpuid(&self) -> i32 {
        self.id
    }

    pub fn is_bsp(&self) -> bool {
        self.id == 0
    }

    pub fn hdl(&self) -> &dyn VcpuHdl {
        self.hdl.as_ref()
    }

    pub(crate) fn platform(&self) -> &dyn VcpuPlatform {
        self.platform.as_ref()
    }

    pub(crate) fn log(&self) -> &slog::Logger {
        &self.log
    }

    /// Raises a request bit.  Idempotent, callable from any thread.
    pub fn request(&self, req: IntrReq) {
        self.irqs.assert(req);
    }

    /// Signals a non-maskable interrupt to the vCPU.
    pub fn request_nmi(&self) {
        self.irqs.assert(IntrReq::NMI);
    }

    /// Writes the guest model into the host context: general registers,
    /// flags, instruction pointer, XCR0, extended state, segments and
    /// control registers, MSRs, and debug registers.
    pub fn put_state(&self, cpu: &mut GuestCpuState) -> Result<()> {
        let hdl = self.hdl();

        hdl.write_reg(HV_X86_RAX, cpu.rax)?;
        hdl.write_reg(HV_X86_RBX, cpu.rbx)?;
        hdl.write_reg(HV_X86_RCX, cpu.rcx)?;
        hdl.write_reg(HV_X86_RDX, cpu.rdx)?;
        hdl.write_reg(HV_X86_RBP, cpu.rbp)?;
        hdl.write_reg(HV_X86_RSP, cpu.rsp)?;
        hdl.write_reg(HV_X86_RSI, cpu.rsi)?;
        hdl.write_reg(HV_X86_RDI, cpu.rdi)?;
        hdl.write_reg(HV_X86_R8, cpu.r8)?;
        hdl.write_reg(HV_X86_R9, cpu.r9)?;
        hdl.write_reg(HV_X86_R10, cpu.r10)?;
        hdl.write_reg(HV_X86_R11, cpu.r11)?;
        hdl.write_reg(HV_X86_R12, cpu.r12)?;
        hdl.write_reg(HV_X86_R13, cpu.r13)?;
        hdl.write_reg(HV_X86_R14, cpu.r14)?;
        hdl.write_reg(HV_X86_R15, cpu.r15)?;
        hdl.write_reg(HV_X86_RFLAGS, cpu.rflags)?;
        hdl.write_reg(HV_X86_RIP, cpu.rip)?;
        hdl.write_reg(HV_X86_XCR0, cpu.xcr0)?;

        self.put_fpu(cpu)?;
        segments::put_segments(hdl, cpu)?;
        msr::put_msrs(hdl, cpu)?;

        for (i, dr) in cpu.dr.iter().enumerate() {
            hdl.write_reg(DR_REGS[i], *dr)?;
        }

        cpu.dirty = false;
        Ok(())
    }

    /// Reads the host context back into the guest model.
    pub fn get_state(&self, cpu: &mut GuestCpuState) -> Result<()> {
        let hdl = self.hdl();

        cpu.rax = hdl.read_reg(HV_X86_RAX)?;
        cpu.rbx = hdl.read_reg(HV_X86_RBX)?;
        cpu.rcx = hdl.read_reg(HV_X86_RCX)?;
        cpu.rdx = hdl.read_reg(HV_X86_RDX)?;
        cpu.rbp = hdl.read_reg(HV_X86_RBP)?;
        cpu.rsp = hdl.read_reg(HV_X86_RSP)?;
        cpu.rsi = hdl.read_reg(HV_X86_RSI)?;
        cpu.rdi = hdl.read_reg(HV_X86_RDI)?;
        cpu.r8 = hdl.read_reg(HV_X86_R8)?;
        cpu.r9 = hdl.read_reg(HV_X86_R9)?;
        cpu.r10 = hdl.read_reg(HV_X86_R10)?;
        cpu.r11 = hdl.read_reg(HV_X86_R11)?;
        cpu.r12 = hdl.read_reg(HV_X86_R12)?;
        cpu.r13 = hdl.read_reg(HV_X86_R13)?;
        cpu.r14 = hdl.read_reg(HV_X86_R14)?;
        cpu.r15 = hdl.read_reg(HV_X86_R15)?;
        cpu.rflags = hdl.read_reg(HV_X86_RFLAGS)?;
        cpu.rip = hdl.read_reg(HV_X86_RIP)?;

        self.get_fpu(cpu)?;
        cpu.xcr0 = hdl.read_reg(HV_X86_XCR0)?;

        segments::get_segments(hdl, cpu)?;
        msr::get_msrs(hdl, cpu)?;

        for (i, reg) in DR_REGS.iter().enumerate() {
            cpu.dr[i] = hdl.read_reg(*reg)?;
        }

        cpu.dirty = true;
        Ok(())
    }

    /// Transfers the packed extended state to the host.
    pub fn put_fpu(&self, cpu: &GuestCpuState) -> Result<()> {
        let area = xsave::pack(cpu);
        self.hdl.write_fpstate(&area.0)
    }

    /// Pulls the extended state out of the host and unpacks it.
    pub fn get_fpu(&self, cpu: &mut GuestCpuState) -> Result<()> {
        let mut area = XsaveArea::default();
        self.hdl.read_fpstate(&mut area.0)?;
        xsave::unpack(&area, cpu);
        Ok(())
    }

    /// Refreshes the model from the host unless the model is already
    /// authoritative.
    pub fn synchronize_state(&self, cpu: &mut GuestCpuState) -> Result<()> {
        if !cpu.dirty {
            self.get_state(cpu)?;
        }
        Ok(())
    }

    /// Processes pending requests ahead of entry, returning the halted flag
    /// for the run loop.
    pub fn process_events(&self, cpu: &mut GuestCpuState) -> bool {
        match events::process(self, cpu) {
            Ok(halted) => halted,
            Err(e) => self.fatal("event processing", &e),
        }
    }

    /// Synchronizes model state into the host, runs the injector, and
    /// flushes batched writes.  Call immediately before resuming the guest.
    pub fn pre_enter(&self, cpu: &mut GuestCpuState) {
        let res = self.put_state(cpu).and_then(|_| {
            intr::inject_pending(
                self.hdl(),
                cpu,
                &self.irqs,
                self.platform(),
            )?;
            self.hdl.flush()
        });
        if let Err(e) = res {
            self.fatal("state synchronization before entry", &e);
        }
    }

    /// Reads host state back into the model.  Call immediately after a VM
    /// exit.
    pub fn post_exit(&self, cpu: &mut GuestCpuState) {
        if let Err(e) = self.get_state(cpu) {
            self.fatal("state synchronization after exit", &e);
        }
    }

    /// Resuming the guest with partially-synchronized CPU state risks
    /// silent corruption, so a failed host call is unrecoverable for the
    /// whole process.  Deliberate crash-over-corruption policy.
    fn fatal(&self, during: &str, err: &std::io::Error) -> ! {
        slog::crit!(self.log, "fatal host API failure";
            "during" => during, "error" => %err);
        std::process::abort();
    }
}

pub mod migrate {
    use std::io;

    use serde::{Deserialize, Serialize};

    use hvf_api::hv_x86_reg::*;
    use hvf_api::*;

    use super::Vcpu;
    use crate::cpu::{GuestCpuState, IntrReq};
    use crate::segments::{self, HostSegment, SegReg};

    #[derive(Debug, thiserror::Error)]
    pub enum SnapshotError {
        #[error("IO Error")]
        Io(#[from] io::Error),

        #[error("FPU payload size {0} does not match the transfer area")]
        FpuSize(usize),
    }

    type Result<T> = std::result::Result<T, SnapshotError>;

    pub(super) trait VcpuReadWrite: Sized {
        fn read(vcpu: &Vcpu) -> Result<Self>;
        fn write(self, vcpu: &Vcpu) -> Result<()>;
    }

    #[derive(Clone, Default, Deserialize, Serialize)]
    pub struct VcpuRunStateV1 {
        pub halted: bool,
        pub intr_req: u32,
    }

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct VcpuGpRegsV1 {
        pub rax: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rbx: u64,
        pub rsp: u64,
        pub rbp: u64,
        pub rsi: u64,
        pub rdi: u64,
        pub r8: u64,
        pub r9: u64,
        pub r10: u64,
        pub r11: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,

        pub rip: u64,
        pub rflags: u64,
    }

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct VcpuCtrlRegsV1 {
        pub cr0: u64,
        pub cr2: u64,
        pub cr3: u64,
        pub cr4: u64,
        pub xcr0: u64,

        /// EFER travels with the control registers, rather than the rest of
        /// the MSRs, because of its involvement in configuring long mode.
        pub efer: u64,
    }

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct VcpuDbgRegsV1 {
        pub dr0: u64,
        pub dr1: u64,
        pub dr2: u64,
        pub dr3: u64,
        pub dr6: u64,
        pub dr7: u64,
    }

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct SegDesc {
        pub base: u64,
        pub limit: u32,
        pub access: u32,
        pub selector: u16,
    }

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct VcpuSegRegsV1 {
        pub cs: SegDesc,
        pub ds: SegDesc,
        pub es: SegDesc,
        pub fs: SegDesc,
        pub gs: SegDesc,
        pub ss: SegDesc,
        pub gdtr: SegDesc,
        pub idtr: SegDesc,
        pub ldtr: SegDesc,
        pub tr: SegDesc,
    }

    #[derive(Clone, Default, Deserialize, Serialize)]
    pub struct VcpuMsrsV1(pub Vec<MsrEntry>);

    #[derive(Copy, Clone, Default, Deserialize, Serialize)]
    pub struct MsrEntry {
        pub ident: u32,
        pub value: u64,
    }

    #[derive(Clone, Default, Deserialize, Serialize)]
    pub struct FpuStateV1 {
        pub blob: Vec<u8>,
    }

    /// Everything needed to reconstruct one vCPU on a fresh host context.
    #[derive(Clone, Default, Deserialize, Serialize)]
    pub struct VcpuSnapshot {
        pub run_state: VcpuRunStateV1,
        pub gp_regs: VcpuGpRegsV1,
        pub ctrl_regs: VcpuCtrlRegsV1,
        pub dbg_regs: VcpuDbgRegsV1,
        pub seg_regs: VcpuSegRegsV1,
        pub msrs: VcpuMsrsV1,
        pub fpu: FpuStateV1,
    }

    impl From<HostSegment> for SegDesc {
        fn from(seg: HostSegment) -> Self {
            Self {
                base: seg.base,
                limit: seg.limit,
                access: seg.access_rights,
                selector: seg.selector,
            }
        }
    }
    impl From<SegDesc> for HostSegment {
        fn from(desc: SegDesc) -> Self {
            Self {
                base: desc.base,
                limit: desc.limit,
                access_rights: desc.access,
                selector: desc.selector,
            }
        }
    }

    impl VcpuReadWrite for VcpuGpRegsV1 {
        fn read(vcpu: &Vcpu) -> Result<Self> {
            let hdl = vcpu.hdl();
            Ok(Self {
                rax: hdl.read_reg(HV_X86_RAX)?,
                rcx: hdl.read_reg(HV_X86_RCX)?,
                rdx: hdl.read_reg(HV_X86_RDX)?,
                rbx: hdl.read_reg(HV_X86_RBX)?,
                rsp: hdl.read_reg(HV_X86_RSP)?,
                rbp: hdl.read_reg(HV_X86_RBP)?,
                rsi: hdl.read_reg(HV_X86_RSI)?,
                rdi: hdl.read_reg(HV_X86_RDI)?,
                r8: hdl.read_reg(HV_X86_R8)?,
                r9: hdl.read_reg(HV_X86_R9)?,
                r10: hdl.read_reg(HV_X86_R10)?,
                r11: hdl.read_reg(HV_X86_R11)?,
                r12: hdl.read_reg(HV_X86_R12)?,
                r13: hdl.read_reg(HV_X86_R13)?,
                r14: hdl.read_reg(HV_X86_R14)?,
                r15: hdl.read_reg(HV_X86_R15)?,
                rip: hdl.read_reg(HV_X86_RIP)?,
                rflags: hdl.read_reg(HV_X86_RFLAGS)?,
            })
        }

        fn write(self, vcpu: &Vcpu) -> Result<()> {
            let hdl = vcpu.hdl();
            hdl.write_reg(HV_X86_RAX, self.rax)?;
            hdl.write_reg(HV_X86_RCX, self.rcx)?;
            hdl.write_reg(HV_X86_RDX, self.rdx)?;
            hdl.write_reg(HV_X86_RBX, self.rbx)?;
            hdl.write_reg(HV_X86_RSP, self.rsp)?;
            hdl.write_reg(HV_X86_RBP, self.rbp)?;
            hdl.write_reg(HV_X86_RSI, self.rsi)?;
            hdl.write_reg(HV_X86_RDI, self.rdi)?;
            hdl.write_reg(HV_X86_R8, self.r8)?;
            hdl.write_reg(HV_X86_R9, self.r9)?;
            hdl.write_reg(HV_X86_R10, self.r10)?;
            hdl.write_reg(HV_X86_R11, self.r11)?;
            hdl.write_reg(HV_X86_R12, self.r12)?;
            hdl.write_reg(HV_X86_R13, self.r13)?;
            hdl.write_reg(HV_X86_R14, self.r14)?;
            hdl.write_reg(HV_X86_R15, self.r15)?;
            hdl.write_reg(HV_X86_RIP, self.rip)?;
            hdl.write_reg(HV_X86_RFLAGS, self.rflags)?;
            Ok(())
        }
    }

    impl VcpuReadWrite for VcpuCtrlRegsV1 {
        fn read(vcpu: &Vcpu) -> Result<Self> {
            let hdl = vcpu.hdl();
            Ok(Self {
                cr0: hdl.read_vmcs(VMCS_GUEST_CR0)?,
                cr2: hdl.read_reg(HV_X86_CR2)?,
                cr3: hdl.read_vmcs(VMCS_GUEST_CR3)?,
                cr4: hdl.read_vmcs(VMCS_GUEST_CR4)?,
                xcr0: hdl.read_reg(HV_X86_XCR0)?,
                efer: hdl.read_vmcs(VMCS_GUEST_IA32_EFER)?,
            })
        }

        fn write(self, vcpu: &Vcpu) -> Result<()> {
            let hdl = vcpu.hdl();
            hdl.write_vmcs(VMCS_GUEST_CR0, self.cr0)?;
            hdl.write_reg(HV_X86_CR2, self.cr2)?;
            hdl.write_vmcs(VMCS_GUEST_CR3, self.cr3)?;
            hdl.write_vmcs(VMCS_GUEST_CR4, self.cr4)?;
            hdl.write_reg(HV_X86_XCR0, self.xcr0)?;
            hdl.write_vmcs(VMCS_GUEST_IA32_EFER, self.efer)?;
            Ok(())
        }
    }

    impl VcpuReadWrite for VcpuDbgRegsV1 {
        fn read(vcpu: &Vcpu) -> Result<Self> {
            let hdl = vcpu.hdl();
            Ok(Self {
                dr0: hdl.read_reg(HV_X86_DR0)?,
                dr1: hdl.read_reg(HV_X86_DR1)?,
                dr2: hdl.read_reg(HV_X86_DR2)?,
                dr3: hdl.read_reg(HV_X86_DR3)?,
                dr6: hdl.read_reg(HV_X86_DR6)?,
                dr7: hdl.read_reg(HV_X86_DR7)?,
            })
        }

        fn write(self, vcpu: &Vcpu) -> Result<()> {
            let hdl = vcpu.hdl();
            hdl.write_reg(HV_X86_DR0, self.dr0)?;
            hdl.write_reg(HV_X86_DR1, self.dr1)?;
            hdl.write_reg(HV_X86_DR2, self.dr2)?;
            hdl.write_reg(HV_X86_DR3, self.dr3)?;
            hdl.write_reg(HV_X86_DR6, self.dr6)?;
            hdl.write_reg(HV_X86_DR7, self.dr7)?;
            Ok(())
        }
    }

    impl VcpuReadWrite for VcpuSegRegsV1 {
        fn read(vcpu: &Vcpu) -> Result<Self> {
            let hdl = vcpu.hdl();
            let read = |reg| -> Result<SegDesc> {
                Ok(segments::read_segment(hdl, reg)?.into())
            };
            Ok(Self {
                cs: read(SegReg::Cs)?,
                ds: read(SegReg::Ds)?,
                es: read(SegReg::Es)?,
                fs: read(SegReg::Fs)?,
                gs: read(SegReg::Gs)?,
                ss: read(SegReg::Ss)?,
                ldtr: read(SegReg::Ldtr)?,
                tr: read(SegReg::Tr)?,
                gdtr: SegDesc {
                    base: hdl.read_vmcs(VMCS_GUEST_GDTR_BASE)?,
                    limit: hdl.read_vmcs(VMCS_GUEST_GDTR_LIMIT)? as u32,
                    ..Default::default()
                },
                idtr: SegDesc {
                    base: hdl.read_vmcs(VMCS_GUEST_IDTR_BASE)?,
                    limit: hdl.read_vmcs(VMCS_GUEST_IDTR_LIMIT)? as u32,
                    ..Default::default()
                },
            })
        }

        fn write(self, vcpu: &Vcpu) -> Result<()> {
            let hdl = vcpu.hdl();
            segments::write_segment(hdl, SegReg::Cs, &self.cs.into())?;
            segments::write_segment(hdl, SegReg::Ds, &self.ds.into())?;
            segments::write_segment(hdl, SegReg::Es, &self.es.into())?;
            segments::write_segment(hdl, SegReg::Fs, &self.fs.into())?;
            segments::write_segment(hdl, SegReg::Gs, &self.gs.into())?;
            segments::write_segment(hdl, SegReg::Ss, &self.ss.into())?;
            segments::write_segment(hdl, SegReg::Ldtr, &self.ldtr.into())?;
            segments::write_segment(hdl, SegReg::Tr, &self.tr.into())?;
            hdl.write_vmcs(VMCS_GUEST_GDTR_BASE, self.gdtr.base)?;
            hdl.write_vmcs(VMCS_GUEST_GDTR_LIMIT, self.gdtr.limit as u64)?;
            hdl.write_vmcs(VMCS_GUEST_IDTR_BASE, self.idtr.base)?;
            hdl.write_vmcs(VMCS_GUEST_IDTR_LIMIT, self.idtr.limit as u64)?;
            Ok(())
        }
    }

    impl VcpuMsrsV1 {
        /// MSRs captured in the snapshot.  The long-mode set is included
        /// regardless of configuration on export and filtered on import.
        const IDENTS: [u32; 10] = [
            MSR_IA32_SYSENTER_CS,
            MSR_IA32_SYSENTER_ESP,
            MSR_IA32_SYSENTER_EIP,
            MSR_STAR,
            MSR_LSTAR,
            MSR_CSTAR,
            MSR_FMASK,
            MSR_KERNELGSBASE,
            MSR_FSBASE,
            MSR_GSBASE,
        ];

        const fn valid_msr(ident: u32) -> bool {
            // EFER is held in CtrlRegs
            !matches!(ident, MSR_EFER)
        }

        fn long_mode_only(ident: u32) -> bool {
            matches!(ident, MSR_LSTAR | MSR_CSTAR | MSR_FMASK | MSR_KERNELGSBASE)
        }

        pub(super) fn read(vcpu: &Vcpu) -> Result<Self> {
            let hdl = vcpu.hdl();
            let mut out = Vec::with_capacity(Self::IDENTS.len());
            for ident in Self::IDENTS {
                out.push(MsrEntry { ident, value: hdl.read_msr(ident)? });
            }
            Ok(Self(out))
        }

        pub(super) fn write(
            self,
            vcpu: &Vcpu,
            long_mode: bool,
        ) -> Result<()> {
            let hdl = vcpu.hdl();
            for ent in self.0 {
                if !Self::valid_msr(ent.ident) {
                    continue;
                }
                // Skipping (rather than failing on) registers the target
                // configuration does not carry keeps 32-bit imports working.
                if !long_mode && Self::long_mode_only(ent.ident) {
                    continue;
                }
                hdl.write_msr(ent.ident, ent.value)?;
            }
            Ok(())
        }
    }

    impl VcpuReadWrite for FpuStateV1 {
        fn read(vcpu: &Vcpu) -> Result<Self> {
            let mut buf = Box::new([0u8; XSAVE_AREA_LEN]);
            vcpu.hdl().read_fpstate(&mut buf)?;
            Ok(Self { blob: buf.to_vec() })
        }

        fn write(self, vcpu: &Vcpu) -> Result<()> {
            let buf: Box<[u8; XSAVE_AREA_LEN]> = self
                .blob
                .into_boxed_slice()
                .try_into()
                .map_err(|b: Box<[u8]>| SnapshotError::FpuSize(b.len()))?;
            vcpu.hdl().write_fpstate(&buf)?;
            Ok(())
        }
    }

    impl Vcpu {
        /// Captures the vCPU as versioned payloads.  The host context is
        /// assumed current (i.e. after `post_exit`).
        pub fn export(
            &self,
            cpu: &GuestCpuState,
        ) -> Result<VcpuSnapshot> {
            Ok(VcpuSnapshot {
                run_state: VcpuRunStateV1 {
                    halted: cpu.halted,
                    intr_req: self.irqs.pending().bits(),
                },
                gp_regs: VcpuGpRegsV1::read(self)?,
                ctrl_regs: VcpuCtrlRegsV1::read(self)?,
                dbg_regs: VcpuDbgRegsV1::read(self)?,
                seg_regs: VcpuSegRegsV1::read(self)?,
                msrs: VcpuMsrsV1::read(self)?,
                fpu: FpuStateV1::read(self)?,
            })
        }

        /// Restores a snapshot into the host context and the model-side
        /// run state.  The model itself is left for `synchronize_state` to
        /// refill from the restored context.
        pub fn import(
            &self,
            snapshot: VcpuSnapshot,
            cpu: &mut GuestCpuState,
        ) -> Result<()> {
            snapshot.gp_regs.write(self)?;
            snapshot.ctrl_regs.write(self)?;
            snapshot.dbg_regs.write(self)?;
            snapshot.seg_regs.write(self)?;
            snapshot.msrs.write(self, cpu.long_mode)?;
            snapshot.fpu.write(self)?;

            cpu.halted = snapshot.run_state.halted;
            self.irqs.load(IntrReq::from_bits_retain(
                snapshot.run_state.intr_req,
            ));
            cpu.dirty = false;
            Ok(())
        }
    }
}
