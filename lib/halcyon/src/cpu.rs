// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software model of one guest CPU.

use std::sync::atomic::{AtomicU32, Ordering};

pub mod bits {
    // RFLAGS
    pub const RFLAGS_IF: u64 = 1 << 9;

    // CR0
    pub const CR0_PE: u64 = 1 << 0;

    // Flag layout of the segment descriptor cache, matching the in-memory
    // descriptor format (second dword of a segment descriptor).
    pub const DESC_TYPE_SHIFT: u32 = 8;
    pub const DESC_S_SHIFT: u32 = 12;
    pub const DESC_DPL_SHIFT: u32 = 13;
    pub const DESC_P_SHIFT: u32 = 15;
    pub const DESC_AVL_SHIFT: u32 = 20;
    pub const DESC_L_SHIFT: u32 = 21;
    pub const DESC_B_SHIFT: u32 = 22;
    pub const DESC_G_SHIFT: u32 = 23;

    // Exception vectors the injector treats specially
    pub const EXC_NMI: u8 = 2;
    pub const EXC_BP: u8 = 3;
    pub const EXC_OF: u8 = 4;
}

/// One segment register as cached by the CPU: a selector plus the hidden
/// base/limit/flags loaded from its descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub flags: u32,
}

/// A descriptor-table register (GDTR/IDTR): base and limit only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DtableReg {
    pub base: u64,
    pub limit: u32,
}

/// Kind of guest access to the task-priority register, recorded by the exit
/// handler for the event processor to report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TprAccess {
    #[default]
    Read,
    Write,
}

/// FPU/SIMD state, kept unpacked in the model and exchanged with the host
/// through the fixed-layout extended-state buffer (see [`crate::xsave`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    /// Top-of-stack, kept separately from the status word and folded into
    /// (out of) its TOP field by the codec.
    pub top: u8,
    /// Per-register "empty" flags.  The abridged tag bit in the extended
    /// state buffer is the negation of these.
    pub ftw_empty: [bool; 8],
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 16],
    pub ymm_hi: [[u8; 16]; 16],
    pub zmm_hi: [[u8; 32]; 16],
    pub zmm_hi16: [[u8; 64]; 16],
    pub opmask: [u64; 8],
    pub bnd: [[u8; 16]; 4],
    pub bndcsr: [u8; 16],
    /// State-component bitmap recorded in the buffer header.
    pub xstate_bv: u64,
}
impl Default for FpuState {
    fn default() -> Self {
        Self {
            // Architectural post-reset values
            fcw: 0x037f,
            fsw: 0,
            top: 0,
            ftw_empty: [true; 8],
            fop: 0,
            fip: 0,
            fdp: 0,
            mxcsr: 0x1f80,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            ymm_hi: [[0; 16]; 16],
            zmm_hi: [[0; 32]; 16],
            zmm_hi16: [[0; 64]; 16],
            opmask: [0; 8],
            bnd: [[0; 16]; 4],
            bndcsr: [0; 16],
            xstate_bv: 0,
        }
    }
}

/// The software model of one guest CPU.
///
/// Owned by the vCPU's run loop and mutated only on that thread, at the two
/// transition points around guest execution ("put" before entry, "get" after
/// exit) and by the event processor.
#[derive(Clone, Debug, Default)]
pub struct GuestCpuState {
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

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub xcr0: u64,
    pub efer: u64,

    pub dr: [u64; 8],

    pub cs: SegmentCache,
    pub ds: SegmentCache,
    pub es: SegmentCache,
    pub fs: SegmentCache,
    pub gs: SegmentCache,
    pub ss: SegmentCache,
    pub tr: SegmentCache,
    pub ldtr: SegmentCache,
    pub gdt: DtableReg,
    pub idt: DtableReg,

    pub fpu: FpuState,

    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub tsc: u64,

    /// Parked in HLT (or waiting for SIPI); maintained by the event
    /// processor and consumed by the run loop.
    pub halted: bool,
    /// Kind of the most recent TPR access, recorded by the exit handler.
    pub tpr_access: TprAccess,
    /// Whether this vCPU is configured with 64-bit mode support.  Gates the
    /// long-mode-only MSRs during synchronization.
    pub long_mode: bool,
    /// The model holds state more recent than the hypervisor's.  Set by
    /// "get", cleared by "put"; lets `synchronize_state` skip redundant
    /// readbacks.
    pub dirty: bool,
}

impl GuestCpuState {
    pub fn new(long_mode: bool) -> Self {
        Self { long_mode, dirty: true, ..Default::default() }
    }

    /// Protected mode not yet enabled.
    pub fn is_real_mode(&self) -> bool {
        self.cr0 & bits::CR0_PE == 0
    }

    pub fn intr_enabled(&self) -> bool {
        self.rflags & bits::RFLAGS_IF != 0
    }
}

bitflags! {
    /// Pending interrupt/reset requests for one vCPU.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IntrReq: u32 {
        /// Maskable hardware interrupt pending at the interrupt controller
        const HARD = 1 << 0;
        const NMI = 1 << 1;
        const INIT = 1 << 2;
        const SIPI = 1 << 3;
        /// Guest accessed the task-priority register
        const TPR = 1 << 4;
        /// Re-query the interrupt controller for pending interrupts
        const POLL = 1 << 5;
    }
}

/// The interrupt-request bit set of one vCPU.
///
/// Bits may be asserted from any thread (idempotently); they are cleared
/// only by the event processor and injector on the vCPU's own thread.
#[derive(Default)]
pub struct IntrRequests(AtomicU32);

impl IntrRequests {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn assert(&self, req: IntrReq) {
        self.0.fetch_or(req.bits(), Ordering::AcqRel);
    }

    pub fn deassert(&self, req: IntrReq) {
        self.0.fetch_and(!req.bits(), Ordering::AcqRel);
    }

    pub fn pending(&self) -> IntrReq {
        IntrReq::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn is_pending(&self, req: IntrReq) -> bool {
        self.pending().intersects(req)
    }

    /// Overwrites the whole set.  Restore-path only; live requests are
    /// asserted/deasserted bit-wise.
    pub fn load(&self, reqs: IntrReq) {
        self.0.store(reqs.bits(), Ordering::Release);
    }
}
