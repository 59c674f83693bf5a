// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-structure field identifiers and bit encodings.
//!
//! Field encodings follow the virtualization architecture's numbering scheme
//! (width and guest/host/control class are baked into the identifier).

use strum::FromRepr;

// 16-bit guest-state fields: segment selectors
pub const VMCS_GUEST_ES_SELECTOR: u32 = 0x0800;
pub const VMCS_GUEST_CS_SELECTOR: u32 = 0x0802;
pub const VMCS_GUEST_SS_SELECTOR: u32 = 0x0804;
pub const VMCS_GUEST_DS_SELECTOR: u32 = 0x0806;
pub const VMCS_GUEST_FS_SELECTOR: u32 = 0x0808;
pub const VMCS_GUEST_GS_SELECTOR: u32 = 0x080a;
pub const VMCS_GUEST_LDTR_SELECTOR: u32 = 0x080c;
pub const VMCS_GUEST_TR_SELECTOR: u32 = 0x080e;

// 64-bit control fields
pub const VMCS_TSC_OFFSET: u32 = 0x2010;

// 64-bit guest-state fields
pub const VMCS_GUEST_IA32_EFER: u32 = 0x2806;

// 32-bit control fields
pub const VMCS_PRI_PROC_BASED_CTLS: u32 = 0x4002;
pub const VMCS_ENTRY_CTLS: u32 = 0x4012;
pub const VMCS_ENTRY_INTR_INFO: u32 = 0x4016;
pub const VMCS_ENTRY_EXCEPTION_ERROR: u32 = 0x4018;
pub const VMCS_ENTRY_INST_LENGTH: u32 = 0x401a;

// 32-bit read-only data fields
pub const VMCS_INSTRUCTION_ERROR: u32 = 0x4400;
pub const VMCS_EXIT_REASON: u32 = 0x4402;
pub const VMCS_EXIT_INTERRUPTION_INFO: u32 = 0x4404;
pub const VMCS_EXIT_INTERRUPTION_ERROR: u32 = 0x4406;
pub const VMCS_IDT_VECTORING_INFO: u32 = 0x4408;
pub const VMCS_IDT_VECTORING_ERROR: u32 = 0x440a;
pub const VMCS_EXIT_INSTRUCTION_LENGTH: u32 = 0x440c;

// 32-bit guest-state fields
pub const VMCS_GUEST_ES_LIMIT: u32 = 0x4800;
pub const VMCS_GUEST_CS_LIMIT: u32 = 0x4802;
pub const VMCS_GUEST_SS_LIMIT: u32 = 0x4804;
pub const VMCS_GUEST_DS_LIMIT: u32 = 0x4806;
pub const VMCS_GUEST_FS_LIMIT: u32 = 0x4808;
pub const VMCS_GUEST_GS_LIMIT: u32 = 0x480a;
pub const VMCS_GUEST_LDTR_LIMIT: u32 = 0x480c;
pub const VMCS_GUEST_TR_LIMIT: u32 = 0x480e;
pub const VMCS_GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const VMCS_GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const VMCS_GUEST_ES_AR: u32 = 0x4814;
pub const VMCS_GUEST_CS_AR: u32 = 0x4816;
pub const VMCS_GUEST_SS_AR: u32 = 0x4818;
pub const VMCS_GUEST_DS_AR: u32 = 0x481a;
pub const VMCS_GUEST_FS_AR: u32 = 0x481c;
pub const VMCS_GUEST_GS_AR: u32 = 0x481e;
pub const VMCS_GUEST_LDTR_AR: u32 = 0x4820;
pub const VMCS_GUEST_TR_AR: u32 = 0x4822;
pub const VMCS_GUEST_INTERRUPTIBILITY: u32 = 0x4824;

// natural-width guest-state fields
pub const VMCS_GUEST_CR0: u32 = 0x6800;
pub const VMCS_GUEST_CR3: u32 = 0x6802;
pub const VMCS_GUEST_CR4: u32 = 0x6804;
pub const VMCS_GUEST_ES_BASE: u32 = 0x6806;
pub const VMCS_GUEST_CS_BASE: u32 = 0x6808;
pub const VMCS_GUEST_SS_BASE: u32 = 0x680a;
pub const VMCS_GUEST_DS_BASE: u32 = 0x680c;
pub const VMCS_GUEST_FS_BASE: u32 = 0x680e;
pub const VMCS_GUEST_GS_BASE: u32 = 0x6810;
pub const VMCS_GUEST_LDTR_BASE: u32 = 0x6812;
pub const VMCS_GUEST_TR_BASE: u32 = 0x6814;
pub const VMCS_GUEST_GDTR_BASE: u32 = 0x6816;
pub const VMCS_GUEST_IDTR_BASE: u32 = 0x6818;

// Primary processor-based execution control bits
pub const PROC_CTLS_INT_WINDOW_EXITING: u64 = 1 << 2;
pub const PROC_CTLS_NMI_WINDOW_EXITING: u64 = 1 << 22;

// Guest interruptibility-state bits
pub const IRQSTATE_STI_BLOCKING: u32 = 1 << 0;
pub const IRQSTATE_MOVSS_BLOCKING: u32 = 1 << 1;
pub const IRQSTATE_SMI_BLOCKING: u32 = 1 << 2;
pub const IRQSTATE_NMI_BLOCKING: u32 = 1 << 3;

/// Exit-reason codes reported in [`VMCS_EXIT_REASON`].  Only the reasons this
/// VMM distinguishes are enumerated; everything else is handled generically.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Hlt = 12,
    Rdtsc = 16,
    Vmcall = 18,
    CrAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    EptViolation = 48,
    Xsetbv = 55,
}
