// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt/event injection ahead of each entry into guest context.

use std::io::Result;

use bitstruct::bitstruct;
use strum::FromRepr;

use hvf_api::*;

use crate::cpu::bits::{EXC_BP, EXC_NMI, EXC_OF};
use crate::cpu::{GuestCpuState, IntrReq, IntrRequests};
use crate::events::VcpuPlatform;
use crate::vmm::VcpuHdl;

/// Delivery mechanism of an event, as encoded in the event-information
/// word's type field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum IntrKind {
    HwIntr = 0,
    Nmi = 2,
    HwException = 3,
    SwIntr = 4,
    PrivSwException = 5,
    SwException = 6,
}

bitstruct! {
    /// Packed event-information word, shared between the vectoring-info
    /// (exit side) and entry-injection (entry side) fields.  The layout is
    /// fixed by the virtualization architecture.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventInfo(pub u32) {
        pub vector: u8 = 0..8;
        raw_kind: u8 = 8..11;
        pub deliver_errcode: bool = 11;
        /// Undefined in the entry-injection encoding; must be cleared
        /// before an exit-side word is written back for reinjection.
        pub undefined: bool = 12;
        reserved: u32 = 13..31;
        pub valid: bool = 31;
    }
}

impl EventInfo {
    /// Decodes the type field.  Reserved encodings cannot be produced by
    /// the hardware and indicate corrupted state.
    pub fn kind(&self) -> IntrKind {
        IntrKind::from_repr(self.raw_kind())
            .expect("event-info type field holds a reserved encoding")
    }

    pub fn set_kind(&mut self, kind: IntrKind) {
        self.set_raw_kind(kind as u8);
    }

    pub fn with_kind(self, kind: IntrKind) -> Self {
        self.with_raw_kind(kind as u8)
    }

    fn is_software(&self) -> bool {
        matches!(
            self.kind(),
            IntrKind::SwIntr | IntrKind::PrivSwException | IntrKind::SwException
        )
    }
}

bitstruct! {
    /// Guest interruptibility state.  Read fresh from the host each cycle,
    /// never cached.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Interruptibility(pub u32) {
        pub sti_blocking: bool = 0;
        pub movss_blocking: bool = 1;
        pub smi_blocking: bool = 2;
        pub nmi_blocking: bool = 3;
        reserved: u32 = 4..32;
    }
}

impl Interruptibility {
    /// Whether the guest can accept a maskable interrupt right now
    /// (instruction-boundary blocking aside from RFLAGS.IF).
    pub fn window_open(&self) -> bool {
        !self.sti_blocking() && !self.movss_blocking()
    }
}

/// An event deliverable to the guest CPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InjectableEvent {
    HardwareInterrupt { vector: u8 },
    NonMaskableInterrupt,
    Exception { vector: u8, error_code: Option<u32> },
    SoftwareInterrupt { vector: u8, inst_len: u8 },
    SoftwareException { vector: u8, inst_len: u8 },
    Init,
    StartupIpi { vector: u8 },
}

impl InjectableEvent {
    /// Entry-injection encoding for this event.  INIT and SIPI are carried
    /// through the request bits and handled by the event processor; they
    /// have no entry encoding.
    pub fn entry_info(&self) -> Option<EventInfo> {
        let base = EventInfo(0).with_valid(true);
        match self {
            Self::HardwareInterrupt { vector } => {
                Some(base.with_kind(IntrKind::HwIntr).with_vector(*vector))
            }
            Self::NonMaskableInterrupt => {
                Some(base.with_kind(IntrKind::Nmi).with_vector(EXC_NMI))
            }
            Self::Exception { vector, error_code } => Some(
                base.with_kind(IntrKind::HwException)
                    .with_vector(*vector)
                    .with_deliver_errcode(error_code.is_some()),
            ),
            Self::SoftwareInterrupt { vector, .. } => {
                Some(base.with_kind(IntrKind::SwIntr).with_vector(*vector))
            }
            Self::SoftwareException { vector, .. } => {
                Some(base.with_kind(IntrKind::SwException).with_vector(*vector))
            }
            Self::Init | Self::StartupIpi { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<u32> {
        match self {
            Self::Exception { error_code, .. } => *error_code,
            _ => None,
        }
    }

    /// Instruction length for software-originated events that re-execute
    /// with instruction-pointer advancement.
    pub fn inst_len(&self) -> Option<u8> {
        match self {
            Self::SoftwareInterrupt { inst_len, .. }
            | Self::SoftwareException { inst_len, .. } => Some(*inst_len),
            _ => None,
        }
    }
}

/// Writes one event into the entry-injection fields.
pub fn inject_event(
    hdl: &dyn VcpuHdl,
    event: &InjectableEvent,
) -> Result<EventInfo> {
    let info =
        event.entry_info().expect("event has an entry-injection encoding");
    if let Some(err) = event.error_code() {
        hdl.write_vmcs(VMCS_ENTRY_EXCEPTION_ERROR, err as u64)?;
    }
    if let Some(len) = event.inst_len() {
        hdl.write_vmcs(VMCS_ENTRY_INST_LENGTH, len as u64)?;
    }
    hdl.write_vmcs(VMCS_ENTRY_INTR_INFO, info.0 as u64)?;
    Ok(info)
}

pub fn set_intr_window_exiting(hdl: &dyn VcpuHdl) -> Result<()> {
    let ctls = hdl.read_vmcs(VMCS_PRI_PROC_BASED_CTLS)?;
    hdl.write_vmcs(VMCS_PRI_PROC_BASED_CTLS, ctls | PROC_CTLS_INT_WINDOW_EXITING)
}

pub fn clear_intr_window_exiting(hdl: &dyn VcpuHdl) -> Result<()> {
    let ctls = hdl.read_vmcs(VMCS_PRI_PROC_BASED_CTLS)?;
    hdl.write_vmcs(
        VMCS_PRI_PROC_BASED_CTLS,
        ctls & !PROC_CTLS_INT_WINDOW_EXITING,
    )
}

pub fn set_nmi_window_exiting(hdl: &dyn VcpuHdl) -> Result<()> {
    let ctls = hdl.read_vmcs(VMCS_PRI_PROC_BASED_CTLS)?;
    hdl.write_vmcs(VMCS_PRI_PROC_BASED_CTLS, ctls | PROC_CTLS_NMI_WINDOW_EXITING)
}

pub fn clear_nmi_window_exiting(hdl: &dyn VcpuHdl) -> Result<()> {
    let ctls = hdl.read_vmcs(VMCS_PRI_PROC_BASED_CTLS)?;
    hdl.write_vmcs(
        VMCS_PRI_PROC_BASED_CTLS,
        ctls & !PROC_CTLS_NMI_WINDOW_EXITING,
    )
}

fn clear_nmi_blocking(hdl: &dyn VcpuHdl) -> Result<()> {
    let state = hdl.read_vmcs(VMCS_GUEST_INTERRUPTIBILITY)?;
    hdl.write_vmcs(
        VMCS_GUEST_INTERRUPTIBILITY,
        state & !(IRQSTATE_NMI_BLOCKING as u64),
    )
}

/// Decides what to inject before the next entry into guest context.
///
/// Architectural priority order: reinjection of an event whose delivery was
/// interrupted by the exit, then a pending NMI, then a pending maskable
/// hardware interrupt.  At most one event is injected per cycle;
/// window-exit requests for whatever could not be injected are armed
/// alongside.
pub fn inject_pending(
    hdl: &dyn VcpuHdl,
    cpu: &GuestCpuState,
    irqs: &IntrRequests,
    platform: &dyn VcpuPlatform,
) -> Result<()> {
    let irq_state =
        Interruptibility(hdl.read_vmcs(VMCS_GUEST_INTERRUPTIBILITY)? as u32);
    let mut allow_nmi = !irq_state.nmi_blocking();

    let vectoring = EventInfo(hdl.read_vmcs(VMCS_IDT_VECTORING_INFO)? as u32);
    let mut queued = EventInfo(0);

    if vectoring.valid() {
        queued = vectoring;
        let kind = vectoring.kind();

        if kind == IntrKind::Nmi {
            // Delivery of an NMI was cut short by this exit, so the blocking
            // window it opened must be torn down for the retry -- unless the
            // exit was a task switch, which disposes of NMI blocking on its
            // own terms.
            let reason = hdl.read_vmcs(VMCS_EXIT_REASON)? as u32;
            if ExitReason::from_repr(reason) != Some(ExitReason::TaskSwitch) {
                allow_nmi = true;
                clear_nmi_blocking(hdl)?;
            }
        }

        if allow_nmi || kind != IntrKind::Nmi {
            queued.set_undefined(false);
            if vectoring.is_software() {
                let len = hdl.read_vmcs(VMCS_EXIT_INSTRUCTION_LENGTH)?;
                hdl.write_vmcs(VMCS_ENTRY_INST_LENGTH, len)?;
            }
            if vectoring.vector() == EXC_BP || vectoring.vector() == EXC_OF {
                // The architecture requires #BP and #OF to be injected as
                // software exceptions, with the faulting instruction's
                // length accounted for.
                queued.set_kind(IntrKind::SwException);
                let len = hdl.read_vmcs(VMCS_EXIT_INSTRUCTION_LENGTH)?;
                hdl.write_vmcs(VMCS_ENTRY_INST_LENGTH, len)?;
            }
            if vectoring.deliver_errcode() {
                let err = hdl.read_vmcs(VMCS_IDT_VECTORING_ERROR)?;
                hdl.write_vmcs(VMCS_ENTRY_EXCEPTION_ERROR, err)?;
            }
            hdl.write_vmcs(VMCS_ENTRY_INTR_INFO, queued.0 as u64)?;
        }
    }

    if irqs.is_pending(IntrReq::NMI) {
        if allow_nmi && !queued.valid() {
            irqs.deassert(IntrReq::NMI);
            queued =
                inject_event(hdl, &InjectableEvent::NonMaskableInterrupt)?;
        } else {
            // Blocked or displaced by a higher-priority event; exit as soon
            // as delivery becomes legal.
            set_nmi_window_exiting(hdl)?;
        }
    }

    if irqs.is_pending(IntrReq::HARD) && cpu.intr_enabled() {
        if irq_state.window_open() && !queued.valid() {
            if let Some(vector) = platform.pending_vector() {
                irqs.deassert(IntrReq::HARD);
                inject_event(
                    hdl,
                    &InjectableEvent::HardwareInterrupt { vector },
                )?;
            }
        }
        if irqs.is_pending(IntrReq::HARD) {
            set_intr_window_exiting(hdl)?;
        }
    }

    Ok(())
}
