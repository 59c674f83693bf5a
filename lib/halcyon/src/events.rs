// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processing of pending vCPU requests (INIT/SIPI/NMI/interrupt/TPR/poll)
//! ahead of injection consideration.

use std::io::Result;

use hvf_api::hv_x86_reg;

use crate::cpu::{GuestCpuState, IntrReq, TprAccess};
use crate::vcpu::Vcpu;

/// Callbacks into the CPU emulation core and interrupt-controller model.
///
/// The event processor and injector drive these; their implementations live
/// with the surrounding machine, not in this crate.
pub trait VcpuPlatform: Send + Sync {
    /// Resets the CPU model in response to INIT.
    fn cpu_reset(&self, cpu: &mut GuestCpuState);

    /// Starts an application processor in response to SIPI.
    fn cpu_startup(&self, cpu: &mut GuestCpuState);

    /// Reports a completed task-priority-register access to the
    /// interrupt-controller model.
    fn tpr_access_report(&self, rip: u64, access: TprAccess);

    /// Hands over the highest-priority pending interrupt vector,
    /// acknowledging it at the controller.
    fn pending_vector(&self) -> Option<u8>;

    /// Whether a maskable interrupt is pending, without acknowledging it.
    fn poll_pending(&self) -> bool;
}

/// Runs the per-cycle request checks, returning the (possibly updated)
/// halted flag for the run loop.
///
/// Each check acts only when its request bit is set, and clears the bit
/// itself; injection is left entirely to the injector on the subsequent
/// entry path.
pub(crate) fn process(vcpu: &Vcpu, cpu: &mut GuestCpuState) -> Result<bool> {
    let hdl = vcpu.hdl();
    let irqs = &vcpu.irqs;
    let platform = vcpu.platform();

    // The IF test below needs current flags; skip the readback when the
    // model is already authoritative.
    if !cpu.dirty {
        cpu.rflags = hdl.read_reg(hv_x86_reg::HV_X86_RFLAGS)?;
    }

    if irqs.is_pending(IntrReq::INIT) {
        irqs.deassert(IntrReq::INIT);
        vcpu.synchronize_state(cpu)?;
        slog::info!(vcpu.log(), "INIT signal; resetting vCPU");
        platform.cpu_reset(cpu);
    }

    if irqs.is_pending(IntrReq::POLL) {
        irqs.deassert(IntrReq::POLL);
        if platform.poll_pending() {
            irqs.assert(IntrReq::HARD);
        }
    }

    if (irqs.is_pending(IntrReq::HARD) && cpu.intr_enabled())
        || irqs.is_pending(IntrReq::NMI)
    {
        cpu.halted = false;
    }

    if irqs.is_pending(IntrReq::SIPI) {
        irqs.deassert(IntrReq::SIPI);
        vcpu.synchronize_state(cpu)?;
        slog::info!(vcpu.log(), "SIPI signal; starting vCPU");
        platform.cpu_startup(cpu);
    }

    if irqs.is_pending(IntrReq::TPR) {
        irqs.deassert(IntrReq::TPR);
        vcpu.synchronize_state(cpu)?;
        platform.tpr_access_report(cpu.rip, cpu.tpr_access);
    }

    Ok(cpu.halted)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cpu::bits::RFLAGS_IF;
    use crate::vmm::testhdl::{TestHdl, TestPlatform};

    fn test_vcpu(hdl: Arc<TestHdl>, platform: Arc<TestPlatform>) -> Arc<Vcpu> {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        Vcpu::new(hdl, 0, platform, &log)
    }

    #[test]
    fn poll_clears_bit_and_requeries_controller() {
        let hdl = Arc::new(TestHdl::new());
        let platform = Arc::new(TestPlatform::new());
        platform.set_poll_pending(true);
        let vcpu = test_vcpu(hdl, Arc::clone(&platform));
        let mut cpu = GuestCpuState::new(true);

        vcpu.irqs.assert(IntrReq::POLL);
        let halted = process(&vcpu, &mut cpu).unwrap();

        assert!(!vcpu.irqs.is_pending(IntrReq::POLL));
        assert!(vcpu.irqs.is_pending(IntrReq::HARD));
        // POLL handling queries, but never hands out (injects) a vector
        assert_eq!(platform.vector_queries(), 0);
        assert!(!halted);
    }

    #[test]
    fn poll_without_pending_interrupt_leaves_hard_clear() {
        let hdl = Arc::new(TestHdl::new());
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(hdl, platform);
        let mut cpu = GuestCpuState::new(true);

        vcpu.irqs.assert(IntrReq::POLL);
        process(&vcpu, &mut cpu).unwrap();
        assert!(!vcpu.irqs.is_pending(IntrReq::HARD));
    }

    #[test]
    fn halted_cleared_by_pending_nmi() {
        let hdl = Arc::new(TestHdl::new());
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(hdl, platform);
        let mut cpu = GuestCpuState::new(true);
        cpu.halted = true;

        vcpu.request_nmi();
        assert!(!process(&vcpu, &mut cpu).unwrap());
    }

    #[test]
    fn halted_persists_when_interrupts_masked() {
        let hdl = Arc::new(TestHdl::new());
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(hdl, platform);
        let mut cpu = GuestCpuState::new(true);
        cpu.halted = true;
        cpu.rflags = 0x2; // IF clear

        vcpu.irqs.assert(IntrReq::HARD);
        assert!(process(&vcpu, &mut cpu).unwrap());
    }

    #[test]
    fn flags_are_refreshed_from_host() {
        let hdl = Arc::new(TestHdl::new());
        hdl.seed_reg(hv_x86_reg::HV_X86_RFLAGS, 0x2 | RFLAGS_IF);
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(Arc::clone(&hdl), platform);
        let mut cpu = GuestCpuState::new(true);
        cpu.halted = true;
        cpu.rflags = 0x2; // stale: IF clear in the model
        cpu.dirty = false;

        vcpu.irqs.assert(IntrReq::HARD);
        assert!(!process(&vcpu, &mut cpu).unwrap());
    }

    #[test]
    fn init_synchronizes_then_resets() {
        let hdl = Arc::new(TestHdl::new());
        hdl.seed_reg(hv_x86_reg::HV_X86_RAX, 0x1111);
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(Arc::clone(&hdl), Arc::clone(&platform));
        let mut cpu = GuestCpuState::new(true);
        cpu.dirty = false;

        vcpu.irqs.assert(IntrReq::INIT);
        process(&vcpu, &mut cpu).unwrap();

        assert_eq!(platform.resets(), 1);
        assert!(!vcpu.irqs.is_pending(IntrReq::INIT));
        // The model was pulled from the host before the reset callback ran
        assert_eq!(platform.rax_at_reset(), 0x1111);
    }

    #[test]
    fn sipi_synchronizes_then_starts() {
        let hdl = Arc::new(TestHdl::new());
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(hdl, Arc::clone(&platform));
        let mut cpu = GuestCpuState::new(true);

        vcpu.irqs.assert(IntrReq::SIPI);
        process(&vcpu, &mut cpu).unwrap();
        assert_eq!(platform.startups(), 1);
        assert!(!vcpu.irqs.is_pending(IntrReq::SIPI));
    }

    #[test]
    fn tpr_access_reported_with_rip() {
        let hdl = Arc::new(TestHdl::new());
        hdl.seed_reg(hv_x86_reg::HV_X86_RIP, 0xfff0_1234);
        let platform = Arc::new(TestPlatform::new());
        let vcpu = test_vcpu(Arc::clone(&hdl), Arc::clone(&platform));
        let mut cpu = GuestCpuState::new(true);
        cpu.tpr_access = TprAccess::Write;
        cpu.dirty = false;

        vcpu.irqs.assert(IntrReq::TPR);
        process(&vcpu, &mut cpu).unwrap();

        assert_eq!(platform.tpr_reports(), vec![(0xfff0_1234, TprAccess::Write)]);
        assert!(!vcpu.irqs.is_pending(IntrReq::TPR));
    }
}
