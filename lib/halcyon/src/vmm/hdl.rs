// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handle to one host virtual-CPU context.

use std::io::Result;

use hvf_api::{hv_x86_reg, XSAVE_AREA_LEN};

/// The host API surface consumed for one virtual CPU.
///
/// One handle exists per vCPU for the VM's lifetime.  Calls against a handle
/// are not reentrant and must only be issued from the thread that owns the
/// vCPU; the `Sync` bound exists so the owning [`crate::Vcpu`] can be shared
/// for request-bit signalling, not to permit concurrent host calls.
///
/// Control-structure writes may be batched by the host; [`VcpuHdl::flush`]
/// commits them and must be called before resuming the guest.
pub trait VcpuHdl: Send + Sync {
    /// Reads an architectural register by identifier.
    fn read_reg(&self, reg: hv_x86_reg) -> Result<u64>;
    /// Writes an architectural register by identifier.
    fn write_reg(&self, reg: hv_x86_reg, val: u64) -> Result<()>;

    /// Reads a control-structure field by identifier.
    fn read_vmcs(&self, field: u32) -> Result<u64>;
    /// Writes a control-structure field by identifier.
    fn write_vmcs(&self, field: u32, val: u64) -> Result<()>;

    /// Commits batched register/field writes to the hardware context.
    fn flush(&self) -> Result<()>;

    /// Reads the extended-state buffer as one opaque blob.
    fn read_fpstate(&self, buf: &mut [u8; XSAVE_AREA_LEN]) -> Result<()>;
    /// Writes the extended-state buffer as one opaque blob.
    fn write_fpstate(&self, buf: &[u8; XSAVE_AREA_LEN]) -> Result<()>;

    /// Reads a model-specific register by index.
    fn read_msr(&self, msr: u32) -> Result<u64>;
    /// Writes a model-specific register by index.
    fn write_msr(&self, msr: u32, value: u64) -> Result<()>;

    /// Current value of the host's physical cycle counter.
    fn host_tsc(&self) -> u64;
    /// Reconciles the guest-visible time-stamp counter with the host.
    fn sync_tsc(&self, guest_tsc: u64) -> Result<()>;
}
