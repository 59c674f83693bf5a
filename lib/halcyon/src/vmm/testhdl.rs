// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-in for the host API, used to exercise the sync and
//! injection logic without a real hypervisor.

use std::collections::{HashMap, VecDeque};
use std::io::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use hvf_api::{hv_x86_reg, XSAVE_AREA_LEN};

use super::hdl::VcpuHdl;
use crate::cpu::{GuestCpuState, TprAccess};
use crate::events::VcpuPlatform;

#[derive(Default)]
pub struct TestHdl {
    regs: Mutex<HashMap<u32, u64>>,
    vmcs: Mutex<HashMap<u32, u64>>,
    msrs: Mutex<HashMap<u32, u64>>,
    fpstate: Mutex<Vec<u8>>,
    pub flushes: AtomicUsize,
    pub tsc: AtomicU64,
    pub synced_tsc: AtomicU64,
}

impl TestHdl {
    pub fn new() -> Self {
        Self { fpstate: Mutex::new(vec![0u8; XSAVE_AREA_LEN]), ..Default::default() }
    }

    /// Seeds a control-structure field for a test scenario.
    pub fn seed_vmcs(&self, field: u32, val: u64) {
        self.vmcs.lock().unwrap().insert(field, val);
    }

    /// Field value as last written (0 when never touched, like a
    /// freshly-cleared control structure).
    pub fn vmcs_value(&self, field: u32) -> u64 {
        self.vmcs.lock().unwrap().get(&field).copied().unwrap_or(0)
    }

    pub fn vmcs_written(&self, field: u32) -> bool {
        self.vmcs.lock().unwrap().contains_key(&field)
    }

    pub fn reg_value(&self, reg: hv_x86_reg) -> u64 {
        self.regs.lock().unwrap().get(&(reg as u32)).copied().unwrap_or(0)
    }

    pub fn seed_reg(&self, reg: hv_x86_reg, val: u64) {
        self.regs.lock().unwrap().insert(reg as u32, val);
    }

    pub fn msr_value(&self, msr: u32) -> u64 {
        self.msrs.lock().unwrap().get(&msr).copied().unwrap_or(0)
    }

    pub fn seed_msr(&self, msr: u32, val: u64) {
        self.msrs.lock().unwrap().insert(msr, val);
    }
}

impl VcpuHdl for TestHdl {
    fn read_reg(&self, reg: hv_x86_reg) -> Result<u64> {
        Ok(self.reg_value(reg))
    }
    fn write_reg(&self, reg: hv_x86_reg, val: u64) -> Result<()> {
        self.regs.lock().unwrap().insert(reg as u32, val);
        Ok(())
    }
    fn read_vmcs(&self, field: u32) -> Result<u64> {
        Ok(self.vmcs_value(field))
    }
    fn write_vmcs(&self, field: u32, val: u64) -> Result<()> {
        self.vmcs.lock().unwrap().insert(field, val);
        Ok(())
    }
    fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn read_fpstate(&self, buf: &mut [u8; XSAVE_AREA_LEN]) -> Result<()> {
        buf.copy_from_slice(&self.fpstate.lock().unwrap());
        Ok(())
    }
    fn write_fpstate(&self, buf: &[u8; XSAVE_AREA_LEN]) -> Result<()> {
        self.fpstate.lock().unwrap().copy_from_slice(buf);
        Ok(())
    }
    fn read_msr(&self, msr: u32) -> Result<u64> {
        Ok(self.msr_value(msr))
    }
    fn write_msr(&self, msr: u32, value: u64) -> Result<()> {
        self.msrs.lock().unwrap().insert(msr, value);
        Ok(())
    }
    fn host_tsc(&self) -> u64 {
        self.tsc.load(Ordering::Relaxed)
    }
    fn sync_tsc(&self, guest_tsc: u64) -> Result<()> {
        self.synced_tsc.store(guest_tsc, Ordering::Relaxed);
        Ok(())
    }
}

/// Scripted platform callbacks for event-processor and injector tests.
#[derive(Default)]
pub struct TestPlatform {
    resets: AtomicUsize,
    startups: AtomicUsize,
    rax_at_reset: AtomicU64,
    tpr_reports: Mutex<Vec<(u64, TprAccess)>>,
    vectors: Mutex<VecDeque<u8>>,
    vector_queries: AtomicUsize,
    poll_pending: AtomicBool,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_vector(&self, vector: u8) {
        self.vectors.lock().unwrap().push_back(vector);
    }

    pub fn set_poll_pending(&self, pending: bool) {
        self.poll_pending.store(pending, Ordering::Relaxed);
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::Relaxed)
    }

    pub fn rax_at_reset(&self) -> u64 {
        self.rax_at_reset.load(Ordering::Relaxed)
    }

    pub fn vector_queries(&self) -> usize {
        self.vector_queries.load(Ordering::Relaxed)
    }

    pub fn tpr_reports(&self) -> Vec<(u64, TprAccess)> {
        self.tpr_reports.lock().unwrap().clone()
    }
}

impl VcpuPlatform for TestPlatform {
    fn cpu_reset(&self, cpu: &mut GuestCpuState) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        self.rax_at_reset.store(cpu.rax, Ordering::Relaxed);
    }
    fn cpu_startup(&self, _cpu: &mut GuestCpuState) {
        self.startups.fetch_add(1, Ordering::Relaxed);
    }
    fn tpr_access_report(&self, rip: u64, access: TprAccess) {
        self.tpr_reports.lock().unwrap().push((rip, access));
    }
    fn pending_vector(&self) -> Option<u8> {
        self.vector_queries.fetch_add(1, Ordering::Relaxed);
        self.vectors.lock().unwrap().pop_front()
    }
    fn poll_pending(&self) -> bool {
        self.poll_pending.load(Ordering::Relaxed)
    }
}
