// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-CPU state synchronization and event injection for vCPUs backed by a
//! hardware-virtualization host API.
//!
//! The crate translates between the software CPU model ([`GuestCpuState`])
//! and the host's per-vCPU control structures, and decides which pending
//! interrupt, exception, or reset event to inject before each entry into
//! guest context.

pub extern crate hvf_api;
#[macro_use]
extern crate bitflags;

pub mod cpu;
pub mod events;
pub mod intr;
pub mod msr;
pub mod segments;
pub mod vcpu;
pub mod vmm;
pub mod xsave;

pub use cpu::GuestCpuState;
pub use vcpu::Vcpu;

pub fn version() -> &'static str {
    lazy_static::lazy_static! {
        static ref VERSION: String = {
            use std::fmt::Write;

            let git = option_env!("VERGEN_GIT_BRANCH")
                .and_then(|branch| Some((branch, option_env!("VERGEN_GIT_SHA")?)));

            let mut version = format!("v{}", env!("CARGO_PKG_VERSION"));
            if let Some((branch, sha)) = git {
                write!(version, " ({sha}) {branch}")
                    .expect("writing to a string never fails");
            }
            version
        };
    };
    &VERSION
}
