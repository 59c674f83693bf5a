// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw ABI surface of the host hardware-virtualization API.
//!
//! The identifiers and encodings in this crate are fixed externally: register
//! identifiers by the host framework, control-structure field identifiers and
//! bit layouts by the virtualization architecture itself.  None of them may
//! be renumbered or recomputed.

pub mod msr;
pub mod regs;
pub mod vmcs;

pub use msr::*;
pub use regs::*;
pub use vmcs::*;

/// Size (in bytes) of the extended-state buffer exchanged with the host as
/// one opaque blob.
pub const XSAVE_AREA_LEN: usize = 4096;
