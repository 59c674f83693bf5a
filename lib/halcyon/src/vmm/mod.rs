// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Abstraction over the host hardware-virtualization API.

pub mod hdl;

pub use hdl::*;

#[cfg(test)]
pub(crate) mod testhdl;
