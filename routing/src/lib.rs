// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Discovery of the route, source address, and link-layer addresses used to
//! reach the Instance Metadata Service.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

mod errors;
mod probe;

pub use errors::RouteProbeError;
pub use probe::{RouteDecision, probe};
