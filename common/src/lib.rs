// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the mix-network directory authority.
//!
//! This crate holds everything both the authority server and its clients
//! need to agree on:
//!
//! 1. [`epochtime`]: the epoch schedule. All participants derive the
//!    current epoch from the same genesis instant and period.
//! 2. [`pki`]: the PKI data model. Key material, mix descriptors, and the
//!    parsed form of the directory document, along with the validity rules
//!    for each.
//! 3. [`wire`]: the signing envelope and canonical serialization used to
//!    move descriptors and documents between nodes and authorities.

pub mod epochtime;
pub mod pki;
pub mod wire;

mod b64;
