// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Plumbing between the tier components and the P2P layer: the outbound
//! command channel, wire opcodes, peer snapshots and the per-peer
//! fulfilled-request registry. The transport itself is a collaborator.

mod fulfilled;
mod message;
mod peers;

pub use self::fulfilled::*;
pub use self::message::*;
pub use self::peers::*;
