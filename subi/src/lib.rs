// Copyright 2019-2022 Subi Platform developers
// SPDX-License-Identifier: Apache-2.0, MIT

//! Glue between the tier components and the host node: configuration,
//! message dispatch by wire opcode, the periodic scheduler and the
//! process-wide service container.

mod config;
mod dispatch;
mod node;
mod scheduler;

pub use self::config::*;
pub use self::dispatch::*;
pub use self::node::*;
pub use self::scheduler::*;
