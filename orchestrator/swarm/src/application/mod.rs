// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Application Layer
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`lifecycle`] | `AgentLifecycleManager`, `LifecycleError`, `LifecyclePhase` |
//! | [`orchestrator`] | `FleetOrchestrator`, `FleetError` |
//! | [`node`] | `FleetNode` composition root |

pub mod lifecycle;
pub mod node;
pub mod orchestrator;

pub use lifecycle::{AgentLifecycleManager, LifecycleError, LifecyclePhase};
pub use node::FleetNode;
pub use orchestrator::{FleetError, FleetOrchestrator};
