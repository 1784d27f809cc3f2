// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `fleet-swarm`: Agent Pool Crate
//!
//! Runs a pool of worker agents on top of the `fleet_core` substrate.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `AgentBehavior` plug-in trait, `AgentContext`, pool health |
//! | [`application`] | Application | lifecycle manager, orchestrator, `FleetNode` |
//!
//! ## Key Concepts
//!
//! - **Agent behavior**: what an agent type actually does. Registered per
//!   type in a `BehaviorRegistry`; the pool never inspects it.
//! - **Single-flight initialization**: concurrent `initialize` calls for one
//!   agent share a single run and its outcome.
//! - **Capacity**: at most `max_agents` live agents; excess tasks wait in a
//!   bounded queue or are rejected with `CapacityExceeded`.

pub mod application;
pub mod domain;

pub use application::*;
pub use domain::*;
