// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Domain Layer
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`behavior`] | `AgentBehavior`, `AgentContext`, `BehaviorRegistry` |
//! | [`health`] | `FleetHealth`, `HealthStatus`, `TaskAssignment` |

pub mod behavior;
pub mod health;

pub use behavior::*;
pub use health::*;
