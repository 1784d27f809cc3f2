// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet node CLI library - exposes testable components
//!
//! Embedding applications that bring their own agent behaviors call
//! [`daemon::run_node`] with a populated
//! [`BehaviorRegistry`](fleet_swarm::BehaviorRegistry) instead of going
//! through the `fleet` binary.

pub mod commands;
pub mod daemon;
