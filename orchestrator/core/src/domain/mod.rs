// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value types shared by every fleet component: records, events, peers,
//! agents, tasks, configuration and the retry policy.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure data and invariants, no I/O

pub mod agent;
pub mod events;
pub mod node_config;
pub mod pattern;
pub mod peer;
pub mod record;
pub mod retry;
pub mod task;
pub mod typed_records;
