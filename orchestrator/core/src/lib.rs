// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Core
//!
//! Coordination substrate shared by every agent on a node: the record
//! store, the in-process event bus and the peer sync transport.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Shared state, notification and replication

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
