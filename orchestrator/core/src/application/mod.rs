// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod record_sweeper;

pub use record_sweeper::RecordSweeper;
