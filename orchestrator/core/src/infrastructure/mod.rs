// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod record_store;
pub mod sync;

pub use event_bus::{EventBus, EventBusError, EventReceiver, SubscriptionId};
pub use record_store::{AgentStoreView, RecordIter, RecordStore};
pub use sync::{SyncListener, SyncTransport, TransportError};
