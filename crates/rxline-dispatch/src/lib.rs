/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Asynchronous analysis dispatch over a publish/subscribe transport.
//!
//! The [`DispatchBroker`] correlates one published job with one reply via a
//! per-call reply subject; the [`JobConsumer`] sits on the worker side of
//! the bus, runs each job through the fallback chain and publishes the
//! result. The [`Transport`] trait decouples both from the concrete bus, so
//! tests run over an in-memory router.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod consumer;
pub mod transport;
pub mod wire;

pub use broker::{DispatchBroker, DispatchError};
pub use consumer::{ConsumerCounters, JobConsumer};
pub use transport::{MemoryTransport, NatsTransport, Subscription, Transport, TransportError};
pub use wire::{JobKind, Subjects};
