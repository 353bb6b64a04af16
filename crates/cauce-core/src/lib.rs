// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core types, errors, and capability traits for the Cauce message dispatcher.
//!
//! Everything shared across the pipeline crates lives here: the canonical
//! [`InboundMessage`], the queue and context models, the [`CauceError`] enum,
//! and the narrow traits ([`TransportSender`], [`ReplyEngine`],
//! [`ActivityObserver`]) that decouple the worker pool, the transports, the
//! agent runtime, and the follow-up scheduler from each other.

pub mod error;
pub mod traits;
pub mod types;

pub use error::CauceError;
pub use traits::{ActivityObserver, ReplyEngine, TransportSender};
pub use types::*;
