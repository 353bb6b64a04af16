// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP gateway for the Cauce dispatcher.
//!
//! Webhook handlers are non-blocking: after admission they hand off to the
//! asynchronous pipeline and answer the transport immediately. Admission
//! rejections still answer 200 with a reason so transports do not retry.

pub mod handlers;
pub mod server;

pub use server::{start_server, GatewayState};
