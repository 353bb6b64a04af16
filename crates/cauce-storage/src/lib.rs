// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence layer for the Cauce dispatcher.
//!
//! Provides WAL-mode SQLite storage with embedded migrations, a single-writer
//! concurrency model via `tokio-rusqlite`, and typed query modules for the
//! durable queue, conversation contexts, bot states, and follow-up tables.

pub mod database;
pub mod migrations;
pub mod queries;

pub use database::Database;
