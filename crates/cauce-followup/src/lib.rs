// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! 14-stage follow-up scheduler for dormant prospects.
//!
//! A fixed cadence of scheduled messages keeps inactive users engaged:
//! stage 0 fires one hour after the last reply, later stages stretch out to
//! day 66, and an optional maintenance stage recurs every 15 days. Any
//! inbound message from the user rewinds the whole sequence to stage 0.

pub mod scheduler;
pub mod stages;
pub mod templates;

pub use scheduler::{FollowUpScheduler, SchedulerConfig};
pub use stages::{offset_hours, ScheduleWindow, STAGE_OFFSETS_HOURS, TERMINAL_STAGE};
