// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus metrics for the Cauce dispatcher.
//!
//! Uses the metrics-rs facade with the Prometheus exporter. Metrics are
//! rendered as Prometheus text format via [`PrometheusRecorder::render`],
//! which the gateway exposes at `/metrics`.

pub mod recording;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use cauce_core::CauceError;

pub use recording::*;

/// Prometheus metrics recorder.
///
/// Installs the global recorder; only one can exist per process.
pub struct PrometheusRecorder {
    handle: PrometheusHandle,
}

impl PrometheusRecorder {
    /// Install the Prometheus recorder and register metric descriptions.
    pub fn install() -> Result<Self, CauceError> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            CauceError::Internal(format!("failed to install Prometheus recorder: {e}"))
        })?;

        recording::register_metrics();
        tracing::info!("prometheus metrics recorder installed");

        Ok(Self { handle })
    }

    /// Render all collected metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
