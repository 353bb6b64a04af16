// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport adapters for the Cauce dispatcher.
//!
//! Each adapter parses its transport's webhook payloads into the canonical
//! [`cauce_core::WebhookEvent`] variant and sends outbound text through the
//! transport's REST API with a shared retry ladder: 429 and 5xx/timeouts
//! retry with exponential backoff, 4xx is terminal.

pub mod chatwoot;
pub mod sender;
pub mod whatsapp;

pub use chatwoot::ChatwootTransport;
pub use sender::OutboundRouter;
pub use whatsapp::WhatsAppTransport;

use std::time::Duration;

use cauce_core::CauceError;

/// Attempts for one outbound send before giving up.
const SEND_ATTEMPTS: u32 = 3;

/// Base delay for the send retry ladder.
const SEND_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Run one POST with the shared retry ladder and classify the outcome.
///
/// `transport` names the adapter for logs and metrics.
pub(crate) async fn post_with_retry(
    transport: &str,
    request: impl Fn() -> reqwest::RequestBuilder,
) -> Result<(), CauceError> {
    let mut last_error = String::new();

    for attempt in 0..SEND_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(SEND_BACKOFF_BASE * 2u32.pow(attempt)).await;
        }

        let response = match request().send().await {
            Ok(r) => r,
            Err(e) => {
                // Connection errors and timeouts are retriable.
                tracing::warn!(transport, attempt, error = %e, "outbound send failed");
                last_error = e.to_string();
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            cauce_metrics::record_transport_send(transport, true);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            tracing::warn!(transport, attempt, %status, "transient transport error, will retry");
            last_error = format!("{status}: {body}");
            continue;
        }

        // 4xx other than 429 is terminal.
        cauce_metrics::record_transport_send(transport, false);
        return Err(CauceError::Transport {
            message: format!("{transport} returned {status}: {body}"),
            transient: false,
        });
    }

    cauce_metrics::record_transport_send(transport, false);
    Err(CauceError::Transport {
        message: format!("{transport} send failed after {SEND_ATTEMPTS} attempts: {last_error}"),
        transient: true,
    })
}

/// Keep only the digits of a phone-like identifier.
pub(crate) fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}
