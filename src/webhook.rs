//! Outbound webhook dispatcher (spec §6 "Webhook outbound"): signs the
//! payload with HMAC-SHA256 when a secret is configured and retries 5xx
//! responses with exponential backoff capped at `max_backoff`, up to
//! `max_retries`; a 4xx response is dropped without retry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use tracing::warn;

use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Serialize)]
pub struct WebhookEvent<'a> {
	#[serde(rename = "type")]
	pub event_type: &'a str,
	pub timestamp: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub route_id: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<serde_json::Value>,
}

fn sign(secret: &str, body: &[u8]) -> String {
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
	mac.update(body);
	format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Posts one event to one endpoint: 4xx is dropped immediately, 5xx is
/// retried with exponential backoff.
/// Returns once the event is delivered (2xx) or retries are exhausted.
pub async fn dispatch(client: &Client, config: &WebhookConfig, event: &WebhookEvent<'_>) {
	let body = match serde_json::to_vec(event) {
		Ok(b) => b,
		Err(e) => {
			warn!("failed to serialize webhook event: {e}");
			return;
		},
	};

	let mut backoff = ExponentialBackoffBuilder::new()
		.with_initial_interval(Duration::from_millis(200))
		.with_max_interval(Duration::from_secs(config.max_backoff_secs))
		.with_max_elapsed_time(None)
		.build();

	for attempt in 0..=config.max_retries {
		let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
		let mut request = client
			.post(&config.url)
			.header("content-type", "application/json")
			.header("x-webhook-event", event.event_type)
			.header("x-webhook-timestamp", timestamp.to_string());
		if let Some(secret) = &config.secret {
			request = request.header("x-webhook-signature", sign(secret, &body));
		}

		match request.body(body.clone()).send().await {
			Ok(response) if response.status().is_success() => return,
			Ok(response) if response.status().is_client_error() => {
				warn!(status = %response.status(), url = %config.url, "webhook dropped, client error");
				return;
			},
			Ok(response) => {
				warn!(status = %response.status(), url = %config.url, attempt, "webhook delivery failed, will retry");
			},
			Err(e) => {
				warn!(error = %e, url = %config.url, attempt, "webhook request failed, will retry");
			},
		}

		if attempt == config.max_retries {
			warn!(url = %config.url, "webhook exhausted retries, dropping event");
			return;
		}
		let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(config.max_backoff_secs));
		tokio::time::sleep(wait).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_is_stable_for_same_body_and_secret() {
		let a = sign("s3cr3t", b"hello");
		let b = sign("s3cr3t", b"hello");
		assert_eq!(a, b);
		assert!(a.starts_with("sha256="));
	}

	#[test]
	fn signature_changes_with_body() {
		let a = sign("s3cr3t", b"hello");
		let b = sign("s3cr3t", b"world");
		assert_ne!(a, b);
	}
}
