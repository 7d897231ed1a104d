//! # Subscription Dispatch (Webhooks)
//!
//! After every committed mutation the kernel hands the new event to this
//! module, which matches it against active subscriptions and POSTs the event
//! JSON to each matching endpoint.
//!
//! ## Pattern Grammar
//!
//! `"*"` matches every event. Otherwise a pattern is `{entity}.{verb}` where
//! either side may be `*`; a pattern with any other shape is compared as a
//! literal string against the event type.
//!
//! ## Delivery
//!
//! Fire-and-forget: delivery runs outside the commit boundary, errors are
//! logged and swallowed, and nothing here ever blocks or fails the request
//! that caused the event. The engine tolerates at-most-once webhook delivery
//! while guaranteeing at-least-once append of the event itself.
//!
//! Each delivery carries a content-type header, the event type, a fresh
//! delivery id, and (when the subscription holds a secret) an HMAC-SHA-256
//! signature of the body as `sha256=<hex>`.

use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::ident;
use crate::types::{EventRecord, Subscription, SubscriptionMode};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Headers
// =============================================================================

/// Header carrying the event type (`Contact.create`).
pub const EVENT_HEADER: &str = "x-morph-event";

/// Header carrying the per-delivery id (`dlv_…`).
pub const DELIVERY_HEADER: &str = "x-morph-delivery";

/// Header carrying `sha256=<hex hmac>` when the subscription has a secret.
pub const SIGNATURE_HEADER: &str = "x-morph-signature";

// =============================================================================
// Pattern Matching
// =============================================================================

/// Evaluates a subscription pattern against an event type.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let (p_entity, p_verb) = match split_two(pattern) {
        Some(parts) => parts,
        // Not a two-segment pattern: literal comparison.
        None => return pattern == event_type,
    };
    let (e_entity, e_verb) = match split_two(event_type) {
        Some(parts) => parts,
        None => return pattern == event_type,
    };
    (p_entity == "*" || p_entity == e_entity) && (p_verb == "*" || p_verb == e_verb)
}

/// Splits `a.b` into its two segments; `None` for any other shape.
fn split_two(s: &str) -> Option<(&str, &str)> {
    let mut parts = s.splitn(2, '.');
    let first = parts.next()?;
    let second = parts.next()?;
    if second.contains('.') {
        return None;
    }
    Some((first, second))
}

// =============================================================================
// Signatures
// =============================================================================

/// HMAC-SHA-256 of the body, rendered as `sha256=<lowercase hex>`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256={}", hex)
}

// =============================================================================
// Delivery
// =============================================================================

/// Posts one event to one subscription endpoint.
///
/// Errors are reported to the caller only so it can log them; they carry no
/// further consequence.
async fn deliver(client: &Client, subscription: &Subscription, event_type: &str, body: &str) {
    let delivery_id = ident::delivery_id();
    let mut request = client
        .post(&subscription.endpoint)
        .header("content-type", "application/json")
        .header(EVENT_HEADER, event_type)
        .header(DELIVERY_HEADER, &delivery_id)
        .body(body.to_string());
    if let Some(secret) = &subscription.secret {
        request = request.header(SIGNATURE_HEADER, sign_body(secret, body.as_bytes()));
    }

    match request.send().await {
        Ok(response) => {
            debug!(
                subscription = %subscription.id,
                delivery = %delivery_id,
                status = response.status().as_u16(),
                "webhook delivered"
            );
        }
        Err(err) => {
            warn!(
                subscription = %subscription.id,
                endpoint = %subscription.endpoint,
                error = %err,
                "webhook delivery failed"
            );
        }
    }
}

/// Fans one event out to every matching active webhook subscription.
///
/// Websocket-mode subscriptions are skipped (their transport lives outside
/// the engine). Deliveries run concurrently up to `limit` in flight;
/// ordering across subscriptions is not guaranteed.
pub async fn fan_out(client: Client, subscriptions: Vec<Subscription>, event: EventRecord, limit: usize) {
    let body = match serde_json::to_string(&event.to_json()) {
        Ok(body) => body,
        Err(err) => {
            warn!(event = %event.id, error = %err, "event serialization failed; skipping fan-out");
            return;
        }
    };

    let matching: Vec<Subscription> = subscriptions
        .into_iter()
        .filter(|s| s.active)
        .filter(|s| s.mode == SubscriptionMode::Webhook)
        .filter(|s| pattern_matches(&s.pattern, &event.event_type))
        .collect();

    if matching.is_empty() {
        return;
    }
    debug!(event = %event.id, count = matching.len(), "dispatching webhooks");
    let event_type = event.event_type.clone();
    stream::iter(matching.into_iter().map(|s| {
        let client = client.clone();
        let event_type = event_type.clone();
        let body = body.clone();
        async move { deliver(&client, &s, &event_type, &body).await }
    }))
    .buffer_unordered(limit.max(1))
    .collect::<Vec<_>>()
    .await;
}

// =============================================================================
// Tests
// =============================================================================
