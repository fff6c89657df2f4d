//! Idempotent response replay for `/verify` and `/settle`.
//!
//! Successful responses are stored under a request fingerprint before they
//! are emitted; a retry with the same fingerprint inside the TTL replays the
//! stored body byte-for-byte, timestamps included, and never re-enters the
//! pipeline. Clients that need explicit control supply an `Idempotency-Key`
//! header, which overrides the derived fingerprint.

use alloy::primitives::keccak256;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::types::PaymentRequirements;

#[derive(Debug, Clone)]
struct StoredResponse {
    body: String,
    stored_at: Instant,
}

/// TTL-bounded cache of serialized response bodies keyed by fingerprint.
pub struct IdempotencyCache {
    entries: DashMap<String, StoredResponse>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// The stored body for `key`, if present and within TTL.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.body.clone())
    }

    /// Store a response body under `key`, evicting anything expired.
    pub fn store(&self, key: &str, body: String) {
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        self.entries.insert(
            key.to_string(),
            StoredResponse {
                body,
                stored_at: Instant::now(),
            },
        );
    }
}

/// Derive the request fingerprint from the route and the stable subset of the
/// request: authorization nonce, resource, receiver, amount, and network.
pub fn fingerprint(route: &str, nonce: &str, requirements: &PaymentRequirements) -> String {
    let material = format!(
        "{route}|{nonce}|{resource}|{pay_to}|{amount}|{network}",
        resource = requirements.resource,
        pay_to = requirements.pay_to,
        amount = requirements.max_amount_required,
        network = requirements.network,
    );
    hex::encode(keccak256(material.as_bytes()))
}
