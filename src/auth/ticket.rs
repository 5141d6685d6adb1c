//! # One-Use Connection Tickets
//!
//! WebSocket clients cannot send an `Authorization` header on the upgrade
//! request from a browser, so the gateway exchanges the user's bearer token
//! for a short-lived single-use ticket over plain HTTPS first. The ticket is
//! then presented as the first WebSocket message and consumed atomically.
//!
//! ## Ticket Lifecycle:
//! 1. **Issue**: 32 cryptographically random bytes, rendered as 64 lowercase
//!    hex chars, stored under `ticket:{id}` with a 300 s TTL
//! 2. **Consume**: first presentation deletes the record and yields the
//!    subject; every later presentation (or presentation after expiry) fails
//!
//! ## Storage Seam:
//! `TicketStore` abstracts the TTL key-value store. Production deployments
//! bind an external KV service; tests and single-node runs use the
//! in-process `MemoryTicketStore`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Server-side ticket TTL. The HTTP response advertises the same value.
pub const TICKET_TTL_SECONDS: i64 = 300;

const TICKET_KEY_PREFIX: &str = "ticket:";

/// Stored ticket record.
///
/// `used` exists for stores whose delete is not atomic with the read; the
/// in-process store never sets it, but an external KV adapter may mark a
/// record used before deletion lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Opaque user id taken from the verified bearer token
    pub subject: String,

    /// Absolute expiry instant (issuance + 300 s)
    pub expires_at: DateTime<Utc>,

    /// Set if a consume was observed but the delete has not landed yet
    pub used: bool,
}

/// TTL-keyed blob store holding issued tickets.
///
/// Keys are `ticket:{64-hex}`. The store enforces its own TTL as a backstop;
/// `consume_ticket` additionally checks `expires_at` so a lagging store
/// cannot extend a ticket's life.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Store a record under `key`, evicted server-side after `ttl_seconds`.
    async fn put(&self, key: &str, record: TicketRecord, ttl_seconds: i64) -> Result<(), String>;

    /// Fetch the record at `key`, if present and not yet evicted.
    async fn get(&self, key: &str) -> Result<Option<TicketRecord>, String>;

    /// Remove the record at `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), String>;
}

/// In-process ticket store backed by a mutex-guarded map.
///
/// TTL is enforced lazily: expired entries are dropped when read and swept
/// opportunistically on writes.
pub struct MemoryTicketStore {
    entries: Mutex<HashMap<String, (TicketRecord, DateTime<Utc>)>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTicketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn put(&self, key: &str, record: TicketRecord, ttl_seconds: i64) -> Result<(), String> {
        let evict_at = Utc::now() + Duration::seconds(ttl_seconds);
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.insert(key.to_string(), (record, evict_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<TicketRecord>, String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((record, evict_at)) if *evict_at > Utc::now() => Ok(Some(record.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Generate and store a fresh one-use ticket for `subject`.
///
/// ## Returns:
/// The 64-char lowercase hex ticket id.
pub async fn issue_ticket(store: &dyn TicketStore, subject: &str) -> Result<String, String> {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);

    let id = raw.iter().fold(String::with_capacity(64), |mut acc, b| {
        // infallible on String
        let _ = write!(acc, "{:02x}", b);
        acc
    });

    let record = TicketRecord {
        subject: subject.to_string(),
        expires_at: Utc::now() + Duration::seconds(TICKET_TTL_SECONDS),
        used: false,
    };

    store
        .put(&ticket_key(&id), record, TICKET_TTL_SECONDS)
        .await?;

    debug!(ticket_prefix = %&id[..8], "issued connection ticket");
    Ok(id)
}

/// Validate and consume a ticket in one shot.
///
/// ## Contract:
/// - Absent, expired, or already-used tickets yield `Ok(None)`; the record
///   (if any) is deleted so a retry cannot succeed either.
/// - On success the record is deleted first, then the subject returned.
///   Concurrent presentations of the same id race on the store's delete;
///   at-most-once consumption is all the protocol needs.
/// - Store failures are surfaced as `Err` and treated as auth failures by
///   the caller.
pub async fn consume_ticket(
    store: &dyn TicketStore,
    ticket_id: &str,
) -> Result<Option<String>, String> {
    let key = ticket_key(ticket_id);

    let record = match store.get(&key).await? {
        Some(record) => record,
        None => return Ok(None),
    };

    if record.used || Utc::now() >= record.expires_at {
        warn!(ticket_prefix = %ticket_prefix(ticket_id), "rejected stale connection ticket");
        store.delete(&key).await?;
        return Ok(None);
    }

    store.delete(&key).await?;
    Ok(Some(record.subject))
}

fn ticket_key(id: &str) -> String {
    format!("{}{}", TICKET_KEY_PREFIX, id)
}

/// First 8 hex chars, safe to log for correlation. The full id is a bearer
/// credential and must never reach the logs.
pub fn ticket_prefix(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_produces_64_hex_chars() {
        let store = MemoryTicketStore::new();
        let id = issue_ticket(&store, "user_42").await.unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_tickets_are_unique() {
        let store = MemoryTicketStore::new();
        let a = issue_ticket(&store, "user_42").await.unwrap();
        let b = issue_ticket(&store, "user_42").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_consume_returns_subject_once() {
        let store = MemoryTicketStore::new();
        let id = issue_ticket(&store, "user_42").await.unwrap();

        let first = consume_ticket(&store, &id).await.unwrap();
        assert_eq!(first.as_deref(), Some("user_42"));

        // Second presentation must fail
        let second = consume_ticket(&store, &id).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_unknown_ticket_rejected() {
        let store = MemoryTicketStore::new();
        let result = consume_ticket(&store, &"ab".repeat(32)).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_expired_record_rejected_and_deleted() {
        let store = MemoryTicketStore::new();
        let record = TicketRecord {
            subject: "user_42".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
            used: false,
        };
        store.put("ticket:deadbeef", record, 300).await.unwrap();

        let result = consume_ticket(&store, "deadbeef").await.unwrap();
        assert_eq!(result, None);
        assert!(store.get("ticket:deadbeef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_used_record_rejected() {
        let store = MemoryTicketStore::new();
        let record = TicketRecord {
            subject: "user_42".to_string(),
            expires_at: Utc::now() + Duration::seconds(60),
            used: true,
        };
        store.put("ticket:cafebabe", record, 300).await.unwrap();

        let result = consume_ticket(&store, "cafebabe").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_store_ttl_evicts_lazily() {
        let store = MemoryTicketStore::new();
        let record = TicketRecord {
            subject: "user_42".to_string(),
            expires_at: Utc::now() + Duration::seconds(300),
            used: false,
        };
        // Store-level TTL already elapsed even though the record itself claims validity
        store.put("ticket:feedface", record, -1).await.unwrap();
        assert!(store.get("ticket:feedface").await.unwrap().is_none());
    }

    #[test]
    fn test_ticket_prefix_never_panics() {
        assert_eq!(ticket_prefix("deadbeefcafe"), "deadbeef");
        assert_eq!(ticket_prefix("ab"), "ab");
        assert_eq!(ticket_prefix(""), "");
    }
}
