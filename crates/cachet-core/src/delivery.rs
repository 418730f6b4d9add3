//! Offline-delivery reliability queue.
//!
//! When a message targets a recipient that cannot be reached, an entry is
//! queued here and retried until it is delivered, its retries are
//! exhausted, or it expires. The queue owns no scheduler: a periodic
//! external job polls [`DeliveryQueue::find_ready_for_retry`] and
//! [`DeliveryQueue::expire_overdue`], attempts delivery through the
//! transport, and reports the outcome back.
//!
//! Retry pacing is exponential: 1, 2, 4, 8, 16 minutes for retries 0..4,
//! after which the entry is exhausted. Entries expire 30 days after
//! queuing by default regardless of retry count.
//!
//! Only transient transport failures belong here. Payloads that failed
//! authentication must never be requeued (see
//! [`crate::error::Error::is_retryable`]).

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default maximum delivery attempts per entry.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default entry lifetime (30 days).
pub const DEFAULT_EXPIRATION_SECS: i64 = 30 * 24 * 60 * 60;

/// Base retry delay (1 minute), doubled per retry.
pub const BASE_RETRY_DELAY_SECS: i64 = 60;

/// Delivery entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeliveryStatus {
    /// Waiting for a delivery attempt.
    Pending = 0,
    /// Successfully delivered (terminal).
    Delivered = 1,
    /// Last attempt failed; may still be retried.
    Failed = 2,
    /// Lifetime elapsed without delivery (terminal).
    Expired = 3,
}

impl DeliveryStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Expired)
    }
}

impl From<i32> for DeliveryStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Delivered,
            2 => Self::Failed,
            3 => Self::Expired,
            _ => Self::Pending,
        }
    }
}

/// A queued delivery attempt for one message to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEntry {
    /// Database row ID.
    pub id: i64,
    /// Opaque message identifier.
    pub message_id: String,
    /// Recipient identifier.
    pub recipient_id: String,
    /// Current status.
    pub status: DeliveryStatus,
    /// Completed delivery attempts.
    pub retry_count: u32,
    /// Attempt ceiling.
    pub max_retries: u32,
    /// Time queued (Unix timestamp).
    pub queued_at: i64,
    /// Earliest time for the next attempt (Unix timestamp).
    pub next_retry_at: i64,
    /// Time of the last attempt, if any (Unix timestamp).
    pub last_retry_at: Option<i64>,
    /// Expiration time (Unix timestamp).
    pub expires_at: i64,
    /// Delivery time, if delivered (Unix timestamp).
    pub delivered_at: Option<i64>,
    /// Reason recorded by the last failed attempt.
    pub failure_reason: Option<String>,
}

/// Statistics about the delivery queue.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Total entries.
    pub total: usize,
    /// Pending entries.
    pub pending: usize,
    /// Delivered entries.
    pub delivered: usize,
    /// Failed entries.
    pub failed: usize,
    /// Expired entries.
    pub expired: usize,
    /// Distinct recipients with pending entries.
    pub unique_recipients: usize,
}

/// The delivery queue.
pub struct DeliveryQueue {
    conn: Arc<Mutex<Connection>>,
    expiration_secs: i64,
}

impl DeliveryQueue {
    /// Open or create a delivery queue database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                queued_at INTEGER NOT NULL,
                next_retry_at INTEGER NOT NULL,
                last_retry_at INTEGER,
                expires_at INTEGER NOT NULL,
                delivered_at INTEGER,
                failure_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_recipient ON delivery_queue(recipient_id);
            CREATE INDEX IF NOT EXISTS idx_delivery_status ON delivery_queue(status);
            CREATE INDEX IF NOT EXISTS idx_delivery_next_retry ON delivery_queue(next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_delivery_expires ON delivery_queue(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            expiration_secs: DEFAULT_EXPIRATION_SECS,
        })
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Set the default entry lifetime for newly queued entries.
    pub fn set_expiration(&mut self, secs: i64) {
        self.expiration_secs = secs;
    }

    /// Queue a message for a recipient.
    ///
    /// The entry starts pending with zero retries and is immediately
    /// eligible for a first attempt.
    pub fn enqueue(&self, message_id: &str, recipient_id: &str) -> Result<i64> {
        let expires_at = now_ts() + self.expiration_secs;
        self.enqueue_with_expiry(message_id, recipient_id, expires_at)
    }

    /// Queue a message with an explicit expiration time.
    pub fn enqueue_with_expiry(
        &self,
        message_id: &str,
        recipient_id: &str,
        expires_at: i64,
    ) -> Result<i64> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        conn.execute(
            r#"INSERT INTO delivery_queue
               (message_id, recipient_id, status, retry_count, max_retries,
                queued_at, next_retry_at, expires_at)
               VALUES (?, ?, 0, 0, ?, ?, ?, ?)"#,
            params![
                message_id,
                recipient_id,
                DEFAULT_MAX_RETRIES,
                now,
                now,
                expires_at,
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!(entry = id, recipient = %recipient_id, "queued message for delivery");
        Ok(id)
    }

    /// Get a single entry by ID.
    pub fn get(&self, id: i64) -> Result<Option<DeliveryEntry>> {
        let conn = self.lock_conn()?;

        let entry = conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_ENTRY),
                params![id],
                row_to_entry,
            )
            .optional()?;

        Ok(entry)
    }

    /// All pending entries for a recipient, oldest first.
    pub fn find_pending_for(&self, recipient_id: &str) -> Result<Vec<DeliveryEntry>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE recipient_id = ? AND status = 0 ORDER BY queued_at ASC",
            SELECT_ENTRY
        ))?;

        let entries = stmt
            .query_map(params![recipient_id], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Entries whose next retry time has arrived and that have not
    /// expired, oldest first.
    pub fn find_ready_for_retry(&self, limit: usize) -> Result<Vec<DeliveryEntry>> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(&format!(
            r#"{} WHERE status = 0 AND next_retry_at <= ? AND expires_at > ?
               ORDER BY queued_at ASC LIMIT ?"#,
            SELECT_ENTRY
        ))?;

        let entries = stmt
            .query_map(params![now, now, limit as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Non-terminal entries whose lifetime has elapsed.
    pub fn find_expired(&self) -> Result<Vec<DeliveryEntry>> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE status IN (0, 2) AND expires_at <= ? ORDER BY expires_at ASC",
            SELECT_ENTRY
        ))?;

        let entries = stmt
            .query_map(params![now], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Mark an entry as successfully delivered (terminal).
    pub fn mark_delivered(&self, id: i64) -> Result<()> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        conn.execute(
            "UPDATE delivery_queue SET status = 1, delivered_at = ? WHERE id = ?",
            params![now, id],
        )?;

        debug!(entry = id, "marked delivered");
        Ok(())
    }

    /// Record a failed delivery attempt.
    ///
    /// Does not touch the retry counter: retry orchestration calls
    /// [`DeliveryQueue::schedule_retry`] separately to pace the next
    /// attempt.
    pub fn mark_failed(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "UPDATE delivery_queue SET status = 2, failure_reason = ? WHERE id = ?",
            params![reason, id],
        )?;

        debug!(entry = id, "marked failed");
        Ok(())
    }

    /// Schedule the next retry for an entry with exponential backoff.
    ///
    /// Fails with [`Error::DeliveryExhausted`] when the retry ceiling is
    /// reached or the entry's lifetime has elapsed; the caller should then
    /// notify the sender.
    pub fn schedule_retry(&self, id: i64) -> Result<()> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        let entry = conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_ENTRY),
                params![id],
                row_to_entry,
            )
            .optional()?
            .ok_or_else(|| Error::Storage("delivery entry not found".into()))?;

        if entry.status.is_terminal() {
            return Err(Error::DeliveryExhausted("entry already terminal".into()));
        }

        if entry.expires_at <= now {
            conn.execute(
                "UPDATE delivery_queue SET status = 3 WHERE id = ?",
                params![id],
            )?;
            warn!(entry = id, "entry expired before delivery");
            return Err(Error::DeliveryExhausted("entry expired".into()));
        }

        if entry.retry_count >= entry.max_retries {
            warn!(entry = id, "delivery retries exhausted");
            return Err(Error::DeliveryExhausted("max retries reached".into()));
        }

        let delay = retry_backoff_secs(entry.retry_count);
        conn.execute(
            r#"UPDATE delivery_queue
               SET status = 0, retry_count = retry_count + 1,
                   last_retry_at = ?, next_retry_at = ?
               WHERE id = ?"#,
            params![now, now + delay, id],
        )?;

        debug!(entry = id, delay_secs = delay, "scheduled retry");
        Ok(())
    }

    /// Transition every overdue non-terminal entry to expired.
    ///
    /// Returns the number of entries expired.
    pub fn expire_overdue(&self) -> Result<usize> {
        let now = now_ts();
        let conn = self.lock_conn()?;

        let count = conn.execute(
            "UPDATE delivery_queue SET status = 3 WHERE expires_at <= ? AND status IN (0, 2)",
            params![now],
        )?;

        if count > 0 {
            debug!(count, "expired overdue delivery entries");
        }
        Ok(count)
    }

    /// Delete terminal entries queued before the given age.
    pub fn cleanup(&self, max_age_secs: i64) -> Result<usize> {
        let cutoff = now_ts() - max_age_secs;
        let conn = self.lock_conn()?;

        let count = conn.execute(
            "DELETE FROM delivery_queue WHERE status IN (1, 3) AND queued_at <= ?",
            params![cutoff],
        )?;

        Ok(count)
    }

    /// Queue statistics.
    pub fn stats(&self) -> Result<DeliveryStats> {
        let conn = self.lock_conn()?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DeliveryStats {
            total: count("SELECT COUNT(*) FROM delivery_queue")?,
            pending: count("SELECT COUNT(*) FROM delivery_queue WHERE status = 0")?,
            delivered: count("SELECT COUNT(*) FROM delivery_queue WHERE status = 1")?,
            failed: count("SELECT COUNT(*) FROM delivery_queue WHERE status = 2")?,
            expired: count("SELECT COUNT(*) FROM delivery_queue WHERE status = 3")?,
            unique_recipients: count(
                "SELECT COUNT(DISTINCT recipient_id) FROM delivery_queue WHERE status = 0",
            )?,
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }
}

/// Backoff delay in seconds before the next attempt after `retry_count`
/// completed retries: 1, 2, 4, 8, 16 minutes.
pub fn retry_backoff_secs(retry_count: u32) -> i64 {
    BASE_RETRY_DELAY_SECS * (1 << retry_count.min(4))
}

const SELECT_ENTRY: &str = r#"SELECT id, message_id, recipient_id, status, retry_count,
       max_retries, queued_at, next_retry_at, last_retry_at, expires_at,
       delivered_at, failure_reason
   FROM delivery_queue"#;

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryEntry> {
    Ok(DeliveryEntry {
        id: row.get(0)?,
        message_id: row.get(1)?,
        recipient_id: row.get(2)?,
        status: DeliveryStatus::from(row.get::<_, i32>(3)?),
        retry_count: row.get::<_, i64>(4)? as u32,
        max_retries: row.get::<_, i64>(5)? as u32,
        queued_at: row.get(6)?,
        next_retry_at: row.get(7)?,
        last_retry_at: row.get(8)?,
        expires_at: row.get(9)?,
        delivered_at: row.get(10)?,
        failure_reason: row.get(11)?,
    })
}

/// Current Unix timestamp.
fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_defaults() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let id = queue.enqueue("msg-1", "bob").expect("enqueue");
        let entry = queue.get(id).expect("get").expect("exists");

        assert_eq!(entry.status, DeliveryStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.max_retries, 5);
        assert!(entry.delivered_at.is_none());
        assert!(entry.failure_reason.is_none());
        // Expires roughly 30 days out
        assert!((entry.expires_at - entry.queued_at - DEFAULT_EXPIRATION_SECS).abs() <= 1);
    }

    #[test]
    fn test_mark_delivered() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let id = queue.enqueue("msg-1", "bob").expect("enqueue");
        queue.mark_delivered(id).expect("deliver");

        let entry = queue.get(id).expect("get").expect("exists");
        assert_eq!(entry.status, DeliveryStatus::Delivered);
        assert!(entry.delivered_at.is_some());
        assert!(entry.status.is_terminal());
    }

    #[test]
    fn test_mark_failed_keeps_retry_count() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let id = queue.enqueue("msg-1", "bob").expect("enqueue");
        queue.mark_failed(id, "Connection refused").expect("fail");

        let entry = queue.get(id).expect("get").expect("exists");
        assert_eq!(entry.status, DeliveryStatus::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("Connection refused"));
        assert_eq!(entry.retry_count, 0);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(retry_backoff_secs(0), 60);
        assert_eq!(retry_backoff_secs(1), 2 * 60);
        assert_eq!(retry_backoff_secs(2), 4 * 60);
        assert_eq!(retry_backoff_secs(3), 8 * 60);
        assert_eq!(retry_backoff_secs(4), 16 * 60);
    }

    #[test]
    fn test_schedule_retry_increments_and_paces() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let id = queue.enqueue("msg-1", "bob").expect("enqueue");
        queue.mark_failed(id, "timeout").expect("fail");
        queue.schedule_retry(id).expect("retry");

        let entry = queue.get(id).expect("get").expect("exists");
        assert_eq!(entry.status, DeliveryStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_retry_at.is_some());
        assert!(entry.next_retry_at >= entry.queued_at + retry_backoff_secs(0));
    }

    #[test]
    fn test_retry_exhaustion() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let id = queue.enqueue("msg-1", "bob").expect("enqueue");
        for _ in 0..5 {
            queue.schedule_retry(id).expect("retry");
        }

        let err = queue.schedule_retry(id).expect_err("exhausted");
        assert!(matches!(err, Error::DeliveryExhausted(_)));

        let entry = queue.get(id).expect("get").expect("exists");
        assert_eq!(entry.retry_count, 5);
    }

    #[test]
    fn test_expired_entry_cannot_retry() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let past = chrono::Utc::now().timestamp() - 60;
        let id = queue
            .enqueue_with_expiry("msg-1", "bob", past)
            .expect("enqueue");

        let err = queue.schedule_retry(id).expect_err("expired");
        assert!(matches!(err, Error::DeliveryExhausted(_)));

        let entry = queue.get(id).expect("get").expect("exists");
        assert_eq!(entry.status, DeliveryStatus::Expired);
    }

    #[test]
    fn test_find_pending_for_recipient() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        queue.enqueue("msg-1", "bob").expect("enqueue");
        queue.enqueue("msg-2", "bob").expect("enqueue");
        let delivered = queue.enqueue("msg-3", "bob").expect("enqueue");
        queue.enqueue("msg-4", "charlie").expect("enqueue");
        queue.mark_delivered(delivered).expect("deliver");

        let pending = queue.find_pending_for("bob").expect("query");
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.recipient_id == "bob"));
    }

    #[test]
    fn test_find_ready_for_retry() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        // Fresh entries are immediately eligible
        queue.enqueue("msg-1", "bob").expect("enqueue");
        // Scheduled entries wait for their backoff window
        let waiting = queue.enqueue("msg-2", "bob").expect("enqueue");
        queue.schedule_retry(waiting).expect("retry");

        let ready = queue.find_ready_for_retry(10).expect("query");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "msg-1");
    }

    #[test]
    fn test_expire_overdue() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let past = chrono::Utc::now().timestamp() - 1;
        queue
            .enqueue_with_expiry("msg-1", "bob", past)
            .expect("enqueue");
        queue
            .enqueue_with_expiry("msg-2", "bob", past)
            .expect("enqueue");
        queue.enqueue("msg-3", "bob").expect("enqueue");

        let expired = queue.find_expired().expect("query");
        assert_eq!(expired.len(), 2);

        assert_eq!(queue.expire_overdue().expect("expire"), 2);

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_stats() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        queue.enqueue("msg-1", "bob").expect("enqueue");
        let delivered = queue.enqueue("msg-2", "charlie").expect("enqueue");
        queue.mark_delivered(delivered).expect("deliver");
        let failed = queue.enqueue("msg-3", "bob").expect("enqueue");
        queue.mark_failed(failed, "unreachable").expect("fail");

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unique_recipients, 1);
    }

    #[test]
    fn test_cleanup_terminal_entries() {
        let queue = DeliveryQueue::open_in_memory().expect("open");

        let delivered = queue.enqueue("msg-1", "bob").expect("enqueue");
        queue.mark_delivered(delivered).expect("deliver");
        queue.enqueue("msg-2", "bob").expect("enqueue");

        let removed = queue.cleanup(0).expect("cleanup");
        assert_eq!(removed, 1);

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
    }
}
