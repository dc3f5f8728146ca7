//! libSQL-backed `MessageQueue`.
//!
//! Visibility is a millisecond timestamp per row. `receive` claims the
//! oldest visible row with a single `UPDATE ... RETURNING`, so two workers
//! can never lease the same message. Every lease-scoped operation matches on
//! the lease token; a token that was voided by `rearm` or a later delivery
//! simply matches nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::{DeadLetter, Delivery, Lease, MessageQueue, QueueMessage};
use crate::store::libsql_backend::{ms_to_datetime, now_ms};
use crate::store::migrations;

/// Durable queue stored in the `queue_messages` table.
pub struct LibSqlQueue {
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    config: QueueConfig,
}

impl LibSqlQueue {
    /// Share an already migrated connection.
    pub fn from_connection(db: Arc<LibSqlDatabase>, conn: Connection, config: QueueConfig) -> Self {
        Self {
            _db: db,
            conn,
            config,
        }
    }

    /// A standalone in-memory queue (for tests).
    pub async fn new_memory(config: QueueConfig) -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to create in-memory queue: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Storage(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn)
            .await
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        Ok(Self::from_connection(Arc::new(db), conn, config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn move_to_dead_letters(&self, lease: &Lease) -> Result<(), QueueError> {
        let msg = &lease.message;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO dead_letters (id, kind, job_id, payload, received, enqueued_at, dead_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    msg.id.as_str(),
                    msg.kind.as_str(),
                    msg.job_id.to_string(),
                    msg.payload.to_string(),
                    i64::from(lease.receive_count),
                    lease.enqueued_at.timestamp_millis(),
                    now_ms(),
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("dead_letter insert: {e}")))?;

        self.conn
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND lease_token = ?2",
                params![msg.id.as_str(), lease.token.as_str()],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("dead_letter delete: {e}")))?;
        Ok(())
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

fn row_to_message(row: &libsql::Row) -> Result<(QueueMessage, i64, i64), QueueError> {
    let get_err = |e: libsql::Error| QueueError::Storage(format!("row_to_message: {e}"));
    let id: String = row.get(0).map_err(get_err)?;
    let kind: String = row.get(1).map_err(get_err)?;
    let job_id: String = row.get(2).map_err(get_err)?;
    let payload: String = row.get(3).map_err(get_err)?;
    let received: i64 = row.get(4).map_err(get_err)?;
    let enqueued_at: i64 = row.get(5).map_err(get_err)?;

    let job_id = Uuid::parse_str(&job_id).map_err(|e| QueueError::Decode {
        id: id.clone(),
        reason: format!("job id: {e}"),
    })?;
    let payload = serde_json::from_str(&payload).map_err(|e| QueueError::Decode {
        id: id.clone(),
        reason: format!("payload: {e}"),
    })?;

    Ok((
        QueueMessage {
            id,
            kind,
            job_id,
            payload,
        },
        received,
        enqueued_at,
    ))
}

#[async_trait]
impl MessageQueue for LibSqlQueue {
    async fn enqueue_with_delay(
        &self,
        msg: &QueueMessage,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let now = now_ms();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO queue_messages (id, kind, job_id, payload, visible_at, received, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                params![
                    msg.id.as_str(),
                    msg.kind.as_str(),
                    msg.job_id.to_string(),
                    msg.payload.to_string(),
                    now + millis(delay),
                    now,
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("enqueue: {e}")))?;

        if inserted > 0 {
            debug!(message_id = %msg.id, kind = %msg.kind, "Message enqueued");
        }
        Ok(inserted > 0)
    }

    async fn rearm(&self, msg: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let now = now_ms();
        self.conn
            .execute(
                "INSERT INTO queue_messages (id, kind, job_id, payload, visible_at, received, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    visible_at = excluded.visible_at,
                    lease_token = NULL,
                    received = 0",
                params![
                    msg.id.as_str(),
                    msg.kind.as_str(),
                    msg.job_id.to_string(),
                    msg.payload.to_string(),
                    now + millis(delay),
                    now,
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("rearm: {e}")))?;
        debug!(message_id = %msg.id, delay_ms = millis(delay), "Message rearmed");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let now = now_ms();
        let token = Uuid::new_v4().to_string();

        let claimed = {
            let mut rows = self
                .conn
                .query(
                    "UPDATE queue_messages SET
                        received = received + 1,
                        lease_token = ?1,
                        visible_at = ?2
                     WHERE seq = (
                        SELECT seq FROM queue_messages
                        WHERE visible_at <= ?3
                        ORDER BY visible_at, seq
                        LIMIT 1
                     )
                     RETURNING id, kind, job_id, payload, received, enqueued_at",
                    params![token.as_str(), now + millis(self.config.lease), now],
                )
                .await
                .map_err(|e| QueueError::Storage(format!("receive: {e}")))?;

            match rows
                .next()
                .await
                .map_err(|e| QueueError::Storage(format!("receive: {e}")))?
            {
                Some(row) => Some(row_to_message(&row)?),
                None => None,
            }
        };

        let Some((message, received, enqueued_at)) = claimed else {
            return Ok(None);
        };

        let lease = Lease {
            message,
            token,
            receive_count: u32::try_from(received).unwrap_or(u32::MAX),
            enqueued_at: ms_to_datetime(enqueued_at),
        };

        if lease.receive_count > self.config.max_receive {
            warn!(
                message_id = %lease.message.id,
                kind = %lease.message.kind,
                receive_count = lease.receive_count,
                "Message exceeded receive limit, moving to dead letters"
            );
            self.move_to_dead_letters(&lease).await?;
            return Ok(Some(Delivery::DeadLettered {
                message: lease.message,
                receive_count: lease.receive_count,
            }));
        }

        Ok(Some(Delivery::Leased(lease)))
    }

    async fn delete(&self, lease: &Lease) -> Result<bool, QueueError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND lease_token = ?2",
                params![lease.message.id.as_str(), lease.token.as_str()],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("delete: {e}")))?;
        Ok(deleted > 0)
    }

    async fn extend(&self, lease: &Lease, by: Duration) -> Result<bool, QueueError> {
        let changed = self
            .conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?3 WHERE id = ?1 AND lease_token = ?2",
                params![
                    lease.message.id.as_str(),
                    lease.token.as_str(),
                    now_ms() + millis(by),
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("extend: {e}")))?;
        Ok(changed > 0)
    }

    async fn requeue(
        &self,
        lease: &Lease,
        delay: Duration,
        payload: Option<&serde_json::Value>,
    ) -> Result<bool, QueueError> {
        let payload = match payload {
            Some(p) => libsql::Value::Text(p.to_string()),
            None => libsql::Value::Null,
        };
        let changed = self
            .conn
            .execute(
                "UPDATE queue_messages SET
                    visible_at = ?3,
                    lease_token = NULL,
                    received = 0,
                    payload = COALESCE(?4, payload)
                 WHERE id = ?1 AND lease_token = ?2",
                params![
                    lease.message.id.as_str(),
                    lease.token.as_str(),
                    now_ms() + millis(delay),
                    payload,
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("requeue: {e}")))?;
        Ok(changed > 0)
    }

    async fn release(&self, lease: &Lease, delay: Duration) -> Result<bool, QueueError> {
        let changed = self
            .conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?3, lease_token = NULL
                 WHERE id = ?1 AND lease_token = ?2",
                params![
                    lease.message.id.as_str(),
                    lease.token.as_str(),
                    now_ms() + millis(delay),
                ],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("release: {e}")))?;
        Ok(changed > 0)
    }

    async fn purge_jobs(&self, job_ids: &[Uuid]) -> Result<u64, QueueError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = job_ids.iter().map(Uuid::to_string).collect();
        let ids_json = serde_json::to_string(&ids)
            .map_err(|e| QueueError::Storage(format!("purge_jobs: {e}")))?;
        let purged = self
            .conn
            .execute(
                "DELETE FROM queue_messages WHERE job_id IN (SELECT value FROM json_each(?1))",
                params![ids_json],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("purge_jobs: {e}")))?;
        Ok(purged)
    }

    async fn contains(&self, id: &str) -> Result<bool, QueueError> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM queue_messages WHERE id = ?1", params![id])
            .await
            .map_err(|e| QueueError::Storage(format!("contains: {e}")))?;
        let found = rows
            .next()
            .await
            .map_err(|e| QueueError::Storage(format!("contains: {e}")))?
            .is_some();
        Ok(found)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM queue_messages", ())
            .await
            .map_err(|e| QueueError::Storage(format!("depth: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| QueueError::Storage(format!("depth: {e}")))?
        {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            None => Ok(0),
        }
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, job_id, payload, received, enqueued_at, dead_at
                 FROM dead_letters ORDER BY dead_at DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| QueueError::Storage(format!("dead_letters: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| QueueError::Storage(format!("dead_letters: {e}")))?
        {
            let (message, received, _) = row_to_message(&row)?;
            let dead_at: i64 = row
                .get(6)
                .map_err(|e| QueueError::Storage(format!("dead_letters: {e}")))?;
            out.push(DeadLetter {
                message,
                receive_count: u32::try_from(received).unwrap_or(u32::MAX),
                dead_at: ms_to_datetime(dead_at),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lease_ms: u64, max_receive: u32) -> QueueConfig {
        QueueConfig {
            lease: Duration::from_millis(lease_ms),
            max_receive,
            ..QueueConfig::default()
        }
    }

    fn msg(id: &str) -> QueueMessage {
        QueueMessage::new(id, "crawl_page", Uuid::new_v4(), serde_json::json!({"n": 1}))
    }

    fn leased(d: Option<Delivery>) -> Lease {
        match d {
            Some(Delivery::Leased(lease)) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_id() {
        let q = LibSqlQueue::new_memory(config(1000, 5)).await.unwrap();
        assert!(q.enqueue(&msg("a")).await.unwrap());
        assert!(!q.enqueue(&msg("a")).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn leased_message_is_invisible_then_redelivered() {
        let q = LibSqlQueue::new_memory(config(50, 5)).await.unwrap();
        q.enqueue(&msg("a")).await.unwrap();

        let first = leased(q.receive().await.unwrap());
        assert_eq!(first.receive_count, 1);
        assert!(q.receive().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = leased(q.receive().await.unwrap());
        assert_eq!(second.message.id, "a");
        assert_eq!(second.receive_count, 2);

        // The stale lease can no longer ack.
        assert!(!q.delete(&first).await.unwrap());
        assert!(q.delete(&second).await.unwrap());
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_letters_after_max_receive() {
        let q = LibSqlQueue::new_memory(config(1000, 2)).await.unwrap();
        q.enqueue(&msg("a")).await.unwrap();

        for _ in 0..2 {
            let lease = leased(q.receive().await.unwrap());
            assert!(q.release(&lease, Duration::ZERO).await.unwrap());
        }
        match q.receive().await.unwrap() {
            Some(Delivery::DeadLettered { receive_count, .. }) => assert_eq!(receive_count, 3),
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(q.depth().await.unwrap(), 0);
        let dead = q.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.id, "a");
    }

    #[tokio::test]
    async fn requeue_resets_count_and_replaces_payload() {
        let q = LibSqlQueue::new_memory(config(1000, 5)).await.unwrap();
        q.enqueue(&msg("a")).await.unwrap();
        let lease = leased(q.receive().await.unwrap());

        let payload = serde_json::json!({"phase": "wait"});
        assert!(q.requeue(&lease, Duration::ZERO, Some(&payload)).await.unwrap());

        let again = leased(q.receive().await.unwrap());
        assert_eq!(again.receive_count, 1);
        assert_eq!(again.message.payload, payload);
    }

    #[tokio::test]
    async fn rearm_voids_the_current_lease() {
        let q = LibSqlQueue::new_memory(config(10_000, 5)).await.unwrap();
        let probe = QueueMessage::probe(Uuid::new_v4(), serde_json::json!({}));
        q.rearm(&probe, Duration::ZERO).await.unwrap();

        let lease = leased(q.receive().await.unwrap());
        let rearmed = QueueMessage {
            payload: serde_json::json!({"fresh": true}),
            ..probe.clone()
        };
        q.rearm(&rearmed, Duration::ZERO).await.unwrap();

        // The in-flight holder can't ack away the rearmed message.
        assert!(!q.delete(&lease).await.unwrap());
        let next = leased(q.receive().await.unwrap());
        assert_eq!(next.message.payload, serde_json::json!({"fresh": true}));
        assert_eq!(q.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delayed_messages_wait_their_turn() {
        let q = LibSqlQueue::new_memory(config(1000, 5)).await.unwrap();
        q.enqueue_with_delay(&msg("later"), Duration::from_millis(60))
            .await
            .unwrap();
        q.enqueue(&msg("now")).await.unwrap();

        let first = leased(q.receive().await.unwrap());
        assert_eq!(first.message.id, "now");
        assert!(q.receive().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(leased(q.receive().await.unwrap()).message.id, "later");
    }

    #[tokio::test]
    async fn purge_by_job() {
        let q = LibSqlQueue::new_memory(config(1000, 5)).await.unwrap();
        let a = msg("a");
        q.enqueue(&a).await.unwrap();
        q.enqueue(&msg("b")).await.unwrap();
        assert_eq!(q.purge_jobs(&[a.job_id]).await.unwrap(), 1);
        assert!(!q.contains("a").await.unwrap());
        assert!(q.contains("b").await.unwrap());
    }
}
