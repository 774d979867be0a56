//! Redis streams queue backend.
//!
//! The queue is a stream read through one consumer group:
//!
//! - **Declare**: `XGROUP CREATE ... MKSTREAM`, an existing group is fine
//! - **Receive**: entries idle longer than `claim_idle` in another consumer's
//!   pending list are taken over with `XAUTOCLAIM`, then new entries are read
//!   with `XREADGROUP`
//! - **Ack / discard**: `XACK` + `XDEL`
//! - **Requeue**: `XADD` with the attempt counter increased, `XACK` + `XDEL`
//!   of the original, in one `MULTI`
//! - **Dead letter**: `XADD` to `<stream>:dead`, `XACK` + `XDEL`
//!
//! With `durable_writes` every write waits on `WAITAOF` until the local
//! append-only file is fsynced. That requires `appendonly yes` on the server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailverify_common::config::QueueConfig;
use mailverify_common::{AppError, AppResult, IdGenerator};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamRangeReply, StreamReadReply};
use redis::{Pipeline, RedisError};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{Delivery, QueueBackend};
use crate::retry::DeadLetterEntry;

const FIELD_BODY: &str = "body";
const FIELD_ATTEMPT: &str = "attempt";
const FIELD_REASON: &str = "reason";
const FIELD_FAILED_AT: &str = "failed_at";

fn redis_err(e: RedisError) -> AppError {
    AppError::Redis(e.to_string())
}

/// Queue backed by a Redis stream and consumer group.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    stream: String,
    dead_stream: String,
    group: String,
    consumer: String,
    poll_interval: Duration,
    claim_idle: Duration,
    durable_timeout: Option<Duration>,
}

impl RedisQueue {
    /// Connect to the configured broker.
    ///
    /// Fails with [`AppError::Config`] when `queue.url` is not set.
    pub async fn connect(config: &QueueConfig) -> AppResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| AppError::Config("queue.url is not configured".to_string()))?;

        let client = redis::Client::open(url).map_err(redis_err)?;

        // Long enough for WAITAOF to report back
        let response_timeout =
            Duration::from_millis(config.durable_timeout_ms) + Duration::from_secs(5);
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(10))
            .set_response_timeout(response_timeout);

        let conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(redis_err)?;

        let consumer = config.consumer.clone().unwrap_or_else(|| {
            format!("worker-{}-{}", std::process::id(), IdGenerator::new().generate())
        });

        info!(stream = %config.stream_key(), group = %config.group, consumer = %consumer, "Connected to Redis");

        Ok(Self {
            conn,
            stream: config.stream_key(),
            dead_stream: config.dead_letter_key(),
            group: config.group.clone(),
            consumer,
            poll_interval: config.poll_interval(),
            claim_idle: config.claim_idle(),
            durable_timeout: config
                .durable_writes
                .then(|| Duration::from_millis(config.durable_timeout_ms)),
        })
    }

    /// Read up to `count` entries of the dead-letter stream, oldest first.
    pub async fn dead_letters(&self, count: usize) -> AppResult<Vec<DeadLetterEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&self.dead_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(reply
            .ids
            .iter()
            .map(|entry| DeadLetterEntry {
                body: entry.get(FIELD_BODY).unwrap_or_default(),
                attempts: entry.get(FIELD_ATTEMPT).unwrap_or(1),
                last_error: entry.get(FIELD_REASON).unwrap_or_default(),
                failed_at: entry
                    .get::<String>(FIELD_FAILED_AT)
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map_or_else(Utc::now, |t| t.with_timezone(&Utc)),
            })
            .collect())
    }

    fn to_delivery(entry: &StreamId) -> Delivery {
        Delivery {
            id: entry.id.clone(),
            body: entry.get(FIELD_BODY).unwrap_or_default(),
            attempt: entry.get(FIELD_ATTEMPT).unwrap_or(1),
        }
    }

    /// Append `XACK` + `XDEL` of a delivery to a pipeline.
    fn settle_into(&self, pipe: &mut Pipeline, delivery: &Delivery) {
        pipe.cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(&delivery.id)
            .ignore();
    }

    async fn run_pipeline(&self, pipe: &Pipeline, durable: bool) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        if durable {
            self.confirm_durable(&mut conn).await?;
        }
        Ok(())
    }

    async fn confirm_durable(&self, conn: &mut ConnectionManager) -> AppResult<()> {
        let Some(timeout) = self.durable_timeout else {
            return Ok(());
        };

        let (local, _replicas): (i64, i64) = redis::cmd("WAITAOF")
            .arg(1)
            .arg(0)
            .arg(timeout.as_millis() as u64)
            .query_async(conn)
            .await
            .map_err(redis_err)?;

        if local < 1 {
            return Err(AppError::Queue(format!(
                "write not fsynced to the append-only file within {timeout:?}"
            )));
        }
        Ok(())
    }

    async fn claim_stale(&self, conn: &mut ConnectionManager) -> AppResult<Option<Delivery>> {
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(redis_err)?;

        let claimed = reply.claimed.first().map(Self::to_delivery);
        if let Some(delivery) = &claimed {
            info!(id = %delivery.id, attempt = delivery.attempt, "Reclaimed message from a stalled consumer");
        }
        Ok(claimed)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn declare(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Declared queue");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Queue already declared");
                Ok(())
            }
            Err(e) => Err(redis_err(e)),
        }
    }

    async fn publish(&self, body: &[u8]) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(body)
            .arg(FIELD_ATTEMPT)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        self.confirm_durable(&mut conn).await?;

        debug!(id = %id, stream = %self.stream, "Published message");
        Ok(())
    }

    async fn receive(&self) -> AppResult<Option<Delivery>> {
        let mut conn = self.conn.clone();

        if let Some(delivery) = self.claim_stale(&mut conn).await? {
            return Ok(Some(delivery));
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let delivery = reply.and_then(|reply| {
            reply
                .keys
                .iter()
                .flat_map(|key| key.ids.iter())
                .next()
                .map(Self::to_delivery)
        });

        if delivery.is_none() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(delivery)
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle_into(&mut pipe, delivery);
        self.run_pipeline(&pipe, false).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> AppResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if requeue {
            pipe.cmd("XADD")
                .arg(&self.stream)
                .arg("*")
                .arg(FIELD_BODY)
                .arg(&delivery.body)
                .arg(FIELD_ATTEMPT)
                .arg(delivery.attempt.saturating_add(1))
                .ignore();
        }
        self.settle_into(&mut pipe, delivery);
        self.run_pipeline(&pipe, requeue).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("XADD")
            .arg(&self.dead_stream)
            .arg("*")
            .arg(FIELD_BODY)
            .arg(&delivery.body)
            .arg(FIELD_ATTEMPT)
            .arg(delivery.attempt)
            .arg(FIELD_REASON)
            .arg(reason)
            .arg(FIELD_FAILED_AT)
            .arg(Utc::now().to_rfc3339())
            .ignore();
        self.settle_into(&mut pipe, delivery);
        self.run_pipeline(&pipe, true).await
    }
}
