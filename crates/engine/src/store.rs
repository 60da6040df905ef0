//! Shared queue store — the only shared mutable state of the alarm engine.
//!
//! Every piece of coordination (fuse flags, repeat counters, cached rules,
//! the primary and delayed queues) lives behind [`AlarmStore`]. The engine
//! itself keeps no alarm state in memory, so several processes can share one
//! store and the atomic primitives below are the only synchronization.
//!
//! [`RedisStore`] is the production implementation. Blocking pops run on
//! dedicated connections so a worker parked in `BRPOP` never stalls the
//! multiplexed connection used for everything else.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};

use herald_common::error::AppError;

/// Primitives the alarm engine needs from its shared store.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Read a string value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Set a value with a TTL, overwriting any previous value.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    /// Set a value with a TTL only if the key is absent. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Atomically increment a counter. A counter created by this call gets `ttl`;
    /// an existing counter keeps its remaining TTL.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, AppError>;

    /// Push onto the head of a list.
    async fn lpush(&self, list: &str, value: &str) -> Result<(), AppError>;

    /// Pop from the tail of a list, waiting up to `timeout`. `None` on timeout.
    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, AppError>;

    /// Insert (or re-score) a member of a sorted set.
    async fn zadd(&self, zset: &str, score: i64, member: &str) -> Result<(), AppError>;

    /// Members with score ≤ `max_score`, lowest first, at most `limit`.
    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, AppError>;

    /// For each `(member, payload)`: push `payload` onto `list` and remove
    /// `member` from `zset`; then remove every member in `discard`.
    ///
    /// The commands are sent as one batch but are not a transaction: a crash
    /// part-way through can leave a payload pushed whose member is still
    /// scheduled.
    async fn move_to_list(
        &self,
        zset: &str,
        list: &str,
        moves: &[(String, String)],
        discard: &[String],
    ) -> Result<(), AppError>;

    /// Current time of the store in Unix milliseconds. Delayed-queue scores
    /// are computed and compared against this clock.
    async fn now_millis(&self) -> Result<i64, AppError>;
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis implementation of [`AlarmStore`].
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    /// Idle dedicated connections for blocking pops.
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
        }
    }

    /// Open a client and connection manager for `redis_url`.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = herald_common::redis_pool::create_redis_pool(redis_url).await?;
        Ok(Self::new(client, conn))
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, AppError> {
        let idle = self.blocking.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }
}

#[async_trait]
impl AlarmStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();

        // Some("OK") when the key was set, None when it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64, AppError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn lpush(&self, list: &str, value: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(list, value).await?;
        Ok(())
    }

    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>, AppError> {
        let mut conn = self.blocking_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(list)
            .arg(timeout.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await?;

        // Only a connection that completed its command goes back to the pool
        self.blocking.lock().push(conn);
        Ok(popped.map(|(_, value)| value))
    }

    async fn zadd(&self, zset: &str, score: i64, member: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(zset)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        zset: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(zset)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn move_to_list(
        &self,
        zset: &str,
        list: &str,
        moves: &[(String, String)],
        discard: &[String],
    ) -> Result<(), AppError> {
        if moves.is_empty() && discard.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (member, payload) in moves {
            pipe.cmd("LPUSH").arg(list).arg(payload).ignore();
            pipe.cmd("ZREM").arg(zset).arg(member).ignore();
        }
        for member in discard {
            pipe.cmd("ZREM").arg(zset).arg(member).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn now_millis(&self) -> Result<i64, AppError> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }
}
