use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Cmd};

use crate::config::StoreConfig;
use crate::histogram::{WriteBatch, WriteOp};

use super::Store;

/// Redis-backed store over a multiplexed tokio connection.
///
/// Accepts `redis://host:port/db` and `unix:///path/to/socket` targets.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    connect_timeout: Duration,
}

impl RedisStore {
    /// Opens a connection and verifies connectivity with a ping.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let client = Client::open(cfg.url.as_str())
            .with_context(|| format!("parsing store url {}", cfg.url))?;
        let conn = open_connection(&client, cfg.connect_timeout).await?;

        tracing::info!(url = %cfg.url, "store connected");

        Ok(Self {
            client,
            conn,
            connect_timeout: cfg.connect_timeout,
        })
    }

    async fn query<T: ::redis::FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        let value: T = cmd.query_async(&mut conn).await?;
        Ok(value)
    }
}

async fn open_connection(client: &Client, timeout: Duration) -> Result<MultiplexedConnection> {
    let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_tokio_connection())
        .await
        .context("timed out connecting to store")?
        .context("opening store connection")?;

    let pong: String = ::redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("pinging store")?;
    tracing::debug!(reply = %pong, "store ping");

    Ok(conn)
}

impl Store for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect_worker(&self) -> Result<Self> {
        let conn = open_connection(&self.client, self.connect_timeout).await?;
        Ok(Self {
            client: self.client.clone(),
            conn,
            connect_timeout: self.connect_timeout,
        })
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                WriteOp::SetAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                WriteOp::IncrementBy {
                    key,
                    member,
                    amount,
                } => {
                    pipe.cmd("ZINCRBY").arg(key).arg(*amount).arg(member).ignore();
                }
                WriteOp::SetValue { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let () = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("applying batch of {} operations", batch.len()))?;
        Ok(())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        self.query(::redis::cmd("SISMEMBER").arg(key).arg(member))
            .await
            .with_context(|| format!("SISMEMBER {key}"))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        self.query(::redis::cmd("SMEMBERS").arg(key))
            .await
            .with_context(|| format!("SMEMBERS {key}"))
    }

    async fn add_members(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(::redis::cmd("SADD").arg(key).arg(members))
            .await
            .with_context(|| format!("SADD {key}"))
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        self.query(::redis::cmd("SREM").arg(key).arg(member))
            .await
            .with_context(|| format!("SREM {key}"))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(::redis::cmd("HGET").arg(key).arg(field))
            .await
            .with_context(|| format!("HGET {key}"))
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        self.query(::redis::cmd("HGETALL").arg(key))
            .await
            .with_context(|| format!("HGETALL {key}"))
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.query(::redis::cmd("HSETNX").arg(key).arg(field).arg(value))
            .await
            .with_context(|| format!("HSETNX {key}"))
    }

    async fn hash_set_all(&self, key: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(field).arg(value);
        }
        let _: i64 = self
            .query(&cmd)
            .await
            .with_context(|| format!("HSET {key}"))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(::redis::cmd("INCR").arg(key))
            .await
            .with_context(|| format!("INCR {key}"))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(::redis::cmd("GET").arg(key))
            .await
            .with_context(|| format!("GET {key}"))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .query(
                ::redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1)),
            )
            .await
            .with_context(|| format!("SET NX {key}"))?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.query(::redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)))
            .await
            .with_context(|| format!("EXPIRE {key}"))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.query(::redis::cmd("DEL").arg(key))
            .await
            .with_context(|| format!("DEL {key}"))
    }

    async fn scores(&self, key: &str) -> Result<BTreeMap<String, u64>> {
        let pairs: Vec<(String, f64)> = self
            .query(
                ::redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES"),
            )
            .await
            .with_context(|| format!("ZRANGE {key}"))?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| (member, score as u64))
            .collect())
    }
}
