//! Redis store backend.
//!
//! Conditional writes are a single Lua script so the compare and the set run
//! atomically on the server, the same way lock release is done with a
//! compare-and-delete script.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{bounded, KvStore, StoreError, StoreResult};

/// ARGV[1] = new value, ARGV[2] = "1" if an expected value is given,
/// ARGV[3] = expected value.
static CONDITIONAL_PUT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if ARGV[2] == '1' then
            if current ~= ARGV[3] then
                return 0
            end
        elseif current then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[1])
        return 1
        "#,
    )
});

/// Configuration for the Redis connection.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis server hostname or IP
    pub host: String,
    /// Redis server port
    pub port: u16,
    /// Database index
    pub db: u32,
    /// Bound on establishing the connection
    pub connect_timeout: Duration,
}

impl RedisStoreConfig {
    /// Creates a configuration with a 5 second connect timeout.
    pub fn new(host: impl Into<String>, port: u16, db: u32) -> Self {
        Self {
            host: host.into(),
            port,
            db,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Returns the Redis connection URI.
    pub fn uri(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Key-value store on a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        let uri = config.uri();
        let client = Client::open(uri.as_str())
            .map_err(|e| StoreError::Connection(format!("{}: {}", uri, e)))?;

        let connection = bounded(config.connect_timeout, async {
            ConnectionManager::new(client)
                .await
                .map_err(|e| StoreError::Connection(format!("{}: {}", uri, e)))
        })
        .await?;

        info!(host = %config.host, port = config.port, db = config.db, "Connected to Redis");
        Ok(Self { connection })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Command(format!("GET failed: {}", e)))?;
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn conditional_put(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let (has_expected, expected) = match expected {
            Some(v) => ("1", v),
            None => ("0", ""),
        };

        let written: i64 = CONDITIONAL_PUT
            .key(key)
            .arg(value)
            .arg(has_expected)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("conditional put failed: {}", e)))?;

        debug!(key, written = written > 0, "Conditional put");
        Ok(written > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| StoreError::Command(format!("DEL failed: {}", e)))?;
        Ok(())
    }
}
