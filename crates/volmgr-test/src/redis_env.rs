//! Containerised Redis for store integration tests

use redis::{AsyncCommands, Client};
use std::time::Duration;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, TestcontainersError,
};
use thiserror::Error;
use volmgr_common::store::StoreResult;
use volmgr_common::{RedisStore, RedisStoreConfig};

/// Failures bringing up the Redis container
#[derive(Debug, Error)]
pub enum TestEnvError {
    #[error("container failed to start: {0}")]
    Container(#[from] TestcontainersError),

    #[error("redis client error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis at {0} never accepted a connection")]
    NotReady(String),
}

/// Redis test environment with a containerized Redis instance
pub struct RedisTestEnv {
    _container: testcontainers::ContainerAsync<GenericImage>,
    pub client: Client,
    pub host: String,
    pub port: u16,
}

impl RedisTestEnv {
    /// Starts a new Redis container
    ///
    /// # Errors
    /// Returns error if the container fails to start or the client cannot connect
    pub async fn start() -> Result<Self, TestEnvError> {
        let container = GenericImage::new("redis", "7-alpine")
            .with_exposed_port(ContainerPort::Tcp(6379))
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(6379).await?;

        let client = Client::open(format!("redis://{}:{}", host, port).as_str())?;
        let mut ready = false;
        for _ in 0..5 {
            match client.get_connection_with_timeout(Duration::from_secs(1)) {
                Ok(_) => {
                    ready = true;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
        if !ready {
            return Err(TestEnvError::NotReady(format!("{}:{}", host, port)));
        }

        Ok(Self {
            _container: container,
            client,
            host,
            port,
        })
    }

    /// Connection settings for a [`RedisStore`] on this container
    pub fn store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig::new(&self.host, self.port, 0)
    }

    /// Opens an independent [`RedisStore`] connection
    pub async fn connect_store(&self) -> StoreResult<RedisStore> {
        RedisStore::connect(&self.store_config()).await
    }

    /// Reads a key directly
    pub async fn get(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;
        conn.get(key).await
    }

    /// Writes a key directly
    pub async fn set(&self, key: &str, value: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;
        conn.set(key, value).await
    }

    /// Flushes every database
    pub async fn flush_all(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_tokio_connection().await?;
        redis::cmd("FLUSHALL").query_async::<()>(&mut conn).await
    }
}
