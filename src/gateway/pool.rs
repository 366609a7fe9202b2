//! Bounded connection pool.
//!
//! A plain bounded pool of `tokio_postgres::Client` connections. Postgres
//! clients are not `Clone`, so checkout/release is explicit: a semaphore
//! caps the number of connections in flight and a guard returns its client
//! to the pool on drop.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_postgres::{Client, Config, NoTls};

use super::GatewayError;

/// Connection parameters for the Postgres gateway pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: usize,
    pub pool_max: usize,
}

pub struct ConnectionPool {
    config: PoolConfig,
    idle: Arc<Mutex<Vec<Client>>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    /// Eagerly establishes `pool_min` connections and reserves capacity for
    /// up to `pool_max`.
    pub async fn connect(config: PoolConfig) -> Result<Self, GatewayError> {
        let mut idle = Vec::with_capacity(config.pool_min);
        for _ in 0..config.pool_min {
            idle.push(new_client(&config).await?);
        }

        log::info!(
            "established {} connections to {}:{}/{} (max {})",
            idle.len(),
            config.host,
            config.port,
            config.database,
            config.pool_max
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.pool_max)),
            idle: Arc::new(Mutex::new(idle)),
            config,
        })
    }

    /// Checks out a connection, creating one lazily if the idle list is
    /// empty but the pool has not reached `pool_max` in-flight connections.
    /// The returned guard releases the connection back to the pool on drop.
    pub async fn acquire(&self) -> Result<PooledConnection, GatewayError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::PoolClosed)?;

        let client = {
            let mut idle = self.idle.lock().await;
            idle.pop()
        };

        let client = match client {
            Some(client) => client,
            None => {
                log::debug!("pool idle list empty, opening a new connection");
                new_client(&self.config).await?
            }
        };

        Ok(PooledConnection {
            client: Some(client),
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

async fn new_client(config: &PoolConfig) -> Result<Client, GatewayError> {
    let mut pg_config = Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password);

    let (client, connection) = pg_config
        .connect(NoTls)
        .await
        .map_err(GatewayError::Connect)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::warn!("postgres connection task ended: {}", e);
        }
    });

    Ok(client)
}

/// A checked-out connection. Returns the client to the pool's idle list on
/// drop rather than closing it, unless the connection has already failed.
pub struct PooledConnection {
    client: Option<Client>,
    idle: Arc<Mutex<Vec<Client>>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().expect("client taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if client.is_closed() {
                return;
            }
            let idle = self.idle.clone();
            tokio::spawn(async move {
                idle.lock().await.push(client);
            });
        }
    }
}
