//! Connection lifecycle management.
//!
//! Scaler targets come and go as the orchestrator registers and removes
//! scaled workloads, and each target is polled every few seconds. The
//! manager keeps one live connection per target in a keyed cache so a
//! poll never pays connect latency, and a background sweep closes
//! connections that have sat unused past the idle threshold — there is
//! no deregistration signal in the protocol, so idleness is the only
//! removal cue.
//!
//! All cache access (lookup-or-create, timestamp refresh, eviction,
//! close-all) goes through a single mutex. Two concurrent first
//! requests for the same key therefore serialize: the winner opens the
//! connection, the loser finds it in the cache and reuses it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// How often the idle sweep scans the cache.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long a connection may sit unused before the sweep closes it.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Options describing how to reach one Redis instance.
///
/// Either `address` (a `host:port` string) or `host` must be set;
/// `address` wins when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: Option<String>,
    pub host: Option<String>,
    pub port: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub enable_tls: bool,
    pub unsafe_ssl: bool,
}

impl ConnectOptions {
    /// Resolve the `(host, port)` endpoint, preferring the explicit
    /// address over the host/port pair.
    pub fn endpoint(&self) -> StoreResult<(String, u16)> {
        if let Some(address) = &self.address {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| StoreError::InvalidAddress(address.clone()))?;
            let port = port
                .parse()
                .map_err(|_| StoreError::InvalidAddress(address.clone()))?;
            return Ok((host.to_string(), port));
        }

        match &self.host {
            Some(host) => {
                let port = self
                    .port
                    .parse()
                    .map_err(|_| StoreError::InvalidPort(self.port.clone()))?;
                Ok((host.clone(), port))
            }
            None => Err(StoreError::MissingAddress),
        }
    }

    /// Check that the options can produce an endpoint.
    pub fn validate(&self) -> StoreResult<()> {
        self.endpoint().map(|_| ())
    }
}

type ConnectFuture<C> = Pin<Box<dyn Future<Output = StoreResult<C>> + Send>>;

/// Callback type for opening a new store connection.
///
/// The manager calls this with validated options when a cache miss
/// requires a fresh connection.
pub type Connector<C> = Box<dyn Fn(ConnectOptions) -> ConnectFuture<C> + Send + Sync>;

/// One cached connection plus its last-used timestamp.
struct ConnectionEntry<C> {
    conn: C,
    used_at: Instant,
}

/// Keyed cache of live store connections with idle-based eviction.
///
/// Generic over the connection type; production code uses the
/// [`RedisConnectionManager`] alias.
pub struct ConnectionManager<C> {
    entries: Arc<Mutex<HashMap<String, ConnectionEntry<C>>>>,
    connector: Connector<C>,
    shutdown_tx: watch::Sender<bool>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

/// Connection manager over real multiplexed Redis connections.
pub type RedisConnectionManager = ConnectionManager<MultiplexedConnection>;

impl<C: Send + 'static> ConnectionManager<C> {
    /// Create a manager with a custom connector and start its sweep task.
    pub fn with_connector(connector: Connector<C>) -> Self {
        let entries = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweep = tokio::spawn(run_sweep(entries.clone(), shutdown_rx));

        Self {
            entries,
            connector,
            shutdown_tx,
            sweep: Mutex::new(Some(sweep)),
        }
    }
}

impl<C: Clone + Send + 'static> ConnectionManager<C> {
    /// Return the cached connection for `key`, or open a new one.
    ///
    /// A cache hit refreshes the entry's timestamp and never opens a
    /// connection; at most one live connection exists per key.
    pub async fn acquire(&self, key: &str, options: &ConnectOptions) -> StoreResult<C> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(key) {
            entry.used_at = Instant::now();
            return Ok(entry.conn.clone());
        }

        options.validate()?;

        let conn = (self.connector)(options.clone()).await?;
        entries.insert(
            key.to_string(),
            ConnectionEntry {
                conn: conn.clone(),
                used_at: Instant::now(),
            },
        );

        debug!(name = %key, "created new store connection");

        Ok(conn)
    }

    /// Stop the sweep and close every remaining cached connection.
    ///
    /// The sweep's stop signal is awaited, not just fired, so shutdown
    /// cannot race a final sweep iteration. Connections still held by
    /// in-flight requests close when their last clone drops.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweep.lock().await.take() {
            let _ = handle.await;
        }

        let mut entries = self.entries.lock().await;
        let closed = entries.len();
        entries.clear();

        info!(closed, "connection manager shut down");
    }
}

impl RedisConnectionManager {
    /// Create a manager that opens multiplexed Redis connections.
    pub fn new() -> Self {
        Self::with_connector(Box::new(|options| Box::pin(connect_redis(options))))
    }
}

impl Default for RedisConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Open one multiplexed connection for the given options.
async fn connect_redis(options: ConnectOptions) -> StoreResult<MultiplexedConnection> {
    let (host, port) = options.endpoint()?;

    let addr = if options.enable_tls {
        ConnectionAddr::TcpTls {
            host,
            port,
            insecure: options.unsafe_ssl,
            tls_params: None,
        }
    } else {
        ConnectionAddr::Tcp(host, port)
    };

    let client = redis::Client::open(ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db: options.database,
            username: options.username,
            password: options.password,
            ..Default::default()
        },
    })?;

    let conn = client.get_multiplexed_async_connection().await?;
    Ok(conn)
}

/// Periodic eviction loop; runs until the shutdown signal fires.
async fn run_sweep<C>(
    entries: Arc<Mutex<HashMap<String, ConnectionEntry<C>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                sweep_idle(&mut *entries.lock().await);
            }
            _ = shutdown.changed() => {
                debug!("connection sweep stopped");
                return;
            }
        }
    }
}

/// Drop every entry idle longer than the threshold. Dropping the last
/// clone of a multiplexed connection closes the underlying socket.
fn sweep_idle<C>(entries: &mut HashMap<String, ConnectionEntry<C>>) {
    let now = Instant::now();
    entries.retain(|name, entry| {
        if now.duration_since(entry.used_at) > IDLE_THRESHOLD {
            debug!(name = %name, "closing idle store connection");
            false
        } else {
            true
        }
    });
}
