//! Daemon lifecycle.
//!
//! The daemon wires the core together: metrics sink, data store, receiver
//! list, query executor, and the two transports. It owns process-wide
//! state explicitly: everything is constructed during startup and torn
//! down after the ingest paths have drained.

pub mod hrpc;
pub mod rest;

use crate::core::config::Config;
use crate::core::error::{HtracedError, Result};
use crate::metrics::MetricsSink;
use crate::query::QueryExecutor;
use crate::receivers::SharedReceiverList;
use crate::storage::store::DataStore;
use crossbeam_channel::{bounded, select, tick};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// One-shot JSON written to `startup.notification.address` at boot.
#[derive(Debug, Serialize)]
struct StartupNotification {
    #[serde(rename = "HttpAddr")]
    http_addr: String,
    #[serde(rename = "HrpcAddr")]
    hrpc_addr: String,
    #[serde(rename = "ProcessId")]
    process_id: u32,
}

/// The assembled daemon.
pub struct Daemon {
    config: Config,
    store: Arc<DataStore>,
    sink: MetricsSink,
    receivers: Arc<SharedReceiverList>,
}

impl Daemon {
    /// Builds every component. Fails fast on configuration or shard
    /// problems, before any socket is bound.
    pub fn new(config: Config) -> Result<Daemon> {
        config.validate()?;
        let sink = MetricsSink::spawn(
            config.metrics_max_addr_entries()?,
            config.metrics_heartbeat_period()?,
        );
        let store = DataStore::open(&config, sink.handle())?;
        let receivers = Arc::new(SharedReceiverList::from_ids(config.span_receivers())?);
        Ok(Daemon {
            config,
            store,
            sink,
            receivers,
        })
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Runs until a shutdown signal arrives, then drains and exits.
    pub async fn run(self) -> Result<()> {
        let Daemon {
            config,
            store,
            sink,
            receivers,
        } = self;

        let web_listener = TcpListener::bind(config.web_address()).await.map_err(|e| {
            HtracedError::network(format!("Failed to bind {}: {}", config.web_address(), e))
        })?;
        let hrpc_listener = TcpListener::bind(config.hrpc_address()).await.map_err(|e| {
            HtracedError::network(format!("Failed to bind {}: {}", config.hrpc_address(), e))
        })?;
        let http_addr = web_listener.local_addr()?;
        let hrpc_addr = hrpc_listener.local_addr()?;

        // The notification is fatal on failure: a supervisor asked to be
        // told where we are listening.
        if let Some(addr) = config.startup_notification_address() {
            send_startup_notification(&addr, http_addr, hrpc_addr).await?;
        }

        let executor = Arc::new(QueryExecutor::new(
            store.clone(),
            config.query_default_limit()?,
        ));
        let query_timeout = config.query_timeout()?;

        let rest_state = rest::RestState {
            store: store.clone(),
            sink: sink.handle(),
            executor: executor.clone(),
            receivers: receivers.clone(),
            query_timeout,
            children_default_limit: config.query_default_limit()?,
        };
        let hrpc_state = hrpc::HrpcState {
            store: store.clone(),
            executor,
            receivers: receivers.clone(),
            query_timeout,
        };

        let heartbeat = spawn_heartbeat(store.clone(), config.datastore_heartbeat_period()?);

        let mut rest_task = tokio::spawn(rest::serve(web_listener, rest::create_router(rest_state)));
        let mut hrpc_task = tokio::spawn(hrpc::serve(hrpc_listener, hrpc_state));
        tracing::info!(%http_addr, %hrpc_addr, "htraced is serving");

        let mut rest_done = false;
        let mut hrpc_done = false;
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                Ok(())
            },
            result = &mut rest_task => {
                rest_done = true;
                match result {
                    Ok(server_result) => server_result,
                    Err(_) => Err(HtracedError::network("REST server task died")),
                }
            },
            result = &mut hrpc_task => {
                hrpc_done = true;
                match result {
                    Ok(server_result) => server_result,
                    Err(_) => Err(HtracedError::network("RPC server task died")),
                }
            },
        };

        if !rest_done {
            rest_task.abort();
            let _ = rest_task.await;
        }
        if !hrpc_done {
            hrpc_task.abort();
            let _ = hrpc_task.await;
        }

        receivers.close_all();
        heartbeat.stop();
        DataStore::shutdown_arc(store);
        sink.shutdown();
        tracing::info!("htraced shut down");
        outcome
    }
}

struct HeartbeatHandle {
    stop: crossbeam_channel::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl HeartbeatHandle {
    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("Data store heartbeat thread panicked");
        }
    }
}

/// Periodic visibility into the write pipeline: logs per-shard queue
/// depths so a backed-up shard shows before drops start.
fn spawn_heartbeat(store: Arc<DataStore>, period: std::time::Duration) -> HeartbeatHandle {
    let (stop_sender, stop_receiver) = bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("datastore-heartbeat".to_string())
        .spawn(move || {
            let ticker = tick(period);
            loop {
                select! {
                    recv(stop_receiver) -> _ => break,
                    recv(ticker) -> _ => {
                        let depths = store.queue_depths();
                        tracing::debug!(queue_depths = ?depths, "Data store heartbeat");
                    },
                }
            }
        })
        .expect("failed to spawn heartbeat thread");
    HeartbeatHandle {
        stop: stop_sender,
        handle,
    }
}

/// Connects once and writes the startup JSON, then closes.
async fn send_startup_notification(
    notify_addr: &str,
    http_addr: SocketAddr,
    hrpc_addr: SocketAddr,
) -> Result<()> {
    let mut stream = TcpStream::connect(notify_addr).await.map_err(|e| {
        HtracedError::network(format!(
            "Failed to connect to startup notification address {}: {}",
            notify_addr, e
        ))
    })?;
    let notification = StartupNotification {
        http_addr: http_addr.to_string(),
        hrpc_addr: hrpc_addr.to_string(),
        process_id: std::process::id(),
    };
    let body = serde_json::to_vec(&notification)?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}
