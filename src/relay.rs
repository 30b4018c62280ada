//! # Relay Assembly
//!
//! Wires the staged pipeline together and exposes the three entry points the
//! transport layer drives: `accept`, `message`, `disconnect`. The transport
//! itself (websocket framing, TCP accept) is an external collaborator behind
//! the [`Transport`] trait; the relay owns everything from the first parsed
//! frame to the last outbound payload.
//!
//! ```text
//! accept/message/disconnect
//!         │
//!         ▼
//!   ┌───────────┐   ┌─────────┐   storage   ┌─────────────┐
//!   │ Ingester  │──►│ Writer  │──═watcher══►│ Req Monitor │──┐
//!   │  (N)      │   │  (1)    │             │    (N)      │  │
//!   └─────┬─────┘   └────┬────┘             └─────────────┘  │
//!         │              │                        ▲          │
//!         ├──────────────┼───────┐                │          │
//!         ▼              │       ▼                │          │
//!   ┌────────────┐       │  ┌──────────┐  EOSE    │          │
//!   │ Negentropy │       │  │ ReqWorker│──────────┘          │
//!   │    (N)     │       │  │   (N)    │                     │
//!   └─────┬──────┘       │  └────┬─────┘                     │
//!         │              │       │                           │
//!         └──────────────┴───────┴───────────┬───────────────┘
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │ Websocket pool  │──► Transport
//!                                   └─────────────────┘
//! ```
//!
//! Every message carrying a connection id is routed to the worker
//! `connId % N` of its pool, so per-connection state never crosses workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::messages::{
    IngesterMsg, MonitorMsg, NegentropyMsg, ReqWorkerMsg, Senders, WriterMsg, WsMsg,
};
use crate::pool::{pool, spawn_workers, Inbox};
use crate::registry::TenantRegistry;
use crate::types::{ConnId, TenantId};
use crate::{ingester, req_monitor, req_worker, sync, wire, writer};

// =============================================================================
// Transport
// =============================================================================

/// The external transport the embedder implements. The relay calls these from
/// its single websocket worker; payloads are complete text or binary frames.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, conn_id: ConnId, payload: String);

    fn send_binary(&self, _conn_id: ConnId, _payload: Vec<u8>) {}

    /// Called once when the relay shuts down gracefully.
    fn shutdown(&self) {}
}

// =============================================================================
// Relay
// =============================================================================

struct ConnState {
    tenant: TenantId,
    ip_addr: String,
}

pub struct Relay {
    cfg: Arc<Config>,
    senders: Senders,
    directory: Arc<TenantDirectory>,
    next_conn_id: AtomicU64,
    conns: Mutex<HashMap<ConnId, ConnState>>,
    handles: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Opens the default tenant environment, loads the membership directory,
    /// and starts every worker pool.
    pub fn start(cfg: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let cfg = Arc::new(cfg);
        let registry = Arc::new(TenantRegistry::open(&cfg)?);
        let directory = Arc::new(TenantDirectory::load(registry.default_env())?);

        let threads = &cfg.relay.num_threads;
        let (ws_tx, ws_rx) = pool::<WsMsg>(1);
        let (ingester_tx, ingester_rx) = pool::<IngesterMsg>(threads.ingester.max(1));
        let (writer_tx, writer_rx) = pool::<WriterMsg>(1);
        let (req_worker_tx, req_worker_rx) = pool::<ReqWorkerMsg>(threads.req_worker.max(1));
        let (req_monitor_tx, req_monitor_rx) = pool::<MonitorMsg>(threads.req_monitor.max(1));
        let (negentropy_tx, negentropy_rx) = pool::<NegentropyMsg>(threads.negentropy.max(1));

        let senders = Senders {
            ws: ws_tx,
            ingester: ingester_tx,
            writer: writer_tx,
            req_worker: req_worker_tx,
            req_monitor: req_monitor_tx,
            negentropy: negentropy_tx,
        };

        let mut handles = Vec::new();

        handles.extend(spawn_workers("websocket", ws_rx, {
            let transport = Arc::clone(&transport);
            move |inbox| run_websocket(inbox, Arc::clone(&transport))
        }));

        handles.extend(spawn_workers("ingester", ingester_rx, {
            let ctx = ingester::IngesterCtx {
                cfg: Arc::clone(&cfg),
                registry: Arc::clone(&registry),
                directory: Arc::clone(&directory),
                senders: senders.clone(),
            };
            move |inbox| ingester::run(inbox, ctx.clone())
        }));

        handles.extend(spawn_workers("writer", writer_rx, {
            let ctx = writer::WriterCtx {
                registry: Arc::clone(&registry),
                directory: Arc::clone(&directory),
                senders: senders.clone(),
            };
            move |inbox| writer::run(inbox, ctx.clone())
        }));

        handles.extend(spawn_workers("req-worker", req_worker_rx, {
            let ctx = req_worker::ReqWorkerCtx {
                cfg: Arc::clone(&cfg),
                registry: Arc::clone(&registry),
                directory: Arc::clone(&directory),
                senders: senders.clone(),
            };
            move |inbox| req_worker::run(inbox, ctx.clone())
        }));

        handles.extend(spawn_workers("req-monitor", req_monitor_rx, {
            let ctx = req_monitor::MonitorCtx {
                cfg: Arc::clone(&cfg),
                registry: Arc::clone(&registry),
                directory: Arc::clone(&directory),
                senders: senders.clone(),
            };
            move |inbox| req_monitor::run(inbox, ctx.clone())
        }));

        handles.extend(spawn_workers("negentropy", negentropy_rx, {
            let ctx = sync::SyncCtx {
                cfg: Arc::clone(&cfg),
                registry: Arc::clone(&registry),
                directory: Arc::clone(&directory),
                senders: senders.clone(),
            };
            move |inbox| sync::run(inbox, ctx.clone())
        }));

        info!(db_dir = %cfg.db_dir.display(), "relay started");
        Ok(Self {
            cfg,
            senders,
            directory,
            next_conn_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            handles,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// The tenant membership directory, for policy administration.
    pub fn directory(&self) -> &TenantDirectory {
        &self.directory
    }

    /// Registers a freshly accepted connection, deriving its tenant from the
    /// HTTP `Host` header and URL path. Returns the connection id the
    /// transport must use for subsequent frames.
    pub fn accept(&self, host: &str, path: &str, ip_addr: &str) -> ConnId {
        let conn_id = ConnId::from_raw(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let tenant = TenantId::derive(host, path);
        debug!(conn = %conn_id, %tenant, ip = ip_addr, "connection accepted");
        self.conns.lock().expect("conn table poisoned").insert(
            conn_id,
            ConnState {
                tenant,
                ip_addr: ip_addr.to_string(),
            },
        );
        conn_id
    }

    /// Feeds one inbound text frame into the pipeline. Frames for unknown
    /// connections are answered with a notice and otherwise dropped.
    pub fn message(&self, conn_id: ConnId, payload: &str) {
        let conns = self.conns.lock().expect("conn table poisoned");
        let Some(state) = conns.get(&conn_id) else {
            self.senders
                .send(conn_id, wire::notice_error("bad msg: unknown connection"));
            return;
        };
        self.senders.ingester.dispatch(
            conn_id,
            IngesterMsg::Client {
                conn_id,
                ip_addr: state.ip_addr.clone(),
                tenant: state.tenant.clone(),
                payload: payload.to_string(),
            },
        );
    }

    /// Propagates a transport close. Every pool purges its per-connection
    /// state at its own pace; in-flight work for the connection may still
    /// complete and its frames will simply never reach the wire.
    pub fn disconnect(&self, conn_id: ConnId) {
        if self
            .conns
            .lock()
            .expect("conn table poisoned")
            .remove(&conn_id)
            .is_some()
        {
            debug!(conn = %conn_id, "connection closed");
            self.senders
                .ingester
                .dispatch(conn_id, IngesterMsg::CloseConn(conn_id));
        }
    }

    /// Stops every pool in pipeline order and joins the worker threads.
    pub fn shutdown(mut self) {
        self.senders.ingester.dispatch_all(|| IngesterMsg::Shutdown);
        self.senders.writer.dispatch_all(|| WriterMsg::Shutdown);
        self.senders
            .req_worker
            .dispatch_all(|| ReqWorkerMsg::Shutdown);
        self.senders
            .req_monitor
            .dispatch_all(|| MonitorMsg::Shutdown);
        self.senders
            .negentropy
            .dispatch_all(|| NegentropyMsg::Shutdown);
        self.senders.ws.dispatch_all(|| WsMsg::GracefulShutdown);

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("relay stopped");
    }
}

// =============================================================================
// Websocket Pool
// =============================================================================

/// The single outbound worker. Owns the transport's send side and expands
/// batched event fan-outs into per-recipient frames.
fn run_websocket(inbox: Inbox<WsMsg>, transport: Arc<dyn Transport>) {
    while let Some(batch) = inbox.pop_all() {
        for msg in batch {
            match msg {
                WsMsg::Send { conn_id, payload } => transport.send(conn_id, payload),
                WsMsg::SendBinary { conn_id, payload } => transport.send_binary(conn_id, payload),
                WsMsg::SendEventToBatch {
                    recipients,
                    event_json,
                } => {
                    for (conn_id, sub_id) in recipients {
                        transport.send(conn_id, wire::event(&sub_id, &event_json));
                    }
                }
                WsMsg::GracefulShutdown => {
                    transport.shutdown();
                    return;
                }
            }
        }
    }
}
