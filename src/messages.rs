//! # Inter-Pool Messages
//!
//! The message vocabulary flowing between worker pools, plus the shared
//! dispatch handle bundle every worker captures. All cross-pool communication
//! goes through these enums; pools share no mutable state beyond the tenant
//! registry and membership directory.

use crate::event::VerifiedEvent;
use crate::filter::FilterGroup;
use crate::pool::PoolHandle;
use crate::subscription::Subscription;
use crate::types::{ConnId, SubId, TenantId};
use crate::wire;

// =============================================================================
// Per-Pool Message Types
// =============================================================================

/// Outbound side: consumed by the websocket pool, which owns the transport.
pub enum WsMsg {
    Send {
        conn_id: ConnId,
        payload: String,
    },
    SendBinary {
        conn_id: ConnId,
        payload: Vec<u8>,
    },
    /// One event fanned out to many subscriptions: synthesizes one
    /// `["EVENT", subId, json]` frame per recipient.
    SendEventToBatch {
        recipients: Vec<(ConnId, SubId)>,
        event_json: String,
    },
    GracefulShutdown,
}

pub enum IngesterMsg {
    Client {
        conn_id: ConnId,
        ip_addr: String,
        tenant: TenantId,
        payload: String,
    },
    CloseConn(ConnId),
    Shutdown,
}

pub enum WriterMsg {
    AddEvent(Box<AddEvent>),
    CloseConn(ConnId),
    Shutdown,
}

/// A fully verified event on its way to durable storage.
pub struct AddEvent {
    pub conn_id: ConnId,
    pub ip_addr: String,
    pub tenant: TenantId,
    pub verified: VerifiedEvent,
}

pub enum ReqWorkerMsg {
    NewSub(Box<Subscription>),
    RemoveSub { conn_id: ConnId, sub_id: SubId },
    CloseConn(ConnId),
    Shutdown,
}

pub enum MonitorMsg {
    NewSub(Box<Subscription>),
    RemoveSub { conn_id: ConnId, sub_id: SubId },
    CloseConn(ConnId),
    /// Broadcast to every monitor worker when a tenant's storage changed.
    DbChange(TenantId),
    Shutdown,
}

pub enum NegentropyMsg {
    Open {
        conn_id: ConnId,
        sub_id: SubId,
        tenant: TenantId,
        filters: FilterGroup,
        payload: Vec<u8>,
    },
    Msg {
        conn_id: ConnId,
        sub_id: SubId,
        payload: Vec<u8>,
    },
    Close {
        conn_id: ConnId,
        sub_id: SubId,
    },
    CloseConn(ConnId),
    Shutdown,
}

// =============================================================================
// Shared Dispatch Bundle
// =============================================================================

/// Every pool's dispatch handle, cloned into each worker. Reply helpers wrap
/// the frame builders so handlers state intent rather than format strings.
#[derive(Clone)]
pub struct Senders {
    pub ws: PoolHandle<WsMsg>,
    pub ingester: PoolHandle<IngesterMsg>,
    pub writer: PoolHandle<WriterMsg>,
    pub req_worker: PoolHandle<ReqWorkerMsg>,
    pub req_monitor: PoolHandle<MonitorMsg>,
    pub negentropy: PoolHandle<NegentropyMsg>,
}

impl Senders {
    pub fn send(&self, conn_id: ConnId, payload: String) {
        self.ws.dispatch(conn_id, WsMsg::Send { conn_id, payload });
    }

    pub fn send_ok(&self, conn_id: ConnId, id_hex: &str, ok: bool, message: &str) {
        self.send(conn_id, wire::ok(id_hex, ok, message));
    }

    pub fn send_notice(&self, conn_id: ConnId, message: &str) {
        self.send(conn_id, wire::notice(message));
    }

    pub fn send_notice_error(&self, conn_id: ConnId, message: &str) {
        self.send(conn_id, wire::notice_error(message));
    }

    pub fn send_event(&self, conn_id: ConnId, sub_id: &SubId, event_json: &str) {
        self.send(conn_id, wire::event(sub_id, event_json));
    }

    pub fn send_eose(&self, conn_id: ConnId, sub_id: &SubId) {
        self.send(conn_id, wire::eose(sub_id));
    }

    pub fn send_auth_challenge(&self, conn_id: ConnId, challenge: &str) {
        self.send(conn_id, wire::auth_challenge(challenge));
    }

    pub fn send_neg_msg(&self, conn_id: ConnId, sub_id: &SubId, payload_hex: &str) {
        self.send(conn_id, wire::neg_msg(sub_id, payload_hex));
    }

    pub fn send_event_batch(&self, recipients: Vec<(ConnId, SubId)>, event_json: String) {
        // The batch is keyed by the first recipient; the single websocket
        // worker receives everything anyway.
        if let Some((first, _)) = recipients.first() {
            let key = *first;
            self.ws.dispatch(
                key,
                WsMsg::SendEventToBatch {
                    recipients,
                    event_json,
                },
            );
        }
    }
}
