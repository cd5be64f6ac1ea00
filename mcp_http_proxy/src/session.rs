//! Correlation state for one proxied server.
//!
//! Every client message gets a process-unique correlation id before it goes
//! on the wire; the id rides in the JSON-RPC `id` field so the remote
//! server's replies can be matched back to their entry. The client's own
//! `id` is kept on the entry and restored before anything is written back
//! out, so the counter never leaks to the client side.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use url::Url;

use crate::error::Result;
use crate::sse::endpoint_url;

/// One in-flight client message awaiting its reply.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: u64,
    pub submitted_at: Instant,
    /// The message exactly as the client sent it, `id` included.
    pub original_message: Value,
}

impl PendingRequest {
    /// The id the client used, if it sent one (notifications carry none).
    pub fn original_id(&self) -> Option<&Value> {
        self.original_message.get("id")
    }
}

/// Process-wide proxy state: the remote endpoint identity plus everything
/// still outstanding.
///
/// Owned by the event loop and only ever touched from it, so a plain map is
/// enough. Correlation ids start at 1 and are never reused within a process
/// lifetime.
#[derive(Debug)]
pub struct ProxySession {
    server_identity: String,
    base_url: Url,
    next_correlation_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl ProxySession {
    pub fn new(server_identity: impl Into<String>, base_url: Url) -> Self {
        Self {
            server_identity: server_identity.into(),
            base_url,
            next_correlation_id: 1,
            pending: HashMap::new(),
        }
    }

    pub fn server_identity(&self) -> &str {
        &self.server_identity
    }

    /// Where client messages are posted.
    pub fn message_url(&self) -> Result<Url> {
        endpoint_url(&self.base_url, &self.server_identity, "message")
    }

    /// Where the push channel lives.
    pub fn sse_url(&self) -> Result<Url> {
        endpoint_url(&self.base_url, &self.server_identity, "sse")
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Assigns the next correlation id, records the pending entry, and
    /// returns the message to put on the wire: the client's message with
    /// its `id` replaced by the correlation id. The entry is recorded
    /// before any I/O happens so a fast reply can never arrive for an
    /// unknown id.
    pub fn register(&mut self, message: Value) -> (u64, Value) {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;

        let mut outbound = message.clone();
        if let Some(fields) = outbound.as_object_mut() {
            fields.insert("id".to_string(), json!(correlation_id));
        }

        self.pending.insert(
            correlation_id,
            PendingRequest {
                correlation_id,
                submitted_at: Instant::now(),
                original_message: message,
            },
        );
        (correlation_id, outbound)
    }

    /// Removes and returns the entry for a correlation id, if present.
    pub fn complete(&mut self, correlation_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&correlation_id)
    }

    /// Settles a synchronous reply for a known correlation id: consumes the
    /// entry and puts the client's original id back on the body. When the
    /// entry is already gone (say the push channel answered first) the body
    /// passes through untouched.
    pub fn settle(
        &mut self,
        correlation_id: u64,
        mut reply: Value,
    ) -> (Value, Option<PendingRequest>) {
        let entry = self.pending.remove(&correlation_id);
        if let Some(entry) = &entry {
            restore_original_id(&mut reply, entry);
        }
        (reply, entry)
    }

    /// Matches a pushed server payload against the pending table. A payload
    /// whose `id` is one of ours consumes the entry and gets the client's
    /// original id back; everything else (server notifications, replies to
    /// ids we never issued) passes through verbatim.
    pub fn reconcile(&mut self, mut payload: Value) -> (Value, Option<PendingRequest>) {
        let entry = payload
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| self.pending.remove(&id));

        if let Some(entry) = &entry {
            restore_original_id(&mut payload, entry);
        }
        (payload, entry)
    }

    /// Drains every entry older than `limit`.
    pub fn expire_older_than(&mut self, limit: Duration) -> Vec<PendingRequest> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.submitted_at) >= limit)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}

/// The JSON-RPC internal-error reply the proxy fabricates when a transport
/// operation fails. Addressed the way the client addressed us: if the
/// client sent no id, the reply carries none.
pub fn error_reply(original_id: Option<&Value>, reason: impl fmt::Display) -> Value {
    let mut reply = json!({
        "jsonrpc": "2.0",
        "error": {
            "code": -32603,
            "message": format!("Proxy error: {reason}"),
        }
    });
    if let (Some(fields), Some(id)) = (reply.as_object_mut(), original_id) {
        fields.insert("id".to_string(), id.clone());
    }
    reply
}

fn restore_original_id(payload: &mut Value, entry: &PendingRequest) {
    if let Some(fields) = payload.as_object_mut() {
        match entry.original_id() {
            Some(id) => {
                fields.insert("id".to_string(), id.clone());
            }
            None => {
                fields.remove("id");
            }
        }
    }
}
