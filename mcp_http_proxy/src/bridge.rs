//! The bridge proper: one event loop translating line-delimited JSON-RPC on
//! stdio into HTTP posts against a remote server, with replies arriving
//! either synchronously or over a persistent SSE push channel.
//!
//! Concurrency model: a single logical thread. The loop suspends on stdin
//! reads, on in-flight HTTP responses, and on the next pushed event; none of
//! them blocks the others, and the correlation table is only ever touched
//! between those suspension points, so it needs no locking. Replies reach
//! stdout in completion order, not submission order.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use owo_colors::OwoColorize;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::Result;
use crate::framing::LineBuffer;
use crate::session::{ProxySession, error_reply};
use crate::sse::{SseEvent, spawn_event_stream};

/// Runtime settings for one bridge process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Logical name of the remote server; both endpoint URLs derive from it.
    pub server_identity: String,
    /// HTTP origin the centralized server listens on.
    pub base_url: Url,
    /// When set, pending entries older than this are answered with a
    /// synthetic timeout error by a periodic sweep. Off by default: the
    /// base behavior keeps unanswered entries until shutdown.
    pub request_timeout: Option<Duration>,
    /// Mirror wire traffic to stderr with colors.
    pub colored_output: bool,
}

impl ProxyConfig {
    pub fn new(server_identity: impl Into<String>, base_url: Url) -> Self {
        Self {
            server_identity: server_identity.into(),
            base_url,
            request_timeout: None,
            colored_output: false,
        }
    }
}

/// What an outbound POST resolved to.
enum PostOutcome {
    /// 2xx with a JSON body: the synchronous reply.
    Reply(Value),
    /// 2xx announcing delivery over the event stream.
    Deferred,
    /// Non-2xx status, a transport error, or an undecodable body. The
    /// original id rides along because the failure reply must be addressed
    /// with it even if the table entry has meanwhile gone.
    Failed {
        reason: String,
        original_id: Option<Value>,
    },
}

type InFlight = FuturesUnordered<BoxFuture<'static, (u64, PostOutcome)>>;

#[derive(Clone, Copy)]
enum EchoTag {
    ToServer,
    FromServer,
    ProxyFault,
}

/// Owns every transport end of the relay. Constructed once per process,
/// consumed by [`Bridge::run`].
pub struct Bridge {
    session: ProxySession,
    http: reqwest::Client,
    message_url: Url,
    sse_url: Url,
    request_timeout: Option<Duration>,
    colored_output: bool,
}

impl Bridge {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let session = ProxySession::new(config.server_identity, config.base_url);
        let message_url = session.message_url()?;
        let sse_url = session.sse_url()?;
        Ok(Self {
            session,
            http: reqwest::Client::new(),
            message_url,
            sse_url,
            request_timeout: config.request_timeout,
            colored_output: config.colored_output,
        })
    }

    /// Drives the relay until the input stream closes or a termination
    /// signal arrives. Generic over the stdio pair so tests can drive it
    /// over in-memory pipes.
    pub async fn run<R, W>(mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(
            server = %self.session.server_identity(),
            message_url = %self.message_url,
            "bridge starting"
        );

        // The connect attempt runs in the reader task; a dead push channel
        // is not fatal because direct HTTP replies work without it.
        let mut events = Some(spawn_event_stream(self.http.clone(), self.sse_url.clone()));

        let mut stdin_chunk = vec![0u8; 8 * 1024];
        let mut stdin_lines = LineBuffer::new();
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut sweep = self.request_timeout.map(sweep_interval);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                read = reader.read(&mut stdin_chunk) => {
                    match read {
                        Ok(0) => {
                            info!("input closed, shutting down");
                            break;
                        }
                        Ok(n) => {
                            for line in stdin_lines.feed(&stdin_chunk[..n]) {
                                self.handle_client_line(&line, &mut in_flight);
                            }
                        }
                        Err(error) => {
                            error!(%error, "failed reading input, shutting down");
                            break;
                        }
                    }
                }
                Some((correlation_id, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle_post_outcome(correlation_id, outcome, &mut writer).await?;
                }
                event = next_event(events.as_mut()), if events.is_some() => {
                    match event {
                        Some(event) => self.handle_server_event(event, &mut writer).await?,
                        None => {
                            debug!("push channel closed, continuing with direct replies only");
                            events = None;
                        }
                    }
                }
                _ = tick(sweep.as_mut()), if sweep.is_some() => {
                    self.sweep_expired(&mut writer).await?;
                }
                _ = &mut shutdown => {
                    info!("termination signal received, shutting down");
                    break;
                }
            }
        }

        drop(events);
        let discarded = self.session.pending_count();
        if discarded > 0 {
            info!(discarded, "dropping unanswered requests");
        }
        info!(server = %self.session.server_identity(), "bridge stopped");
        Ok(())
    }

    /// One complete line off stdin: parse it, register it, and launch the
    /// POST. Nothing here writes to stdout, and nothing here waits for the
    /// server, so a burst of lines becomes a burst of concurrent posts.
    fn handle_client_line(&mut self, line: &str, in_flight: &mut InFlight) {
        if line.trim().is_empty() {
            return;
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping unparseable input line");
                return;
            }
        };
        if !message.is_object() {
            warn!("dropping input line that is not a JSON object");
            return;
        }

        self.echo(EchoTag::ToServer, line);

        let original_id = message.get("id").cloned();
        let (correlation_id, outbound) = self.session.register(message);
        debug!(
            correlation_id,
            pending = self.session.pending_count(),
            "forwarding client message"
        );

        let client = self.http.clone();
        let url = self.message_url.clone();
        in_flight.push(Box::pin(async move {
            let outcome = post_message(client, url, outbound, original_id).await;
            (correlation_id, outcome)
        }));
    }

    async fn handle_post_outcome<W>(
        &mut self,
        correlation_id: u64,
        outcome: PostOutcome,
        writer: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match outcome {
            PostOutcome::Reply(reply) => {
                let (reply, entry) = self.session.settle(correlation_id, reply);
                match entry {
                    Some(entry) => debug!(
                        correlation_id,
                        elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                        pending = self.session.pending_count(),
                        "synchronous reply"
                    ),
                    None => debug!(correlation_id, "reply for a request no longer pending"),
                }
                self.write_protocol_line(writer, &reply, EchoTag::FromServer)
                    .await?;
            }
            PostOutcome::Deferred => {
                debug!(correlation_id, "reply deferred to the event stream");
            }
            PostOutcome::Failed {
                reason,
                original_id,
            } => {
                warn!(correlation_id, %reason, "client message failed");
                // The base behavior keeps the entry; with the sweep on it
                // must go now, or the sweep would answer this id twice.
                if self.request_timeout.is_some() {
                    self.session.complete(correlation_id);
                }
                let reply = error_reply(original_id.as_ref(), &reason);
                self.write_protocol_line(writer, &reply, EchoTag::ProxyFault)
                    .await?;
            }
        }
        Ok(())
    }

    /// One event off the push channel: protocol events are parsed, matched
    /// against the pending table, and forwarded; everything the server sends
    /// reaches the client whether the proxy asked for it or not.
    async fn handle_server_event<W>(&mut self, event: SseEvent, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !event.is_message() {
            debug!(
                event_type = event.event_type.as_deref().unwrap_or_default(),
                "ignoring non-protocol event"
            );
            return Ok(());
        }

        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "dropping unparseable event payload");
                return Ok(());
            }
        };

        let (payload, entry) = self.session.reconcile(payload);
        match entry {
            Some(entry) => debug!(
                correlation_id = entry.correlation_id,
                elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                pending = self.session.pending_count(),
                "pushed reply matched"
            ),
            None => debug!("forwarding unsolicited server message"),
        }
        self.write_protocol_line(writer, &payload, EchoTag::FromServer)
            .await
    }

    /// Answers every entry older than the configured limit with a synthetic
    /// timeout error. Entries born from id-less client messages have no
    /// address to send an error to and are dropped silently.
    async fn sweep_expired<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(limit) = self.request_timeout else {
            return Ok(());
        };
        for entry in self.session.expire_older_than(limit) {
            warn!(
                correlation_id = entry.correlation_id,
                waited_ms = entry.submitted_at.elapsed().as_millis() as u64,
                "request timed out"
            );
            if let Some(id) = entry.original_id() {
                let reason = format!("request timed out after {}s", limit.as_secs());
                let reply = error_reply(Some(id), reason);
                self.write_protocol_line(writer, &reply, EchoTag::ProxyFault)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stdout carries exclusively protocol traffic: one JSON document per
    /// line, flushed immediately.
    async fn write_protocol_line<W>(
        &self,
        writer: &mut W,
        payload: &Value,
        tag: EchoTag,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let line = serde_json::to_string(payload)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        self.echo(tag, &line);
        Ok(())
    }

    fn echo(&self, tag: EchoTag, payload: &str) {
        if !self.colored_output {
            return;
        }
        let timestamp = format!("[{}]", chrono::Local::now().format("%H:%M:%S%.3f"));
        let label = format!("[{}]", self.session.server_identity());
        let pretty = serde_json::from_str::<Value>(payload)
            .and_then(|parsed| serde_json::to_string_pretty(&parsed))
            .unwrap_or_else(|_| payload.to_string());
        match tag {
            EchoTag::ToServer => {
                let arrow = "→ server:";
                eprintln!("{} {} {}\n{}", timestamp, label.cyan(), arrow.cyan(), pretty.cyan());
            }
            EchoTag::FromServer => {
                let arrow = "← server:";
                eprintln!("{} {} {}\n{}", timestamp, label.green(), arrow.green(), pretty.green());
            }
            EchoTag::ProxyFault => {
                eprintln!("{} {} {}\n{}", timestamp, label.red(), "⚠ proxy:".red(), pretty.red());
            }
        }
    }
}

/// Bridges the process's real stdio to the configured server. Returns when
/// stdin closes or a termination signal arrives.
pub async fn run_bridge(config: ProxyConfig) -> Result<()> {
    let bridge = Bridge::new(config)?;
    bridge.run(tokio::io::stdin(), tokio::io::stdout()).await
}

async fn post_message(
    client: reqwest::Client,
    url: Url,
    outbound: Value,
    original_id: Option<Value>,
) -> PostOutcome {
    let response = match client.post(url).json(&outbound).send().await {
        Ok(response) => response,
        Err(error) => {
            return PostOutcome::Failed {
                reason: error.to_string(),
                original_id,
            };
        }
    };

    let status = response.status();
    if !status.is_success() {
        return PostOutcome::Failed {
            reason: format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
            original_id,
        };
    }

    // An event-stream content type means the body is not the answer; the
    // reply will arrive over the push channel instead.
    if is_event_stream(response.headers()) {
        return PostOutcome::Deferred;
    }

    match response.json::<Value>().await {
        Ok(reply) => PostOutcome::Reply(reply),
        Err(error) => PostOutcome::Failed {
            reason: error.to_string(),
            original_id,
        },
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"))
}

fn sweep_interval(limit: Duration) -> Interval {
    let period = Duration::from_secs((limit.as_secs() / 4).max(1));
    tokio::time::interval(period)
}

async fn next_event(events: Option<&mut mpsc::Receiver<SseEvent>>) -> Option<SseEvent> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending::<Option<SseEvent>>().await,
    }
}

async fn tick(sweep: Option<&mut Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves when the process is told to stop. SIGTERM matters here because
/// MCP clients terminate their child servers with it.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "SIGTERM handler unavailable, watching SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
