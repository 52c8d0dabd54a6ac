//! Request/reply transport between the supervisor and its workers.
//!
//! The supervisor binds one [`Receiver`] on a random loopback port inside
//! a configured range; every worker connects one [`Sender`] to it. The
//! wire format is one JSON document per line: an [`Event`] up, an
//! [`EventReply`] back.
//!
//! # Reliability
//!
//! The sender retries: each logical message gets up to [`NUM_RETRIES`]
//! attempts with a [`REQUEST_TIMEOUT`] reply deadline per attempt. A
//! timed-out attempt closes and reopens the connection and re-issues the
//! event under a fresh event id (same source id), so the supervisor can
//! tell a retry from a new message. A sender that exhausts its retries
//! gives up with [`IpcError::RetriesExhausted`]; the worker then exits
//! non-zero and the supervisor reaps it.
//!
//! On the receiver side a `recv` timeout is fatal for the whole run — all
//! processes live on one machine, so a silent channel means something is
//! badly wrong.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::test::event::{Event, EventFactory, EventReply};

/// Per-attempt deadline for a sender waiting on its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Send attempts per logical message.
pub const NUM_RETRIES: usize = 5;

/// Default lower bound of the receiver's port range.
pub const DEFAULT_MIN_PORT: u16 = 5556;

/// Default upper bound (inclusive) of the receiver's port range.
pub const DEFAULT_MAX_PORT: u16 = 5656;

/// The receiver's port range: `TEST_DRIVER_MIN_PORT` /
/// `TEST_DRIVER_MAX_PORT` when set, built-in defaults otherwise.
pub fn port_range_from_env() -> (u16, u16) {
    let parse = |name: &str, default: u16| {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };
    (
        parse("TEST_DRIVER_MIN_PORT", DEFAULT_MIN_PORT),
        parse("TEST_DRIVER_MAX_PORT", DEFAULT_MAX_PORT),
    )
}

/// Result type for transport operations.
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors from the event transport.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid port range: min {min} > max {max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("no free port in range [{min}, {max}]")]
    NoAvailablePort { min: u16, max: u16 },

    /// The supervisor waited too long for any worker event. Fatal for
    /// the run.
    #[error("runner client unresponsive")]
    RecvTimeout,

    /// One send attempt missed its reply deadline. The sender retries.
    #[error("timed out waiting for event reply")]
    RequestTimeout,

    #[error("connection closed")]
    Closed,

    #[error("no event is awaiting a reply")]
    NoPendingReply,

    #[error("unable to receive response from test driver after {0} attempts")]
    RetriesExhausted(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

type PendingEvent = (Event, oneshot::Sender<EventReply>);

/// Supervisor-side endpoint: accepts worker connections and surfaces
/// their events one at a time.
///
/// Strict request/reply: after [`recv`](Self::recv) hands out an event,
/// [`send`](Self::send) routes the reply back to the connection that
/// produced it. Events from other workers queue up in the meantime.
#[derive(Debug)]
pub struct Receiver {
    port: u16,
    events: mpsc::Receiver<PendingEvent>,
    pending: Option<oneshot::Sender<EventReply>>,
    accept_task: JoinHandle<()>,
}

impl Receiver {
    /// Binds to a random free loopback port in `[min_port, max_port]`,
    /// inclusive. Gives up after `2 x range` attempts.
    pub async fn bind(min_port: u16, max_port: u16) -> IpcResult<Self> {
        if min_port > max_port {
            return Err(IpcError::InvalidPortRange {
                min: min_port,
                max: max_port,
            });
        }

        let range = usize::from(max_port - min_port) + 1;
        for _ in 0..(2 * range) {
            let port = rand::thread_rng().gen_range(min_port..=max_port);
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(Self::from_listener(listener, port)),
                Err(e) => debug!(port, "port unavailable: {e}"),
            }
        }
        Err(IpcError::NoAvailablePort {
            min: min_port,
            max: max_port,
        })
    }

    fn from_listener(listener: TcpListener, port: u16) -> Self {
        let (tx, events) = mpsc::channel(64);
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        Self {
            port,
            events,
            pending: None,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits up to `timeout` for the next worker event.
    pub async fn recv(&mut self, timeout: Duration) -> IpcResult<Event> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => Err(IpcError::RecvTimeout),
            Ok(None) => Err(IpcError::Closed),
            Ok(Some((event, reply_tx))) => {
                self.pending = Some(reply_tx);
                Ok(event)
            }
        }
    }

    /// Replies to the most recently received event.
    pub fn send(&mut self, reply: EventReply) -> IpcResult<()> {
        let reply_tx = self.pending.take().ok_or(IpcError::NoPendingReply)?;
        if reply_tx.send(reply).is_err() {
            // The worker's connection died before the reply went out; it
            // will retry the event on a fresh connection.
            warn!("worker connection dropped before reply could be delivered");
        }
        Ok(())
    }

    /// Shuts the endpoint down. In-flight connections are dropped.
    pub fn close(self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<PendingEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(connection_loop(stream, tx.clone()));
            }
            Err(e) => {
                warn!("error accepting worker connection: {e}");
            }
        }
    }
}

async fn connection_loop(stream: TcpStream, tx: mpsc::Sender<PendingEvent>) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("dropping worker connection on framing error: {e}");
                return;
            }
        };
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("ignoring undecodable event: {e}");
                continue;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send((event, reply_tx)).await.is_err() {
            return; // receiver gone, run is over
        }
        let Ok(reply) = reply_rx.await else {
            return; // supervisor dropped the reply slot; worker will retry
        };
        let encoded = match serde_json::to_string(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode reply: {e}");
                return;
            }
        };
        if framed.send(encoded).await.is_err() {
            return;
        }
    }
}

/// Worker-side endpoint: one synchronous-feeling `send` per event, with
/// retry and reconnection baked in.
pub struct Sender {
    endpoint: String,
    factory: EventFactory,
    connection: Option<Framed<TcpStream, LinesCodec>>,
}

impl Sender {
    pub fn new(host: impl Into<String>, port: u16, factory: EventFactory) -> Self {
        Self {
            endpoint: format!("{}:{port}", host.into()),
            factory,
            connection: None,
        }
    }

    /// Sends one event and waits for its reply, retrying with a fresh
    /// event id on every timed-out or failed attempt.
    pub async fn send(&mut self, event: Event) -> IpcResult<EventReply> {
        let mut event = event;
        for attempt in 0..NUM_RETRIES {
            if attempt > 0 {
                event = self.factory.copy(&event);
            }
            match self.try_send(&event).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!(
                        attempt,
                        event = event.kind.name(),
                        "send attempt failed, reconnecting: {e}"
                    );
                    self.connection = None;
                }
            }
        }
        Err(IpcError::RetriesExhausted(NUM_RETRIES))
    }

    async fn try_send(&mut self, event: &Event) -> IpcResult<EventReply> {
        if self.connection.is_none() {
            let stream = TcpStream::connect(&self.endpoint).await?;
            self.connection = Some(Framed::new(stream, LinesCodec::new()));
        }
        let connection = self.connection.as_mut().expect("connected above");

        connection.send(serde_json::to_string(event)?).await?;

        match tokio::time::timeout(REQUEST_TIMEOUT, connection.next()).await {
            Err(_) => Err(IpcError::RequestTimeout),
            Ok(None) => Err(IpcError::Closed),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(line))) => Ok(serde_json::from_str(&line)?),
        }
    }

    /// Drops the connection. The next send reconnects.
    pub fn close(&mut self) {
        self.connection = None;
    }
}
