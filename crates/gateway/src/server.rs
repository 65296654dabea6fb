//! WebSocket gateway server.
//!
//! The gateway listens on two addresses. End-user clients connect to the
//! client listener, open with an attach handshake, and then exchange frames
//! with their session. The session host dials the upstream listener and
//! carries frames for every session over that one link.
//!
//! The gateway never interprets terminal bytes; it resolves attachments,
//! enforces write policy, fans output out through the multiplexer, and
//! notifies the session host when a session loses its last viewer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Attach, ErrorFrame, ErrorKind, Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::mux::{CloseReason, ConnId, Multiplexer};
use crate::reaper;

/// Outbound frame queue depth for the upstream link writer.
const UPSTREAM_QUEUE: usize = 1024;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Outcome of an attach forwarded to the session host.
type AttachOutcome = Result<Attach, ErrorFrame>;

/// Snapshot of the gateway for status reporting.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    /// Registered client connections.
    pub client_connections: usize,
    /// Sessions with at least one attached client.
    pub routed_sessions: usize,
    /// Whether a session host link is up.
    pub upstream_connected: bool,
}

/// State of the single link to the session host.
///
/// Attach requests are correlated with their replies here: a reply carries
/// the resolved session and user ids, so waiters are keyed by whichever id
/// the request named.
struct Upstream {
    tx: tokio::sync::RwLock<Option<mpsc::Sender<Frame>>>,
    pending: DashMap<String, Vec<oneshot::Sender<AttachOutcome>>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

impl Upstream {
    fn new() -> Self {
        Self {
            tx: tokio::sync::RwLock::new(None),
            pending: DashMap::new(),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Frame) -> bool {
        match &*self.tx.read().await {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Installs a fresh link and returns its generation.
    async fn install(&self, tx: mpsc::Sender<Frame>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.tx.write().await = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        generation
    }

    /// Tears the link down if it is still the current one.
    async fn teardown(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.tx.write().await = None;
        self.fail_all(ErrorKind::UpstreamUnavailable, "session host link lost");
    }

    fn session_key(session_id: &str) -> String {
        format!("sid:{session_id}")
    }

    fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    /// Forwards an attach to the session host and waits for its verdict.
    async fn request_attach(&self, attach: Attach, wait: Duration) -> AttachOutcome {
        let key = match (&attach.session_id, &attach.user_id) {
            (Some(session_id), _) => Self::session_key(session_id),
            (None, Some(user_id)) => Self::user_key(user_id),
            (None, None) => {
                return Err(ErrorFrame {
                    kind: ErrorKind::ProtocolError,
                    session_id: None,
                    message: "attach names neither a session nor a user".to_string(),
                })
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.entry(key.clone()).or_default().push(reply_tx);

        if !self.send(Frame::Attach(attach)).await {
            self.pending.remove(&key);
            return Err(ErrorFrame {
                kind: ErrorKind::UpstreamUnavailable,
                session_id: None,
                message: "no session host connected".to_string(),
            });
        }

        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&key);
                Err(ErrorFrame {
                    kind: ErrorKind::UpstreamUnavailable,
                    session_id: None,
                    message: "session host did not answer the attach".to_string(),
                })
            }
        }
    }

    /// Completes waiters matching an attach confirmation.
    fn resolve(&self, reply: &Attach) {
        let mut keys = Vec::new();
        if let Some(session_id) = &reply.session_id {
            keys.push(Self::session_key(session_id));
        }
        if let Some(user_id) = &reply.user_id {
            keys.push(Self::user_key(user_id));
        }
        for key in keys {
            if let Some((_, waiters)) = self.pending.remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(reply.clone()));
                }
            }
        }
    }

    /// Fails waiters matching an error from the session host.
    ///
    /// Errors that name a session fail that session's waiters. Session-less
    /// errors cannot be correlated, so every waiter learns of the failure.
    fn reject(&self, error: &ErrorFrame) {
        match &error.session_id {
            Some(session_id) => {
                if let Some((_, waiters)) = self.pending.remove(&Self::session_key(session_id)) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            }
            None => self.fail_all(error.kind, &error.message),
        }
    }

    fn fail_all(&self, kind: ErrorKind, message: &str) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, waiters)) = self.pending.remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Err(ErrorFrame {
                        kind,
                        session_id: None,
                        message: message.to_string(),
                    }));
                }
            }
        }
    }
}

/// The gateway: two listeners, a multiplexer, and one upstream link.
pub struct Gateway {
    config: Config,
    mux: Arc<Multiplexer>,
    upstream: Arc<Upstream>,
    client_listener: TcpListener,
    upstream_listener: TcpListener,
}

impl Gateway {
    /// Binds both listeners. Addresses with port 0 get ephemeral ports,
    /// readable afterwards via [`client_addr`] and [`upstream_addr`].
    ///
    /// [`client_addr`]: Gateway::client_addr
    /// [`upstream_addr`]: Gateway::upstream_addr
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let client_listener = TcpListener::bind(&config.listen.client_addr).await?;
        let upstream_listener = TcpListener::bind(&config.listen.upstream_addr).await?;

        let mux = Arc::new(Multiplexer::new(
            config.relay.queue_capacity,
            config.relay.overflow_policy,
        ));

        Ok(Self {
            config,
            mux,
            upstream: Arc::new(Upstream::new()),
            client_listener,
            upstream_listener,
        })
    }

    /// Address the client listener is bound to.
    pub fn client_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Address the upstream listener is bound to.
    pub fn upstream_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.upstream_listener.local_addr()?)
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            client_connections: self.mux.conn_count(),
            routed_sessions: self.mux.routed_sessions().len(),
            upstream_connected: self.upstream.is_connected(),
        }
    }

    /// Runs both accept loops and the idle reaper until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let shared = Arc::new(self);

        reaper::start(
            Arc::clone(&shared.mux),
            shared.config.sweep_interval(),
            shared.config.idle_timeout(),
            cancel.clone(),
        );

        let client_accept = {
            let gateway = Arc::clone(&shared);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = gateway.client_listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                let gateway = Arc::clone(&gateway);
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    gateway.handle_client(stream, addr, cancel).await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Client accept failed");
                            }
                        }
                    }
                }
            })
        };

        let upstream_accept = {
            let gateway = Arc::clone(&shared);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = gateway.upstream_listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                let gateway = Arc::clone(&gateway);
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    gateway.handle_upstream(stream, addr, cancel).await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Upstream accept failed");
                            }
                        }
                    }
                }
            })
        };

        let _ = client_accept.await;
        let _ = upstream_accept.await;
    }

    // ---- upstream side ----

    async fn handle_upstream(&self, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Upstream handshake failed");
                return;
            }
        };
        tracing::info!(addr = %addr, "Session host connected");

        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(UPSTREAM_QUEUE);
        let generation = self.upstream.install(tx.clone()).await;

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // A reconnecting session host has no memory of our attachments;
        // ask it to resume the pump for each routed session. Resumes are
        // not attachments, so viewer counts stay accurate.
        for session_id in self.mux.routed_sessions() {
            let _ = tx.send(Frame::resume_session(session_id)).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => match Frame::decode(&bytes) {
                        Ok(frame) => self.handle_upstream_frame(frame, &tx).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "Undecodable frame from session host");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Upstream link error");
                        break;
                    }
                }
            }
        }

        drop(tx);
        let _ = writer.await;
        self.upstream.teardown(generation).await;
        tracing::info!(addr = %addr, "Session host disconnected");
    }

    async fn handle_upstream_frame(&self, frame: Frame, tx: &mpsc::Sender<Frame>) {
        match frame {
            Frame::Output(ref output) => {
                let session_id = output.session_id.clone();
                self.mux.broadcast(&session_id, &frame);
            }
            Frame::Attach(reply) => {
                if reply.session_id.is_some() {
                    self.upstream.resolve(&reply);
                } else {
                    tracing::debug!("Attach reply without a session id, ignoring");
                }
            }
            Frame::Error(error) => {
                self.upstream.reject(&error);
                if error.kind == ErrorKind::Gone {
                    if let Some(session_id) = &error.session_id {
                        // The session died; every viewer learns and the
                        // route disappears.
                        let members = self.mux.drop_route(session_id);
                        tracing::info!(
                            session_id = %session_id,
                            viewers = members.len(),
                            "Session terminated upstream"
                        );
                        for conn_id in members {
                            self.mux.send_to(&conn_id, Frame::Error(error.clone()));
                        }
                    }
                }
            }
            Frame::Ping => {
                let _ = tx.send(Frame::Pong).await;
            }
            Frame::Pong => {}
            Frame::Input(_) | Frame::Resize(_) | Frame::Detach(_) => {
                tracing::debug!("Unexpected frame kind from session host, ignoring");
            }
        }
    }

    // ---- client side ----

    async fn handle_client(&self, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Client handshake failed");
                return;
            }
        };

        let conn_id: ConnId = Uuid::new_v4().to_string();
        tracing::info!(conn_id = %conn_id, addr = %addr, "Client connected");

        let (mut sink, mut source) = ws.split();

        // The opening frame must be an attach; anything else is a protocol
        // error and the connection never registers.
        let attach = match self.await_opening_attach(&mut source).await {
            Ok(attach) => attach,
            Err(error) => {
                Self::send_now(&mut sink, Frame::Error(error)).await;
                let _ = sink.close().await;
                return;
            }
        };

        let reply = match self.resolve_attach(attach).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::info!(conn_id = %conn_id, kind = ?error.kind, "Attach rejected");
                Self::send_now(&mut sink, Frame::Error(error)).await;
                let _ = sink.close().await;
                return;
            }
        };

        let queue = self.mux.register(&conn_id);
        self.attach_conn(&conn_id, &reply);
        queue.push(Frame::Attach(reply));

        // Relay until either side closes or the queue is shut.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = queue.pop() => match frame {
                    Some(frame) => {
                        let bytes = match frame.encode() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                tracing::warn!(conn_id = %conn_id, error = %e, "Dropping unencodable frame");
                                continue;
                            }
                        };
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        match queue.close_reason() {
                            CloseReason::Overflow => {
                                tracing::warn!(conn_id = %conn_id, "Disconnecting backpressured client");
                                Self::send_now(&mut sink, Frame::error(
                                    ErrorKind::Backpressure,
                                    None,
                                    "outbound queue overflowed",
                                )).await;
                            }
                            CloseReason::Idle => {
                                tracing::info!(conn_id = %conn_id, "Evicting idle client");
                            }
                            CloseReason::Normal => {}
                        }
                        break;
                    }
                },
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => match Frame::decode(&bytes) {
                        Ok(frame) => self.handle_client_frame(&conn_id, frame).await,
                        Err(e) => {
                            tracing::debug!(conn_id = %conn_id, error = %e, "Undecodable frame from client");
                            self.mux.send_to(&conn_id, Frame::error(
                                ErrorKind::ProtocolError,
                                None,
                                e.to_string(),
                            ));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "Client link error");
                        break;
                    }
                }
            }
        }

        let _ = sink.close().await;
        self.cleanup_conn(&conn_id).await;
        tracing::info!(conn_id = %conn_id, "Client disconnected");
    }

    /// Waits for the opening attach frame, bounded by the attach timeout.
    async fn await_opening_attach(&self, source: &mut WsSource) -> Result<Attach, ErrorFrame> {
        let deadline = tokio::time::sleep(self.config.attach_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ErrorFrame {
                        kind: ErrorKind::ProtocolError,
                        session_id: None,
                        message: "no attach within the handshake window".to_string(),
                    });
                }
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        return match Frame::decode(&bytes) {
                            Ok(Frame::Attach(attach)) => Ok(attach),
                            Ok(other) => Err(ErrorFrame {
                                kind: ErrorKind::ProtocolError,
                                session_id: None,
                                message: format!(
                                    "expected an attach frame to open, got {:?}",
                                    std::mem::discriminant(&other)
                                ),
                            }),
                            Err(e) => Err(ErrorFrame {
                                kind: ErrorKind::ProtocolError,
                                session_id: None,
                                message: e.to_string(),
                            }),
                        };
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ErrorFrame {
                            kind: ErrorKind::ProtocolError,
                            session_id: None,
                            message: "connection closed before attach".to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(ErrorFrame {
                            kind: ErrorKind::ProtocolError,
                            session_id: None,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Resolves an attach against the session host, degraded mode included.
    async fn resolve_attach(&self, attach: Attach) -> AttachOutcome {
        if !self.upstream.is_connected() {
            return Err(ErrorFrame {
                kind: ErrorKind::UpstreamUnavailable,
                session_id: attach.session_id,
                message: "no session host connected".to_string(),
            });
        }
        self.upstream
            .request_attach(attach, self.config.attach_timeout())
            .await
    }

    fn attach_conn(&self, conn_id: &ConnId, reply: &Attach) {
        if let Some(session_id) = &reply.session_id {
            self.mux
                .attach(conn_id, session_id, reply.policy.unwrap_or_default());
        }
    }

    async fn handle_client_frame(&self, conn_id: &ConnId, frame: Frame) {
        self.mux.touch(conn_id);

        match frame {
            Frame::Input(input) => {
                if !self.mux.may_write(conn_id, &input.session_id) {
                    self.mux.send_to(
                        conn_id,
                        Frame::error(
                            ErrorKind::ProtocolError,
                            Some(input.session_id),
                            "input not permitted on this session",
                        ),
                    );
                    return;
                }
                let session_id = input.session_id.clone();
                if !self.upstream.send(Frame::Input(input)).await {
                    tracing::warn!(
                        conn_id = %conn_id,
                        session_id = %session_id,
                        "Input dropped: session host link down"
                    );
                    self.mux.send_to(
                        conn_id,
                        Frame::error(
                            ErrorKind::UpstreamUnavailable,
                            Some(session_id),
                            "session host link down, input dropped",
                        ),
                    );
                }
            }
            Frame::Resize(resize) => {
                // Any viewer may resize; the terminal takes the last geometry.
                let session_id = resize.session_id.clone();
                if !self.upstream.send(Frame::Resize(resize)).await {
                    self.mux.send_to(
                        conn_id,
                        Frame::error(
                            ErrorKind::UpstreamUnavailable,
                            Some(session_id),
                            "session host link down, resize dropped",
                        ),
                    );
                }
            }
            Frame::Attach(attach) => {
                // A connection may attach to more sessions after opening.
                match self.resolve_attach(attach).await {
                    Ok(reply) => {
                        self.attach_conn(conn_id, &reply);
                        self.mux.send_to(conn_id, Frame::Attach(reply));
                    }
                    Err(error) => {
                        self.mux.send_to(conn_id, Frame::Error(error));
                    }
                }
            }
            Frame::Detach(detach) => {
                if self.mux.detach(conn_id, &detach.session_id) {
                    let _ = self.upstream.send(Frame::Detach(detach)).await;
                }
            }
            Frame::Ping => {
                self.mux.send_to(conn_id, Frame::Pong);
            }
            Frame::Pong => {}
            Frame::Output(_) | Frame::Error(_) => {
                self.mux.send_to(
                    conn_id,
                    Frame::error(
                        ErrorKind::ProtocolError,
                        None,
                        "clients do not send this frame kind",
                    ),
                );
            }
        }
    }

    async fn cleanup_conn(&self, conn_id: &ConnId) {
        for session_id in self.mux.unregister(conn_id) {
            tracing::debug!(
                conn_id = %conn_id,
                session_id = %session_id,
                "Last viewer gone, detaching upstream"
            );
            let _ = self.upstream.send(Frame::detach(session_id)).await;
        }
    }

    /// Sends one frame directly on a sink, best effort.
    async fn send_now(sink: &mut WsSink, frame: Frame) {
        if let Ok(bytes) = frame.encode() {
            let _ = sink.send(Message::Binary(bytes)).await;
        }
    }
}
