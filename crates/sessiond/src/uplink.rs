//! Gateway uplink: one WebSocket carrying frames for every session.
//!
//! The session host dials the gateway's upstream listener and keeps the link
//! alive forever, reconnecting with capped exponential backoff. Frames for
//! all sessions are multiplexed over the single link and addressed by
//! session id. Each session with at least one past attachment gets an output
//! pump that forwards terminal bytes upstream with per-session sequence
//! numbers; pumps keep draining while the session is detached so no output
//! is lost between attachments.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use protocol::{Attach, ErrorKind, Frame, SessionId};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::registry::SessionRegistry;

/// Outbound frame queue depth for the link writer.
const OUTBOUND_QUEUE: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The persistent connection from this host to the gateway.
pub struct Uplink {
    registry: Arc<SessionRegistry>,
    url: String,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Uplink {
    /// Creates an uplink from the gateway link configuration.
    pub fn new(registry: Arc<SessionRegistry>, config: &GatewayConfig) -> Self {
        Self {
            registry,
            url: config.url.clone(),
            initial_backoff: Duration::from_millis(config.reconnect_initial_ms),
            max_backoff: Duration::from_millis(config.reconnect_max_ms),
        }
    }

    /// Dials the gateway and services the link until cancelled.
    ///
    /// A lost link is retried with exponential backoff; sessions are left
    /// untouched across reconnects.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = self.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_async(&self.url) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    tracing::info!(url = %self.url, "Connected to gateway");
                    backoff = self.initial_backoff;
                    self.run_link(ws, &cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(url = %self.url, "Gateway link lost, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "Failed to connect to gateway");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Services one established link until it drops or we are cancelled.
    async fn run_link(&self, ws: WsStream, cancel: &CancellationToken) {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

        // Pumps and the writer live only as long as this link.
        let link_token = cancel.child_token();
        let pumps: Arc<DashMap<SessionId, ()>> = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
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

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(bytes))) => match Frame::decode(&bytes) {
                        Ok(frame) => {
                            self.handle_frame(frame, &outbound_tx, &pumps, &link_token)
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Undecodable frame from gateway");
                            let _ = outbound_tx
                                .send(Frame::error(ErrorKind::ProtocolError, None, e.to_string()))
                                .await;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // WebSocket-level ping/pong and text are not part of
                        // the protocol; the library answers pings itself.
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Gateway link error");
                        break;
                    }
                }
            }
        }

        link_token.cancel();
        drop(outbound_tx);
        let _ = writer.await;
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        outbound: &mpsc::Sender<Frame>,
        pumps: &Arc<DashMap<SessionId, ()>>,
        link_token: &CancellationToken,
    ) {
        match frame {
            Frame::Attach(attach) => {
                self.handle_attach(attach, outbound, pumps, link_token).await;
            }
            Frame::Detach(detach) => {
                if let Err(e) = self.registry.detach(&detach.session_id) {
                    tracing::debug!(
                        session_id = %detach.session_id,
                        error = %e,
                        "Detach for unknown session"
                    );
                }
            }
            Frame::Input(input) => {
                if let Err(e) = self.registry.write(&input.session_id, &input.data).await {
                    tracing::warn!(session_id = %input.session_id, error = %e, "Input rejected");
                    let _ = outbound
                        .send(Frame::error(
                            e.wire_kind(),
                            Some(input.session_id),
                            e.to_string(),
                        ))
                        .await;
                }
            }
            Frame::Resize(resize) => {
                if let Err(e) = self
                    .registry
                    .resize(&resize.session_id, resize.rows, resize.cols)
                    .await
                {
                    tracing::warn!(session_id = %resize.session_id, error = %e, "Resize rejected");
                    let _ = outbound
                        .send(Frame::error(
                            e.wire_kind(),
                            Some(resize.session_id),
                            e.to_string(),
                        ))
                        .await;
                }
            }
            Frame::Ping => {
                let _ = outbound.send(Frame::Pong).await;
            }
            Frame::Pong => {}
            Frame::Output(_) | Frame::Error(_) => {
                tracing::debug!("Unexpected frame kind from gateway, ignoring");
            }
        }
    }

    async fn handle_attach(
        &self,
        attach: Attach,
        outbound: &mpsc::Sender<Frame>,
        pumps: &Arc<DashMap<SessionId, ()>>,
        link_token: &CancellationToken,
    ) {
        let requested = attach.session_id.clone();

        if attach.version != protocol::PROTOCOL_VERSION {
            tracing::warn!(
                version = attach.version,
                "Attach with unsupported protocol version"
            );
            let _ = outbound
                .send(Frame::error(
                    ErrorKind::ProtocolError,
                    requested,
                    format!("unsupported protocol version {}", attach.version),
                ))
                .await;
            return;
        }

        // A resume restarts the output pump after a link reconnect. The
        // viewers behind it were already counted; do not count them again.
        if attach.resume {
            let Some(session_id) = requested else {
                tracing::debug!("Resume without a session id, ignoring");
                return;
            };
            match self.registry.get(&session_id) {
                Ok(_) => self.ensure_pump(&session_id, outbound, pumps, link_token),
                Err(e) => {
                    tracing::info!(session_id = %session_id, error = %e, "Resume rejected");
                    let _ = outbound
                        .send(Frame::error(e.wire_kind(), Some(session_id), e.to_string()))
                        .await;
                }
            }
            return;
        }

        match self
            .registry
            .attach(attach.session_id.as_deref(), attach.user_id.as_deref())
        {
            Ok(entry) => {
                self.ensure_pump(&entry.id, outbound, pumps, link_token);
                let _ = outbound
                    .send(Frame::attach_reply(
                        entry.id.clone(),
                        entry.user_id.clone(),
                        entry.policy,
                    ))
                    .await;
            }
            Err(e) => {
                tracing::info!(session_id = ?requested, error = %e, "Attach rejected");
                let _ = outbound
                    .send(Frame::error(e.wire_kind(), requested, e.to_string()))
                    .await;
            }
        }
    }

    /// Starts the output pump for a session if this link does not have one.
    fn ensure_pump(
        &self,
        session_id: &SessionId,
        outbound: &mpsc::Sender<Frame>,
        pumps: &Arc<DashMap<SessionId, ()>>,
        link_token: &CancellationToken,
    ) {
        use dashmap::mapref::entry::Entry;

        match pumps.entry(session_id.clone()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                vacant.insert(());
            }
        }

        let entry = match self.registry.get(session_id) {
            Ok(entry) => entry,
            Err(_) => {
                pumps.remove(session_id);
                return;
            }
        };

        let registry = Arc::clone(&self.registry);
        let outbound = outbound.clone();
        let pumps = Arc::clone(pumps);
        let link_token = link_token.clone();
        let id = session_id.clone();

        tokio::spawn(async move {
            let mut rx = entry.bridge().subscribe();
            let terminated = entry.bridge().terminated();

            loop {
                tokio::select! {
                    _ = link_token.cancelled() => break,
                    _ = terminated.cancelled() => {
                        registry.note_exit(&id);
                        let _ = outbound
                            .send(Frame::error(
                                ErrorKind::Gone,
                                Some(id.clone()),
                                "session terminated",
                            ))
                            .await;
                        break;
                    }
                    result = rx.recv() => match result {
                        Ok(data) => {
                            let seq = entry.next_seq();
                            if outbound
                                .send(Frame::output(id.clone(), seq, data))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                session_id = %id,
                                skipped = skipped,
                                "Output pump lagged, dropping chunks"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            registry.note_exit(&id);
                            let _ = outbound
                                .send(Frame::error(
                                    ErrorKind::Gone,
                                    Some(id.clone()),
                                    "session terminated",
                                ))
                                .await;
                            break;
                        }
                    }
                }
            }

            pumps.remove(&id);
            tracing::debug!(session_id = %id, "Output pump stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockFactory;
    use crate::registry::RegistryConfig;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    type ServerWs = WebSocketStream<TcpStream>;

    const TICK: Duration = Duration::from_secs(5);

    async fn accept_ws(listener: &TcpListener) -> ServerWs {
        let (stream, _) = timeout(TICK, listener.accept()).await.unwrap().unwrap();
        timeout(TICK, tokio_tungstenite::accept_async(stream))
            .await
            .unwrap()
            .unwrap()
    }

    async fn send_frame(ws: &mut ServerWs, frame: Frame) {
        ws.send(Message::Binary(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    async fn recv_frame(ws: &mut ServerWs) -> Frame {
        loop {
            let msg = timeout(TICK, ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("link closed")
                .expect("link error");
            if let Message::Binary(bytes) = msg {
                return Frame::decode(&bytes).unwrap();
            }
        }
    }

    struct Harness {
        factory: Arc<MockFactory>,
        registry: Arc<SessionRegistry>,
        listener: TcpListener,
        cancel: CancellationToken,
    }

    impl Harness {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());

            let factory = MockFactory::new();
            let registry = Arc::new(SessionRegistry::new(
                Arc::clone(&factory) as Arc<dyn crate::bridge::BridgeFactory>,
                RegistryConfig::default(),
            ));

            let config = GatewayConfig {
                url,
                reconnect_initial_ms: 10,
                reconnect_max_ms: 100,
            };
            let uplink = Uplink::new(Arc::clone(&registry), &config);
            let cancel = CancellationToken::new();
            let run_cancel = cancel.clone();
            tokio::spawn(async move { uplink.run(run_cancel).await });

            Self {
                factory,
                registry,
                listener,
                cancel,
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[tokio::test]
    async fn test_attach_by_user_creates_and_confirms() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::attach_user("alice")).await;

        match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => {
                assert!(reply.session_id.is_some());
                assert_eq!(reply.user_id.as_deref(), Some("alice"));
                assert!(reply.policy.is_some());
            }
            other => panic!("expected attach reply, got {:?}", other),
        }
        assert_eq!(harness.registry.live_count(), 1);
    }

    #[tokio::test]
    async fn test_input_reaches_bridge_in_order() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        let session_id = match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => reply.session_id.unwrap(),
            other => panic!("expected attach reply, got {:?}", other),
        };

        send_frame(&mut gateway, Frame::input(session_id.clone(), b"ls\n".to_vec())).await;
        send_frame(&mut gateway, Frame::input(session_id, b"pwd\n".to_vec())).await;

        // Input is applied asynchronously; poll until both writes landed.
        let bridge = harness.factory.last();
        timeout(TICK, async {
            loop {
                if bridge.writes.lock().unwrap().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("writes did not arrive");

        let writes = bridge.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![b"ls\n".to_vec(), b"pwd\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_output_pumped_with_sequence_numbers() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        let session_id = match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => reply.session_id.unwrap(),
            other => panic!("expected attach reply, got {:?}", other),
        };

        let bridge = harness.factory.last();
        bridge.emit(b"first");
        bridge.emit(b"second");

        match recv_frame(&mut gateway).await {
            Frame::Output(out) => {
                assert_eq!(out.session_id, session_id);
                assert_eq!(out.seq, 0);
                assert_eq!(out.data, b"first");
            }
            other => panic!("expected output, got {:?}", other),
        }
        match recv_frame(&mut gateway).await {
            Frame::Output(out) => {
                assert_eq!(out.seq, 1);
                assert_eq!(out.data, b"second");
            }
            other => panic!("expected output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_death_reported_as_gone() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        let session_id = match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => reply.session_id.unwrap(),
            other => panic!("expected attach reply, got {:?}", other),
        };

        harness.factory.last().die();

        match recv_frame(&mut gateway).await {
            Frame::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Gone);
                assert_eq!(e.session_id.as_deref(), Some(session_id.as_str()));
            }
            other => panic!("expected gone error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_unknown_session_reports_not_found() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::attach_session("no-such-session")).await;

        match recv_frame(&mut gateway).await {
            Frame::Error(e) => {
                assert_eq!(e.kind, ErrorKind::NotFound);
                assert_eq!(e.session_id.as_deref(), Some("no-such-session"));
            }
            other => panic!("expected not-found error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::Ping).await;
        assert_eq!(recv_frame(&mut gateway).await, Frame::Pong);
    }

    #[tokio::test]
    async fn test_reconnects_after_link_drop() {
        let harness = Harness::start().await;

        let gateway = accept_ws(&harness.listener).await;
        drop(gateway);

        // The uplink should dial again and the session arena should be intact
        // across the drop.
        let mut gateway = accept_ws(&harness.listener).await;
        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => assert_eq!(reply.user_id.as_deref(), Some("alice")),
            other => panic!("expected attach reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_restarts_pump_without_counting_a_viewer() {
        let harness = Harness::start().await;

        let mut gateway = accept_ws(&harness.listener).await;
        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        let session_id = match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => reply.session_id.unwrap(),
            other => panic!("expected attach reply, got {:?}", other),
        };
        drop(gateway);

        let mut gateway = accept_ws(&harness.listener).await;
        send_frame(&mut gateway, Frame::resume_session(session_id.clone())).await;

        // The pump is back and forwards output, but the viewer count still
        // reflects the one real attachment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.factory.last().emit(b"resumed");
        match recv_frame(&mut gateway).await {
            Frame::Output(out) => assert_eq!(out.data, b"resumed"),
            other => panic!("expected output, got {:?}", other),
        }

        let entry = harness.registry.get(&session_id).unwrap();
        assert_eq!(entry.attached(), 1);
    }

    #[tokio::test]
    async fn test_resume_of_unknown_session_reports_not_found() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        send_frame(&mut gateway, Frame::resume_session("no-such-session")).await;

        match recv_frame(&mut gateway).await {
            Frame::Error(e) => {
                assert_eq!(e.kind, ErrorKind::NotFound);
                assert_eq!(e.session_id.as_deref(), Some("no-such-session"));
            }
            other => panic!("expected not-found error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_with_wrong_version_rejected() {
        let harness = Harness::start().await;
        let mut gateway = accept_ws(&harness.listener).await;

        let attach = Attach {
            session_id: None,
            user_id: Some("alice".to_string()),
            policy: None,
            version: protocol::PROTOCOL_VERSION + 1,
            resume: false,
        };
        send_frame(&mut gateway, Frame::Attach(attach)).await;

        match recv_frame(&mut gateway).await {
            Frame::Error(e) => assert_eq!(e.kind, ErrorKind::ProtocolError),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(harness.registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_reattach_after_reconnect_resumes_sequence() {
        let harness = Harness::start().await;

        let mut gateway = accept_ws(&harness.listener).await;
        send_frame(&mut gateway, Frame::attach_user("alice")).await;
        let session_id = match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => reply.session_id.unwrap(),
            other => panic!("expected attach reply, got {:?}", other),
        };

        let bridge = harness.factory.last();
        bridge.emit(b"before drop");
        match recv_frame(&mut gateway).await {
            Frame::Output(out) => assert_eq!(out.seq, 0),
            other => panic!("expected output, got {:?}", other),
        }
        drop(gateway);

        let mut gateway = accept_ws(&harness.listener).await;
        send_frame(&mut gateway, Frame::attach_session(session_id.clone())).await;
        match recv_frame(&mut gateway).await {
            Frame::Attach(reply) => {
                assert_eq!(reply.session_id.as_deref(), Some(session_id.as_str()))
            }
            other => panic!("expected attach reply, got {:?}", other),
        }

        // Give the fresh pump a moment to subscribe before emitting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.emit(b"after drop");
        match recv_frame(&mut gateway).await {
            Frame::Output(out) => {
                assert_eq!(out.seq, 1);
                assert_eq!(out.data, b"after drop");
            }
            other => panic!("expected output, got {:?}", other),
        }
    }
}
