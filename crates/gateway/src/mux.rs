//! Connection multiplexer.
//!
//! This module fans frames out from sessions to their attached client
//! connections. Each connection owns a bounded outbound queue; broadcasting
//! never awaits, so one slow client cannot stall a session's other viewers.
//! A full queue either sheds its oldest frame or closes the connection,
//! depending on the configured overflow policy.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use protocol::{Frame, InputPolicy, SessionId};
use tokio::sync::Notify;

use crate::config::OverflowPolicy;

/// Unique identifier for a client connection.
pub type ConnId = String;

/// Why an outbound queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal teardown.
    Normal,
    /// The queue overflowed under the disconnect policy.
    Overflow,
    /// The reaper evicted the connection as idle.
    Idle,
}

impl CloseReason {
    fn as_u8(self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Overflow => 1,
            CloseReason::Idle => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CloseReason::Overflow,
            2 => CloseReason::Idle,
            _ => CloseReason::Normal,
        }
    }
}

/// Statistics about a connection's frame handling.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Frames enqueued successfully.
    pub frames_enqueued: u64,
    /// Frames shed because the queue was full.
    pub frames_dropped: u64,
    /// Whether the connection is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// Bounded outbound frame queue for one client connection.
///
/// Producers push without awaiting; the connection's writer task pops. When
/// the queue is full, [`OverflowPolicy::DropOldest`] sheds the frame at the
/// head so the newest output wins, while [`OverflowPolicy::Disconnect`]
/// closes the queue and the writer tears the connection down.
pub struct OutboundQueue {
    inner: std::sync::Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    close_reason: AtomicU8,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl OutboundQueue {
    /// Creates a queue with the given capacity and overflow policy.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            close_reason: AtomicU8::new(CloseReason::Normal.as_u8()),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        })
    }

    /// Enqueues a frame without blocking.
    ///
    /// Returns false if the queue is closed, including the case where this
    /// push overflowed it under the disconnect policy.
    pub fn push(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if !self.backpressured.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            dropped = self.dropped.load(Ordering::Relaxed),
                            "Connection is backpressured, shedding oldest frames"
                        );
                    }
                }
                OverflowPolicy::Disconnect => {
                    drop(inner);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.close_with(CloseReason::Overflow);
                    return false;
                }
            }
        }

        inner.push_back(frame);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Dequeues the next frame, waiting for one to arrive.
    ///
    /// Returns None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = inner.pop_front() {
                    if inner.is_empty() && self.backpressured.swap(false, Ordering::Relaxed) {
                        tracing::debug!("Connection recovered from backpressure");
                    }
                    return Some(frame);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Closes the queue for normal teardown.
    pub fn close(&self) {
        self.close_with(CloseReason::Normal);
    }

    /// Closes the queue recording why.
    pub fn close_with(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_reason.store(reason.as_u8(), Ordering::SeqCst);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Why the queue was closed. Meaningful only after [`is_closed`] is true.
    ///
    /// [`is_closed`]: OutboundQueue::is_closed
    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.close_reason.load(Ordering::SeqCst))
    }

    /// Returns a snapshot of the queue statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            frames_enqueued: self.enqueued.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection state held by the multiplexer.
struct ClientPort {
    queue: Arc<OutboundQueue>,
    /// Sessions this connection is attached to.
    sessions: std::sync::Mutex<HashSet<SessionId>>,
    /// Last client activity (Unix epoch milliseconds).
    last_activity: AtomicU64,
}

/// Per-session routing state.
struct SessionRoute {
    /// Connections attached to this session.
    members: HashSet<ConnId>,
    /// Input arbitration policy.
    policy: InputPolicy,
    /// Holder of the write slot under the exclusive policy.
    writer: Option<ConnId>,
}

/// Routes frames between sessions and client connections.
pub struct Multiplexer {
    clients: DashMap<ConnId, ClientPort>,
    routes: DashMap<SessionId, SessionRoute>,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
}

impl Multiplexer {
    /// Creates a multiplexer with the given per-connection queue settings.
    pub fn new(queue_capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            clients: DashMap::new(),
            routes: DashMap::new(),
            queue_capacity,
            overflow_policy,
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Registers a new connection and returns its outbound queue.
    pub fn register(&self, conn_id: &ConnId) -> Arc<OutboundQueue> {
        let queue = OutboundQueue::new(self.queue_capacity, self.overflow_policy);
        self.clients.insert(
            conn_id.clone(),
            ClientPort {
                queue: Arc::clone(&queue),
                sessions: std::sync::Mutex::new(HashSet::new()),
                last_activity: AtomicU64::new(Self::now_millis()),
            },
        );
        tracing::debug!(conn_id = %conn_id, "Registered connection");
        queue
    }

    /// Removes a connection and detaches it from every session.
    ///
    /// Returns the sessions that now have no attached connections; the
    /// caller tells the session host about those.
    pub fn unregister(&self, conn_id: &ConnId) -> Vec<SessionId> {
        let port = match self.clients.remove(conn_id) {
            Some((_, port)) => port,
            None => return Vec::new(),
        };
        port.queue.close();

        let sessions: Vec<SessionId> = port
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        let mut emptied = Vec::new();
        for session_id in sessions {
            if self.drop_member(&session_id, conn_id) {
                emptied.push(session_id);
            }
        }

        tracing::debug!(conn_id = %conn_id, "Unregistered connection");
        emptied
    }

    /// Attaches a connection to a session.
    ///
    /// The first member of an exclusive session takes the write slot.
    pub fn attach(&self, conn_id: &ConnId, session_id: &SessionId, policy: InputPolicy) {
        let mut route = self
            .routes
            .entry(session_id.clone())
            .or_insert_with(|| SessionRoute {
                members: HashSet::new(),
                policy,
                writer: None,
            });
        route.policy = policy;
        route.members.insert(conn_id.clone());
        if route.policy == InputPolicy::Exclusive && route.writer.is_none() {
            route.writer = Some(conn_id.clone());
        }
        drop(route);

        if let Some(port) = self.clients.get(conn_id) {
            port.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_id.clone());
        }

        tracing::debug!(conn_id = %conn_id, session_id = %session_id, "Attached to session");
    }

    /// Detaches a connection from a session.
    ///
    /// Returns true if the session now has no attached connections.
    pub fn detach(&self, conn_id: &ConnId, session_id: &SessionId) -> bool {
        if let Some(port) = self.clients.get(conn_id) {
            port.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(session_id);
        }
        self.drop_member(session_id, conn_id)
    }

    fn drop_member(&self, session_id: &SessionId, conn_id: &ConnId) -> bool {
        let mut emptied = false;
        if let Some(mut route) = self.routes.get_mut(session_id) {
            route.members.remove(conn_id);
            // The write slot passes to any remaining member.
            if route.writer.as_ref() == Some(conn_id) {
                route.writer = route.members.iter().next().cloned();
            }
            emptied = route.members.is_empty();
        }
        if emptied {
            self.routes.remove(session_id);
        }
        emptied
    }

    /// Removes a session's route entirely, returning its former members.
    pub fn drop_route(&self, session_id: &SessionId) -> Vec<ConnId> {
        let members: Vec<ConnId> = match self.routes.remove(session_id) {
            Some((_, route)) => route.members.into_iter().collect(),
            None => return Vec::new(),
        };
        for conn_id in &members {
            if let Some(port) = self.clients.get(conn_id) {
                port.sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(session_id);
            }
        }
        members
    }

    /// Whether a connection may write input to a session.
    ///
    /// Shared sessions accept input from any member; exclusive sessions only
    /// from the holder of the write slot.
    pub fn may_write(&self, conn_id: &ConnId, session_id: &SessionId) -> bool {
        match self.routes.get(session_id) {
            Some(route) => match route.policy {
                InputPolicy::Shared => route.members.contains(conn_id),
                InputPolicy::Exclusive => route.writer.as_deref() == Some(conn_id.as_str()),
            },
            None => false,
        }
    }

    /// Fans a frame out to every connection attached to a session.
    ///
    /// Never awaits. Returns the number of connections that accepted the
    /// frame; connections whose queue closed on overflow are torn down by
    /// their own writer task. Delivery counts as activity: a viewer that is
    /// receiving output is not idle, even if it never sends anything.
    pub fn broadcast(&self, session_id: &SessionId, frame: &Frame) -> usize {
        let members: Vec<ConnId> = match self.routes.get(session_id) {
            Some(route) => route.members.iter().cloned().collect(),
            None => return 0,
        };

        let now = Self::now_millis();
        let mut delivered = 0;
        for conn_id in members {
            if let Some(port) = self.clients.get(&conn_id) {
                if port.queue.push(frame.clone()) {
                    port.last_activity.store(now, Ordering::Relaxed);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Sends a frame to one connection. Returns false if it is gone or its
    /// queue rejected the frame.
    pub fn send_to(&self, conn_id: &ConnId, frame: Frame) -> bool {
        match self.clients.get(conn_id) {
            Some(port) => port.queue.push(frame),
            None => false,
        }
    }

    /// Records client activity for the idle reaper.
    pub fn touch(&self, conn_id: &ConnId) {
        if let Some(port) = self.clients.get(conn_id) {
            port.last_activity
                .store(Self::now_millis(), Ordering::Relaxed);
        }
    }

    /// Milliseconds since the connection last showed activity.
    pub fn idle_millis(&self, conn_id: &ConnId) -> Option<u64> {
        self.clients.get(conn_id).map(|port| {
            Self::now_millis().saturating_sub(port.last_activity.load(Ordering::Relaxed))
        })
    }

    /// Closes a connection's queue with the given reason. Its writer task
    /// notices and tears the connection down.
    pub fn close_conn(&self, conn_id: &ConnId, reason: CloseReason) {
        if let Some(port) = self.clients.get(conn_id) {
            port.queue.close_with(reason);
        }
    }

    /// All registered connection ids.
    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Sessions that currently have at least one attached connection.
    pub fn routed_sessions(&self) -> Vec<SessionId> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of connections attached to a session.
    pub fn member_count(&self, session_id: &SessionId) -> usize {
        self.routes
            .get(session_id)
            .map(|route| route.members.len())
            .unwrap_or(0)
    }

    /// Number of registered connections.
    pub fn conn_count(&self) -> usize {
        self.clients.len()
    }

    /// Statistics for one connection's outbound queue.
    pub fn conn_stats(&self, conn_id: &ConnId) -> Option<QueueStats> {
        self.clients.get(conn_id).map(|port| port.queue.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn mux(capacity: usize, policy: OverflowPolicy) -> Multiplexer {
        Multiplexer::new(capacity, policy)
    }

    fn output(session: &str, seq: u64, data: &[u8]) -> Frame {
        Frame::output(session, seq, data.to_vec())
    }

    #[tokio::test]
    async fn test_queue_push_pop_in_order() {
        let queue = OutboundQueue::new(8, OverflowPolicy::DropOldest);

        assert!(queue.push(output("s", 0, b"a")));
        assert!(queue.push(output("s", 1, b"b")));

        assert_eq!(queue.pop().await, Some(output("s", 0, b"a")));
        assert_eq!(queue.pop().await, Some(output("s", 1, b"b")));
    }

    #[tokio::test]
    async fn test_queue_pop_waits_for_push() {
        let queue = OutboundQueue::new(8, OverflowPolicy::DropOldest);

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.push(Frame::Ping));

        let frame = timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Some(Frame::Ping));
    }

    #[tokio::test]
    async fn test_queue_drop_oldest_sheds_head() {
        let queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);

        assert!(queue.push(output("s", 0, b"old")));
        assert!(queue.push(output("s", 1, b"mid")));
        assert!(queue.push(output("s", 2, b"new"))); // sheds seq 0

        let stats = queue.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert!(stats.is_backpressured);

        assert_eq!(queue.pop().await, Some(output("s", 1, b"mid")));
        assert_eq!(queue.pop().await, Some(output("s", 2, b"new")));
        assert!(!queue.stats().is_backpressured);
    }

    #[tokio::test]
    async fn test_queue_disconnect_policy_closes_on_overflow() {
        let queue = OutboundQueue::new(1, OverflowPolicy::Disconnect);

        assert!(queue.push(output("s", 0, b"a")));
        assert!(!queue.push(output("s", 1, b"b")));

        assert!(queue.is_closed());
        assert_eq!(queue.close_reason(), CloseReason::Overflow);

        // Already-queued frames still drain before None.
        assert_eq!(queue.pop().await, Some(output("s", 0, b"a")));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_queue_close_wakes_popper() {
        let queue = OutboundQueue::new(8, OverflowPolicy::DropOldest);

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let frame = timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, None);
    }

    #[tokio::test]
    async fn test_queue_backpressure_clears_after_drain() {
        let queue = OutboundQueue::new(1, OverflowPolicy::DropOldest);

        queue.push(Frame::Ping);
        queue.push(Frame::Ping); // sheds
        assert!(queue.stats().is_backpressured);

        let _ = queue.pop().await;
        assert!(!queue.stats().is_backpressured);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let q1 = mux.register(&"conn-1".to_string());
        let q2 = mux.register(&"conn-2".to_string());
        mux.attach(&"conn-1".to_string(), &sid, InputPolicy::Shared);
        mux.attach(&"conn-2".to_string(), &sid, InputPolicy::Shared);

        let frame = output(&sid, 0, b"hello");
        assert_eq!(mux.broadcast(&sid, &frame), 2);

        assert_eq!(q1.pop().await, Some(frame.clone()));
        assert_eq!(q2.pop().await, Some(frame));
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_member() {
        let mux = mux(64, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let q = mux.register(&"conn-1".to_string());
        mux.attach(&"conn-1".to_string(), &sid, InputPolicy::Shared);

        for seq in 0..10 {
            mux.broadcast(&sid, &output(&sid, seq, format!("{seq}").as_bytes()));
        }
        for seq in 0..10 {
            match q.pop().await {
                Some(Frame::Output(out)) => assert_eq!(out.seq, seq),
                other => panic!("expected output, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_member_does_not_block_others() {
        let mux = mux(2, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let fast = mux.register(&"fast".to_string());
        let _slow = mux.register(&"slow".to_string());
        mux.attach(&"fast".to_string(), &sid, InputPolicy::Shared);
        mux.attach(&"slow".to_string(), &sid, InputPolicy::Shared);

        // The slow member never drains; the fast one keeps up.
        for seq in 0..10 {
            mux.broadcast(&sid, &output(&sid, seq, b"x"));
            let _ = fast.pop().await;
        }

        let slow_stats = mux.conn_stats(&"slow".to_string()).unwrap();
        assert!(slow_stats.frames_dropped > 0);

        let fast_stats = mux.conn_stats(&"fast".to_string()).unwrap();
        assert_eq!(fast_stats.frames_dropped, 0);
        assert_eq!(fast_stats.frames_enqueued, 10);
    }

    #[tokio::test]
    async fn test_exclusive_policy_write_slot() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let _q1 = mux.register(&"first".to_string());
        let _q2 = mux.register(&"second".to_string());
        mux.attach(&"first".to_string(), &sid, InputPolicy::Exclusive);
        mux.attach(&"second".to_string(), &sid, InputPolicy::Exclusive);

        assert!(mux.may_write(&"first".to_string(), &sid));
        assert!(!mux.may_write(&"second".to_string(), &sid));

        // The slot passes when the holder detaches.
        mux.detach(&"first".to_string(), &sid);
        assert!(mux.may_write(&"second".to_string(), &sid));
    }

    #[tokio::test]
    async fn test_shared_policy_everyone_writes() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let _q1 = mux.register(&"a".to_string());
        let _q2 = mux.register(&"b".to_string());
        mux.attach(&"a".to_string(), &sid, InputPolicy::Shared);
        mux.attach(&"b".to_string(), &sid, InputPolicy::Shared);

        assert!(mux.may_write(&"a".to_string(), &sid));
        assert!(mux.may_write(&"b".to_string(), &sid));
        assert!(!mux.may_write(&"stranger".to_string(), &sid));
    }

    #[tokio::test]
    async fn test_detach_reports_emptied_session() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let _q1 = mux.register(&"a".to_string());
        let _q2 = mux.register(&"b".to_string());
        mux.attach(&"a".to_string(), &sid, InputPolicy::Shared);
        mux.attach(&"b".to_string(), &sid, InputPolicy::Shared);

        assert!(!mux.detach(&"a".to_string(), &sid));
        assert!(mux.detach(&"b".to_string(), &sid));
        assert_eq!(mux.member_count(&sid), 0);
    }

    #[tokio::test]
    async fn test_unregister_detaches_everywhere() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let s1 = "sess-1".to_string();
        let s2 = "sess-2".to_string();

        let _q1 = mux.register(&"a".to_string());
        let _q2 = mux.register(&"b".to_string());
        mux.attach(&"a".to_string(), &s1, InputPolicy::Shared);
        mux.attach(&"a".to_string(), &s2, InputPolicy::Shared);
        mux.attach(&"b".to_string(), &s2, InputPolicy::Shared);

        let emptied = mux.unregister(&"a".to_string());
        // sess-1 lost its only member; sess-2 still has conn b.
        assert_eq!(emptied, vec![s1.clone()]);
        assert_eq!(mux.member_count(&s2), 1);
        assert_eq!(mux.conn_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_route_clears_members() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let sid = "sess-1".to_string();

        let _q = mux.register(&"a".to_string());
        mux.attach(&"a".to_string(), &sid, InputPolicy::Shared);

        let members = mux.drop_route(&sid);
        assert_eq!(members, vec!["a".to_string()]);
        assert_eq!(mux.member_count(&sid), 0);
        assert_eq!(mux.broadcast(&sid, &Frame::Ping), 0);
    }

    #[tokio::test]
    async fn test_close_conn_records_reason() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let q = mux.register(&"a".to_string());

        mux.close_conn(&"a".to_string(), CloseReason::Idle);
        assert!(q.is_closed());
        assert_eq!(q.close_reason(), CloseReason::Idle);
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn test_touch_resets_idle_clock() {
        let mux = mux(8, OverflowPolicy::DropOldest);
        let _q = mux.register(&"a".to_string());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let before = mux.idle_millis(&"a".to_string()).unwrap();
        assert!(before >= 30);

        mux.touch(&"a".to_string());
        let after = mux.idle_millis(&"a".to_string()).unwrap();
        assert!(after < before);
    }
}
