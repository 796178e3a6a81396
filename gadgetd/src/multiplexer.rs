//! Fan-out of the shared kernel event stream to per-session sinks.
//!
//! A single drain loop resolves each event's mount namespace through the
//! registry and pushes it into every attached session that targets the
//! container. Sinks are bounded and drop their oldest entry when full, so a
//! slow consumer never stalls the loop.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::Stream;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};

use crate::container::ContainerId;
use crate::event::{AttributedEvent, ContainerRef, Event, GadgetKind, SharedEvent};
use crate::registry::ContainerRegistry;
use crate::session::SessionId;
use crate::telemetry;

pub const DEFAULT_SESSION_BUFFER: usize = 1024;

struct SinkState {
    queue: VecDeque<SharedEvent>,
    closed: bool,
}

/// Bounded, drop-oldest output buffer of one session.
pub struct SessionSink {
    capacity: usize,
    state: Mutex<SinkState>,
    notify: Notify,
    accepted: AtomicU64,
    dropped: AtomicU64,
    generation: AtomicU64,
}

impl SessionSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SinkState {
                queue: VecDeque::with_capacity(capacity.clamp(1, DEFAULT_SESSION_BUFFER)),
                closed: false,
            }),
            notify: Notify::new(),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns false once the sink is closed.
    pub fn push(&self, event: SharedEvent) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return false;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                telemetry::record_delivery_dropped();
            }
            state.queue.push_back(event);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        true
    }

    /// Refuse further events. Already buffered events can still be drained.
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<SharedEvent> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events taken into the buffer, counting ones later evicted. What the
    /// consumer can still see is `accepted - dropped` minus what it popped.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Start a new consumer. Any previous stream on this sink ends.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify.notify_waiters();
        EventStream {
            sink: Arc::clone(self),
            generation,
        }
    }
}

/// Lazy sequence of a session's events; ends when the session stops or a
/// newer stream supersedes it.
pub struct EventStream {
    sink: Arc<SessionSink>,
    generation: u64,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<SharedEvent> {
        loop {
            let notified = self.sink.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if self.sink.generation.load(Ordering::Acquire) != self.generation {
                return None;
            }
            {
                let mut state = self.sink.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.sink.dropped()
    }

    pub fn into_stream(self) -> impl Stream<Item = SharedEvent> {
        futures::stream::unfold(self, |mut s| async move {
            let event = s.next().await?;
            Some((event, s))
        })
    }
}

struct Route {
    session: SessionId,
    kind: GadgetKind,
    sink: Arc<SessionSink>,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The namespace is not (yet) known to the registry.
    Unattributed,
    /// Attributed, but no attached session wants it.
    Unrouted,
    /// Pushed into this many sessions.
    Delivered(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub received: u64,
    pub attributed: u64,
    pub unattributed: u64,
}

pub struct Multiplexer {
    registry: Arc<ContainerRegistry>,
    routes: RwLock<HashMap<ContainerId, Vec<Route>>>,
    received: AtomicU64,
    attributed: AtomicU64,
    unattributed: AtomicU64,
}

impl Multiplexer {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        Self {
            registry,
            routes: RwLock::new(HashMap::new()),
            received: AtomicU64::new(0),
            attributed: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
        }
    }

    /// Start forwarding `kind` events of `container` to `sink`.
    pub fn route(
        &self,
        session: &SessionId,
        kind: GadgetKind,
        container: &ContainerId,
        sink: &Arc<SessionSink>,
    ) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let entries = routes.entry(container.clone()).or_default();
        if entries.iter().any(|r| &r.session == session) {
            return;
        }
        entries.push(Route {
            session: session.clone(),
            kind,
            sink: Arc::clone(sink),
        });
        debug!("Route added: {} -> session {}", container, session);
    }

    /// Stop forwarding one container's events to a session.
    pub fn unroute(&self, session: &SessionId, container: &ContainerId) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = routes.get_mut(container) {
            entries.retain(|r| &r.session != session);
            if entries.is_empty() {
                routes.remove(container);
            }
        }
    }

    /// Remove every route of a session.
    ///
    /// Takes the write lock, so it returns only after any in-flight dispatch
    /// has finished; no event reaches the session afterwards.
    pub fn unroute_session(&self, session: &SessionId) {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.retain(|_, entries| {
            entries.retain(|r| &r.session != session);
            !entries.is_empty()
        });
    }

    pub fn dispatch(&self, event: Event) -> Dispatch {
        self.received.fetch_add(1, Ordering::Relaxed);

        let container = match self.registry.lookup_by_namespace(event.mount_ns) {
            Ok(c) => c,
            Err(_) => {
                self.unattributed.fetch_add(1, Ordering::Relaxed);
                telemetry::record_unattributed_event();
                return Dispatch::Unattributed;
            }
        };
        self.attributed.fetch_add(1, Ordering::Relaxed);
        telemetry::record_attributed_event(event.kind());

        let kind = event.kind();
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = routes.get(&container.id) else {
            return Dispatch::Unrouted;
        };

        let shared: SharedEvent = Arc::new(AttributedEvent {
            container: ContainerRef::from(container.as_ref()),
            event,
        });
        let mut delivered = 0;
        for route in entries.iter().filter(|r| r.kind == kind) {
            if route.sink.push(Arc::clone(&shared)) {
                delivered += 1;
            }
        }

        if delivered == 0 {
            Dispatch::Unrouted
        } else {
            Dispatch::Delivered(delivered)
        }
    }

    /// Drain loop; runs until every sender of `events` is dropped.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        info!("Event multiplexer started");
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        info!("Event multiplexer stopped");
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            received: self.received.load(Ordering::Relaxed),
            attributed: self.attributed.load(Ordering::Relaxed),
            unattributed: self.unattributed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, NamespaceId};
    use crate::event::{EventPayload, SyscallRecord};
    use std::time::Duration;

    fn syscall(ns: u64, nr: u64) -> Event {
        Event {
            timestamp_ns: nr,
            mount_ns: NamespaceId(ns),
            pid: 1,
            comm: "sh".into(),
            payload: EventPayload::Syscall(SyscallRecord::new(nr, 0)),
        }
    }

    fn setup() -> (Arc<ContainerRegistry>, Multiplexer) {
        let registry = Arc::new(ContainerRegistry::new());
        registry.add(Container::new("a", 10, 10)).unwrap();
        registry.add(Container::new("b", 20, 20)).unwrap();
        let mux = Multiplexer::new(Arc::clone(&registry));
        (registry, mux)
    }

    fn nrs(sink: &SessionSink) -> Vec<u64> {
        std::iter::from_fn(|| sink.try_pop())
            .map(|e| match &e.event.payload {
                EventPayload::Syscall(r) => r.nr,
                EventPayload::Connection(_) => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_unknown_namespace_is_counted_and_dropped() {
        let (_, mux) = setup();
        assert_eq!(mux.dispatch(syscall(99, 1)), Dispatch::Unattributed);
        assert_eq!(mux.stats().unattributed, 1);
        assert_eq!(mux.stats().attributed, 0);
    }

    #[test]
    fn test_events_reach_only_targeting_sessions() {
        let (_, mux) = setup();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        let sink1 = Arc::new(SessionSink::new(16));
        let sink2 = Arc::new(SessionSink::new(16));
        mux.route(&s1, GadgetKind::SyscallTrace, &ContainerId::new("a"), &sink1);
        mux.route(&s2, GadgetKind::SyscallTrace, &ContainerId::new("b"), &sink2);

        assert_eq!(mux.dispatch(syscall(10, 1)), Dispatch::Delivered(1));
        assert_eq!(mux.dispatch(syscall(20, 2)), Dispatch::Delivered(1));

        let e = sink1.try_pop().unwrap();
        assert_eq!(e.container.id, ContainerId::new("a"));
        assert!(sink1.try_pop().is_none());
        assert_eq!(nrs(&sink2), vec![2]);
    }

    #[test]
    fn test_kind_mismatch_is_not_delivered() {
        let (_, mux) = setup();
        let sink = Arc::new(SessionSink::new(16));
        mux.route(
            &SessionId::from("net"),
            GadgetKind::NetworkTrace,
            &ContainerId::new("a"),
            &sink,
        );
        assert_eq!(mux.dispatch(syscall(10, 1)), Dispatch::Unrouted);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_per_namespace_fifo_is_preserved() {
        let (_, mux) = setup();
        let sink = Arc::new(SessionSink::new(1024));
        let s = SessionId::from("s");
        mux.route(&s, GadgetKind::SyscallTrace, &ContainerId::new("a"), &sink);
        mux.route(&s, GadgetKind::SyscallTrace, &ContainerId::new("b"), &sink);

        for i in 0..100 {
            mux.dispatch(syscall(if i % 3 == 0 { 20 } else { 10 }, i));
        }

        let all = nrs(&sink);
        let from_a: Vec<u64> = all.iter().copied().filter(|n| n % 3 != 0).collect();
        let from_b: Vec<u64> = all.iter().copied().filter(|n| n % 3 == 0).collect();
        assert!(from_a.windows(2).all(|w| w[0] < w[1]));
        assert!(from_b.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn test_slow_consumer_drops_oldest_without_affecting_others() {
        let (_, mux) = setup();
        let slow = Arc::new(SessionSink::new(4));
        let fast = Arc::new(SessionSink::new(1024));
        mux.route(
            &SessionId::from("slow"),
            GadgetKind::SyscallTrace,
            &ContainerId::new("a"),
            &slow,
        );
        mux.route(
            &SessionId::from("fast"),
            GadgetKind::SyscallTrace,
            &ContainerId::new("a"),
            &fast,
        );

        let mut last_dropped = 0;
        for i in 0..10 {
            mux.dispatch(syscall(10, i));
            assert!(slow.dropped() >= last_dropped);
            last_dropped = slow.dropped();
        }

        assert_eq!(slow.dropped(), 6);
        assert_eq!(slow.accepted(), 10);
        assert_eq!(slow.len() as u64, slow.accepted() - slow.dropped());
        assert_eq!(nrs(&slow), vec![6, 7, 8, 9]);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(nrs(&fast), (0..10u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_delivery_after_unroute() {
        let (_, mux) = setup();
        let sink = Arc::new(SessionSink::new(16));
        let s = SessionId::from("s");
        mux.route(&s, GadgetKind::SyscallTrace, &ContainerId::new("a"), &sink);
        mux.dispatch(syscall(10, 1));

        mux.unroute_session(&s);
        sink.close();
        assert_eq!(mux.dispatch(syscall(10, 2)), Dispatch::Unrouted);
        assert_eq!(nrs(&sink), vec![1]);
    }

    #[tokio::test]
    async fn test_stream_ends_on_close_after_draining() {
        let sink = Arc::new(SessionSink::new(16));
        let mut stream = sink.subscribe();

        let producer = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let registry = Arc::new(ContainerRegistry::new());
                registry.add(Container::new("a", 10, 10)).unwrap();
                let mux = Multiplexer::new(registry);
                mux.route(
                    &SessionId::from("s"),
                    GadgetKind::SyscallTrace,
                    &ContainerId::new("a"),
                    &sink,
                );
                for i in 0..3 {
                    mux.dispatch(syscall(10, i));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                mux.unroute_session(&SessionId::from("s"));
                sink.close();
            })
        };

        let mut seen = Vec::new();
        while let Some(e) = stream.next().await {
            seen.push(e.event.timestamp_ns);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_new_stream_supersedes_previous() {
        let sink = Arc::new(SessionSink::new(16));
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        assert!(first.next().await.is_none());

        let registry = Arc::new(ContainerRegistry::new());
        registry.add(Container::new("a", 10, 10)).unwrap();
        let mux = Multiplexer::new(registry);
        mux.route(
            &SessionId::from("s"),
            GadgetKind::SyscallTrace,
            &ContainerId::new("a"),
            &sink,
        );
        mux.dispatch(syscall(10, 5));
        assert_eq!(second.next().await.unwrap().event.timestamp_ns, 5);
    }

    #[tokio::test]
    async fn test_into_stream_yields_buffered_then_ends() {
        use futures::StreamExt;

        let (_, mux) = setup();
        let sink = Arc::new(SessionSink::new(16));
        mux.route(
            &SessionId::from("s"),
            GadgetKind::SyscallTrace,
            &ContainerId::new("a"),
            &sink,
        );
        let stream = sink.subscribe().into_stream();
        mux.dispatch(syscall(10, 3));
        mux.dispatch(syscall(10, 4));
        mux.unroute_session(&SessionId::from("s"));
        sink.close();

        let seen: Vec<u64> = stream.map(|e| e.event.timestamp_ns).collect().await;
        assert_eq!(seen, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (_, mux) = setup();
        let mux = Arc::new(mux);
        let sink = Arc::new(SessionSink::new(16));
        mux.route(
            &SessionId::from("s"),
            GadgetKind::SyscallTrace,
            &ContainerId::new("b"),
            &sink,
        );

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(Arc::clone(&mux).run(rx));
        tx.send(syscall(20, 1)).await.unwrap();
        tx.send(syscall(77, 2)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(mux.stats().received, 2);
        assert_eq!(mux.stats().unattributed, 1);
        assert_eq!(nrs(&sink), vec![1]);
    }
}
