use std::{collections::BTreeSet, time::Duration};

use log::{debug, warn};

use crate::event::{AttributedEvent, ConnectionTuple};
use crate::multiplexer::EventStream;

pub const DEFAULT_MAX_TUPLES: usize = 4096;

/// Distinct connection tuples seen on a network-trace session.
#[derive(Debug)]
pub struct ConnectionCollector {
    tuples: BTreeSet<ConnectionTuple>,
    limit: usize,
    overflow: u64,
}

impl Default for ConnectionCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TUPLES)
    }
}

impl ConnectionCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            tuples: BTreeSet::new(),
            limit,
            overflow: 0,
        }
    }

    /// Record the event's tuple. Returns true if it was new.
    pub fn observe(&mut self, event: &AttributedEvent) -> bool {
        let Some(tuple) = event.event.connection() else {
            return false;
        };
        if self.tuples.contains(tuple) {
            return false;
        }
        if self.tuples.len() >= self.limit {
            if self.overflow == 0 {
                warn!("Connection collector full ({} tuples); ignoring new ones", self.limit);
            }
            self.overflow += 1;
            return false;
        }
        self.tuples.insert(*tuple);
        true
    }

    /// Drain `stream` until `window` elapses or the session stops. A window
    /// past the clock's range only ends with the stream.
    pub async fn collect(&mut self, stream: &mut EventStream, window: Duration) {
        match tokio::time::Instant::now().checked_add(window) {
            Some(deadline) => {
                while let Ok(Some(event)) = tokio::time::timeout_at(deadline, stream.next()).await
                {
                    self.observe(&event);
                }
            }
            None => {
                while let Some(event) = stream.next().await {
                    self.observe(&event);
                }
            }
        }
        debug!(
            "Collected {} distinct connections ({} over limit)",
            self.tuples.len(),
            self.overflow
        );
    }

    pub fn tuples(&self) -> impl Iterator<Item = &ConnectionTuple> {
        self.tuples.iter()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerId, NamespaceId};
    use crate::event::{ContainerRef, Direction, Event, EventPayload, Protocol, SyscallRecord};
    use crate::multiplexer::SessionSink;
    use std::sync::Arc;

    fn connection(port: u16) -> Arc<AttributedEvent> {
        Arc::new(AttributedEvent {
            container: ContainerRef {
                id: ContainerId::new("a"),
                pod_name: "web-0".into(),
                pod_namespace: "default".into(),
            },
            event: Event {
                timestamp_ns: 0,
                mount_ns: NamespaceId(1),
                pid: 1,
                comm: "web".into(),
                payload: EventPayload::Connection(ConnectionTuple {
                    source_ns: NamespaceId(1),
                    destination_ip: "10.0.0.2".parse().unwrap(),
                    destination_port: port,
                    protocol: Protocol::Tcp,
                    direction: Direction::Egress,
                }),
            },
        })
    }

    #[test]
    fn test_distinct_and_bounded() {
        let mut collector = ConnectionCollector::new(2);
        assert!(collector.observe(&connection(80)));
        assert!(!collector.observe(&connection(80)));
        assert!(collector.observe(&connection(443)));
        assert!(!collector.observe(&connection(8080)));
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.overflow(), 1);
    }

    #[test]
    fn test_syscall_events_are_ignored() {
        let mut collector = ConnectionCollector::default();
        let mut event = (*connection(80)).clone();
        event.event.payload = EventPayload::Syscall(SyscallRecord::new(0, 0));
        assert!(!collector.observe(&event));
        assert!(collector.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_stops_at_window() {
        let sink = Arc::new(SessionSink::new(16));
        let mut stream = sink.subscribe();
        sink.push(connection(80));
        sink.push(connection(80));
        sink.push(connection(443));

        let mut collector = ConnectionCollector::default();
        collector
            .collect(&mut stream, Duration::from_secs(5))
            .await;
        assert_eq!(
            collector.tuples().map(|t| t.destination_port).collect::<Vec<_>>(),
            vec![80, 443]
        );
    }

    #[tokio::test]
    async fn test_collect_stops_when_session_closes() {
        let sink = Arc::new(SessionSink::new(16));
        let mut stream = sink.subscribe();
        sink.push(connection(22));
        sink.close();

        let mut collector = ConnectionCollector::default();
        collector
            .collect(&mut stream, Duration::from_secs(3600))
            .await;
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_window_runs_until_close() {
        let sink = Arc::new(SessionSink::new(16));
        let mut stream = sink.subscribe();
        sink.push(connection(80));
        sink.close();

        let mut collector = ConnectionCollector::default();
        collector
            .collect(&mut stream, Duration::from_secs(u64::MAX))
            .await;
        assert_eq!(collector.len(), 1);
    }
}
