//! Control-plane server: newline-delimited JSON over a Unix socket.
//!
//! Each line from the client is one [`Request`]; each reply is one
//! [`Response`] line. `stream_events` switches the connection into
//! streaming mode until the session stops or the client sends its next
//! request, which is answered after the `StreamEnd` line. Sessions created
//! on a connection are terminated when it goes away.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::container::TargetSelector;
use crate::error::{ControlError, ControlResult, SessionError};
use crate::event::{AttributedEvent, GadgetKind};
use crate::multiplexer::EventStream;
use crate::policy::{ConnectionCollector, NetworkPolicy, PolicySynthesizer, WorkloadTarget};
use crate::registry::ContainerRegistry;
use crate::session::{SessionId, SessionManager, SessionSummary};

const DEFAULT_SYNTHESIS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_MAX_SYNTHESIS_WINDOW_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        kind: GadgetKind,
        target: TargetSelector,
    },
    Attach {
        session: SessionId,
    },
    Stop {
        session: SessionId,
    },
    ListSessions,
    StreamEvents {
        session: SessionId,
    },
    /// Collect the session's connections for a window, then build a policy.
    SynthesizePolicy {
        session: SessionId,
        #[serde(default)]
        window_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    UnknownContainer,
    NoMatchingContainers,
    UnknownSession,
    AttachFailed,
    SessionStopped,
    WrongKind,
    NoWorkload,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    SessionCreated { session: SessionId },
    Ok,
    Sessions { sessions: Vec<SessionSummary> },
    /// `line` is the event rendered as one trace line.
    Event { event: AttributedEvent, line: String },
    StreamEnd { session: SessionId, dropped: u64 },
    Policy { policy: NetworkPolicy },
    Error { code: ErrorCode, message: String },
}

impl From<ControlError> for Response {
    fn from(err: ControlError) -> Self {
        let code = match &err {
            ControlError::Session(e) => match e {
                SessionError::UnknownContainer(_) => ErrorCode::UnknownContainer,
                SessionError::NoMatchingContainers => ErrorCode::NoMatchingContainers,
                SessionError::UnknownSession(_) => ErrorCode::UnknownSession,
                SessionError::AttachFailed { .. } => ErrorCode::AttachFailed,
                SessionError::Stopped(_) => ErrorCode::SessionStopped,
            },
            ControlError::BadRequest(_) => ErrorCode::BadRequest,
            ControlError::WrongKind { .. } => ErrorCode::WrongKind,
            ControlError::NoWorkload(_) => ErrorCode::NoWorkload,
            ControlError::Io(_) | ControlError::Encode(_) => ErrorCode::Internal,
        };
        Response::Error {
            code,
            message: err.to_string(),
        }
    }
}

type RequestLines = Lines<BufReader<OwnedReadHalf>>;

/// How a streaming phase ended.
enum StreamExit {
    /// The session stopped or a newer stream took over.
    Ended,
    HungUp,
    /// The client sent this line; it still has to be answered.
    Interrupted(String),
}

/// Sessions created over one connection. Dropping the guard terminates
/// them, also when the connection task unwinds.
struct OwnedSessions {
    sessions: Arc<SessionManager>,
    ids: Vec<SessionId>,
}

impl Drop for OwnedSessions {
    fn drop(&mut self) {
        for session in self.ids.drain(..) {
            if let Err(e) = self.sessions.terminate(&session) {
                debug!("Terminating session {} on disconnect: {}", session, e);
            }
        }
    }
}

pub struct ControlPlane {
    sessions: Arc<SessionManager>,
    registry: Arc<ContainerRegistry>,
    synthesizer: Arc<PolicySynthesizer>,
    max_window: Duration,
}

impl ControlPlane {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ContainerRegistry>,
        synthesizer: Arc<PolicySynthesizer>,
    ) -> Self {
        Self {
            sessions,
            registry,
            synthesizer,
            max_window: Duration::from_secs(DEFAULT_MAX_SYNTHESIS_WINDOW_SECS),
        }
    }

    pub fn with_max_synthesis_window(mut self, secs: u64) -> Self {
        self.max_window = Duration::from_secs(secs);
        self
    }

    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        info!("Control plane listening on {}", path.display());
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Control socket accept failed: {}", e);
                    continue;
                }
            };
            let plane = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = plane.handle_connection(stream).await {
                    debug!("Control connection closed with error: {}", e);
                }
            });
        }
    }

    /// Answer one non-streaming request. Sessions it creates are appended
    /// to `owned`.
    pub async fn handle(&self, request: Request, owned: &mut Vec<SessionId>) -> Response {
        match self.dispatch(request, owned).await {
            Ok(response) => response,
            Err(e) => Response::from(e),
        }
    }

    async fn dispatch(
        &self,
        request: Request,
        owned: &mut Vec<SessionId>,
    ) -> ControlResult<Response> {
        match request {
            Request::CreateSession { kind, target } => {
                let session = self.sessions.create_session(kind, target)?;
                owned.push(session.clone());
                Ok(Response::SessionCreated { session })
            }
            Request::Attach { session } => {
                self.sessions.attach(&session)?;
                Ok(Response::Ok)
            }
            Request::Stop { session } => {
                self.sessions.stop(&session)?;
                Ok(Response::Ok)
            }
            Request::ListSessions => Ok(Response::Sessions {
                sessions: self.sessions.list(),
            }),
            Request::StreamEvents { .. } => Err(ControlError::BadRequest(
                "stream_events needs a control connection".into(),
            )),
            Request::SynthesizePolicy {
                session,
                window_secs,
            } => {
                let secs = window_secs.unwrap_or(DEFAULT_SYNTHESIS_WINDOW_SECS);
                let window = Duration::from_secs(secs);
                if window > self.max_window {
                    return Err(ControlError::BadRequest(format!(
                        "window_secs {} exceeds the limit of {}",
                        secs,
                        self.max_window.as_secs()
                    )));
                }
                let policy = self.synthesize(&session, window).await?;
                Ok(Response::Policy { policy })
            }
        }
    }

    /// Takes over the session's event stream for `window`, so a concurrent
    /// `stream_events` consumer of the same session is ended.
    async fn synthesize(&self, id: &SessionId, window: Duration) -> ControlResult<NetworkPolicy> {
        let summary = self.sessions.describe(id)?;
        if summary.kind != GadgetKind::NetworkTrace {
            return Err(ControlError::WrongKind {
                session: id.clone(),
                kind: summary.kind,
            });
        }

        let containers = self
            .registry
            .select(&TargetSelector::Containers(summary.targets.clone()));
        let selector = match &summary.selector {
            TargetSelector::Labels(labels) => Some(labels),
            _ => None,
        };
        let target = WorkloadTarget::infer(selector, &containers)
            .ok_or_else(|| ControlError::NoWorkload(id.clone()))?;

        let mut stream = self.sessions.stream_events(id)?;
        let mut collector = ConnectionCollector::default();
        collector.collect(&mut stream, window).await;
        info!(
            "Synthesizing policy for {}/{} from {} connections",
            target.namespace,
            target.name,
            collector.len()
        );
        Ok(self.synthesizer.synthesize(&target, collector.tuples()))
    }

    async fn handle_connection(&self, stream: UnixStream) -> ControlResult<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut owned = OwnedSessions {
            sessions: Arc::clone(&self.sessions),
            ids: Vec::new(),
        };
        self.converse(&mut lines, &mut write, &mut owned.ids).await
    }

    async fn converse(
        &self,
        lines: &mut RequestLines,
        write: &mut OwnedWriteHalf,
        owned: &mut Vec<SessionId>,
    ) -> ControlResult<()> {
        let mut pending: Option<String> = None;
        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => match lines.next_line().await? {
                    Some(line) => line,
                    None => return Ok(()),
                },
            };
            if line.trim().is_empty() {
                continue;
            }
            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    let err = ControlError::BadRequest(e.to_string());
                    write_response(write, &Response::from(err)).await?;
                    continue;
                }
            };

            match request {
                Request::StreamEvents { session } => match self.sessions.stream_events(&session) {
                    Ok(events) => match self.pump(events, &session, lines, write).await? {
                        StreamExit::Ended => {}
                        StreamExit::HungUp => return Ok(()),
                        StreamExit::Interrupted(line) => pending = Some(line),
                    },
                    Err(e) => {
                        write_response(write, &Response::from(ControlError::from(e))).await?
                    }
                },
                request => {
                    let response = self.handle(request, owned).await;
                    write_response(write, &response).await?;
                }
            }
        }
    }

    /// Forward events until the stream ends or the client speaks.
    async fn pump(
        &self,
        mut events: EventStream,
        session: &SessionId,
        lines: &mut RequestLines,
        write: &mut OwnedWriteHalf,
    ) -> ControlResult<StreamExit> {
        let exit = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        let response = Response::Event {
                            line: event.event.to_string(),
                            event: event.as_ref().clone(),
                        };
                        write_response(write, &response).await?;
                    }
                    None => break StreamExit::Ended,
                },
                line = lines.next_line() => match line? {
                    None => return Ok(StreamExit::HungUp),
                    Some(line) => break StreamExit::Interrupted(line),
                },
            }
        };
        write_response(
            write,
            &Response::StreamEnd {
                session: session.clone(),
                dropped: events.dropped(),
            },
        )
        .await?;
        Ok(exit)
    }
}

async fn write_response(write: &mut OwnedWriteHalf, response: &Response) -> ControlResult<()> {
    let mut buf = serde_json::to_vec(response)?;
    buf.push(b'\n');
    write.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, ContainerId, NamespaceId};
    use crate::event::{Event, EventPayload, SyscallRecord};
    use crate::multiplexer::Multiplexer;
    use crate::probes::ProbeTable;
    use crate::probes::table::testing::CountingInstaller;
    use crate::session::SessionState;

    struct Harness {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        mux: Arc<Multiplexer>,
        sessions: Arc<SessionManager>,
        plane: Arc<ControlPlane>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ContainerRegistry::new());
        registry
            .add(Container::new("a", 10, 10).with_label("app", "web"))
            .unwrap();
        let probes = Arc::new(ProbeTable::new(Arc::new(CountingInstaller::default())));
        let mux = Arc::new(Multiplexer::new(Arc::clone(&registry)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            probes,
            Arc::clone(&mux),
            16,
            3,
        ));
        let synthesizer = Arc::new(PolicySynthesizer::new(Arc::clone(&registry)));
        let plane = Arc::new(ControlPlane::new(
            Arc::clone(&sessions),
            registry,
            synthesizer,
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("gadgetd.sock");
        let listener = ControlPlane::bind(&path).unwrap();
        tokio::spawn(Arc::clone(&plane).serve(listener));

        Harness {
            _dir: dir,
            path,
            mux,
            sessions,
            plane,
        }
    }

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            let (read, write) = UnixStream::connect(path).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.write.write_all(line.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn call(&mut self, request: &Request) -> Response {
            self.send_raw(&serde_json::to_string(request).unwrap()).await;
            self.recv().await
        }
    }

    fn create(target: &str) -> Request {
        Request::CreateSession {
            kind: GadgetKind::SyscallTrace,
            target: TargetSelector::Containers(vec![ContainerId::new(target)]),
        }
    }

    fn session_of(response: Response) -> SessionId {
        match response {
            Response::SessionCreated { session } => session,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_socket() {
        let h = harness();
        let mut client = Client::connect(&h.path).await;

        let session = session_of(client.call(&create("a")).await);
        assert_eq!(
            client
                .call(&Request::Attach {
                    session: session.clone()
                })
                .await,
            Response::Ok
        );

        match client.call(&Request::ListSessions).await {
            Response::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].state, SessionState::Attached);
                assert_eq!(sessions[0].targets, vec![ContainerId::new("a")]);
            }
            other => panic!("unexpected response {other:?}"),
        }

        let stop = Request::Stop {
            session: session.clone(),
        };
        assert_eq!(client.call(&stop).await, Response::Ok);
        assert_eq!(client.call(&stop).await, Response::Ok);
    }

    #[tokio::test]
    async fn test_unknown_container_and_bad_request() {
        let h = harness();
        let mut client = Client::connect(&h.path).await;

        match client.call(&create("missing")).await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownContainer),
            other => panic!("unexpected response {other:?}"),
        }

        client.send_raw("{\"method\":\"explode\"}").await;
        match client.recv().await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::BadRequest),
            other => panic!("unexpected response {other:?}"),
        }
        assert!(h.sessions.list().is_empty());
    }

    #[tokio::test]
    async fn test_stream_events_until_stop() {
        let h = harness();
        let mut client = Client::connect(&h.path).await;
        let session = session_of(client.call(&create("a")).await);
        client
            .call(&Request::Attach {
                session: session.clone(),
            })
            .await;

        client
            .send_raw(
                &serde_json::to_string(&Request::StreamEvents {
                    session: session.clone(),
                })
                .unwrap(),
            )
            .await;
        // Give the server a moment to subscribe before producing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.mux.dispatch(Event {
            timestamp_ns: 7,
            mount_ns: NamespaceId(10),
            pid: 1,
            comm: "nginx".into(),
            payload: EventPayload::Syscall(
                SyscallRecord::new(1, 2)
                    .with_args([1, 0x7ffc_0000, 2, 0, 0, 0])
                    .with_data(b"ok"),
            ),
        });
        match client.recv().await {
            Response::Event { event, line } => {
                assert_eq!(event.container.id, ContainerId::new("a"));
                assert_eq!(event.event.timestamp_ns, 7);
                assert_eq!(line, r#"[nginx] write(1, "ok", 2) = 2"#);
            }
            other => panic!("unexpected response {other:?}"),
        }

        h.sessions.stop(&session).unwrap();
        assert_eq!(
            client.recv().await,
            Response::StreamEnd {
                session,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn test_request_sent_while_streaming_is_answered() {
        let h = harness();
        let mut client = Client::connect(&h.path).await;
        let session = session_of(client.call(&create("a")).await);
        client
            .call(&Request::Attach {
                session: session.clone(),
            })
            .await;

        let stream = Request::StreamEvents {
            session: session.clone(),
        };
        client.send_raw(&serde_json::to_string(&stream).unwrap()).await;
        let stop = Request::Stop {
            session: session.clone(),
        };
        client.send_raw(&serde_json::to_string(&stop).unwrap()).await;

        assert_eq!(
            client.recv().await,
            Response::StreamEnd {
                session: session.clone(),
                dropped: 0
            }
        );
        let reply = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap();
        assert_eq!(reply, Response::Ok);
        assert_eq!(
            h.sessions.describe(&session).unwrap().state,
            SessionState::Stopped
        );
    }

    #[tokio::test]
    async fn test_oversized_synthesis_window_is_rejected() {
        let h = harness();
        let mut client = Client::connect(&h.path).await;
        let session = session_of(
            client
                .call(&Request::CreateSession {
                    kind: GadgetKind::NetworkTrace,
                    target: TargetSelector::All,
                })
                .await,
        );
        client
            .call(&Request::Attach {
                session: session.clone(),
            })
            .await;

        let reply = client
            .call(&Request::SynthesizePolicy {
                session: session.clone(),
                window_secs: Some(u64::MAX),
            })
            .await;
        match reply {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::BadRequest),
            other => panic!("unexpected response {other:?}"),
        }

        // The connection is still served.
        assert_eq!(
            client
                .call(&Request::Stop {
                    session: session.clone()
                })
                .await,
            Response::Ok
        );
        assert_eq!(
            h.sessions.describe(&session).unwrap().state,
            SessionState::Stopped
        );
    }

    #[tokio::test]
    async fn test_configured_window_limit() {
        let h = harness();
        let plane = ControlPlane::new(
            Arc::clone(&h.sessions),
            Arc::new(ContainerRegistry::new()),
            Arc::new(PolicySynthesizer::new(Arc::new(ContainerRegistry::new()))),
        )
        .with_max_synthesis_window(5);
        let response = plane
            .handle(
                Request::SynthesizePolicy {
                    session: SessionId::from("any"),
                    window_secs: Some(6),
                },
                &mut Vec::new(),
            )
            .await;
        match response {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::BadRequest),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_owned_sessions_end_when_connection_task_panics() {
        let h = harness();
        let session = h
            .sessions
            .create_session(
                GadgetKind::SyscallTrace,
                TargetSelector::Containers(vec![ContainerId::new("a")]),
            )
            .unwrap();
        h.sessions.attach(&session).unwrap();

        let owned = OwnedSessions {
            sessions: Arc::clone(&h.sessions),
            ids: vec![session.clone()],
        };
        let task = tokio::spawn(async move {
            let owned = owned;
            tokio::task::yield_now().await;
            assert!(owned.ids.is_empty(), "connection task unwinds");
        });
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(
            h.sessions.describe(&session).unwrap().state,
            SessionState::Stopped
        );
    }

    #[tokio::test]
    async fn test_disconnect_terminates_owned_sessions() {
        let h = harness();
        let session = {
            let mut client = Client::connect(&h.path).await;
            let session = session_of(client.call(&create("a")).await);
            client
                .call(&Request::Attach {
                    session: session.clone(),
                })
                .await;
            session
        };

        let mut state = SessionState::Attached;
        for _ in 0..100 {
            state = h.sessions.describe(&session).unwrap().state;
            if state == SessionState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_synthesis_requires_network_session() {
        let h = harness();
        let mut owned = Vec::new();
        let session = session_of(h.plane.handle(create("a"), &mut owned).await);
        assert_eq!(owned, vec![session.clone()]);

        let response = h
            .plane
            .handle(
                Request::SynthesizePolicy {
                    session,
                    window_secs: Some(0),
                },
                &mut owned,
            )
            .await;
        match response {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::WrongKind),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synthesis_over_empty_window_yields_bare_policy() {
        let h = harness();
        let mut owned = Vec::new();
        let session = session_of(
            h.plane
                .handle(
                    Request::CreateSession {
                        kind: GadgetKind::NetworkTrace,
                        target: TargetSelector::All,
                    },
                    &mut owned,
                )
                .await,
        );

        let response = h
            .plane
            .handle(
                Request::SynthesizePolicy {
                    session,
                    window_secs: Some(0),
                },
                &mut owned,
            )
            .await;
        match response {
            Response::Policy { policy } => {
                assert_eq!(policy.metadata.name, "web-network");
                assert!(policy.spec.egress.is_empty());
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
}
