//! Tracer sessions: lifecycle, probe ownership and routing.
//!
//! A session moves `Created -> Attached -> Stopped`. Every transition of one
//! session runs under that session's mutex; distinct sessions never contend
//! beyond the short lookups in the session map.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::{Container, ContainerId, NamespaceId, TargetSelector};
use crate::error::{SessionError, SessionResult};
use crate::event::GadgetKind;
use crate::multiplexer::{EventStream, Multiplexer, SessionSink};
use crate::probes::{ProbeHandle, ProbeTable};
use crate::registry::ContainerRegistry;
use crate::telemetry;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Attached,
    Stopped,
}

/// Point-in-time view of a session for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub kind: GadgetKind,
    pub state: SessionState,
    pub selector: TargetSelector,
    pub targets: Vec<ContainerId>,
    /// Events the session buffer took in, including evicted ones.
    pub accepted: u64,
    pub dropped: u64,
    pub degraded: bool,
}

struct SessionInner {
    state: SessionState,
    targets: BTreeMap<ContainerId, NamespaceId>,
    handles: HashMap<ContainerId, ProbeHandle>,
    consecutive_failures: u32,
    degraded: bool,
}

struct Session {
    id: SessionId,
    kind: GadgetKind,
    selector: TargetSelector,
    sink: Arc<SessionSink>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            id: self.id.clone(),
            kind: self.kind,
            state: inner.state,
            selector: self.selector.clone(),
            targets: inner.targets.keys().cloned().collect(),
            accepted: self.sink.accepted(),
            dropped: self.sink.dropped(),
            degraded: inner.degraded,
        }
    }
}

pub struct SessionManager {
    registry: Arc<ContainerRegistry>,
    probes: Arc<ProbeTable>,
    multiplexer: Arc<Multiplexer>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    session_buffer: usize,
    degraded_after: u32,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        probes: Arc<ProbeTable>,
        multiplexer: Arc<Multiplexer>,
        session_buffer: usize,
        degraded_after: u32,
    ) -> Self {
        Self {
            registry,
            probes,
            multiplexer,
            sessions: RwLock::new(HashMap::new()),
            session_buffer,
            degraded_after: degraded_after.max(1),
        }
    }

    /// Register a session in `Created` state.
    ///
    /// Explicit ids must all be known to the registry; label and wildcard
    /// selectors must match at least one container.
    pub fn create_session(
        &self,
        kind: GadgetKind,
        selector: TargetSelector,
    ) -> SessionResult<SessionId> {
        if let TargetSelector::Containers(ids) = &selector {
            for id in ids {
                self.registry
                    .lookup(id)
                    .map_err(|_| SessionError::UnknownContainer(id.clone()))?;
            }
        }

        let targets: BTreeMap<ContainerId, NamespaceId> = self
            .registry
            .select(&selector)
            .into_iter()
            .map(|c| (c.id.clone(), c.mount_ns))
            .collect();
        if targets.is_empty() {
            return Err(SessionError::NoMatchingContainers);
        }

        let id = SessionId::generate();
        let session = Arc::new(Session {
            id: id.clone(),
            kind,
            selector,
            sink: Arc::new(SessionSink::new(self.session_buffer)),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                targets,
                handles: HashMap::new(),
                consecutive_failures: 0,
                degraded: false,
            }),
        });

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&session));

        // A container removed between `select` and the insert above was
        // announced to a session map that did not hold this session yet.
        let remaining = {
            let mut inner = session.lock();
            let gone = self.prune_unregistered(&mut inner);
            if !gone.is_empty() {
                debug!("Session {} lost {:?} while being created", id, gone);
            }
            if inner.targets.is_empty() {
                inner.state = SessionState::Stopped;
                Err(gone)
            } else {
                Ok(inner.targets.len())
            }
        };
        let targets = match remaining {
            Ok(n) => n,
            Err(gone) => {
                self.sessions
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                return Err(match (&session.selector, gone.into_iter().next()) {
                    (TargetSelector::Containers(_), Some(container)) => {
                        SessionError::UnknownContainer(container)
                    }
                    _ => SessionError::NoMatchingContainers,
                });
            }
        };

        info!("Session {} created (kind={}, targets={})", id, kind, targets);
        telemetry::record_session_created(kind);
        Ok(id)
    }

    /// Drop targets whose container is no longer registered under the same
    /// mount namespace. Returns the dropped ids.
    fn prune_unregistered(&self, inner: &mut SessionInner) -> Vec<ContainerId> {
        let gone: Vec<ContainerId> = inner
            .targets
            .iter()
            .filter(|(container, ns)| {
                !self
                    .registry
                    .lookup(container)
                    .is_ok_and(|c| c.mount_ns == **ns)
            })
            .map(|(container, _)| container.clone())
            .collect();
        for container in &gone {
            inner.targets.remove(container);
        }
        gone
    }

    /// Install probes for every target and start routing events.
    ///
    /// All-or-nothing: on failure the probes acquired so far are released and
    /// the session stays `Created`. Attaching an attached session is a no-op.
    pub fn attach(&self, id: &SessionId) -> SessionResult<()> {
        let session = self.get(id)?;
        let mut inner = session.lock();

        match inner.state {
            SessionState::Attached => return Ok(()),
            SessionState::Stopped => return Err(SessionError::Stopped(id.clone())),
            SessionState::Created => {}
        }

        let gone = self.prune_unregistered(&mut inner);
        if !gone.is_empty() {
            debug!("Session {} skips unregistered targets {:?}", id, gone);
        }
        if inner.targets.is_empty() {
            info!("Session {} has no registered target left; stopping", id);
            self.shut_down(&session, &mut inner);
            return Err(SessionError::Stopped(id.clone()));
        }

        let targets: Vec<(ContainerId, NamespaceId)> = inner
            .targets
            .iter()
            .map(|(c, ns)| (c.clone(), *ns))
            .collect();
        let mut acquired: Vec<(ContainerId, ProbeHandle)> = Vec::with_capacity(targets.len());
        for (container, namespace) in targets {
            match self.probes.acquire(namespace) {
                Ok(handle) => acquired.push((container, handle)),
                Err(source) => {
                    for (_, handle) in acquired {
                        if let Err(e) = self.probes.release(handle) {
                            warn!("Rollback release failed for session {}: {}", id, e);
                        }
                    }
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.degraded_after && !inner.degraded {
                        warn!(
                            "Session {} degraded after {} failed attaches",
                            id, inner.consecutive_failures
                        );
                        inner.degraded = true;
                    }
                    return Err(SessionError::AttachFailed {
                        session: id.clone(),
                        source,
                    });
                }
            }
        }

        for (container, handle) in acquired {
            self.multiplexer
                .route(id, session.kind, &container, &session.sink);
            inner.handles.insert(container, handle);
        }
        inner.state = SessionState::Attached;
        inner.consecutive_failures = 0;
        inner.degraded = false;
        info!("Session {} attached", id);
        Ok(())
    }

    /// Stop an attached session. Any other state is left untouched.
    ///
    /// When this returns no further event reaches the session.
    pub fn stop(&self, id: &SessionId) -> SessionResult<()> {
        let session = self.get(id)?;
        let mut inner = session.lock();
        if inner.state != SessionState::Attached {
            debug!("Stop on session {} in state {:?} ignored", id, inner.state);
            return Ok(());
        }
        self.shut_down(&session, &mut inner);
        Ok(())
    }

    /// Force a session into `Stopped` from any state.
    pub fn terminate(&self, id: &SessionId) -> SessionResult<()> {
        let session = self.get(id)?;
        let mut inner = session.lock();
        if inner.state != SessionState::Stopped {
            self.shut_down(&session, &mut inner);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.snapshot();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn describe(&self, id: &SessionId) -> SessionResult<SessionSummary> {
        Ok(self.get(id)?.summary())
    }

    pub fn kind_of(&self, id: &SessionId) -> SessionResult<GadgetKind> {
        Ok(self.get(id)?.kind)
    }

    /// Open the session's event stream, superseding any earlier one.
    ///
    /// On a stopped session the stream yields what is still buffered and ends.
    pub fn stream_events(&self, id: &SessionId) -> SessionResult<EventStream> {
        Ok(self.get(id)?.sink.subscribe())
    }

    /// A container left the node: release its probe in every session that
    /// targeted it, stopping sessions that lost their last target.
    pub fn container_removed(&self, container: &ContainerId) {
        for session in self.snapshot() {
            let mut inner = session.lock();
            if inner.targets.remove(container).is_none() {
                continue;
            }

            if let Some(handle) = inner.handles.remove(container) {
                self.multiplexer.unroute(&session.id, container);
                if let Err(e) = self.probes.release(handle) {
                    warn!(
                        "Release for removed container {} in session {} failed: {}",
                        container, session.id, e
                    );
                }
            }
            debug!(
                "Container {} dropped from session {}",
                container, session.id
            );

            if inner.targets.is_empty() && inner.state != SessionState::Stopped {
                info!(
                    "Session {} lost its last target; stopping",
                    session.id
                );
                self.shut_down(&session, &mut inner);
            }
        }
    }

    /// A container joined the node: selector sessions that follow it take it
    /// on, installing a probe right away when already attached.
    pub fn container_added(&self, container: &Container) {
        for session in self.snapshot() {
            if !session.selector.follows(container) {
                continue;
            }
            let mut inner = session.lock();
            if inner.state == SessionState::Stopped || inner.targets.contains_key(&container.id) {
                continue;
            }

            if inner.state == SessionState::Attached {
                match self.probes.acquire(container.mount_ns) {
                    Ok(handle) => {
                        self.multiplexer.route(
                            &session.id,
                            session.kind,
                            &container.id,
                            &session.sink,
                        );
                        inner.handles.insert(container.id.clone(), handle);
                    }
                    Err(e) => {
                        warn!(
                            "Session {} could not follow container {}: {}",
                            session.id, container.id, e
                        );
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.degraded_after {
                            inner.degraded = true;
                        }
                        continue;
                    }
                }
            }
            inner.targets.insert(container.id.clone(), container.mount_ns);
            info!(
                "Session {} now follows container {}",
                session.id, container.id
            );
        }
    }

    /// Stop every session that is not stopped yet.
    pub fn shutdown(&self) {
        for session in self.snapshot() {
            let mut inner = session.lock();
            if inner.state != SessionState::Stopped {
                self.shut_down(&session, &mut inner);
            }
        }
    }

    /// Remove routes first so delivery has quiesced, then close the sink and
    /// hand the probes back.
    fn shut_down(&self, session: &Session, inner: &mut SessionInner) {
        self.multiplexer.unroute_session(&session.id);
        session.sink.close();
        for (container, handle) in inner.handles.drain() {
            if let Err(e) = self.probes.release(handle) {
                warn!(
                    "Release of {} for session {} failed: {}",
                    container, session.id, e
                );
            }
        }
        inner.state = SessionState::Stopped;
        info!("Session {} stopped", session.id);
    }

    fn get(&self, id: &SessionId) -> SessionResult<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
