//! Error types for the tracer manager.
//!
//! Each layer returns its own enum so callers can roll back precisely;
//! the control plane maps all of them onto wire error codes.

use thiserror::Error;

use crate::container::{ContainerId, NamespaceId};
use crate::event::GadgetKind;
use crate::session::SessionId;

/// Errors raised by the container registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A different container is already registered under this id.
    #[error("container {0} is already registered with different data")]
    DuplicateId(ContainerId),

    /// The mount namespace already belongs to another container.
    #[error("mount namespace {namespace} already belongs to container {owner}")]
    NamespaceInUse {
        /// Contested namespace.
        namespace: NamespaceId,
        /// Container currently owning it.
        owner: ContainerId,
    },

    /// No container with this id is tracked.
    #[error("container {0} not found")]
    NotFound(ContainerId),

    /// No container owns this namespace.
    #[error("no container owns namespace {0}")]
    NamespaceNotFound(NamespaceId),
}

/// Failure reported by the kernel-side installation primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// The kernel ran out of room (filter map full, memlock limit).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The agent lacks the privileges to install the filter.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other installation failure.
    #[error("{0}")]
    Other(String),
}

impl InstallError {
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Errors raised by the probe attachment layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Installing the filter for a namespace failed; nothing changed.
    #[error("failed to attach probe for namespace {namespace}: {source}")]
    AttachFailed {
        namespace: NamespaceId,
        #[source]
        source: InstallError,
    },

    /// The handle is not live in this table (already released or foreign).
    #[error("probe handle {serial} for namespace {namespace} is not live")]
    HandleNotLive { namespace: NamespaceId, serial: u64 },

    /// The filter was forgotten but the kernel refused to remove it.
    #[error("failed to detach probe for namespace {namespace}: {source}")]
    DetachFailed {
        namespace: NamespaceId,
        #[source]
        source: InstallError,
    },
}

/// Errors raised by the tracer session manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A target container is not known to the registry.
    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),

    /// A label or wildcard selector matched no running container.
    #[error("selector matched no running container")]
    NoMatchingContainers,

    /// No session with this id exists.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Probe installation failed; the session stays `Created`.
    #[error("attach failed for session {session}: {source}")]
    AttachFailed {
        session: SessionId,
        #[source]
        source: ProbeError,
    },

    /// The session already reached its terminal state.
    #[error("session {0} is stopped")]
    Stopped(SessionId),
}

/// Errors raised while serving a control-plane request.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("malformed request: {0}")]
    BadRequest(String),

    /// Policy synthesis needs a network-trace session.
    #[error("session {session} traces {kind}, not network-trace")]
    WrongKind { session: SessionId, kind: GadgetKind },

    /// None of the session's containers carries usable labels.
    #[error("session {0} has no labelled workload to build a policy for")]
    NoWorkload(SessionId),

    #[error("control connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
pub type ProbeResult<T> = std::result::Result<T, ProbeError>;
pub type SessionResult<T> = std::result::Result<T, SessionError>;
pub type ControlResult<T> = std::result::Result<T, ControlError>;
