//! Container start/stop intake.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::container::{Container, ContainerId};
use crate::registry::ContainerRegistry;
use crate::session::SessionManager;

/// Notification from a container source (the Kubernetes watcher, tests).
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    Started(Container),
    Stopped { id: ContainerId },
}

/// Applies lifecycle notifications to the registry, then to sessions.
pub struct LifecycleTracker {
    registry: Arc<ContainerRegistry>,
    sessions: Arc<SessionManager>,
}

impl LifecycleTracker {
    pub fn new(registry: Arc<ContainerRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn apply(&self, event: ContainerEvent) {
        match event {
            ContainerEvent::Started(container) => match self.registry.add(container) {
                Ok(container) => self.sessions.container_added(&container),
                Err(e) => warn!("Ignoring container start: {}", e),
            },
            ContainerEvent::Stopped { id } => {
                // Registry first so no new session can pick the container up.
                if self.registry.remove(&id).is_some() {
                    self.sessions.container_removed(&id);
                }
            }
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<ContainerEvent>) {
        info!("Container lifecycle tracker started");
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        info!("Container lifecycle tracker stopped");
    }
}
