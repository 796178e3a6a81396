//! Kubernetes container source.
//!
//! Turns pod watch events into [`ContainerEvent`]s by:
//! 1. Watching pods scheduled on this node via the K8s API
//! 2. Mapping each running container id to a host PID through `/proc/*/cgroup`
//! 3. Reading the PID's mount and network namespace inodes
//!
//! A second, cluster-wide watcher keeps [`KnownWorkloads`] current so the
//! policy synthesizer can name off-node peers.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::IpAddr,
    os::unix::fs::MetadataExt,
    sync::Arc,
};

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::container::{Container, ContainerId};
use crate::lifecycle::ContainerEvent;
use crate::policy::{KnownWorkloads, WorkloadIdentity};

/// Per-pod bookkeeping of which containers were announced.
#[derive(Default)]
struct NodePods {
    announced: HashMap<String, BTreeSet<ContainerId>>,
    /// Pod uids seen since the last watcher re-list began.
    relist: Option<HashSet<String>>,
}

impl NodePods {
    /// Diff the pod's running containers against what was announced.
    fn apply<F>(&mut self, pod: &Pod, locate: F) -> Vec<ContainerEvent>
    where
        F: Fn(&ContainerId) -> Option<(u64, u64)>,
    {
        let Some(uid) = pod.metadata.uid.clone() else {
            return Vec::new();
        };
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(uid.clone());
        }

        let running: BTreeSet<ContainerId> = running_container_ids(pod).into_iter().collect();
        let announced = self.announced.entry(uid.clone()).or_default();
        let mut events = Vec::new();

        for id in announced.difference(&running) {
            events.push(ContainerEvent::Stopped { id: id.clone() });
        }
        announced.retain(|id| running.contains(id));

        for id in running {
            if announced.contains(&id) {
                continue;
            }
            // The runtime may report the container before its process exists;
            // the next update for this pod retries.
            let Some((mount_ns, net_ns)) = locate(&id) else {
                debug!("No process found yet for container {}", id);
                continue;
            };
            events.push(ContainerEvent::Started(container_from_pod(
                pod,
                id.clone(),
                mount_ns,
                net_ns,
            )));
            announced.insert(id);
        }

        if announced.is_empty() {
            self.announced.remove(&uid);
        }
        events
    }

    fn delete(&mut self, pod: &Pod) -> Vec<ContainerEvent> {
        let Some(uid) = pod.metadata.uid.as_ref() else {
            return Vec::new();
        };
        self.announced
            .remove(uid)
            .into_iter()
            .flatten()
            .map(|id| ContainerEvent::Stopped { id })
            .collect()
    }

    fn begin_relist(&mut self) {
        self.relist = Some(HashSet::new());
    }

    /// Pods that vanished while the watch was disconnected never got a
    /// delete event; stop their containers now.
    fn finish_relist(&mut self) -> Vec<ContainerEvent> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let gone: Vec<String> = self
            .announced
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();
        gone.into_iter()
            .filter_map(|uid| self.announced.remove(&uid))
            .flatten()
            .map(|id| ContainerEvent::Stopped { id })
            .collect()
    }
}

/// Watches pods on one node and reports their containers.
pub struct PodWatcher {
    node_name: String,
    events: mpsc::Sender<ContainerEvent>,
}

impl PodWatcher {
    pub fn new(node_name: String, events: mpsc::Sender<ContainerEvent>) -> Self {
        Self { node_name, events }
    }

    /// Start the watcher background task.
    pub async fn start(self, client: Client) -> Result<tokio::task::JoinHandle<()>> {
        // Pods are namespaced, but every namespace on this node is of interest.
        let api: Api<Pod> = Api::all(client);
        let config = watcher::Config {
            field_selector: Some(format!("spec.nodeName={}", self.node_name)),
            ..Default::default()
        };
        info!("Watching pods on node {}", self.node_name);

        Ok(tokio::spawn(async move {
            let stream = watcher(api, config);
            tokio::pin!(stream);
            let mut pods = NodePods::default();
            let mut pid_cache: HashMap<ContainerId, i32> = HashMap::new();

            while let Some(event) = stream.next().await {
                let out = match event {
                    Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                        if running_container_ids(&pod)
                            .iter()
                            .any(|id| !pid_cache.contains_key(id))
                        {
                            pid_cache = tokio::task::spawn_blocking(scan_container_pids)
                                .await
                                .unwrap_or_default();
                        }
                        pods.apply(&pod, |id| {
                            pid_cache.get(id).and_then(|pid| read_namespaces(*pid))
                        })
                    }
                    Ok(watcher::Event::Delete(pod)) => pods.delete(&pod),
                    Ok(watcher::Event::Init) => {
                        pods.begin_relist();
                        Vec::new()
                    }
                    Ok(watcher::Event::InitDone) => pods.finish_relist(),
                    Err(e) => {
                        // kube's watcher retries with backoff on its own.
                        warn!("K8s pod watcher error: {}. Will retry.", e);
                        Vec::new()
                    }
                };

                for event in out {
                    if let ContainerEvent::Stopped { id } = &event {
                        pid_cache.remove(id);
                    }
                    if self.events.send(event).await.is_err() {
                        warn!("Container event receiver dropped; pod watcher exiting");
                        return;
                    }
                }
            }
            warn!("K8s pod watcher stream ended");
        }))
    }
}

/// Keep `known` in sync with every pod IP in the cluster.
pub async fn start_workload_watcher(
    client: Client,
    known: Arc<KnownWorkloads>,
) -> Result<tokio::task::JoinHandle<()>> {
    let api: Api<Pod> = Api::all(client);
    Ok(tokio::spawn(async move {
        let stream = watcher(api, watcher::Config::default());
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                    if let Some((ip, identity)) = workload_identity(&pod) {
                        known.insert(ip, identity);
                    }
                }
                Ok(watcher::Event::Delete(pod)) => {
                    if let Some(ip) = pod_ip(&pod) {
                        known.remove(&ip);
                    }
                }
                Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                Err(e) => warn!("K8s workload watcher error: {}. Will retry.", e),
            }
        }
        warn!("K8s workload watcher stream ended");
    }))
}

pub async fn client() -> Result<Client> {
    Client::try_default()
        .await
        .context("Failed to create K8s client (not running in cluster?)")
}

fn container_from_pod(pod: &Pod, id: ContainerId, mount_ns: u64, net_ns: u64) -> Container {
    let metadata = &pod.metadata;
    let mut container = Container::new(id, mount_ns, net_ns)
        .with_pod(
            metadata.name.clone().unwrap_or_default(),
            metadata.namespace.clone().unwrap_or_default(),
        )
        .with_labels(metadata.labels.clone().unwrap_or_default());
    if let Some(ip) = pod_ip(pod) {
        container = container.with_ip(ip);
    }
    container
}

fn pod_ip(pod: &Pod) -> Option<IpAddr> {
    pod.status.as_ref()?.pod_ip.as_ref()?.parse().ok()
}

/// Host-network pods share the node address and cannot be told apart.
fn workload_identity(pod: &Pod) -> Option<(IpAddr, WorkloadIdentity)> {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false);
    if host_network {
        return None;
    }
    let ip = pod_ip(pod)?;
    Some((
        ip,
        WorkloadIdentity {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
        },
    ))
}

/// Runtime ids of the pod's running containers.
///
/// Status ids look like `containerd://<64hex>` or `docker://<64hex>`.
fn running_container_ids(pod: &Pod) -> Vec<ContainerId> {
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    else {
        return Vec::new();
    };
    statuses
        .iter()
        .filter(|cs| {
            cs.state
                .as_ref()
                .is_some_and(|state| state.running.is_some())
        })
        .filter_map(|cs| cs.container_id.as_deref())
        .filter_map(|cid| cid.rsplit("://").next())
        .filter(|hex_id| is_container_id(hex_id))
        .map(ContainerId::new)
        .collect()
}

/// One PID per container found on the host.
fn scan_container_pids() -> HashMap<ContainerId, i32> {
    let mut pids = HashMap::new();
    let procs = match procfs::process::all_processes() {
        Ok(procs) => procs,
        Err(e) => {
            warn!("Failed to list processes: {}", e);
            return pids;
        }
    };
    for process in procs.flatten() {
        let Ok(cgroups) = process.cgroups() else {
            continue;
        };
        if let Some(id) = cgroups
            .0
            .iter()
            .find_map(|cg| container_id_from_cgroup_path(&cg.pathname))
        {
            pids.entry(ContainerId::new(id)).or_insert(process.pid);
        }
    }
    pids
}

/// Mount and network namespace inodes of a process.
fn read_namespaces(pid: i32) -> Option<(u64, u64)> {
    let inode = |kind: &str| {
        std::fs::metadata(format!("/proc/{}/ns/{}", pid, kind))
            .map(|m| m.ino())
            .ok()
    };
    Some((inode("mnt")?, inode("net")?))
}

/// Extract a container ID from a cgroup path.
///
/// Supports both cgroup v1 and v2 layouts:
/// - plain: `/kubepods/besteffort/pod<uid>/<64-hex-container-id>`
/// - systemd scope: `cri-containerd-<64hex>.scope` or `docker-<64hex>.scope`
fn container_id_from_cgroup_path(path: &str) -> Option<&str> {
    // Skip paths that don't look like container cgroups
    if !path.contains("kubepods") && !path.contains("docker") && !path.contains("containerd") {
        return None;
    }

    let last_segment = path.rsplit('/').next()?;

    if let Some(inner) = last_segment.strip_suffix(".scope") {
        return inner.rsplit('-').next().filter(|id| is_container_id(id));
    }

    Some(last_segment).filter(|id| is_container_id(id))
}

/// Check if a string looks like a 64-char hex container ID.
fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID_A: &str = "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4e5f6a1b2";
    const ID_B: &str = "ffffeeeeddddccccbbbbaaaa99998888777766665555444433332222111100aa";

    fn pod(uid: &str, running: &[&str], waiting: &[&str]) -> Pod {
        let mut statuses: Vec<serde_json::Value> = running
            .iter()
            .map(|id| {
                json!({
                    "name": "app", "image": "img", "imageID": "", "ready": true,
                    "restartCount": 0, "containerID": format!("containerd://{id}"),
                    "state": {"running": {}}
                })
            })
            .collect();
        statuses.extend(waiting.iter().map(|id| {
            json!({
                "name": "sidecar", "image": "img", "imageID": "", "ready": false,
                "restartCount": 0, "containerID": format!("containerd://{id}"),
                "state": {"waiting": {"reason": "ContainerCreating"}}
            })
        }));
        serde_json::from_value(json!({
            "metadata": {
                "name": "checkoutservice-7d9f-abcde",
                "namespace": "shop",
                "uid": uid,
                "labels": {"app": "checkoutservice"}
            },
            "status": {"podIP": "10.1.0.4", "containerStatuses": statuses}
        }))
        .unwrap()
    }

    fn locate_all(id: &ContainerId) -> Option<(u64, u64)> {
        Some(if id.as_str() == ID_A { (100, 200) } else { (101, 200) })
    }

    #[test]
    fn test_parse_cgroup_v2_plain() {
        let path = format!("/kubepods/besteffort/podabc123/{ID_A}");
        assert_eq!(container_id_from_cgroup_path(&path), Some(ID_A));
    }

    #[test]
    fn test_parse_cgroup_systemd_scope_containerd() {
        let path = format!(
            "/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod123.slice/cri-containerd-{ID_A}.scope"
        );
        assert_eq!(container_id_from_cgroup_path(&path), Some(ID_A));
    }

    #[test]
    fn test_parse_cgroup_systemd_scope_docker() {
        let path = format!("/system.slice/docker-{ID_A}.scope");
        assert_eq!(container_id_from_cgroup_path(&path), Some(ID_A));
    }

    #[test]
    fn test_parse_non_container_cgroup() {
        assert_eq!(
            container_id_from_cgroup_path("/user.slice/user-1000.slice/session-1.scope"),
            None
        );
        assert_eq!(container_id_from_cgroup_path("/"), None);
    }

    #[test]
    fn test_only_running_containers_are_reported() {
        let p = pod("u1", &[ID_A], &[ID_B]);
        assert_eq!(running_container_ids(&p), vec![ContainerId::new(ID_A)]);
    }

    #[test]
    fn test_apply_announces_once_with_pod_metadata() {
        let mut pods = NodePods::default();
        let p = pod("u1", &[ID_A], &[]);

        let events = pods.apply(&p, locate_all);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ContainerEvent::Started(c) => {
                assert_eq!(c.id, ContainerId::new(ID_A));
                assert_eq!(c.mount_ns.0, 100);
                assert_eq!(c.pod_namespace, "shop");
                assert_eq!(c.labels.get("app").map(String::as_str), Some("checkoutservice"));
                assert_eq!(c.ip_addresses, vec!["10.1.0.4".parse::<IpAddr>().unwrap()]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(pods.apply(&p, locate_all).is_empty());
    }

    #[test]
    fn test_unlocated_container_is_retried() {
        let mut pods = NodePods::default();
        let p = pod("u1", &[ID_A], &[]);
        assert!(pods.apply(&p, |_| None).is_empty());
        assert_eq!(pods.apply(&p, locate_all).len(), 1);
    }

    #[test]
    fn test_container_exit_and_pod_delete_stop_containers() {
        let mut pods = NodePods::default();
        pods.apply(&pod("u1", &[ID_A, ID_B], &[]), locate_all);

        let events = pods.apply(&pod("u1", &[ID_A], &[]), locate_all);
        assert!(matches!(&events[..], [ContainerEvent::Stopped { id }] if id.as_str() == ID_B));

        let events = pods.delete(&pod("u1", &[], &[]));
        assert!(matches!(&events[..], [ContainerEvent::Stopped { id }] if id.as_str() == ID_A));
    }

    #[test]
    fn test_relist_stops_pods_missed_while_disconnected() {
        let mut pods = NodePods::default();
        pods.apply(&pod("u1", &[ID_A], &[]), locate_all);
        pods.apply(&pod("u2", &[ID_B], &[]), locate_all);

        pods.begin_relist();
        pods.apply(&pod("u2", &[ID_B], &[]), locate_all);
        let events = pods.finish_relist();
        assert!(matches!(&events[..], [ContainerEvent::Stopped { id }] if id.as_str() == ID_A));
    }

    #[test]
    fn test_workload_identity_skips_host_network() {
        let mut p = pod("u1", &[], &[]);
        let (ip, identity) = workload_identity(&p).unwrap();
        assert_eq!(ip, "10.1.0.4".parse::<IpAddr>().unwrap());
        assert_eq!(identity.namespace, "shop");

        p.spec = Some(serde_json::from_value(json!({"containers": [], "hostNetwork": true})).unwrap());
        assert!(workload_identity(&p).is_none());
    }
}
