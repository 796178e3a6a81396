//! Trace events, before and after attribution to a container.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use gadgetd_common::{
    AF_INET, AF_INET6, EVENT_KIND_ACCEPT, EVENT_KIND_CONNECT, EVENT_KIND_SYSCALL, IPPROTO_TCP,
    IPPROTO_UDP, RawEvent, SYSCALL_ARGS, SYSCALL_DATA_LEN,
};
use serde::{Deserialize, Serialize};

use crate::container::{Container, ContainerId, NamespaceId};
use crate::syscalls;

/// The kind of probe a session drives and an event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GadgetKind {
    SyscallTrace,
    NetworkTrace,
}

impl fmt::Display for GadgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SyscallTrace => f.write_str("syscall-trace"),
            Self::NetworkTrace => f.write_str("network-trace"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

impl Protocol {
    fn from_ipproto(proto: u8) -> Option<Self> {
        match proto {
            IPPROTO_TCP => Some(Self::Tcp),
            IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }
}

/// Traffic direction relative to the traced container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One observed connection.
///
/// `destination_ip` is always the remote endpoint. `destination_port` is the
/// service port: the remote port for egress, the local listening port for
/// ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionTuple {
    pub source_ns: NamespaceId,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub direction: Direction,
}

/// Outgoing connections read `connect 10.0.0.2:80/TCP`, accepted ones
/// `accept 10.0.0.3 on :8080/TCP`.
impl fmt::Display for ConnectionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Egress => write!(
                f,
                "connect {}/{}",
                SocketAddr::new(self.destination_ip, self.destination_port),
                self.protocol
            ),
            Direction::Ingress => write!(
                f,
                "accept {} on :{}/{}",
                self.destination_ip, self.destination_port, self.protocol
            ),
        }
    }
}

/// One syscall with its raw arguments and result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub nr: u64,
    #[serde(default)]
    pub args: [u64; SYSCALL_ARGS],
    pub ret: i64,
    /// User memory copied from the buffer or path argument.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl SyscallRecord {
    pub fn new(nr: u64, ret: i64) -> Self {
        Self {
            nr,
            args: [0; SYSCALL_ARGS],
            ret,
            data: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: [u64; SYSCALL_ARGS]) -> Self {
        self.args = args;
        self
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data[..data.len().min(SYSCALL_DATA_LEN)].to_vec();
        self
    }

    pub fn name(&self) -> Option<&'static str> {
        syscalls::name(self.nr)
    }
}

/// Renders as `write(1, "42\n", 3) = 3`.
impl fmt::Display for SyscallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        syscalls::render(f, self.nr, &self.args, self.ret, &self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Syscall(SyscallRecord),
    Connection(ConnectionTuple),
}

/// One unit of kernel activity, scoped to a mount namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_ns: u64,
    pub mount_ns: NamespaceId,
    pub pid: u32,
    pub comm: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> GadgetKind {
        match self.payload {
            EventPayload::Syscall(_) => GadgetKind::SyscallTrace,
            EventPayload::Connection(_) => GadgetKind::NetworkTrace,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionTuple> {
        match &self.payload {
            EventPayload::Connection(tuple) => Some(tuple),
            EventPayload::Syscall(_) => None,
        }
    }

    /// Decode the kernel layout. Returns `None` for records the agent cannot
    /// interpret (unknown kind, address family or protocol).
    pub fn from_raw(raw: &RawEvent) -> Option<Self> {
        let mount_ns = NamespaceId(raw.mntns_id);
        let payload = match raw.kind {
            EVENT_KIND_SYSCALL => {
                let captured = usize::from(raw.data_len).min(SYSCALL_DATA_LEN);
                EventPayload::Syscall(
                    SyscallRecord::new(raw.syscall_nr, raw.ret)
                        .with_args(raw.args)
                        .with_data(&raw.data[..captured]),
                )
            }
            EVENT_KIND_CONNECT | EVENT_KIND_ACCEPT => {
                let destination_ip = match raw.family {
                    AF_INET => IpAddr::V4(Ipv4Addr::new(
                        raw.addr[0],
                        raw.addr[1],
                        raw.addr[2],
                        raw.addr[3],
                    )),
                    AF_INET6 => IpAddr::V6(Ipv6Addr::from(raw.addr)),
                    _ => return None,
                };
                let direction = if raw.kind == EVENT_KIND_CONNECT {
                    Direction::Egress
                } else {
                    Direction::Ingress
                };
                EventPayload::Connection(ConnectionTuple {
                    source_ns: mount_ns,
                    destination_ip: canonical_ip(destination_ip),
                    destination_port: raw.port,
                    protocol: Protocol::from_ipproto(raw.protocol)?,
                    direction,
                })
            }
            _ => return None,
        };

        Some(Self {
            timestamp_ns: raw.timestamp_ns,
            mount_ns,
            pid: raw.pid,
            comm: comm_to_string(&raw.comm),
            payload,
        })
    }
}

/// One trace line: `[comm] write(1, "42\n", 3) = 3`.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.comm)?;
        match &self.payload {
            EventPayload::Syscall(record) => fmt::Display::fmt(record, f),
            EventPayload::Connection(tuple) => fmt::Display::fmt(tuple, f),
        }
    }
}

/// Dual-stack sockets report IPv4 peers as `::ffff:a.b.c.d`.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn comm_to_string(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// Container identity attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: ContainerId,
    pub pod_name: String,
    pub pod_namespace: String,
}

impl From<&Container> for ContainerRef {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            pod_name: c.pod_name.clone(),
            pod_namespace: c.pod_namespace.clone(),
        }
    }
}

/// An event correlated with the container it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedEvent {
    pub container: ContainerRef,
    #[serde(flatten)]
    pub event: Event,
}

pub type SharedEvent = Arc<AttributedEvent>;
