#![no_std]

/// Raw event emitted by a syscall tracepoint.
pub const EVENT_KIND_SYSCALL: u8 = 0;
/// Raw event emitted on an outgoing connect.
pub const EVENT_KIND_CONNECT: u8 = 1;
/// Raw event emitted on an accepted connection.
pub const EVENT_KIND_ACCEPT: u8 = 2;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TASK_COMM_LEN: usize = 16;
/// Register arguments carried by a syscall event.
pub const SYSCALL_ARGS: usize = 6;
/// User memory captured from a syscall's buffer or path argument.
pub const SYSCALL_DATA_LEN: usize = 64;

/// Name of the hash map holding the mount namespaces that are being traced.
pub const MNTNS_FILTER_MAP: &str = "MNTNS_FILTER";
/// Name of the ring buffer every program writes `RawEvent`s into.
pub const EVENTS_MAP: &str = "EVENTS";

/// Layout shared by the kernel programs and the agent.
///
/// `addr` holds the remote address: the first four bytes for `AF_INET`,
/// all sixteen for `AF_INET6`. Ports are in host byte order.
///
/// Syscall events fill `args` and, for calls taking a buffer or a path,
/// copy up to `SYSCALL_DATA_LEN` bytes of it into `data` (`data_len` valid).
/// Buffers of reads are copied at exit, bounded by the return value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawEvent {
    pub timestamp_ns: u64,
    pub mntns_id: u64,
    pub syscall_nr: u64,
    pub ret: i64,
    pub pid: u32,
    pub kind: u8,
    pub protocol: u8,
    pub family: u16,
    pub addr: [u8; 16],
    pub port: u16,
    pub _pad: [u8; 6],
    pub comm: [u8; TASK_COMM_LEN],
    pub args: [u64; SYSCALL_ARGS],
    pub data_len: u16,
    pub _pad2: [u8; 6],
    pub data: [u8; SYSCALL_DATA_LEN],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RawEvent {}
