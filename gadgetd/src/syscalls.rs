//! Syscall names and argument rendering (x86_64 numbering).
//!
//! Renders a record as `name(arg, ...) = ret`. Only the argument the kernel
//! program copied memory for is shown as a string; everything else is shown
//! as a number.

use std::fmt::{self, Write};

use gadgetd_common::SYSCALL_DATA_LEN;

const AT_FDCWD: i32 = -100;

/// How one argument register is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arg {
    /// Signed decimal.
    Int,
    /// File descriptor; `AT_FDCWD` is named.
    Fd,
    /// Pointer; zero is `NULL`.
    Ptr,
    /// Flag word.
    Flags,
    /// Permission bits.
    Mode,
    /// Data buffer; the captured bytes when present.
    Buf,
    /// NUL-terminated path; the captured bytes when present.
    Path,
}

#[derive(Debug, Clone, Copy)]
struct Syscall {
    name: &'static str,
    args: &'static [Arg],
    /// Return value is an address.
    hex_ret: bool,
}

const fn call(name: &'static str, args: &'static [Arg]) -> Syscall {
    Syscall {
        name,
        args,
        hex_ret: false,
    }
}

const fn addr_call(name: &'static str, args: &'static [Arg]) -> Syscall {
    Syscall {
        name,
        args,
        hex_ret: true,
    }
}

fn lookup(nr: u64) -> Option<Syscall> {
    use Arg::*;

    let sc = match nr {
        0 => call("read", &[Fd, Buf, Int]),
        1 => call("write", &[Fd, Buf, Int]),
        2 => call("open", &[Path, Flags, Mode]),
        3 => call("close", &[Fd]),
        4 => call("stat", &[Path, Ptr]),
        5 => call("fstat", &[Fd, Ptr]),
        6 => call("lstat", &[Path, Ptr]),
        7 => call("poll", &[Ptr, Int, Int]),
        8 => call("lseek", &[Fd, Int, Int]),
        9 => addr_call("mmap", &[Ptr, Int, Flags, Flags, Fd, Int]),
        10 => call("mprotect", &[Ptr, Int, Flags]),
        11 => call("munmap", &[Ptr, Int]),
        12 => addr_call("brk", &[Ptr]),
        13 => call("rt_sigaction", &[Int, Ptr, Ptr, Int]),
        14 => call("rt_sigprocmask", &[Int, Ptr, Ptr, Int]),
        16 => call("ioctl", &[Fd, Flags, Ptr]),
        17 => call("pread64", &[Fd, Buf, Int, Int]),
        18 => call("pwrite64", &[Fd, Buf, Int, Int]),
        19 => call("readv", &[Fd, Ptr, Int]),
        20 => call("writev", &[Fd, Ptr, Int]),
        21 => call("access", &[Path, Mode]),
        22 => call("pipe", &[Ptr]),
        23 => call("select", &[Int, Ptr, Ptr, Ptr, Ptr]),
        24 => call("sched_yield", &[]),
        32 => call("dup", &[Fd]),
        33 => call("dup2", &[Fd, Fd]),
        35 => call("nanosleep", &[Ptr, Ptr]),
        39 => call("getpid", &[]),
        41 => call("socket", &[Int, Int, Int]),
        42 => call("connect", &[Fd, Ptr, Int]),
        43 => call("accept", &[Fd, Ptr, Ptr]),
        44 => call("sendto", &[Fd, Buf, Int, Flags, Ptr, Int]),
        45 => call("recvfrom", &[Fd, Buf, Int, Flags, Ptr, Ptr]),
        49 => call("bind", &[Fd, Ptr, Int]),
        50 => call("listen", &[Fd, Int]),
        56 => call("clone", &[Flags, Ptr, Ptr, Ptr, Int]),
        57 => call("fork", &[]),
        58 => call("vfork", &[]),
        59 => call("execve", &[Path, Ptr, Ptr]),
        60 => call("exit", &[Int]),
        61 => call("wait4", &[Int, Ptr, Flags, Ptr]),
        62 => call("kill", &[Int, Int]),
        63 => call("uname", &[Ptr]),
        72 => call("fcntl", &[Fd, Int, Flags]),
        79 => call("getcwd", &[Buf, Int]),
        80 => call("chdir", &[Path]),
        83 => call("mkdir", &[Path, Mode]),
        84 => call("rmdir", &[Path]),
        87 => call("unlink", &[Path]),
        89 => call("readlink", &[Path, Ptr, Int]),
        102 => call("getuid", &[]),
        110 => call("getppid", &[]),
        158 => call("arch_prctl", &[Int, Ptr]),
        186 => call("gettid", &[]),
        202 => call("futex", &[Ptr, Int, Int, Ptr, Ptr, Int]),
        217 => call("getdents64", &[Fd, Ptr, Int]),
        218 => call("set_tid_address", &[Ptr]),
        228 => call("clock_gettime", &[Int, Ptr]),
        231 => call("exit_group", &[Int]),
        257 => call("openat", &[Fd, Path, Flags, Mode]),
        262 => call("newfstatat", &[Fd, Path, Ptr, Flags]),
        263 => call("unlinkat", &[Fd, Path, Flags]),
        273 => call("set_robust_list", &[Ptr, Int]),
        293 => call("pipe2", &[Ptr, Flags]),
        302 => call("prlimit64", &[Int, Int, Ptr, Ptr]),
        318 => call("getrandom", &[Ptr, Int, Flags]),
        332 => call("statx", &[Fd, Path, Flags, Flags, Ptr]),
        334 => call("rseq", &[Ptr, Int, Flags, Flags]),
        _ => return None,
    };
    Some(sc)
}

/// Name of syscall `nr`, if known.
pub fn name(nr: u64) -> Option<&'static str> {
    lookup(nr).map(|sc| sc.name)
}

/// Write `name(args) = ret` for one syscall.
pub fn render(
    f: &mut impl Write,
    nr: u64,
    args: &[u64],
    ret: i64,
    data: &[u8],
) -> fmt::Result {
    let Some(sc) = lookup(nr) else {
        write!(f, "syscall_{}(", nr)?;
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:#x}", arg)?;
        }
        return write!(f, ") = {}", ret);
    };

    write!(f, "{}(", sc.name)?;
    // Captured memory belongs to the first buffer or path argument.
    let mut data = Some(data).filter(|d| !d.is_empty());
    for (i, (kind, value)) in sc.args.iter().zip(args).enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        match kind {
            Arg::Int => write!(f, "{}", *value as i64)?,
            Arg::Fd => match *value as i32 {
                AT_FDCWD => f.write_str("AT_FDCWD")?,
                fd => write!(f, "{}", fd)?,
            },
            Arg::Ptr => write_pointer(f, *value)?,
            Arg::Flags => write!(f, "{:#x}", value)?,
            Arg::Mode if *value == 0 => f.write_str("0")?,
            Arg::Mode => write!(f, "0{:o}", value)?,
            Arg::Buf | Arg::Path => match data.take() {
                Some(bytes) => write_quoted(f, bytes, *kind == Arg::Path)?,
                None => write_pointer(f, *value)?,
            },
        }
    }
    f.write_str(") = ")?;
    if sc.hex_ret && ret >= 0 {
        write!(f, "{:#x}", ret)
    } else {
        write!(f, "{}", ret)
    }
}

fn write_pointer(f: &mut impl Write, value: u64) -> fmt::Result {
    if value == 0 {
        f.write_str("NULL")
    } else {
        write!(f, "{:#x}", value)
    }
}

/// Quote bytes C-style. A full capture may have been cut short, so it is
/// followed by `...`.
fn write_quoted(f: &mut impl Write, bytes: &[u8], path: bool) -> fmt::Result {
    let bytes = if path {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        &bytes[..end]
    } else {
        bytes
    };

    f.write_char('"')?;
    for &b in bytes {
        match b {
            b'"' => f.write_str("\\\"")?,
            b'\\' => f.write_str("\\\\")?,
            b'\n' => f.write_str("\\n")?,
            b'\t' => f.write_str("\\t")?,
            b'\r' => f.write_str("\\r")?,
            0x20..=0x7e => f.write_char(b as char)?,
            _ => write!(f, "\\x{:02x}", b)?,
        }
    }
    f.write_char('"')?;
    if bytes.len() >= SYSCALL_DATA_LEN {
        f.write_str("...")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(nr: u64, args: &[u64], ret: i64, data: &[u8]) -> String {
        let mut out = String::new();
        render(&mut out, nr, args, ret, data).unwrap();
        out
    }

    #[test]
    fn test_write_shows_captured_buffer() {
        assert_eq!(
            line(1, &[1, 0x7ffd1000, 3, 0, 0, 0], 3, b"42\n"),
            r#"write(1, "42\n", 3) = 3"#
        );
    }

    #[test]
    fn test_openat_names_cwd_and_stops_path_at_nul() {
        assert_eq!(
            line(257, &[(-100i64) as u64, 0x5000, 0x80000, 0, 0, 0], 3, b"/etc/hosts\0junk"),
            r#"openat(AT_FDCWD, "/etc/hosts", 0x80000, 0) = 3"#
        );
    }

    #[test]
    fn test_buffer_without_capture_is_a_pointer() {
        assert_eq!(
            line(0, &[0, 0x7f00, 4096, 0, 0, 0], -11, b""),
            "read(0, 0x7f00, 4096) = -11"
        );
        assert_eq!(line(12, &[0; 6], 0x55aa000, b""), "brk(NULL) = 0x55aa000");
    }

    #[test]
    fn test_full_capture_is_marked_truncated() {
        let data = [b'a'; SYSCALL_DATA_LEN];
        let out = line(1, &[2, 0x10, 1000, 0, 0, 0], 1000, &data);
        assert!(out.starts_with("write(2, \"aaaa"));
        assert!(out.ends_with("\"..., 1000) = 1000"));
    }

    #[test]
    fn test_unprintable_bytes_are_escaped() {
        assert_eq!(
            line(1, &[1, 0x10, 3, 0, 0, 0], 3, b"\x1b\"\\"),
            r#"write(1, "\x1b\"\\", 3) = 3"#
        );
    }

    #[test]
    fn test_unknown_syscall() {
        assert_eq!(name(999), None);
        assert_eq!(
            line(999, &[1, 2, 0, 0, 0, 0], 0, b""),
            "syscall_999(0x1, 0x2, 0x0, 0x0, 0x0, 0x0) = 0"
        );
        assert_eq!(name(59), Some("execve"));
    }
}
