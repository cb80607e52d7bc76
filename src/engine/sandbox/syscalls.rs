//! Operating-system data tables.
//!
//! Syscall numbers, which syscalls carry a path argument, what every run is
//! granted, and the default process ceiling of the host. Nothing else in the
//! crate hard-codes an OS constant.

/// Register positions of a path-bearing syscall's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathArg {
    pub path: usize,
    /// Directory fd the path is relative to (`*at` variants)
    pub dirfd: Option<usize>,
    /// `open(2)` flags; a write-mode open is checked against `fs_write`.
    pub flags: Option<usize>,
}

const fn plain(path: usize) -> PathArg {
    PathArg {
        path,
        dirfd: None,
        flags: None,
    }
}

const fn at(dirfd: usize, path: usize) -> PathArg {
    PathArg {
        path,
        dirfd: Some(dirfd),
        flags: None,
    }
}

impl PathArg {
    const fn opening(self, flags: usize) -> PathArg {
        PathArg {
            flags: Some(flags),
            ..self
        }
    }
}

/// Syscalls whose path argument is checked against `fs_allow`.
pub const PATH_SYSCALLS: &[(&str, PathArg)] = &[
    ("open", plain(0).opening(1)),
    ("openat", at(0, 1).opening(2)),
    ("stat", plain(0)),
    ("lstat", plain(0)),
    ("access", plain(0)),
    ("faccessat", at(0, 1)),
    ("faccessat2", at(0, 1)),
    ("newfstatat", at(0, 1)),
    ("statx", at(0, 1)),
    ("readlink", plain(0)),
    ("readlinkat", at(0, 1)),
];

/// Syscalls granted to every traced run.
pub const BASE_SYSCALLS: &[&str] = &[
    "read", "write", "readv", "writev", "pread64", "pwrite64", "lseek", "close",
    "fstat", "mmap", "munmap", "mprotect", "mremap", "brk", "madvise",
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "sigaltstack",
    "exit", "exit_group", "arch_prctl", "set_tid_address", "set_robust_list",
    "get_robust_list", "rseq", "prlimit64", "getrlimit", "getrandom", "futex",
    "clock_gettime", "clock_getres", "gettimeofday", "time", "nanosleep",
    "clock_nanosleep", "getpid", "gettid", "getppid", "getuid", "geteuid",
    "getgid", "getegid", "uname", "sched_yield", "sched_getaffinity", "dup",
    "dup2", "dup3", "fcntl", "ioctl", "getcwd", "sysinfo", "poll", "ppoll",
    "select", "pselect6", "pipe", "pipe2", "tgkill", "clone", "clone3",
    "getdents64", "membarrier", "epoll_create1", "epoll_ctl", "epoll_wait",
    "epoll_pwait", "eventfd2",
    "open", "openat", "stat", "lstat", "access", "faccessat", "faccessat2",
    "newfstatat", "statx", "readlink", "readlinkat",
];

/// Filesystem patterns granted to every traced run. Patterns are regular
/// expressions anchored at the start of the normalised absolute path.
pub const BASE_FS: &[&str] = &[
    r"/etc/ld\.so\.(cache|preload)$",
    r"/etc/localtime$",
    r"/etc/nsswitch\.conf$",
    r"/lib/",
    r"/lib64/",
    r"/usr/lib/",
    r"/usr/lib64/",
    r"/usr/local/lib/",
    r"/usr/share/zoneinfo/",
    r"/dev/(null|zero|urandom|random)$",
    r"/proc/self/(maps|exe|auxv|status|stat)$",
    r"/sys/devices/system/cpu/",
];

/// Paths every traced run may open for writing. Everything on `BASE_FS` is
/// read-only.
pub const BASE_FS_WRITE: &[&str] = &[r"/dev/null$"];

/// Process ceiling applied by `ProcessCeiling::HostDefault`: unlimited where
/// the host can fork, a single process elsewhere.
pub const HOST_PROCESS_CEILING: Option<u32> = if cfg!(unix) { None } else { Some(1) };

/// Processes allowed by `ProcessCeiling::Single`.
pub const SINGLE_PROCESS_CEILING: Option<u32> = Some(1);

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod numbers {
    use nix::libc;

    pub const SYSCALL_NUMBERS: &[(&str, i64)] = &[
        ("read", libc::SYS_read),
        ("write", libc::SYS_write),
        ("open", libc::SYS_open),
        ("close", libc::SYS_close),
        ("stat", libc::SYS_stat),
        ("fstat", libc::SYS_fstat),
        ("lstat", libc::SYS_lstat),
        ("poll", libc::SYS_poll),
        ("lseek", libc::SYS_lseek),
        ("mmap", libc::SYS_mmap),
        ("mprotect", libc::SYS_mprotect),
        ("munmap", libc::SYS_munmap),
        ("brk", libc::SYS_brk),
        ("rt_sigaction", libc::SYS_rt_sigaction),
        ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
        ("rt_sigreturn", libc::SYS_rt_sigreturn),
        ("ioctl", libc::SYS_ioctl),
        ("pread64", libc::SYS_pread64),
        ("pwrite64", libc::SYS_pwrite64),
        ("readv", libc::SYS_readv),
        ("writev", libc::SYS_writev),
        ("access", libc::SYS_access),
        ("pipe", libc::SYS_pipe),
        ("select", libc::SYS_select),
        ("sched_yield", libc::SYS_sched_yield),
        ("mremap", libc::SYS_mremap),
        ("msync", libc::SYS_msync),
        ("mincore", libc::SYS_mincore),
        ("madvise", libc::SYS_madvise),
        ("dup", libc::SYS_dup),
        ("dup2", libc::SYS_dup2),
        ("nanosleep", libc::SYS_nanosleep),
        ("getpid", libc::SYS_getpid),
        ("socket", libc::SYS_socket),
        ("connect", libc::SYS_connect),
        ("bind", libc::SYS_bind),
        ("listen", libc::SYS_listen),
        ("clone", libc::SYS_clone),
        ("fork", libc::SYS_fork),
        ("vfork", libc::SYS_vfork),
        ("execve", libc::SYS_execve),
        ("exit", libc::SYS_exit),
        ("wait4", libc::SYS_wait4),
        ("kill", libc::SYS_kill),
        ("uname", libc::SYS_uname),
        ("fcntl", libc::SYS_fcntl),
        ("getcwd", libc::SYS_getcwd),
        ("chdir", libc::SYS_chdir),
        ("rename", libc::SYS_rename),
        ("mkdir", libc::SYS_mkdir),
        ("rmdir", libc::SYS_rmdir),
        ("unlink", libc::SYS_unlink),
        ("readlink", libc::SYS_readlink),
        ("chmod", libc::SYS_chmod),
        ("gettimeofday", libc::SYS_gettimeofday),
        ("getrlimit", libc::SYS_getrlimit),
        ("sysinfo", libc::SYS_sysinfo),
        ("ptrace", libc::SYS_ptrace),
        ("getuid", libc::SYS_getuid),
        ("getgid", libc::SYS_getgid),
        ("geteuid", libc::SYS_geteuid),
        ("getegid", libc::SYS_getegid),
        ("setpgid", libc::SYS_setpgid),
        ("getppid", libc::SYS_getppid),
        ("setsid", libc::SYS_setsid),
        ("rt_sigsuspend", libc::SYS_rt_sigsuspend),
        ("sigaltstack", libc::SYS_sigaltstack),
        ("sched_setscheduler", libc::SYS_sched_setscheduler),
        ("arch_prctl", libc::SYS_arch_prctl),
        ("mount", libc::SYS_mount),
        ("gettid", libc::SYS_gettid),
        ("time", libc::SYS_time),
        ("futex", libc::SYS_futex),
        ("sched_getaffinity", libc::SYS_sched_getaffinity),
        ("getdents64", libc::SYS_getdents64),
        ("set_tid_address", libc::SYS_set_tid_address),
        ("fadvise64", libc::SYS_fadvise64),
        ("clock_gettime", libc::SYS_clock_gettime),
        ("clock_getres", libc::SYS_clock_getres),
        ("clock_nanosleep", libc::SYS_clock_nanosleep),
        ("exit_group", libc::SYS_exit_group),
        ("epoll_wait", libc::SYS_epoll_wait),
        ("epoll_ctl", libc::SYS_epoll_ctl),
        ("tgkill", libc::SYS_tgkill),
        ("openat", libc::SYS_openat),
        ("newfstatat", libc::SYS_newfstatat),
        ("readlinkat", libc::SYS_readlinkat),
        ("faccessat", libc::SYS_faccessat),
        ("pselect6", libc::SYS_pselect6),
        ("ppoll", libc::SYS_ppoll),
        ("set_robust_list", libc::SYS_set_robust_list),
        ("get_robust_list", libc::SYS_get_robust_list),
        ("epoll_pwait", libc::SYS_epoll_pwait),
        ("eventfd2", libc::SYS_eventfd2),
        ("epoll_create1", libc::SYS_epoll_create1),
        ("dup3", libc::SYS_dup3),
        ("pipe2", libc::SYS_pipe2),
        ("prlimit64", libc::SYS_prlimit64),
        ("getrandom", libc::SYS_getrandom),
        ("membarrier", libc::SYS_membarrier),
        ("statx", libc::SYS_statx),
        ("rseq", libc::SYS_rseq),
        ("clone3", libc::SYS_clone3),
        ("faccessat2", libc::SYS_faccessat2),
    ];
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod numbers {
    pub const SYSCALL_NUMBERS: &[(&str, i64)] = &[];
}

pub use numbers::SYSCALL_NUMBERS;

/// Native number of a syscall on this platform.
pub fn number(name: &str) -> Option<i64> {
    SYSCALL_NUMBERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nr)| *nr)
}

/// Name of a syscall number, for diagnostics.
pub fn name(nr: i64) -> Option<&'static str> {
    SYSCALL_NUMBERS
        .iter()
        .find(|(_, n)| *n == nr)
        .map(|(name, _)| *name)
}

/// Path arguments of a syscall, if it has one the policy checks.
pub fn path_arg(name: &str) -> Option<PathArg> {
    PATH_SYSCALLS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, arg)| *arg)
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_every_granted_syscall_has_a_number() {
        for name in BASE_SYSCALLS {
            assert!(number(name).is_some(), "missing number for {}", name);
        }
        for (name, _) in PATH_SYSCALLS {
            assert!(number(name).is_some(), "missing number for {}", name);
        }
    }

    #[test]
    fn test_number_name_roundtrip() {
        assert_eq!(number("read"), Some(0));
        assert_eq!(name(57), Some("fork"));
        assert_eq!(
            path_arg("openat"),
            Some(PathArg {
                path: 1,
                dirfd: Some(0),
                flags: Some(2)
            })
        );
        assert_eq!(path_arg("stat").and_then(|arg| arg.flags), None);
    }
}
