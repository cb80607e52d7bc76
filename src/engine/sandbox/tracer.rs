//! ptrace-based supervisor (Linux x86-64).
//!
//! The child is forked into its own process group, has its rlimits applied
//! and asks to be traced before `execve`. The calling thread then becomes
//! the tracer: every syscall entry of every task in the group is checked
//! against the [`ResourcePolicy`], new tasks are adopted through the
//! fork/clone events, and a watchdog thread enforces the wall-clock ceiling.
//!
//! ptrace requests are only valid from the thread that did the fork, so
//! [`Sandbox::run_blocking`] must run start to finish on one thread (the
//! async [`Runner`](super::Runner) impl uses `spawn_blocking`).

use std::collections::{BTreeSet, HashMap};
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use tracing::{debug, trace, warn};

use super::config::get_config;
use super::outcome::{LimitKind, ProcessOutput, RunOutcome, RunRequest, Stdin, SyscallViolation};
use super::policy::{normalize_path, ResourcePolicy, SyscallRule};
use super::syscalls::{self, PathArg};
use super::SandboxError;

/// Process groups of every child currently under supervision.
static LIVE_GROUPS: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

fn register(pgid: i32) {
    LIVE_GROUPS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(pgid);
}

fn unregister(pgid: i32) {
    LIVE_GROUPS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&pgid);
}

/// SIGKILL every supervised process group. Returns how many groups were
/// signalled.
pub fn kill_all() -> usize {
    let groups = LIVE_GROUPS.lock().unwrap_or_else(|e| e.into_inner());
    let mut killed = 0;
    for pgid in groups.iter() {
        if killpg(Pid::from_raw(*pgid), Signal::SIGKILL).is_ok() {
            killed += 1;
        }
    }
    killed
}

const PATH_MAX: usize = 4096;

/// Supervisor for untrusted processes.
#[derive(Debug, Clone, Default)]
pub struct Sandbox;

impl Sandbox {
    pub fn new() -> Self {
        Self
    }

    /// Run `request` under `policy` and wait for the whole process group to
    /// finish. Blocks the calling thread.
    pub fn run_blocking(
        &self,
        request: &RunRequest,
        policy: &ResourcePolicy,
    ) -> Result<ProcessOutput, SandboxError> {
        let mut spawn = Spawn::prepare(request, policy)?;

        let pid = spawn.start()?;
        let pgid = pid.as_raw();
        register(pgid);
        debug!(pid = pgid, argv = ?request.argv, traced = policy.is_traced(), "Spawned sandboxed process");

        let ceiling = request.limits.time + policy.time_grace();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let wall_hit = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let wall_hit = Arc::clone(&wall_hit);
            thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(ceiling) {
                    wall_hit.store(true, Ordering::SeqCst);
                    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                }
            })
        };

        let started = Instant::now();
        let result = Supervisor::new(pid, policy).run();
        let wall_time = started.elapsed();

        drop(done_tx);
        let _ = watchdog.join();
        unregister(pgid);

        let mut outcome = result?;
        outcome.wall_time = wall_time;
        if wall_hit.load(Ordering::SeqCst) && outcome.limit_exceeded.is_none() {
            outcome.limit_exceeded = Some(LimitKind::WallTime);
        }
        if hit_memory_ceiling(&outcome, request.limits.memory_kb) {
            outcome.limit_exceeded = Some(LimitKind::Memory);
        }
        debug!(pid = pgid, ?outcome, "Sandboxed process finished");

        Ok(ProcessOutput {
            outcome,
            stdout: read_back(&mut spawn.stdout)?,
            stderr: read_back(&mut spawn.stderr)?,
        })
    }
}

/// A run that died abnormally after its resident peak reached the limit was
/// stopped by the memory ceiling.
fn hit_memory_ceiling(outcome: &RunOutcome, memory_kb: u64) -> bool {
    memory_kb > 0
        && outcome.limit_exceeded.is_none()
        && outcome.policy_violation.is_none()
        && outcome.exit_code != Some(0)
        && outcome.peak_memory_kb >= memory_kb
}

fn read_back(file: &mut File) -> Result<Vec<u8>, SandboxError> {
    let mut buf = Vec::new();
    file.seek(SeekFrom::Start(0)).map_err(SandboxError::Spawn)?;
    file.read_to_end(&mut buf).map_err(SandboxError::Spawn)?;
    Ok(buf)
}

/// Everything the child needs, allocated before `fork` so the child only
/// makes raw libc calls.
struct Spawn {
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    stdin: File,
    stdout: File,
    stderr: File,
    rlimits: Vec<(Resource, libc::rlim_t)>,
    traced: bool,
    run_as: Option<(libc::uid_t, libc::gid_t)>,
}

impl Spawn {
    fn prepare(request: &RunRequest, policy: &ResourcePolicy) -> Result<Self, SandboxError> {
        let program = request
            .argv
            .first()
            .ok_or_else(|| SandboxError::InvalidArgument("empty argv".to_string()))?;
        if !Path::new(program).is_absolute() {
            return Err(SandboxError::InvalidArgument(format!(
                "program path must be absolute: {}",
                program
            )));
        }

        let argv = request
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = request
            .env
            .iter()
            .map(|(key, value)| c_string(format!("{}={}", key, value).as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let cwd = c_string(request.cwd.as_os_str().as_bytes())?;

        let stdin = match &request.stdin {
            Stdin::Null => File::open("/dev/null").map_err(SandboxError::Spawn)?,
            Stdin::File(path) => File::open(path).map_err(SandboxError::Spawn)?,
            Stdin::Bytes(bytes) => {
                let mut file = tempfile::tempfile().map_err(SandboxError::Spawn)?;
                file.write_all(bytes).map_err(SandboxError::Spawn)?;
                file.seek(SeekFrom::Start(0)).map_err(SandboxError::Spawn)?;
                file
            }
        };
        let stdout = tempfile::tempfile().map_err(SandboxError::Spawn)?;
        let stderr = tempfile::tempfile().map_err(SandboxError::Spawn)?;

        Ok(Self {
            argv,
            envp,
            cwd,
            stdin,
            stdout,
            stderr,
            rlimits: rlimits(request, policy),
            traced: policy.is_traced(),
            // Trusted tooling keeps the judge's identity.
            run_as: if policy.is_traced() { get_config().run_as } else { None },
        })
    }

    /// Fork and exec. Returns once the child has either exec'd or failed to.
    fn start(&self) -> Result<Pid, SandboxError> {
        let mut argv_ptrs: Vec<*const libc::c_char> = self.argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = self.envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::Spawn(e.into()))?;

        // SAFETY: the child branch only calls async-signal-safe libc functions
        // on memory prepared above and never returns.
        match unsafe { fork() }.map_err(|e| SandboxError::Spawn(e.into()))? {
            ForkResult::Child => {
                drop(err_read);
                self.exec_child(&argv_ptrs, &envp_ptrs, &err_write)
            }
            ForkResult::Parent { child } => {
                drop(err_write);
                // The child does the same; whichever runs first wins.
                let _ = nix::unistd::setpgid(child, child);
                self.await_exec(child, err_read)
            }
        }
    }

    /// Runs in the forked child: async-signal-safe calls only.
    fn exec_child(
        &self,
        argv: &[*const libc::c_char],
        envp: &[*const libc::c_char],
        err_write: &OwnedFd,
    ) -> ! {
        let err_fd = err_write.as_raw_fd();

        if unsafe { libc::setpgid(0, 0) } != 0 {
            exit_with_errno(err_fd);
        }
        for (from, to) in [
            (self.stdin.as_raw_fd(), 0),
            (self.stdout.as_raw_fd(), 1),
            (self.stderr.as_raw_fd(), 2),
        ] {
            if unsafe { libc::dup2(from, to) } < 0 {
                exit_with_errno(err_fd);
            }
        }
        if unsafe { libc::chdir(self.cwd.as_ptr()) } != 0 {
            exit_with_errno(err_fd);
        }
        for (resource, value) in &self.rlimits {
            if setrlimit(*resource, *value, *value).is_err() {
                exit_with_errno(err_fd);
            }
        }
        if let Some((uid, gid)) = self.run_as {
            // Supplementary groups first; both need the privilege setuid drops.
            let dropped = unsafe {
                libc::setgroups(0, std::ptr::null()) == 0 && libc::setgid(gid) == 0 && libc::setuid(uid) == 0
            };
            if !dropped {
                exit_with_errno(err_fd);
            }
        }
        if self.traced && ptrace::traceme().is_err() {
            exit_with_errno(err_fd);
        }
        unsafe { libc::execve(argv[0], argv.as_ptr(), envp.as_ptr()) };
        exit_with_errno(err_fd)
    }

    fn await_exec(&self, child: Pid, err_read: OwnedFd) -> Result<Pid, SandboxError> {
        let mut pipe = File::from(err_read);
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            match pipe.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SandboxError::Spawn(e)),
            }
        }
        if read == 0 {
            return Ok(child);
        }

        let mut status = 0;
        unsafe { libc::waitpid(child.as_raw(), &mut status, libc::__WALL) };
        let errno = i32::from_ne_bytes(buf);
        Err(SandboxError::Spawn(io::Error::from_raw_os_error(errno)))
    }
}

/// Report errno to the parent through the exec pipe and leave the child.
fn exit_with_errno(fd: i32) -> ! {
    let errno = Errno::last_raw();
    unsafe {
        libc::write(fd, &errno as *const i32 as *const libc::c_void, 4);
        libc::_exit(127)
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, SandboxError> {
    CString::new(bytes)
        .map_err(|_| SandboxError::InvalidArgument("interior NUL byte in argument".to_string()))
}

fn rlimits(request: &RunRequest, policy: &ResourcePolicy) -> Vec<(Resource, libc::rlim_t)> {
    let config = get_config();
    let cpu = request.limits.time + policy.time_grace();
    let cpu_secs = cpu.as_secs() + u64::from(cpu.subsec_nanos() > 0);

    let mut limits = vec![
        (Resource::RLIMIT_CPU, cpu_secs.max(1)),
        (Resource::RLIMIT_FSIZE, config.output_limit_kb * 1024),
        (Resource::RLIMIT_NOFILE, config.open_files),
        (Resource::RLIMIT_CORE, 0),
    ];
    let memory_kb = request.limits.memory_kb;
    if memory_kb > 0 {
        // Without a data grace the address-space cap alone bounds the heap.
        if policy.memory_grace_kb() > 0 {
            limits.push((Resource::RLIMIT_DATA, (memory_kb + policy.memory_grace_kb()) * 1024));
        }
        if policy.limits_address_space() {
            let address_kb = memory_kb + policy.memory_grace_kb() + policy.address_space_grace_kb();
            limits.push((Resource::RLIMIT_AS, address_kb * 1024));
        }
    }
    limits
}

#[derive(Debug, Default)]
struct Task {
    in_syscall: bool,
    /// Errno to write into `rax` at the next syscall-exit stop.
    pending_errno: Option<Errno>,
    /// Adopted through a fork event; its initial SIGSTOP is still due.
    awaiting_stop: bool,
}

struct Supervisor<'a> {
    main: Pid,
    policy: &'a ResourcePolicy,
    tasks: HashMap<Pid, Task>,
    options_set: bool,
    outcome: RunOutcome,
    killed: bool,
}

impl<'a> Supervisor<'a> {
    fn new(main: Pid, policy: &'a ResourcePolicy) -> Self {
        let mut tasks = HashMap::new();
        tasks.insert(main, Task::default());
        Self {
            main,
            policy,
            tasks,
            options_set: false,
            outcome: RunOutcome::default(),
            killed: false,
        }
    }

    fn run(mut self) -> Result<RunOutcome, SandboxError> {
        loop {
            let (pid, status, usage) = match wait_group(self.main) {
                Ok(event) => event,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.kill();
                    return Err(SandboxError::Trace(e));
                }
            };
            if let Err(e) = self.handle(pid, status, &usage) {
                if e != Errno::ESRCH {
                    self.kill();
                    return Err(SandboxError::Trace(e));
                }
                trace!(pid = pid.as_raw(), "Task vanished mid-request");
            }
        }
        Ok(self.outcome)
    }

    fn handle(&mut self, pid: Pid, status: WaitStatus, usage: &libc::rusage) -> nix::Result<()> {
        match status {
            WaitStatus::Exited(_, code) => {
                self.reap(pid, usage);
                if pid == self.main {
                    self.outcome.exit_code = Some(code);
                }
                Ok(())
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.reap(pid, usage);
                if pid == self.main {
                    self.outcome.signal = Some(signal as i32);
                    if self.outcome.limit_exceeded.is_none() {
                        self.outcome.limit_exceeded = match signal {
                            Signal::SIGXCPU => Some(LimitKind::CpuTime),
                            Signal::SIGXFSZ => Some(LimitKind::Output),
                            _ => None,
                        };
                    }
                }
                Ok(())
            }
            WaitStatus::PtraceSyscall(_) => self.on_syscall(pid),
            WaitStatus::PtraceEvent(_, _, event)
                if event == Event::PTRACE_EVENT_FORK as i32
                    || event == Event::PTRACE_EVENT_VFORK as i32
                    || event == Event::PTRACE_EVENT_CLONE as i32 =>
            {
                let child = Pid::from_raw(ptrace::getevent(pid)? as i32);
                if !self.tasks.contains_key(&child) {
                    self.adopt(child, true);
                }
                ptrace::syscall(pid, None)
            }
            WaitStatus::PtraceEvent(..) => ptrace::syscall(pid, None),
            WaitStatus::Stopped(_, signal) => self.on_signal(pid, signal),
            _ => Ok(()),
        }
    }

    fn reap(&mut self, pid: Pid, usage: &libc::rusage) {
        self.tasks.remove(&pid);
        if pid == self.main {
            self.outcome.cpu_time = timeval(usage.ru_utime) + timeval(usage.ru_stime);
            self.outcome.peak_memory_kb = usage.ru_maxrss.max(0) as u64;
            // Nothing outlives the main process.
            self.kill();
        }
    }

    fn adopt(&mut self, pid: Pid, awaiting_stop: bool) {
        self.tasks.insert(
            pid,
            Task {
                awaiting_stop,
                ..Task::default()
            },
        );
        if let Some(limit) = self.policy.process_limit() {
            if self.tasks.len() > limit as usize {
                debug!(pid = pid.as_raw(), limit, "Process limit exceeded");
                self.limit(LimitKind::Processes);
            }
        }
    }

    fn on_signal(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        if pid == self.main && !self.options_set && signal == Signal::SIGTRAP {
            ptrace::setoptions(
                pid,
                Options::PTRACE_O_TRACESYSGOOD
                    | Options::PTRACE_O_TRACECLONE
                    | Options::PTRACE_O_TRACEFORK
                    | Options::PTRACE_O_TRACEVFORK
                    | Options::PTRACE_O_EXITKILL,
            )?;
            self.options_set = true;
            return ptrace::syscall(pid, None);
        }

        if signal == Signal::SIGSTOP {
            match self.tasks.get_mut(&pid) {
                Some(task) if task.awaiting_stop => {
                    task.awaiting_stop = false;
                    return ptrace::syscall(pid, None);
                }
                // The new task's stop can arrive before its parent's event.
                None => {
                    self.adopt(pid, false);
                    return ptrace::syscall(pid, None);
                }
                Some(_) => {}
            }
        }

        match signal {
            Signal::SIGXCPU => self.limit(LimitKind::CpuTime),
            Signal::SIGXFSZ => self.limit(LimitKind::Output),
            _ => {}
        }
        ptrace::syscall(pid, Some(signal))
    }

    fn on_syscall(&mut self, pid: Pid) -> nix::Result<()> {
        let entering = {
            let task = self.tasks.entry(pid).or_default();
            task.in_syscall = !task.in_syscall;
            task.in_syscall
        };

        if !entering {
            let pending = self.tasks.get_mut(&pid).and_then(|t| t.pending_errno.take());
            if let Some(errno) = pending {
                let mut regs = ptrace::getregs(pid)?;
                regs.rax = (-(errno as i64)) as u64;
                ptrace::setregs(pid, regs)?;
            }
            return ptrace::syscall(pid, None);
        }

        let mut regs = ptrace::getregs(pid)?;
        let nr = regs.orig_rax as i64;
        let denied = match self.policy.rule(nr) {
            Some(SyscallRule::Allow) => None,
            Some(SyscallRule::Fail(errno)) => Some(errno),
            Some(SyscallRule::Path(arg)) => {
                if self.path_allowed(pid, &regs, arg)? {
                    None
                } else {
                    Some(Errno::EACCES)
                }
            }
            None => {
                let name = syscalls::name(nr).map_or_else(|| format!("#{}", nr), str::to_string);
                warn!(pid = pid.as_raw(), syscall = %name, "Disallowed syscall");
                if self.outcome.policy_violation.is_none() {
                    self.outcome.policy_violation = Some(SyscallViolation { id: nr, name });
                }
                self.kill();
                return Ok(());
            }
        };

        if let Some(errno) = denied {
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.pending_errno = Some(errno);
            }
            regs.orig_rax = u64::MAX;
            ptrace::setregs(pid, regs)?;
        }
        ptrace::syscall(pid, None)
    }

    fn path_allowed(&self, pid: Pid, regs: &libc::user_regs_struct, arg: PathArg) -> nix::Result<bool> {
        let raw = read_string(pid, syscall_arg(regs, arg.path))?;
        if raw.is_empty() {
            // AT_EMPTY_PATH: operates on an already open descriptor.
            return Ok(true);
        }

        let path = Path::new(OsStr::from_bytes(&raw));
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = match arg.dirfd.map(|idx| syscall_arg(regs, idx) as i32) {
                Some(fd) if fd != libc::AT_FDCWD => format!("/proc/{}/fd/{}", pid, fd),
                _ => format!("/proc/{}/cwd", pid),
            };
            match std::fs::read_link(&base) {
                Ok(dir) => dir.join(path),
                Err(_) => return Ok(false),
            }
        };

        let normalized = normalize_path(&absolute);
        let writing = arg.flags.is_some_and(|idx| opens_for_write(syscall_arg(regs, idx)));
        let allowed = if writing {
            self.policy.allows_write(&normalized)
        } else {
            self.policy.allows_path(&normalized)
        };
        if !allowed {
            debug!(pid = pid.as_raw(), path = %normalized.display(), writing, "Denied filesystem access");
        }
        Ok(allowed)
    }

    fn limit(&mut self, kind: LimitKind) {
        if self.outcome.limit_exceeded.is_none() {
            self.outcome.limit_exceeded = Some(kind);
        }
        self.kill();
    }

    fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            let _ = killpg(self.main, Signal::SIGKILL);
        }
    }
}

/// Wait for any task in the main process's group, tracees included.
fn wait_group(main: Pid) -> Result<(Pid, WaitStatus, libc::rusage), Errno> {
    let mut status = 0;
    // SAFETY: rusage is plain old data.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let pid = unsafe { libc::wait4(-main.as_raw(), &mut status, libc::__WALL, &mut usage) };
    if pid < 0 {
        return Err(Errno::last());
    }
    let pid = Pid::from_raw(pid);
    let status = WaitStatus::from_raw(pid, status)?;
    Ok((pid, status, usage))
}

fn syscall_arg(regs: &libc::user_regs_struct, idx: usize) -> u64 {
    match idx {
        0 => regs.rdi,
        1 => regs.rsi,
        2 => regs.rdx,
        3 => regs.r10,
        4 => regs.r8,
        _ => regs.r9,
    }
}

/// Read a NUL-terminated string from the tracee, capped at `PATH_MAX`.
fn read_string(pid: Pid, addr: u64) -> nix::Result<Vec<u8>> {
    let mut out = Vec::new();
    let word = std::mem::size_of::<libc::c_long>();
    let mut cursor = addr;
    while out.len() < PATH_MAX {
        let value = ptrace::read(pid, cursor as ptrace::AddressType)?;
        for byte in value.to_ne_bytes() {
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
        }
        cursor += word as u64;
    }
    Ok(out)
}

/// Whether `open(2)` flags can modify the file or create one.
fn opens_for_write(flags: u64) -> bool {
    let flags = OFlag::from_bits_truncate(flags as libc::c_int);
    flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_APPEND)
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}
