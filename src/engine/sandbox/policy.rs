//! Resource policy: which syscalls and paths a run is granted, and the grace
//! margins added on top of the user-facing limits.
//!
//! A policy is an immutable value. Language and deployment specifics are
//! described by [`PolicyFragment`]s and folded in with
//! [`ResourcePolicy::compose`], which always returns a new policy and leaves
//! the receiver untouched.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use regex::Regex;

use super::syscalls::{self, PathArg};
use super::SandboxError;

/// Address-space headroom every traced run gets over its memory limit, so
/// resident memory can pass the limit (and be reported as such) before
/// allocations start failing.
const BASE_ADDRESS_SPACE_GRACE_KB: u64 = 65536;

/// What happens when the child issues a granted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallRule {
    Allow,
    /// Skip the syscall; the child sees it fail with this errno and carries on.
    Fail(Errno),
    /// Allow only when the path argument matches `fs_allow` (`fs_write`
    /// for a write-mode open), else `EACCES`.
    Path(PathArg),
}

/// Ceiling on the number of live tasks (processes and threads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessCeiling {
    #[default]
    Single,
    /// Whatever the host's data table says (see `syscalls::HOST_PROCESS_CEILING`).
    HostDefault,
    Unlimited,
}

impl ProcessCeiling {
    pub fn limit(self) -> Option<u32> {
        match self {
            ProcessCeiling::Single => syscalls::SINGLE_PROCESS_CEILING,
            ProcessCeiling::HostDefault => syscalls::HOST_PROCESS_CEILING,
            ProcessCeiling::Unlimited => None,
        }
    }
}

/// A filesystem allow-list entry: a regex anchored at the path start.
#[derive(Debug, Clone)]
pub struct FsPattern {
    regex: Regex,
}

impl FsPattern {
    pub fn new(pattern: &str) -> Result<Self, SandboxError> {
        let regex = Regex::new(&format!("^(?:{})", pattern))
            .map_err(|e| SandboxError::InvalidPattern(format!("{}: {}", pattern, e)))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Pattern granting a directory and everything below it, and nothing that
/// merely shares its name as a prefix.
pub fn dir_pattern(path: &Path) -> String {
    let text = path.to_string_lossy();
    format!("{}(?:/|$)", regex::escape(text.trim_end_matches('/')))
}

/// Pattern granting exactly one path.
pub fn exact_pattern(path: &Path) -> String {
    format!("{}$", regex::escape(&path.to_string_lossy()))
}

/// Patterns for every ancestor of `path` (excluding `/`), each anchored so
/// only the directory itself matches.
pub fn ancestor_patterns(path: &Path) -> Vec<String> {
    path.ancestors()
        .skip(1)
        .filter(|p| p.parent().is_some())
        .map(exact_pattern)
        .collect()
}

/// A runtime install directory plus its ancestor chain, so the runtime can
/// resolve libraries along the whole path.
pub fn install_home_chain(home: &Path) -> Vec<String> {
    let mut patterns = vec![dir_pattern(home)];
    patterns.extend(ancestor_patterns(home));
    patterns
}

/// Language- or deployment-specific additions to a policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyFragment {
    pub syscalls: Vec<(&'static str, SyscallRule)>,
    pub fs: Vec<String>,
    pub fs_write: Vec<String>,
    pub time_grace: Duration,
    pub memory_grace_kb: u64,
    pub address_space_grace_kb: u64,
    pub processes: Option<ProcessCeiling>,
}

impl PolicyFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, name: &'static str) -> Self {
        self.syscalls.push((name, SyscallRule::Allow));
        self
    }

    pub fn fail(mut self, name: &'static str, errno: Errno) -> Self {
        self.syscalls.push((name, SyscallRule::Fail(errno)));
        self
    }

    pub fn fs(mut self, pattern: impl Into<String>) -> Self {
        self.fs.push(pattern.into());
        self
    }

    pub fn fs_write(mut self, pattern: impl Into<String>) -> Self {
        self.fs_write.push(pattern.into());
        self
    }

    pub fn memory_grace_kb(mut self, kb: u64) -> Self {
        self.memory_grace_kb = kb;
        self
    }

    pub fn address_space_grace_kb(mut self, kb: u64) -> Self {
        self.address_space_grace_kb = kb;
        self
    }

    pub fn processes(mut self, ceiling: ProcessCeiling) -> Self {
        self.processes = Some(ceiling);
        self
    }
}

#[derive(Debug, Clone)]
enum SyscallFilter {
    /// No interception at all (compilers, version probes).
    Unrestricted,
    Only(HashMap<i64, (&'static str, SyscallRule)>),
}

/// Complete policy for one run.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    syscalls: SyscallFilter,
    fs_allow: Vec<FsPattern>,
    fs_write: Vec<FsPattern>,
    time_grace: Duration,
    memory_grace_kb: u64,
    address_space_grace_kb: u64,
    processes: ProcessCeiling,
    address_space_ceiling: bool,
}

impl ResourcePolicy {
    /// Policy every traced run starts from.
    pub fn base() -> Result<Self, SandboxError> {
        let mut policy = Self {
            syscalls: SyscallFilter::Only(HashMap::new()),
            fs_allow: Vec::new(),
            fs_write: Vec::new(),
            time_grace: Duration::ZERO,
            memory_grace_kb: 0,
            address_space_grace_kb: BASE_ADDRESS_SPACE_GRACE_KB,
            processes: ProcessCeiling::Single,
            address_space_ceiling: true,
        };
        for name in syscalls::BASE_SYSCALLS {
            policy.grant(name, SyscallRule::Allow)?;
        }
        for pattern in syscalls::BASE_FS {
            policy.fs_allow.push(FsPattern::new(pattern)?);
        }
        for pattern in syscalls::BASE_FS_WRITE {
            policy.fs_write.push(FsPattern::new(pattern)?);
        }
        Ok(policy)
    }

    /// Policy for trusted tooling such as compilers: limits only, no
    /// syscall or filesystem interception.
    pub fn unrestricted() -> Self {
        Self {
            syscalls: SyscallFilter::Unrestricted,
            fs_allow: Vec::new(),
            fs_write: Vec::new(),
            time_grace: Duration::ZERO,
            memory_grace_kb: 0,
            address_space_grace_kb: 0,
            processes: ProcessCeiling::Unlimited,
            address_space_ceiling: false,
        }
    }

    /// New policy with `fragment` folded in.
    pub fn compose(&self, fragment: &PolicyFragment) -> Result<Self, SandboxError> {
        let mut next = self.clone();
        for (name, rule) in &fragment.syscalls {
            next.grant(*name, *rule)?;
        }
        for pattern in &fragment.fs {
            next.fs_allow.push(FsPattern::new(pattern)?);
        }
        for pattern in &fragment.fs_write {
            next.fs_write.push(FsPattern::new(pattern)?);
        }
        next.time_grace += fragment.time_grace;
        next.memory_grace_kb += fragment.memory_grace_kb;
        next.address_space_grace_kb += fragment.address_space_grace_kb;
        if let Some(ceiling) = fragment.processes {
            next.processes = ceiling;
        }
        Ok(next)
    }

    fn grant(&mut self, name: &'static str, rule: SyscallRule) -> Result<(), SandboxError> {
        let SyscallFilter::Only(table) = &mut self.syscalls else {
            return Ok(());
        };
        let nr = syscalls::number(name)
            .ok_or_else(|| SandboxError::UnknownSyscall(name.to_string()))?;
        let rule = match (rule, syscalls::path_arg(name)) {
            (SyscallRule::Allow, Some(arg)) => SyscallRule::Path(arg),
            (rule, _) => rule,
        };
        table.insert(nr, (name, rule));
        Ok(())
    }

    pub fn is_traced(&self) -> bool {
        matches!(self.syscalls, SyscallFilter::Only(_))
    }

    /// Rule for a syscall number; `None` means the syscall is not granted.
    pub fn rule(&self, nr: i64) -> Option<SyscallRule> {
        match &self.syscalls {
            SyscallFilter::Unrestricted => Some(SyscallRule::Allow),
            SyscallFilter::Only(table) => table.get(&nr).map(|(_, rule)| *rule),
        }
    }

    pub fn grants(&self, name: &str) -> bool {
        syscalls::number(name).is_some_and(|nr| self.rule(nr).is_some())
    }

    /// Whether an absolute, normalised path is on the allow-list.
    pub fn allows_path(&self, path: &Path) -> bool {
        if !self.is_traced() {
            return true;
        }
        let text = path.to_string_lossy();
        self.fs_allow.iter().any(|pattern| pattern.matches(&text))
    }

    /// Whether an absolute, normalised path may be opened for writing,
    /// creation or truncation.
    pub fn allows_write(&self, path: &Path) -> bool {
        if !self.is_traced() {
            return true;
        }
        let text = path.to_string_lossy();
        self.fs_write.iter().any(|pattern| pattern.matches(&text))
    }

    pub fn time_grace(&self) -> Duration {
        self.time_grace
    }

    pub fn memory_grace_kb(&self) -> u64 {
        self.memory_grace_kb
    }

    pub fn address_space_grace_kb(&self) -> u64 {
        self.address_space_grace_kb
    }

    pub fn process_limit(&self) -> Option<u32> {
        self.processes.limit()
    }

    pub fn limits_address_space(&self) -> bool {
        self.address_space_ceiling
    }
}

/// Lexically normalise an absolute path (`.` and `..` removed, no symlink
/// resolution).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_compose_never_mutates_base() {
        let base = ResourcePolicy::base().unwrap();

        let first = base
            .compose(&PolicyFragment::new().allow("mincore").fs(r"/opt/go/"))
            .unwrap();
        let second = base
            .compose(&PolicyFragment::new().fs(dir_pattern(Path::new("/tmp"))))
            .unwrap();

        assert!(!base.allows_path(Path::new("/opt/go/bin/go")));
        assert!(!base.allows_path(Path::new("/tmp/input")));
        assert!(!base.grants("mincore"));
        assert!(first.grants("mincore"));
        assert!(!second.grants("mincore"));
        assert!(first.allows_path(Path::new("/opt/go/bin/go")));
        assert!(!second.allows_path(Path::new("/opt/go/bin/go")));
        assert!(second.allows_path(Path::new("/tmp/input")));
        assert!(!first.allows_path(Path::new("/tmp/input")));
    }

    #[test]
    fn test_graces_accumulate() {
        let policy = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment::new().memory_grace_kb(65536))
            .unwrap()
            .compose(&PolicyFragment::new().memory_grace_kb(1024).address_space_grace_kb(4096))
            .unwrap();
        assert_eq!(policy.memory_grace_kb(), 66560);
        assert_eq!(policy.address_space_grace_kb(), BASE_ADDRESS_SPACE_GRACE_KB + 4096);
    }

    #[test]
    fn test_fail_rule_and_path_upgrade() {
        let policy = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment::new().fail("fork", Errno::EAGAIN))
            .unwrap();
        let fork = syscalls::number("fork").unwrap();
        let openat = syscalls::number("openat").unwrap();
        let execve = syscalls::number("execve").unwrap();
        assert_eq!(policy.rule(fork), Some(SyscallRule::Fail(Errno::EAGAIN)));
        assert!(matches!(policy.rule(openat), Some(SyscallRule::Path(_))));
        assert_eq!(policy.rule(execve), None);
    }

    #[test]
    fn test_base_address_space_grace() {
        assert_eq!(ResourcePolicy::base().unwrap().address_space_grace_kb(), 65536);
        assert_eq!(ResourcePolicy::unrestricted().address_space_grace_kb(), 0);
    }

    #[test]
    fn test_readable_paths_are_not_writable() {
        let policy = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment::new().fs(dir_pattern(Path::new("/srv/work"))))
            .unwrap();
        for path in ["/usr/local/lib/libevil.so", "/lib/x86_64-linux-gnu/libc.so.6", "/srv/work/out.txt"] {
            assert!(policy.allows_path(Path::new(path)), "{} should be readable", path);
            assert!(!policy.allows_write(Path::new(path)), "{} should not be writable", path);
        }
        assert!(policy.allows_write(Path::new("/dev/null")));

        let scratch = policy
            .compose(&PolicyFragment::new().fs_write(dir_pattern(Path::new("/srv/work/scratch"))))
            .unwrap();
        assert!(scratch.allows_write(Path::new("/srv/work/scratch/a")));
        assert!(!scratch.allows_write(Path::new("/srv/work/out.txt")));
        assert!(!policy.allows_write(Path::new("/srv/work/scratch/a")));
    }

    #[test]
    fn test_dir_pattern_rejects_sibling_prefix() {
        let policy = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment::new().fs(dir_pattern(Path::new("/opt/ruby"))))
            .unwrap();
        assert!(policy.allows_path(Path::new("/opt/ruby")));
        assert!(policy.allows_path(Path::new("/opt/ruby/lib/x.so")));
        assert!(!policy.allows_path(Path::new("/opt/ruby-evil/lib")));
    }

    #[test]
    fn test_ancestor_patterns_are_exact() {
        let patterns = ancestor_patterns(Path::new("/opt/lang/ruby"));
        assert_eq!(patterns, vec![r"/opt/lang$".to_string(), r"/opt$".to_string()]);
    }

    #[test]
    fn test_install_home_chain() {
        let policy = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment {
                fs: install_home_chain(Path::new("/opt/ruby.3")),
                ..PolicyFragment::default()
            })
            .unwrap();
        assert!(policy.allows_path(Path::new("/opt/ruby.3/lib/libruby.so")));
        assert!(policy.allows_path(Path::new("/opt")));
        assert!(!policy.allows_path(Path::new("/opt/ruby-3/lib")));
        assert!(!policy.allows_path(Path::new("/opt/other")));
    }

    #[test]
    fn test_unknown_syscall_rejected() {
        let err = ResourcePolicy::base()
            .unwrap()
            .compose(&PolicyFragment::new().allow("not_a_syscall"))
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSyscall(_)));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/usr/lib/../bin/./ruby")), PathBuf::from("/usr/bin/ruby"));
        assert_eq!(normalize_path(Path::new("/../../etc/passwd")), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_unrestricted_allows_everything() {
        let policy = ResourcePolicy::unrestricted();
        assert!(!policy.is_traced());
        assert!(policy.allows_path(Path::new("/etc/shadow")));
        assert!(policy.allows_write(Path::new("/usr/lib/anything")));
        assert_eq!(policy.process_limit(), None);
    }
}
