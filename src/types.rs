use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single authentication profile JSON file, identified by its filename stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProfile {
    pub name: String,
    pub path: PathBuf,
}

impl AuthProfile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Port assignments for a child proxy process. A slot's identity is its ports;
/// they never change across recycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildPorts {
    pub api_port: u16,
    pub stream_port: u16,
    pub debug_port: u16,
}

/// Abstraction over the OS process handle so the slot manager, registry and
/// watchdog can be exercised without spawning real children.
pub trait ProcessControl: Send {
    fn pid(&self) -> u32;
    /// Non-blocking status check. `Ok(None)` means the process is still running.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;
    /// Force the process down (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl ProcessControl for std::process::Child {
    fn pid(&self) -> u32 {
        self.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        std::process::Child::try_wait(self)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(self.id() as i32), Signal::SIGTERM).map_err(io::Error::other)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        std::process::Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        std::process::Child::wait(self)
    }
}

/// Tracking metadata for a launched child process.
///
/// Shared as `Arc<ChildProcess>` between the slot manager, registry, watchdog
/// and HTTP handlers. The `ready` flag is flipped by the health prober and the
/// registry; the process handle is only signaled through the slot manager.
pub struct ChildProcess {
    profile: AuthProfile,
    ports: ChildPorts,
    pid: u32,
    handle: Mutex<Box<dyn ProcessControl>>,
    ready: AtomicBool,
    log_path: Option<PathBuf>,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("profile", &self.profile.name)
            .field("ports", &self.ports)
            .field("pid", &self.pid)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ChildProcess {
    pub fn new(
        profile: AuthProfile,
        ports: ChildPorts,
        handle: Box<dyn ProcessControl>,
        log_path: Option<PathBuf>,
    ) -> Self {
        let pid = handle.pid();
        Self {
            profile,
            ports,
            pid,
            handle: Mutex::new(handle),
            ready: AtomicBool::new(false),
            log_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &AuthProfile {
        &self.profile
    }

    pub fn ports(&self) -> ChildPorts {
        self.ports
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the OS process is still running.
    pub fn is_alive(&self) -> bool {
        let mut handle = self.handle.lock().expect("child handle poisoned");
        matches!(handle.try_wait(), Ok(None))
    }

    /// The exit status, if the process has terminated.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut handle = self.handle.lock().expect("child handle poisoned");
        handle.try_wait().ok().flatten()
    }

    pub(crate) fn terminate(&self) -> io::Result<()> {
        let mut handle = self.handle.lock().expect("child handle poisoned");
        handle.terminate()
    }

    pub(crate) fn kill_and_wait(&self) -> io::Result<ExitStatus> {
        let mut handle = self.handle.lock().expect("child handle poisoned");
        handle.kill()?;
        handle.wait()
    }

    /// Poll for exit until `timeout` elapses. Returns true once the process is
    /// down. The handle lock is re-acquired per poll so concurrent status
    /// checks are not starved.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// One slot of the fixed pool: an immutable port triplet plus its current
/// occupant. Mutated only under the slot-manager lock.
#[derive(Debug)]
pub struct ProfileSlot {
    pub ports: ChildPorts,
    pub profile: Option<AuthProfile>,
    pub child: Option<std::sync::Arc<ChildProcess>>,
}

impl ProfileSlot {
    pub fn new(ports: ChildPorts) -> Self {
        Self {
            ports,
            profile: None,
            child: None,
        }
    }
}

/// FIFO of idle profiles awaiting a slot.
#[derive(Debug, Default)]
pub struct ProfileQueue {
    inner: VecDeque<AuthProfile>,
}

impl ProfileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, profile: AuthProfile) {
        self.inner.push_back(profile);
    }

    /// Requeue a profile so the next recycle attempt tries it first.
    pub fn push_front(&mut self, profile: AuthProfile) {
        self.inner.push_front(profile);
    }

    pub fn pop_front(&mut self) -> Option<AuthProfile> {
        self.inner.pop_front()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.iter().map(|p| p.name.clone()).collect()
    }
}

impl FromIterator<AuthProfile> for ProfileQueue {
    fn from_iter<T: IntoIterator<Item = AuthProfile>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

/// Outcome of broadcasting a cancellation request to child processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelResult {
    pub success: bool,
    pub responders: Vec<String>,
    pub failures: Vec<String>,
}
