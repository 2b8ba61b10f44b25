//! Process identity used to detect forks
use std::sync::atomic::{AtomicU32, Ordering};

/// Source of the current process id
///
/// After a fork the child sees a new pid while the reporter still holds
/// the parent's; the reporter compares the two to detect it.
pub trait ProcessIdentity: Send + Sync + 'static {
    fn current_pid(&self) -> u32;
}

/// The operating system's view of the current process
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcess;

impl ProcessIdentity for OsProcess {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// A settable pid, for simulating forks in tests
#[derive(Debug)]
pub struct SimulatedProcess {
    pid: AtomicU32,
}

impl SimulatedProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: AtomicU32::new(pid),
        }
    }

    /// Pretend the process forked into a child with `pid`
    pub fn fork_into(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }
}

impl ProcessIdentity for SimulatedProcess {
    fn current_pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }
}
