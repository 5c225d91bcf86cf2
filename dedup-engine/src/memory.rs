use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use sysinfo::{Pid, System};
use tracing::debug;

/// Source of the process memory figure used to pick the streaming path and to pace chunks.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the process in bytes, if it can be measured.
    fn used_bytes(&self) -> Option<u64>;

    /// Ask the platform to give memory back. Purely advisory; the default does nothing.
    fn release_hint(&self) {}
}

/// Reads this process's resident set size.
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                debug!("process memory is not measurable on this platform: {}", error);
                None
            }
        };

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

/// A probe that reports whatever it was last told. Also counts release hints.
#[derive(Default)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
    hints: AtomicUsize,
}

impl FixedMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
            hints: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn release_hints(&self) -> usize {
        self.hints.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }

    fn release_hint(&self) {
        self.hints.fetch_add(1, Ordering::SeqCst);
    }
}
