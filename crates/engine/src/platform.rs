//! Thread placement and priority
//!
//! Everything that touches scheduler settings goes through [`ThreadTuning`]
//! so the engine can be tested without privileges.

use std::io;

use contracts::{ModuleFeatures, ThreadingConfig};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Scheduler controls for the calling thread
pub trait ThreadTuning: Send + Sync {
    fn pin_current_thread(&self, core: usize) -> io::Result<()>;

    fn set_current_thread_niceness(&self, niceness: i32) -> io::Result<()>;

    fn set_current_thread_realtime(&self, priority: i32) -> io::Result<()>;

    /// Undo affinity, niceness and realtime settings
    fn reset_current_thread(&self) -> io::Result<()>;

    fn available_cores(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Operating system implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadTuning;

#[cfg(target_os = "linux")]
mod os {
    use std::io;

    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn current_tid() -> libc::id_t {
        // SAFETY: gettid has no preconditions
        unsafe { libc::syscall(libc::SYS_gettid) as libc::id_t }
    }

    pub(super) fn set_affinity(cores: impl IntoIterator<Item = usize>) -> io::Result<()> {
        // SAFETY: cpu_set_t is plain data and zero is a valid empty set
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            for core in cores {
                libc::CPU_SET(core, &mut set);
            }
            check(libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            ))
        }
    }

    pub(super) fn set_niceness(niceness: i32) -> io::Result<()> {
        // SAFETY: plain syscall on the calling thread's id
        check(unsafe { libc::setpriority(libc::PRIO_PROCESS, current_tid(), niceness) })
    }

    pub(super) fn set_scheduler(policy: libc::c_int, priority: i32) -> io::Result<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: pthread_self is always valid for the calling thread
        let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(ret))
        }
    }
}

#[cfg(target_os = "linux")]
impl ThreadTuning for OsThreadTuning {
    fn pin_current_thread(&self, core: usize) -> io::Result<()> {
        os::set_affinity([core])
    }

    fn set_current_thread_niceness(&self, niceness: i32) -> io::Result<()> {
        os::set_niceness(niceness)
    }

    fn set_current_thread_realtime(&self, priority: i32) -> io::Result<()> {
        os::set_scheduler(libc::SCHED_RR, priority)
    }

    fn reset_current_thread(&self) -> io::Result<()> {
        let scheduler = os::set_scheduler(libc::SCHED_OTHER, 0);
        let niceness = os::set_niceness(0);
        let affinity = os::set_affinity(0..self.available_cores());
        scheduler.and(niceness).and(affinity)
    }
}

#[cfg(not(target_os = "linux"))]
impl ThreadTuning for OsThreadTuning {
    fn pin_current_thread(&self, core: usize) -> io::Result<()> {
        debug!(core, "thread pinning not supported on this platform");
        Ok(())
    }

    fn set_current_thread_niceness(&self, niceness: i32) -> io::Result<()> {
        debug!(niceness, "thread niceness not supported on this platform");
        Ok(())
    }

    fn set_current_thread_realtime(&self, priority: i32) -> io::Result<()> {
        debug!(priority, "realtime scheduling not supported on this platform");
        Ok(())
    }

    fn reset_current_thread(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Call recorded by [`RecordingTuning`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuningCall {
    Pin { thread: String, core: usize },
    Niceness { thread: String, niceness: i32 },
    Realtime { thread: String, priority: i32 },
    Reset { thread: String },
}

/// Records tuning requests instead of applying them
#[derive(Debug, Default)]
pub struct RecordingTuning {
    calls: Mutex<Vec<TuningCall>>,
}

impl RecordingTuning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TuningCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: TuningCall) {
        self.calls.lock().push(call);
    }
}

fn thread_label() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

impl ThreadTuning for RecordingTuning {
    fn pin_current_thread(&self, core: usize) -> io::Result<()> {
        self.record(TuningCall::Pin {
            thread: thread_label(),
            core,
        });
        Ok(())
    }

    fn set_current_thread_niceness(&self, niceness: i32) -> io::Result<()> {
        self.record(TuningCall::Niceness {
            thread: thread_label(),
            niceness,
        });
        Ok(())
    }

    fn set_current_thread_realtime(&self, priority: i32) -> io::Result<()> {
        self.record(TuningCall::Realtime {
            thread: thread_label(),
            priority,
        });
        Ok(())
    }

    fn reset_current_thread(&self) -> io::Result<()> {
        self.record(TuningCall::Reset {
            thread: thread_label(),
        });
        Ok(())
    }
}

/// Settings one execution context applies to itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningPlan {
    pub core: Option<usize>,
    pub niceness: Option<i32>,
    pub realtime_priority: Option<i32>,
}

impl TuningPlan {
    /// Plan for a module thread
    pub fn for_module(features: ModuleFeatures, threading: &ThreadingConfig, core: Option<usize>) -> Self {
        Self {
            core: core.filter(|_| features.contains(ModuleFeatures::REQUEST_CPU_AFFINITY)),
            niceness: threading.module_niceness,
            realtime_priority: features
                .contains(ModuleFeatures::REALTIME)
                .then_some(threading.realtime_priority),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply on the calling thread. Failures are logged, never fatal.
    pub fn apply(&self, tuning: &dyn ThreadTuning, label: &str) {
        if let Some(core) = self.core {
            if let Err(e) = tuning.pin_current_thread(core) {
                warn!(thread = label, core, error = %e, "failed to pin thread");
            }
        }
        if let Some(niceness) = self.niceness {
            if let Err(e) = tuning.set_current_thread_niceness(niceness) {
                warn!(thread = label, niceness, error = %e, "failed to set thread niceness");
            }
        }
        if let Some(priority) = self.realtime_priority {
            if let Err(e) = tuning.set_current_thread_realtime(priority) {
                warn!(thread = label, priority, error = %e, "failed to enable realtime scheduling");
            }
        }
        debug!(thread = label, plan = ?self, "thread tuning applied");
    }

    /// Undo [`apply`](Self::apply) if it changed anything
    pub fn reset(&self, tuning: &dyn ThreadTuning, label: &str) {
        if self.is_empty() {
            return;
        }
        if let Err(e) = tuning.reset_current_thread() {
            warn!(thread = label, error = %e, "failed to reset thread tuning");
        }
    }
}

/// Round-robin core assignment for modules requesting affinity
#[derive(Debug, Clone)]
pub struct CoreAllocator {
    cores: Vec<usize>,
    next: usize,
}

impl CoreAllocator {
    pub fn new(threading: &ThreadingConfig, available: usize) -> Self {
        let cores = if threading.affinity_cores.is_empty() {
            (0..available.max(1)).collect()
        } else {
            threading.affinity_cores.clone()
        };
        Self { cores, next: 0 }
    }

    pub fn assign(&mut self, features: ModuleFeatures) -> Option<usize> {
        if !features.contains(ModuleFeatures::REQUEST_CPU_AFFINITY) {
            return None;
        }
        let core = self.cores.get(self.next % self.cores.len().max(1)).copied();
        self.next += 1;
        core
    }
}
