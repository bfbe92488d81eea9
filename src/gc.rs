//! The background pump flushing coalesced reference-GC traffic.
//!
//! Dropping a handle does not talk to the owner directly: the del-client (or
//! add-client, when a handle is serialized) is buffered on the link to the
//! owner and the pump is signalled. The pump wakes up, drains every flagged
//! link and sends the buffered pairs as two `remote_do` batches. Coalescing
//! keeps a cascade of drops from storming the owner with one message each;
//! batches also piggy-back on ordinary outbound traffic (see
//! `WorkerLink::send_msg`).

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cluster::ProcessGroup;

/// How long the pump lets traffic accumulate after a wake-up before it
/// drains the buffers. A cascade of dropped handles lands in a handful of
/// batches instead of one message each.
const SETTLE_DELAY: Duration = Duration::from_millis(1);

struct SignalState {
    pending: bool,
    shutdown: bool,
}

/// Wake-up channel between handle finalization and the pump thread.
pub(crate) struct GcSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl GcSignal {
    pub(crate) fn new() -> GcSignal {
        GcSignal {
            state: Mutex::new(SignalState {
                pending: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Some link has GC traffic to flush.
    pub(crate) fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = true;
        self.cv.notify_one();
    }

    /// Stop the pump.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cv.notify_all();
    }

    /// Block until there is work or the pump must stop; returns `false` on
    /// shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.pending && !state.shutdown {
            state = self.cv.wait(state).unwrap();
        }
        state.pending = false;
        !state.shutdown
    }
}

/// Spawn the GC pump of a group. The pump holds a weak reference so it never
/// keeps the group alive; it exits when the group is gone or shut down.
pub(crate) fn spawn_gc_pump(group: &Arc<ProcessGroup>) -> JoinHandle<()> {
    let signal = group.gc_signal.clone();
    let weak = Arc::downgrade(group);
    thread::Builder::new()
        .name("GC pump".into())
        .spawn(move || gc_pump(signal, weak))
        .expect("Failed to spawn the GC pump")
}

fn gc_pump(signal: Arc<GcSignal>, weak: Weak<ProcessGroup>) {
    // the signal is held directly so waiting never keeps the group alive
    while signal.wait() {
        thread::sleep(SETTLE_DELAY);
        let Some(group) = weak.upgrade() else {
            break;
        };
        for link in group.links() {
            if !link.has_gc_pending() {
                continue;
            }
            // the pump must survive anything a dying link throws at it
            if let Err(e) = link.flush_gc() {
                warn!("Failed to flush GC messages to worker {}: {:?}", link.pid(), e);
            }
        }
    }
    debug!("GC pump exiting");
}
