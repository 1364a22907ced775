//! Interpreter pool (C3) — persistent-thread-per-slot actor model.
//!
//! ## Design
//!
//! Each pool slot is a dedicated OS thread that:
//! 1. Builds one `PyInterp` at startup and loads the configured script once
//!    (pre-warming; this runs `__init__`/`__main__` for that VM).
//! 2. Blocks indefinitely on a `Receiver<WorkItem>` channel.
//! 3. On receiving a work item: sets `CurrentSessionId`, dispatches the
//!    `Invocation` to the matching hook, clears `CurrentSessionId`, and
//!    signals completion back via the work item's response channel.
//! 4. The interpreter NEVER crosses thread boundaries — this is the key
//!    design invariant required because `PyInterp` is not `Send`.
//!
//! ## Thread safety
//!
//! The pool itself (slot dispatch) uses `Mutex<VecDeque<SyncSender<WorkItem>>>`
//! + `Condvar` to hand work channels to calling threads. Only the `Sender` end
//! of the work channel (which is `Send`) crosses thread boundaries. The
//! `PyInterp` stays on its dedicated slot thread.
//!
//! ## Recycling
//!
//! A VM cannot be moved to a fresh thread to pick up a new process image, so
//! "restart after N calls" is self-administered: each slot thread tracks its
//! own `PyInterp::invocation_count()` and reloads the script in place once the
//! threshold is crossed, rather than the two-queue (free/recover) scheme a
//! cross-thread-movable interpreter would need.
//!
//! ## Zero unsafe blocks
//!
//! This file contains no `unsafe` code. All concurrency uses safe Rust APIs
//! (`Mutex`, `Condvar`, `mpsc::sync_channel`, `Arc`).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{SessionId, Value};
use crate::vm::{build_interpreter, PyInterp};

/// Number of hook invocations a slot answers before reloading its script.
/// Bounds any slow memory growth inside a long-lived interpreter without
/// ever moving `PyInterp` across threads.
const RECYCLE_THRESHOLD: u64 = 1000;

/// Where an envelope being dispatched came from — mirrors the
/// `SetAssociatedSourceId`/`SetAssociatedSourceAddr` pair a script sees via
/// `net.reply`, so a reply can be routed back to the right transport.
pub(crate) struct Origin {
    pub source_id: u64,
    pub source_addr: String,
}

/// A unit of dispatch work sent from the dispatcher to a pool slot thread.
pub(crate) enum Invocation {
    Enter { session_id: SessionId, host: String, origin: Origin },
    Leave { session_id: SessionId, host: String, origin: Origin },
    Message { session_id: SessionId, body: std::collections::BTreeMap<i64, Value>, origin: Origin },
    /// Tells a slot thread to stop serving work and exit, dropping its
    /// `PyInterp` and closing its end of the work channel. Sent only by
    /// [`InterpreterPool::dispose`], directly to each slot's own sender —
    /// never placed on the shared idle queue.
    Shutdown,
}

pub(crate) struct WorkItem {
    pub invocation: Invocation,
    pub response: std::sync::mpsc::SyncSender<()>,
}

type SlotQueue = Arc<(Mutex<VecDeque<std::sync::mpsc::SyncSender<WorkItem>>>, Condvar)>;

fn start_slot_thread(
    slot_id: usize,
    script_entry: String,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    pool_available: SlotQueue,
) -> (std::sync::mpsc::SyncSender<WorkItem>, std::thread::JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::sync_channel::<WorkItem>(1);
    let direct_tx = tx.clone();

    let handle = std::thread::Builder::new()
        .name(format!("slave-pool-slot-{slot_id}"))
        .spawn(move || {
            let interp = build_interpreter(storage, transport);
            if let Err(e) = interp.load(&script_entry) {
                tracing::error!(slot_id, error = ?e, "slot failed to load script at startup");
            }

            {
                let (lock, cvar) = &*pool_available;
                let mut queue = lock.lock().expect("pool slot queue poisoned");
                queue.push_back(tx.clone());
                cvar.notify_one();
            }

            loop {
                let item = match rx.recv() {
                    Ok(item) => item,
                    Err(_) => break,
                };

                if matches!(item.invocation, Invocation::Shutdown) {
                    let _ = item.response.send(());
                    break;
                }

                run_invocation(&interp, item.invocation);

                if interp.invocation_count() >= RECYCLE_THRESHOLD {
                    tracing::info!(slot_id, "recycling slot after {RECYCLE_THRESHOLD} invocations");
                    if let Err(e) = interp.load(&script_entry) {
                        tracing::error!(slot_id, error = ?e, "slot failed to reload script while recycling");
                    }
                    interp.reset_invocation_count();
                }

                debug_assert!(interp.context().is_clean(), "slot {slot_id} returned to pool with dirty scratch state");

                let _ = item.response.send(());

                {
                    let (lock, cvar) = &*pool_available;
                    let mut queue = lock.lock().expect("pool slot queue poisoned");
                    queue.push_back(tx.clone());
                    cvar.notify_one();
                }
            }
            tracing::info!(slot_id, "pool slot disposed");
        })
        .expect("failed to spawn pool slot thread");

    (direct_tx, handle)
}

fn set_origin(interp: &PyInterp, origin: &Origin) {
    interp.context().associated_source_id.set(origin.source_id);
    *interp.context().associated_source_addr.borrow_mut() = origin.source_addr.clone();
}

fn run_invocation(interp: &PyInterp, invocation: Invocation) {
    match invocation {
        Invocation::Enter { session_id, host, origin } => {
            interp.set_current_session(session_id);
            set_origin(interp, &origin);
            interp.dispatch_enter(session_id, &host);
            interp.set_current_session(0);
        }
        Invocation::Leave { session_id, host, origin } => {
            interp.set_current_session(session_id);
            set_origin(interp, &origin);
            interp.dispatch_leave(session_id, &host);
            interp.set_current_session(0);
        }
        Invocation::Message { session_id, body, origin } => {
            interp.set_current_session(session_id);
            set_origin(interp, &origin);
            interp.dispatch_message(session_id, &body);
            interp.set_current_session(0);
        }
        Invocation::Shutdown => unreachable!("Shutdown is handled by the slot loop before reaching run_invocation"),
    }
}

/// Fixed-size pool of pre-warmed script interpreters, one dedicated OS thread
/// per slot.
pub struct InterpreterPool {
    available: SlotQueue,
    target_size: usize,
    /// One direct sender per slot, used only by [`Self::dispose`] to reach a
    /// slot that may currently be idle in `available` or mid-invocation.
    slot_senders: Mutex<Vec<std::sync::mpsc::SyncSender<WorkItem>>>,
    slot_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl InterpreterPool {
    /// Creates and pre-warms a pool of `size` slot threads, each loading
    /// `script_entry` once. Blocks until every slot has finished loading and
    /// reported itself available. The minimum effective size is 1.
    pub fn new(size: usize, script_entry: &str, storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        let target_size = size.max(1);
        let available: SlotQueue = Arc::new((Mutex::new(VecDeque::with_capacity(target_size)), Condvar::new()));

        let mut slot_senders = Vec::with_capacity(target_size);
        let mut slot_handles = Vec::with_capacity(target_size);
        for slot_id in 0..target_size {
            let (tx, handle) = start_slot_thread(
                slot_id,
                script_entry.to_owned(),
                Arc::clone(&storage),
                Arc::clone(&transport),
                Arc::clone(&available),
            );
            slot_senders.push(tx);
            slot_handles.push(handle);
        }

        {
            let (lock, cvar) = &*available;
            let mut queue = lock.lock().expect("pool queue poisoned");
            while queue.len() < target_size {
                queue = cvar.wait(queue).expect("pool condvar poisoned");
            }
        }

        InterpreterPool {
            available,
            target_size,
            slot_senders: Mutex::new(slot_senders),
            slot_handles: Mutex::new(slot_handles),
        }
    }

    /// Drain the idle queue and tell every slot to stop, then join each slot
    /// thread so its `PyInterp` is dropped before this returns (§4.3
    /// `Dispose()`: "drain the free queue and destroy each VM; close
    /// channels"). Every slot is in exactly one of {idle, mid-invocation} at
    /// call time; `Shutdown` reaches it either way since it is sent directly
    /// to the slot's own sender rather than placed on the shared queue.
    pub fn dispose(&self) {
        {
            let (lock, _) = &*self.available;
            lock.lock().expect("pool queue poisoned").clear();
        }

        let senders = std::mem::take(&mut *self.slot_senders.lock().expect("slot senders poisoned"));
        for tx in &senders {
            let (response_tx, response_rx) = std::sync::mpsc::sync_channel(1);
            if tx.send(WorkItem { invocation: Invocation::Shutdown, response: response_tx }).is_ok() {
                let _ = response_rx.recv_timeout(Duration::from_secs(5));
            }
        }

        let handles = std::mem::take(&mut *self.slot_handles.lock().expect("slot handles poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Initialize the process-global pool singleton. Must be called exactly
    /// once, by the supervisor during startup, before any `global()` call.
    pub fn init(size: usize, script_entry: &str, storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> &'static InterpreterPool {
        static INSTANCE: OnceLock<InterpreterPool> = OnceLock::new();
        INSTANCE.get_or_init(|| InterpreterPool::new(size, script_entry, storage, transport))
    }

    /// Dispatch a work item to an available slot thread. Blocks until a slot
    /// frees up or `checkout_timeout` elapses; returns `false` on timeout,
    /// meaning the item was never handed to a slot.
    pub(crate) fn dispatch(&self, invocation: Invocation, checkout_timeout: Duration) -> bool {
        let (lock, cvar) = &*self.available;
        let deadline = std::time::Instant::now() + checkout_timeout;

        let slot_tx = loop {
            let mut queue = lock.lock().expect("pool queue poisoned");
            if let Some(tx) = queue.pop_front() {
                break tx;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let result = cvar.wait_timeout(queue, remaining).expect("pool condvar poisoned");
            drop(result.0);
        };

        let (response_tx, response_rx) = std::sync::mpsc::sync_channel(1);
        let _ = slot_tx.send(WorkItem { invocation, response: response_tx });
        let _ = response_rx.recv_timeout(Duration::from_secs(30));
        true
    }

    pub fn idle_count(&self) -> usize {
        let (lock, _) = &*self.available;
        lock.lock().expect("pool queue poisoned").len()
    }

    pub fn size(&self) -> usize {
        self.target_size
    }
}

#[cfg(test)]
impl InterpreterPool {
    /// A pool with no slots and a permanently empty idle queue, for testing
    /// code paths that receive a `&InterpreterPool` but must return before
    /// ever touching it — e.g. the dispatcher's missing-body guard, which
    /// never reaches `dispatch()`. Spawns no threads, so it's cheap to build
    /// unlike [`InterpreterPool::new`].
    pub(crate) fn empty_for_test() -> Self {
        InterpreterPool {
            available: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            target_size: 0,
            slot_senders: Mutex::new(Vec::new()),
            slot_handles: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NullStorage;
    use crate::transport::ChannelTransport;
    use std::io::Write as _;

    fn make_script() -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("slave_core_pool_test_{}.py", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(
            b"entries = []\n\
              def __init__():\n\
              \treturn 0\n\
              def __enter__(session_id, addr):\n\
              \tentries.append(session_id)\n",
        )
        .unwrap();
        path
    }

    fn make_pool(size: usize) -> InterpreterPool {
        let (tcp_tx, _tcp_rx) = tokio::sync::mpsc::unbounded_channel();
        let (dg_tx, _dg_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tcp_tx, dg_tx));
        let script = make_script();
        InterpreterPool::new(size, script.to_str().unwrap(), Arc::new(NullStorage), transport)
    }

    #[test]
    #[ignore = "slow: VM init per slot"]
    fn new_pool_reports_all_slots_idle() {
        let pool = make_pool(2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    #[ignore = "slow: VM init per slot"]
    fn dispatch_returns_slot_to_idle_queue() {
        let pool = make_pool(1);
        let dispatched = pool.dispatch(
            Invocation::Enter { session_id: 7, host: String::new(), origin: Origin { source_id: 0, source_addr: String::new() } },
            Duration::from_secs(5),
        );
        assert!(dispatched);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    #[ignore = "slow: VM init per slot"]
    fn dispose_joins_every_slot_thread() {
        let pool = make_pool(2);
        assert_eq!(pool.idle_count(), 2);
        pool.dispose();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.slot_handles.lock().unwrap().is_empty());
    }

    #[test]
    fn dispatch_with_zero_timeout_fails_when_no_slot_is_idle() {
        // An empty queue with a zero timeout must return false without blocking;
        // exercised at the data-structure level since spinning up a VM slot is slow.
        let pool = InterpreterPool::empty_for_test();
        let dispatched = pool.dispatch(
            Invocation::Enter { session_id: 1, host: String::new(), origin: Origin { source_id: 0, source_addr: String::new() } },
            Duration::ZERO,
        );
        assert!(!dispatched);
    }
}
