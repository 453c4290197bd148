//! Session scheduler: one worker thread ticking all sessions.
//!
//! Control-channel callbacks (connect, acquire response) arrive on the
//! receiver thread and only touch the session map under the scheduler
//! mutex; every tick, session callback and session destruction runs on the
//! single worker thread. A FIFO queue carries the pids due for a visit;
//! wrapper state bits keep each session enqueued at most once and never
//! ticked concurrently.

use crate::session::{SessionHandle, SourceSession};
use ringflip_ipc::{ConnectMessage, ControlMessage, Receiver, Sender, DAEMON_RECEIVER_NAME};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Worker idle period; closed sources are re-enqueued for cleanup on this
/// cadence and every live session gets a tick.
const WORKER_TICK: Duration = Duration::from_millis(100);

/// How long a client gets to finish the connect handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Builds a session for an accepted connect, or `None` to reject it.
pub type SessionFactory =
    Box<dyn Fn(u32, &ConnectMessage, SessionHandle) -> Option<Arc<SourceSession>> + Send + Sync>;

struct SessionWrapper {
    session: Arc<SourceSession>,
    enqueued: bool,
    running: bool,
    to_delete: bool,
    closed_by_peer: bool,
    to_force_finish: bool,
}

impl SessionWrapper {
    fn new(session: Arc<SourceSession>) -> Self {
        Self {
            session,
            enqueued: false,
            running: false,
            to_delete: false,
            closed_by_peer: false,
            to_force_finish: false,
        }
    }
}

struct ServerState {
    sessions: HashMap<u32, SessionWrapper>,
    queue: VecDeque<u32>,
    workers_exit: bool,
    session_finishing: bool,
    connection_deadline: Option<Instant>,
}

impl ServerState {
    /// A tick is enqueued at most once. No-op for deleted sessions unless
    /// the peer-close drain is still owed.
    fn enqueue_tick(&mut self, pid: u32) {
        let Some(wrapper) = self.sessions.get_mut(&pid) else {
            return;
        };
        if wrapper.enqueued || (wrapper.to_delete && !wrapper.closed_by_peer) {
            return;
        }
        if !wrapper.running {
            self.queue.push_back(pid);
        }
        wrapper.enqueued = true;
    }

    /// Marks a session for removal; with `by_peer` the worker first runs
    /// the peer-close callback and the post-mortem drain.
    fn enqueue_for_delete(&mut self, pid: u32, by_peer: bool) {
        let Some(wrapper) = self.sessions.get_mut(&pid) else {
            return;
        };
        wrapper.to_delete = true;
        wrapper.closed_by_peer = by_peer;
        // A running tick is not disturbed; the worker re-enqueues it for
        // the post-mortem pass when the tick returns.
        if !wrapper.running && !wrapper.enqueued {
            self.queue.push_back(pid);
            wrapper.enqueued = true;
        }
    }
}

struct ServerShared {
    state: Mutex<ServerState>,
    worker_cv: Condvar,
    server_cv: Condvar,
    stop_connect: AtomicBool,
    receiver_exit: AtomicBool,
}

/// The daemon's session scheduler and control-channel endpoint.
pub struct SessionServer {
    shared: Arc<ServerShared>,
    channel_dir: PathBuf,
    worker: Option<std::thread::JoinHandle<()>>,
    receiver_thread: Option<std::thread::JoinHandle<()>>,
}

impl SessionServer {
    /// Binds the daemon receiver in `channel_dir` and starts the worker
    /// and receiver threads.
    pub fn start(
        channel_dir: impl Into<PathBuf>,
        factory: SessionFactory,
    ) -> Result<Self, ringflip_ipc::WireError> {
        let channel_dir = channel_dir.into();
        let receiver = Receiver::bind(channel_dir.join(DAEMON_RECEIVER_NAME))?;
        receiver.set_poll_interval(WORKER_TICK)?;

        let shared = Arc::new(ServerShared {
            state: Mutex::new(ServerState {
                sessions: HashMap::new(),
                queue: VecDeque::new(),
                workers_exit: false,
                session_finishing: false,
                connection_deadline: None,
            }),
            worker_cv: Condvar::new(),
            server_cv: Condvar::new(),
            stop_connect: AtomicBool::new(false),
            receiver_exit: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("router_worker".into())
                .spawn(move || run_worker(&shared))
                .expect("spawn worker thread")
        };

        let receiver_thread = {
            let shared = Arc::clone(&shared);
            let channel_dir = channel_dir.clone();
            std::thread::Builder::new()
                .name("router_recv".into())
                .spawn(move || run_receiver(&shared, &receiver, &channel_dir, &factory))
                .expect("spawn receiver thread")
        };

        Ok(Self {
            shared,
            channel_dir,
            worker: Some(worker),
            receiver_thread: Some(receiver_thread),
        })
    }

    /// Directory holding the control sockets and region files.
    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    /// Number of live sessions (diagnostics and tests).
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().unwrap().sessions.len()
    }

    /// Runs `f` on a connected pid's session.
    pub fn with_session<R>(&self, pid: u32, f: impl FnOnce(&SourceSession) -> R) -> Option<R> {
        let state = self.shared.state.lock().unwrap();
        state.sessions.get(&pid).map(|w| f(&w.session))
    }

    /// One statistics series over all connected sources.
    pub fn show_source_statistics(&self, series: u16) {
        let sessions: Vec<Arc<SourceSession>> = {
            let state = self.shared.state.lock().unwrap();
            state
                .sessions
                .values()
                .map(|w| Arc::clone(&w.session))
                .collect()
        };
        info!(series, "log stat");
        for session in sessions {
            session.show_stats();
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        // Unblock any client connection in progress.
        self.shared.stop_connect.store(true, Ordering::Relaxed);

        // Stop the receiver so no new messages arrive.
        self.shared.receiver_exit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver_thread.take() {
            let _ = handle.join();
        }

        // Now the worker can exit safely.
        {
            let mut state = self.shared.state.lock().unwrap();
            state.workers_exit = true;
        }
        self.shared.worker_cv.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        // Remaining sessions drain detached in their destructors.
        self.shared.state.lock().unwrap().sessions.clear();
    }
}

fn run_worker(shared: &ServerShared) {
    let mut deadline = Instant::now() + WORKER_TICK;
    let mut guard = shared.state.lock().unwrap();

    while !guard.workers_exit {
        // Sleep until work arrives or the idle tick is due.
        while !guard.workers_exit && guard.queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (g, _timeout) = shared
                .worker_cv
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }

        if !guard.workers_exit {
            let now = Instant::now();
            if let Some(connect_deadline) = guard.connection_deadline {
                if now >= connect_deadline {
                    guard.connection_deadline = None;
                    shared.stop_connect.store(true, Ordering::Relaxed);
                }
            }
            if now >= deadline {
                deadline = now + WORKER_TICK;
                let pids: Vec<u32> = guard.sessions.keys().copied().collect();
                for pid in pids {
                    let closed = guard.sessions[&pid].session.is_source_closed();
                    if closed {
                        guard.enqueue_for_delete(pid, true);
                    } else {
                        guard.enqueue_tick(pid);
                    }
                }
            }
        }

        while !guard.workers_exit && !guard.queue.is_empty() {
            let pid = guard.queue.pop_front().expect("queue checked non-empty");

            let (session, closed_by_peer) = {
                let Some(wrapper) = guard.sessions.get_mut(&pid) else {
                    continue;
                };
                wrapper.enqueued = false;
                wrapper.running = true;
                let closed = std::mem::take(&mut wrapper.closed_by_peer);
                (Arc::clone(&wrapper.session), closed)
            };

            drop(guard);
            if closed_by_peer {
                session.on_closed_by_peer();
            }
            let mut requeue = session.tick();
            let send_failed = session.take_send_failure();
            let fast = session.take_fast_reschedule();
            guard = shared.state.lock().unwrap();

            let to_force_finish = {
                let Some(wrapper) = guard.sessions.get_mut(&pid) else {
                    continue;
                };
                if send_failed {
                    wrapper.to_delete = true;
                    wrapper.closed_by_peer = true;
                }
                wrapper.to_force_finish
            };

            if to_force_finish {
                // A reconnect waits on this pid; expedite the peer-close
                // drain and erase the entry.
                if !closed_by_peer {
                    drop(guard);
                    session.on_closed_by_peer();
                    requeue = true;
                    guard = shared.state.lock().unwrap();
                }
                if requeue {
                    drop(guard);
                    let _ = session.tick();
                    guard = shared.state.lock().unwrap();
                }
                guard.sessions.remove(&pid);
                guard.session_finishing = false;
                shared.server_cv.notify_all();
            } else {
                let state = &mut *guard;
                let mut push = false;
                let mut remove = false;
                if let Some(wrapper) = state.sessions.get_mut(&pid) {
                    wrapper.running = false;
                    // Re-enqueue for leftover work or the owed post-mortem
                    // pass; the fast hint shortens the next visit.
                    if requeue || fast || wrapper.closed_by_peer {
                        wrapper.enqueued = true;
                    }
                    if wrapper.enqueued {
                        push = true;
                    } else if wrapper.to_delete {
                        remove = true;
                    }
                }
                if push {
                    state.queue.push_back(pid);
                } else if remove {
                    state.sessions.remove(&pid);
                }
            }
        }
    }
}

fn run_receiver(
    shared: &ServerShared,
    receiver: &Receiver,
    channel_dir: &Path,
    factory: &SessionFactory,
) {
    while !shared.receiver_exit.load(Ordering::Relaxed) {
        match receiver.recv() {
            Ok(Some((ControlMessage::Connect(connect), pid))) => {
                on_connect(shared, channel_dir, factory, &connect, pid);
            }
            Ok(Some((ControlMessage::AcquireResponse(grant), pid))) => {
                let mut state = shared.state.lock().unwrap();
                if let Some(wrapper) = state.sessions.get(&pid) {
                    wrapper.session.on_acquire_response(grant);
                    state.enqueue_tick(pid);
                    shared.worker_cv.notify_all();
                }
            }
            Ok(Some((ControlMessage::AcquireRequest, pid))) => {
                warn!(pid, "unexpected acquire request at the daemon receiver");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "undecodable control message dropped");
            }
        }
    }
}

fn on_connect(
    shared: &ServerShared,
    channel_dir: &Path,
    factory: &SessionFactory,
    connect: &ConnectMessage,
    pid: u32,
) {
    let identifier = connect.identifier();
    info!(pid, %identifier, "client connecting");

    {
        let mut state = shared.state.lock().unwrap();
        if state.sessions.contains_key(&pid) {
            // The old pid owner died (or reconnects) without us noticing;
            // finish its session before admitting the new one.
            state = finish_previous_session(shared, state, pid);
        }
        state.connection_deadline = Some(Instant::now() + CONNECT_TIMEOUT);
        shared.stop_connect.store(false, Ordering::Relaxed);
    }

    // Sender creation retries internally; it must run without the mutex so
    // session ticks keep flowing meanwhile.
    let sender = Sender::connect(channel_dir.join(&identifier));

    {
        let mut state = shared.state.lock().unwrap();
        state.connection_deadline = None;
        if shared.stop_connect.swap(false, Ordering::Relaxed) {
            info!(pid, %identifier, "connect abandoned (timeout or shutdown)");
            return;
        }
    }

    let sender = match sender {
        Ok(sender) => sender,
        Err(err) => {
            error!(pid, %identifier, error = %err, "cannot reach client receiver");
            return;
        }
    };

    // The factory opens shared memory and may block on the config mutex;
    // never call it with the scheduler mutex held.
    let session = factory(pid, connect, SessionHandle::Ipc(sender));

    let mut state = shared.state.lock().unwrap();
    match session {
        Some(session) => {
            state.sessions.insert(pid, SessionWrapper::new(session));
            state.enqueue_tick(pid);
            shared.worker_cv.notify_all();
        }
        None => {
            error!(pid, %identifier, "failed to create session");
        }
    }
}

/// Force-finishes a pid's previous session and waits until the worker
/// erased it; returns the re-acquired guard.
fn finish_previous_session<'a>(
    shared: &'a ServerShared,
    mut guard: MutexGuard<'a, ServerState>,
    pid: u32,
) -> MutexGuard<'a, ServerState> {
    {
        let state = &mut *guard;
        if let Some(wrapper) = state.sessions.get_mut(&pid) {
            wrapper.to_force_finish = true;
            wrapper.to_delete = true;
            wrapper.closed_by_peer = true;
            if !wrapper.running && !wrapper.enqueued {
                state.queue.push_back(pid);
                wrapper.enqueued = true;
            }
            // Expedite: rotate the queue until this pid is at the front.
            // A wrapper marked enqueued while running is not in the queue;
            // the worker handles it when its tick returns.
            if wrapper.enqueued && !wrapper.running {
                for _ in 0..state.queue.len() {
                    if state.queue.front() == Some(&pid) {
                        break;
                    }
                    let other = state.queue.pop_front().expect("rotating non-empty queue");
                    state.queue.push_back(other);
                }
            }
        }
        state.session_finishing = true;
    }
    shared.worker_cv.notify_all();

    // Only one server thread ever waits here, for one session at a time.
    while guard.session_finishing {
        guard = shared.server_cv.wait(guard).unwrap();
    }
    guard
}
