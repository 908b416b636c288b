//! The evented IO reactor.
//!
//! A [`Reactor`] owns everything a process needs to run the event loop: the
//! deferred task queue, the timer queue, the polling set, the registry of
//! live IO objects, the worker supervisor and the IPC state. One cycle:
//!
//! 1. advance the tick and move due timers into the task queue,
//! 2. once per second, sweep idle objects and supervise workers,
//! 3. run queued tasks,
//! 4. wait for readiness (or a wake byte) and queue the resulting events.
//!
//! All reactor state is touched only from tasks running on the reactor
//! thread; other threads go through a [`Deferrer`] or [`ReactorHandle`].

pub mod async_queue;
pub mod io;
pub mod listen;
mod poll;
pub mod protocol;
pub(crate) mod queue;
mod registry;
pub mod stage;
pub(crate) mod stream;
pub mod timer;
mod workers;

pub use async_queue::AsyncQueue;
pub use io::{CloseReason, EnvCloseFn, EnvValue, Io, IoId, Lifecycle, Udata};
pub use listen::{ConnectFailedFn, ListenOptions};
pub use protocol::{
    Handler, IoFunctions, PlainIo, Protocol, ProtocolBuilder, ProtocolId, Session, TlsContext,
    UserHook,
};
pub use queue::{Deferrer, Task};
pub use stage::{Stage, StageFn};
pub use stream::Guard;
pub use timer::{FinishFn, Repeat, TimerFn, TimerId};

use crate::config::{IoConfig, TetherConfig};
use crate::error::{Result, TetherError};
use crate::ipc::{Ipc, IpcState};
use crate::platform;
use listen::ListenerInfo;
use poll::{Interest, PollSet};
use queue::TaskQueue;
use registry::Registry;
use stage::Stages;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use timer::{Timer, TimerQueue};
use tracing::{debug, error, info, warn};
use workers::Supervisor;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The part a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No workers; this process does everything.
    Single,
    /// Root process supervising forked workers.
    Master,
    /// Forked worker with its index.
    Worker(usize),
}

/// Thread-safe handle for stopping the reactor and scheduling work.
#[derive(Clone)]
pub struct ReactorHandle {
    stop: Arc<AtomicBool>,
    deferrer: Deferrer,
}

impl ReactorHandle {
    /// Ask the reactor to shut down. Returns immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.deferrer.defer(|_| {});
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.deferrer.defer(task);
    }
}

/// The process-wide event loop context.
pub struct Reactor {
    pub(crate) config: TetherConfig,
    queue: Arc<TaskQueue>,
    pub(crate) poll: PollSet,
    timers: TimerQueue,
    pub(crate) registry: Registry,
    pub(crate) listeners: HashMap<IoId, ListenerInfo>,
    pub(crate) stages: Stages,
    supervisor: Supervisor,
    pub(crate) async_queue: Option<AsyncQueue>,
    pub(crate) ipc: IpcState,
    pub(crate) role: Role,
    running: bool,
    stop: Arc<AtomicBool>,
    supervise_due: bool,
    idle: bool,
    tick: u64,
    last_second: u64,
    pid: u32,
    root_pid: u32,
}

impl Reactor {
    /// Create a reactor. Nothing runs until [`Reactor::start`].
    pub fn new(config: TetherConfig) -> Result<Self> {
        config.validate()?;
        let (queue, wake_rx) =
            TaskQueue::new().map_err(|e| TetherError::io_with_context(e, "creating task queue"))?;
        let ipc = IpcState::new(&config)?;
        let tick = now_ms();
        let pid = std::process::id();
        Ok(Self {
            config,
            queue,
            poll: PollSet::new(wake_rx),
            timers: TimerQueue::default(),
            registry: Registry::default(),
            listeners: HashMap::new(),
            stages: Stages::default(),
            supervisor: Supervisor::default(),
            async_queue: None,
            ipc,
            role: Role::Single,
            running: false,
            stop: Arc::new(AtomicBool::new(false)),
            supervise_due: false,
            idle: false,
            tick,
            last_second: tick / 1000,
            pid,
            root_pid: pid,
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// A cloneable, thread-safe handle onto the task queue.
    pub fn deferrer(&self) -> Deferrer {
        Deferrer {
            queue: self.queue.clone(),
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            stop: self.stop.clone(),
            deferrer: self.deferrer(),
        }
    }

    /// Schedule `task` to run on the reactor thread after the current task.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.queue.push(Box::new(task));
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// The reactor clock in milliseconds since the UNIX epoch. Advances
    /// once per cycle and never goes backwards.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    fn update_tick(&mut self) {
        self.tick = self.tick.max(now_ms());
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True in the root process (single or master).
    pub fn is_master(&self) -> bool {
        !self.is_worker()
    }

    pub fn is_worker(&self) -> bool {
        matches!(self.role, Role::Worker(_))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Worker processes this reactor runs (or will run) under a master.
    pub fn workers(&self) -> usize {
        self.config.worker_count()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    /// Number of attached objects (listeners included).
    pub fn io_count(&self) -> usize {
        self.registry.len()
    }

    /// Ask the loop to stop after the current cycle.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // Timers

    /// Run `task` every `every` until it returns `false`, the repeat count
    /// is exhausted or the timer is cancelled. `on_finish` runs once after.
    pub fn run_every<F>(
        &mut self,
        every: Duration,
        repeat: Repeat,
        task: F,
        on_finish: Option<FinishFn>,
    ) -> TimerId
    where
        F: FnMut(&mut Reactor) -> bool + Send + 'static,
    {
        self.timers.schedule(
            every.as_millis() as u64,
            repeat,
            Box::new(task),
            on_finish,
            self.tick,
        )
    }

    /// Run `task` once after `delay`.
    pub fn run_after<F>(&mut self, delay: Duration, task: F) -> TimerId
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        let mut task = Some(task);
        self.run_every(
            delay,
            Repeat::Times(1),
            move |r| {
                if let Some(task) = task.take() {
                    task(r);
                }
                false
            },
            None,
        )
    }

    /// Cancel a timer. Its finish callback is deferred. Returns false if
    /// the timer is unknown or already finished.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timers.cancel(id) {
            Some(mut timer) => {
                if let Some(finish) = timer.take_finish() {
                    self.queue.push(finish);
                }
                true
            }
            None => self.timers.is_cancelled(id),
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn schedule_due_timers(&mut self) {
        for timer in self.timers.take_due(self.tick) {
            self.queue.push(Box::new(move |r: &mut Reactor| r.fire_timer(timer)));
        }
    }

    fn fire_timer(&mut self, mut timer: Timer) {
        let id = timer.id();
        let keep = !self.timers.is_cancelled(id) && timer.fire(self);
        if keep && !self.timers.is_cancelled(id) {
            self.timers.reschedule(timer, self.tick);
            return;
        }
        self.timers.settle(id);
        if let Some(finish) = timer.take_finish() {
            finish(self);
        }
    }

    // IO objects

    /// Attach a descriptor to `protocol`.
    ///
    /// The descriptor is made non-blocking and registered right away; the
    /// transport start, `on_attach` and read monitoring are deferred so the
    /// caller never sees a half-initialized object. If the descriptor cannot
    /// be used, `on_close` and `cleanup` run before this returns.
    pub fn attach(
        &mut self,
        fd: impl Into<OwnedFd>,
        protocol: Arc<Protocol>,
        udata: Option<Udata>,
        tls: Option<TlsContext>,
    ) -> Result<Io> {
        let owned: OwnedFd = fd.into();
        let raw = owned.as_raw_fd();
        if let Err(e) = platform::set_nonblocking(raw) {
            warn!("Cannot attach fd {}: {}", raw, e);
            drop(owned);
            return Err(self.reject_attach(raw, &protocol, udata, tls));
        }

        let io = Io::new(
            Some(Arc::new(File::from(owned))),
            raw,
            &protocol,
            udata,
            tls,
            self.deferrer(),
            self.tick,
        );
        self.registry.insert(io.clone());
        self.registry.join(&io, &protocol, self.tick);
        let pending = io.clone();
        self.queue
            .push(Box::new(move |r: &mut Reactor| r.complete_attach(&pending)));
        debug!("Attached {} (fd {})", io.id(), raw);
        Ok(io)
    }

    /// Run the close callbacks for a descriptor `attach` refused. The
    /// object never enters the registry.
    fn reject_attach(
        &mut self,
        raw: RawFd,
        protocol: &Arc<Protocol>,
        udata: Option<Udata>,
        tls: Option<TlsContext>,
    ) -> TetherError {
        let io = Io::new(None, raw, protocol, None, tls, self.deferrer(), self.tick);
        io.state().close_reason = Some(CloseReason::Error);
        let remains = io.take_remains();
        protocol.handler().clone().on_close(self, &io, udata);
        protocol.io_functions().cleanup(None);
        drop(remains);
        TetherError::BadDescriptor(raw)
    }

    fn complete_attach(&mut self, io: &Io) {
        let (protocol, started) = {
            let mut guard = io.state();
            let st = &mut *guard;
            if st.lifecycle == Lifecycle::Closed {
                return;
            }
            let Some(file) = st.file.as_ref() else {
                return;
            };
            let started = st.functions.start(file, st.tls.as_ref());
            if st.lifecycle == Lifecycle::Attaching {
                st.lifecycle = Lifecycle::Open;
            }
            (st.protocol.clone(), started)
        };
        match started {
            Ok(session) => io.state().session = session,
            Err(e) => {
                warn!("Transport start failed on {}: {}", io.id(), e);
                io.fail(CloseReason::Error);
                return;
            }
        }
        if io.lifecycle() != Lifecycle::Open {
            return;
        }
        if let Some(protocol) = protocol {
            protocol.handler().clone().on_attach(self, io);
        }
        self.arm_read(io);
    }

    /// Swap the protocol of a live object. `None` puts it in the sink
    /// state: reads stop, queued writes still drain.
    pub fn protocol_set(&mut self, io: &Io, protocol: Option<Arc<Protocol>>) {
        if io.is_closed() {
            return;
        }
        self.registry.leave(io);
        match protocol {
            Some(protocol) => {
                {
                    let mut st = io.state();
                    st.functions = protocol.io_functions().clone();
                    st.buffer.resize(protocol.buffer_size(), 0);
                    st.protocol = Some(protocol.clone());
                }
                self.registry.join(io, &protocol, self.tick);
                self.arm_read(io);
            }
            None => {
                io.state().protocol = None;
                self.poll.unmonitor(io.id(), Interest::READ);
            }
        }
    }

    /// Close immediately: pending output is discarded, `on_close` runs and
    /// the descriptor is released. Idempotent.
    pub fn close_now(&mut self, io: &Io) {
        let Some(mut remains) = io.take_remains() else {
            return;
        };
        self.poll.forget(io.id());
        self.registry.remove(io);
        self.listeners.remove(&io.id());
        if let Some(file) = remains.file.as_ref() {
            remains.functions.finish(file, remains.session.as_mut());
        }
        if let Some(protocol) = remains.protocol.take() {
            protocol
                .handler()
                .clone()
                .on_close(self, io, remains.udata.take());
        }
        for entry in remains.env.drain(..) {
            entry.release();
        }
        remains.functions.cleanup(remains.session.take());
        debug!(
            "Closed {} ({:?}, {} chunks unsent)",
            io.id(),
            remains.reason,
            remains.stream.len()
        );
        drop(remains);
    }

    /// Defer one of the protocol's user hooks for `io`.
    pub fn call_user_hook(&self, io: &Io, hook: UserHook) {
        let io = io.clone();
        self.defer(move |r: &mut Reactor| {
            let Some(protocol) = io.protocol() else {
                return;
            };
            let handler = protocol.handler().clone();
            match hook {
                UserHook::One => handler.on_user1(r, &io),
                UserHook::Two => handler.on_user2(r, &io),
                UserHook::Three => handler.on_user3(r, &io),
            }
        });
    }

    /// Defer delivery of `message` to `io`'s `on_pubsub` hook.
    pub fn pubsub_deliver(&self, io: &Io, message: Ipc) {
        let io = io.clone();
        self.defer(move |r: &mut Reactor| {
            if !io.is_open() {
                return;
            }
            if let Some(protocol) = io.protocol() {
                protocol.handler().clone().on_pubsub(r, &io, &message);
            }
        });
    }

    pub(crate) fn arm_read(&mut self, io: &Io) {
        let file = {
            let st = io.state();
            if st.lifecycle != Lifecycle::Open
                || st.suspended
                || st.throttled
                || st.protocol.is_none()
            {
                return;
            }
            let Some(file) = st.file.clone() else {
                return;
            };
            file
        };
        if self.registry.contains(io.id()) {
            self.poll.monitor(io.id(), &file, Interest::READ);
        }
    }

    pub(crate) fn apply_touch(&mut self, io: &Io) {
        let touched = {
            let mut st = io.state();
            std::mem::take(&mut st.touched) && st.lifecycle != Lifecycle::Closed
        };
        if touched {
            self.registry.touch(io, self.tick);
        }
    }

    fn dispatch_data(&mut self, io: &Io) {
        let protocol = {
            let st = io.state();
            if st.lifecycle != Lifecycle::Open || st.suspended || st.throttled {
                return;
            }
            match st.protocol.clone() {
                Some(protocol) => protocol,
                None => return,
            }
        };
        protocol.handler().clone().on_data(self, io);
        self.apply_touch(io);
        self.arm_read(io);
    }

    fn dispatch_timeout(&mut self, io: &Io) {
        if io.lifecycle() != Lifecycle::Open {
            return;
        }
        if let Some(protocol) = io.protocol() {
            debug!("{} timed out", io.id());
            protocol.handler().clone().on_timeout(self, io);
        }
    }

    /// The write task: drain the transport, then the stream, then decide
    /// between idle, throttled, closing or waiting for writability.
    pub(crate) fn drain_output(&mut self, io: &Io) {
        enum Outcome {
            Failed(std::io::Error),
            Close,
            Ready { unthrottled: bool },
            Pending { throttled: bool },
        }

        let throttle_limit = self.config.throttle_limit;
        let mut finished = Vec::new();
        let (outcome, file, protocol) = {
            let mut guard = io.state();
            let st = &mut *guard;
            st.write_scheduled = false;
            if st.lifecycle == Lifecycle::Closed {
                return;
            }
            let Some(file) = st.file.as_ref() else {
                return;
            };
            let functions = st.functions.clone();
            let session = &mut st.session;
            let mut moved = 0;
            let mut blocked = false;
            let mut failure = None;

            loop {
                match functions.flush(file, session.as_mut()) {
                    Ok(0) => break,
                    Ok(n) => moved += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        blocked = true;
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if failure.is_none() && !blocked {
                let drained = st.stream.drain(
                    |buf| functions.write(file, session.as_mut(), buf),
                    &mut finished,
                );
                match drained {
                    Ok(n) => moved += n,
                    Err(e) => failure = Some(e),
                }
            }
            if moved > 0 {
                st.touched = true;
            }

            let outcome = match failure {
                Some(e) => Outcome::Failed(e),
                None if st.stream.is_empty() && !blocked => {
                    if st.lifecycle == Lifecycle::Closing {
                        Outcome::Close
                    } else {
                        Outcome::Ready {
                            unthrottled: std::mem::take(&mut st.throttled),
                        }
                    }
                }
                None => {
                    let backlog = st.stream.backlog();
                    if backlog >= throttle_limit {
                        st.throttled = true;
                    } else {
                        st.throttled = false;
                    }
                    Outcome::Pending {
                        throttled: st.throttled,
                    }
                }
            };
            (outcome, file.clone(), st.protocol.clone())
        };
        drop(finished);

        match outcome {
            Outcome::Failed(e) => {
                debug!("{} write failed: {}", io.id(), e);
                io.state().close_reason.get_or_insert(CloseReason::Error);
                self.close_now(io);
            }
            Outcome::Close => self.close_now(io),
            Outcome::Ready { unthrottled } => {
                self.apply_touch(io);
                if unthrottled {
                    debug!("{} unthrottled", io.id());
                }
                self.arm_read(io);
                if let Some(protocol) = protocol {
                    protocol.handler().clone().on_ready(self, io);
                }
            }
            Outcome::Pending { throttled } => {
                self.apply_touch(io);
                self.poll.monitor(io.id(), &file, Interest::WRITE);
                if throttled {
                    self.poll.unmonitor(io.id(), Interest::READ);
                } else {
                    self.arm_read(io);
                }
            }
        }
    }

    /// Schedule `on_timeout` for every object idle longer than its
    /// protocol's timeout. Returns the number scheduled.
    pub fn sweep_timeouts(&mut self) -> usize {
        let expired = self.registry.expired(self.tick);
        for io in &expired {
            let io = io.clone();
            self.queue
                .push(Box::new(move |r: &mut Reactor| r.dispatch_timeout(&io)));
        }
        if !expired.is_empty() {
            debug!("Timeout sweep scheduled {} callbacks", expired.len());
        }
        expired.len()
    }

    // The loop

    /// Run queued tasks until the queue is empty, without polling.
    /// Returns the number of tasks run.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.pop() {
            task(self);
            ran += 1;
        }
        ran
    }

    fn run_batch(&mut self) -> usize {
        let batch = self.queue.len();
        let mut ran = 0;
        while ran < batch {
            let Some(task) = self.queue.pop() else {
                break;
            };
            task(self);
            ran += 1;
        }
        ran
    }

    /// Run one cycle, waiting at most `max_wait_ms` for readiness.
    /// Returns the number of readiness events queued.
    pub fn run_once(&mut self, max_wait_ms: u64) -> Result<usize> {
        self.update_tick();
        self.schedule_due_timers();
        let second = self.tick / 1000;
        if second != self.last_second {
            self.last_second = second;
            self.maintain();
        }

        let ran = self.run_batch();
        self.update_tick();
        let mut timeout = if ran > 0 || !self.queue.is_empty() {
            0
        } else {
            max_wait_ms.min(self.config.max_poll_ms)
        };
        if let Some(due) = self.timers.next_due_in(self.tick) {
            timeout = timeout.min(due);
        }

        let block = self.queue.enter_poll();
        let waited = self.poll.wait(if block { timeout as i32 } else { 0 });
        self.queue.leave_poll();
        let events = waited.map_err(|e| TetherError::io_with_context(e, "polling"))?;

        if platform::take_stop_request() {
            info!("Stop signal received (pid {})", self.pid);
            self.stop.store(true, Ordering::SeqCst);
        }

        let count = events.len();
        if count == 0 && ran == 0 && self.queue.is_empty() {
            if !self.idle {
                self.idle = true;
                self.run_stage(Stage::OnIdle);
            }
        } else {
            self.idle = false;
        }

        for event in events {
            let Some(io) = self.registry.get(event.id).cloned() else {
                self.poll.forget(event.id);
                continue;
            };
            if event.ready.contains(Interest::READ) {
                let io = io.clone();
                self.queue
                    .push(Box::new(move |r: &mut Reactor| r.dispatch_data(&io)));
            }
            if event.ready.contains(Interest::WRITE) && io.state().claim_write() {
                let io = io.clone();
                self.queue
                    .push(Box::new(move |r: &mut Reactor| r.drain_output(&io)));
            }
            if event.ready.is_empty() && event.hangup {
                io.fail(CloseReason::Peer);
            }
        }
        Ok(count)
    }

    /// Once-per-second housekeeping.
    fn maintain(&mut self) {
        self.sweep_timeouts();
        self.ipc_maintain();
        if self.role == Role::Master {
            self.supervise_due = true;
        }
    }

    /// Run the reactor until stopped.
    ///
    /// With `workers == 0` the calling process runs the loop alone.
    /// Otherwise it becomes the master: it binds the IPC listener, forks the
    /// workers and supervises them. In a forked worker this call returns
    /// when the worker stops, so the caller should simply exit afterwards.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(TetherError::Other("reactor is already running".to_string()));
        }
        platform::install_signal_handlers(self.config.hot_restart_signal)?;
        self.running = true;
        self.stop.store(false, Ordering::SeqCst);
        self.pid = std::process::id();
        self.root_pid = self.pid;
        self.update_tick();
        self.run_stage(Stage::PreStart);

        let workers = self.config.worker_count();
        if workers > 0 {
            self.role = Role::Master;
            self.supervisor.resize(workers);
            self.park_worker_listeners();
        } else {
            self.role = Role::Single;
        }
        self.ipc_start()?;
        info!(
            "Reactor starting (pid {}, {} workers, {} objects)",
            self.pid,
            workers,
            self.registry.len()
        );

        if self.role == Role::Master {
            self.supervise()?;
        }
        if self.role != Role::Master {
            self.start_async_queue()?;
        }
        self.run_stage(Stage::OnStart);
        self.run_loop()
    }

    fn run_loop(&mut self) -> Result<()> {
        while !self.stop_requested() {
            if let Err(e) = self.run_once(self.config.max_poll_ms) {
                error!("Reactor cycle failed: {}", e);
                self.stop.store(true, Ordering::SeqCst);
                break;
            }
            if self.role == Role::Master && std::mem::take(&mut self.supervise_due) {
                let was_master = self.role == Role::Master;
                self.supervise()?;
                if was_master && self.is_worker() {
                    self.start_async_queue()?;
                    self.run_stage(Stage::OnStart);
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        info!(
            "Reactor shutting down (pid {}, {} objects)",
            self.pid,
            self.registry.len()
        );
        self.run_stage(Stage::OnShutdown);
        if self.role == Role::Master {
            self.terminate_workers();
        }

        let mut grace = 0u64;
        for io in self.registry.ios() {
            if let Some(protocol) = io.protocol() {
                grace = grace.max(u64::from(protocol.handler().clone().on_shutdown(self, &io)));
            }
            io.state().close_reason.get_or_insert(CloseReason::Shutdown);
            io.close();
        }

        let deadline =
            Instant::now() + self.config.shutdown_timeout() + Duration::from_secs(grace);
        let poll_ms = IoConfig::SHUTDOWN_POLL.as_millis() as u64;
        while !self.registry.is_empty() && Instant::now() < deadline {
            if let Err(e) = self.run_once(poll_ms) {
                warn!("Shutdown cycle failed: {}", e);
                break;
            }
        }
        let lingering = self.registry.ios();
        if !lingering.is_empty() {
            warn!("Forcing {} objects closed", lingering.len());
        }
        for io in lingering {
            self.close_now(&io);
        }
        self.run_pending();
        self.timers.clear();
        self.ipc_stop();
        self.run_stage(Stage::OnStop);
        self.stop_async_queue();
        self.running = false;
        self.run_stage(Stage::OnFinish);
        self.run_pending();
        info!("Reactor stopped (pid {})", self.pid);
    }

    /// Rebuild the per-process state in a freshly forked worker.
    ///
    /// The queue, self-pipe, polling set and timers are replaced; inherited
    /// connections are dropped without callbacks, except listeners shared
    /// with workers; IPC routes, pending replies and filters are cleared.
    pub(crate) fn reinitialize_as_worker(&mut self, index: usize) -> Result<()> {
        let (queue, wake_rx) = TaskQueue::new()
            .map_err(|e| TetherError::io_with_context(e, "creating worker task queue"))?;
        let inherited = self.queue.clear();
        self.queue = queue;
        self.poll = PollSet::new(wake_rx);
        self.timers.clear();
        self.supervisor = Supervisor::default();
        self.role = Role::Worker(index);
        self.pid = std::process::id();
        self.idle = false;

        let deferrer = self.deferrer();
        let mut dropped = 0;
        for io in self.registry.ios() {
            let shared = self
                .listeners
                .get(&io.id())
                .is_some_and(|info| !info.on_root);
            if shared {
                {
                    let mut st = io.state();
                    st.deferrer = deferrer.clone();
                    st.suspended = false;
                }
                self.arm_read(&io);
            } else {
                self.registry.remove(&io);
                drop(io.take_remains());
                dropped += 1;
            }
        }
        self.listeners.retain(|_, info| !info.on_root);
        self.ipc.reset_for_worker();
        debug!(
            "Worker {} discarded {} inherited objects and {} tasks",
            index, dropped, inherited
        );
        info!("Worker {} running (pid {})", index, self.pid);
        self.ipc_connect_upstream()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .field("running", &self.running)
            .field("objects", &self.registry.len())
            .field("timers", &self.timers.len())
            .field("pending_tasks", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        attached: AtomicUsize,
        data: AtomicUsize,
        ready: AtomicUsize,
        closed: AtomicUsize,
        timeouts: AtomicUsize,
    }

    struct Recorder(Arc<Counters>);

    impl Handler for Recorder {
        fn on_attach(&self, _r: &mut Reactor, _io: &Io) {
            self.0.attached.fetch_add(1, Ordering::SeqCst);
        }
        fn on_data(&self, _r: &mut Reactor, io: &Io) {
            let mut buf = [0u8; 64];
            while io.read(&mut buf) > 0 {}
            self.0.data.fetch_add(1, Ordering::SeqCst);
        }
        fn on_ready(&self, _r: &mut Reactor, _io: &Io) {
            self.0.ready.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self, _r: &mut Reactor, _io: &Io, _udata: Option<Udata>) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_timeout(&self, _r: &mut Reactor, _io: &Io) {
            self.0.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reactor() -> Reactor {
        Reactor::new(TetherConfig::default()).unwrap()
    }

    fn recorder(timeout: Option<Duration>) -> (Arc<Protocol>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut builder = Protocol::builder(Recorder(counters.clone()));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        (builder.build(), counters)
    }

    #[test]
    fn test_attach_is_deferred() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, _b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        assert_eq!(io.lifecycle(), Lifecycle::Attaching);
        assert_eq!(counters.attached.load(Ordering::SeqCst), 0);

        r.run_pending();
        assert_eq!(io.lifecycle(), Lifecycle::Open);
        assert_eq!(counters.attached.load(Ordering::SeqCst), 1);
        assert_eq!(r.poll.interest(io.id()), Interest::READ);
    }

    struct CountCleanups(Arc<AtomicUsize>);

    impl IoFunctions for CountCleanups {
        fn cleanup(&self, _session: Option<Session>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rejected_descriptor_closes_synchronously() {
        let mut r = reactor();
        let counters = Arc::new(Counters::default());
        let cleanups = Arc::new(AtomicUsize::new(0));
        let protocol = Protocol::builder(Recorder(counters.clone()))
            .io_functions(CountCleanups(cleanups.clone()))
            .build();

        assert!(platform::set_nonblocking(-1).is_err());
        let udata: Udata = Box::new(7u8);
        let err = r.reject_attach(-1, &protocol, Some(udata), None);
        assert!(matches!(err, TetherError::BadDescriptor(-1)));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(counters.attached.load(Ordering::SeqCst), 0);
        assert_eq!(r.io_count(), 0);
        assert_eq!(r.pending_tasks(), 0);
    }

    #[test]
    fn test_close_now_is_idempotent() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, _b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();

        r.close_now(&io);
        r.close_now(&io);
        io.close();
        r.run_pending();
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(io.is_closed());
        assert_eq!(r.io_count(), 0);
    }

    #[test]
    fn test_graceful_close_drains_first() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, mut b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        io.write(&b"bye"[..]);
        io.close();
        r.run_pending();

        assert!(io.is_closed());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        let mut got = Vec::new();
        b.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"bye");
    }

    #[test]
    fn test_write_then_on_ready() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, mut b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();
        assert!(io.write(&b"ping"[..]));
        r.run_pending();

        assert_eq!(counters.ready.load(Ordering::SeqCst), 1);
        assert_eq!(io.backlog(), 0);
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_throttle_and_release() {
        let mut config = TetherConfig::default();
        config.throttle_limit = 64 * 1024;
        let mut r = Reactor::new(config).unwrap();
        let (protocol, _counters) = recorder(None);
        let (a, mut b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();

        // Far more than the socket buffer can take.
        io.write(vec![7u8; 4 * 1024 * 1024]);
        r.run_pending();
        assert!(io.is_throttled());
        assert!(!r.poll.interest(io.id()).contains(Interest::READ));
        assert!(r.poll.interest(io.id()).contains(Interest::WRITE));

        // Drain the peer while cycling until the stream is empty.
        b.set_nonblocking(true).unwrap();
        let mut sink = vec![0u8; 256 * 1024];
        let mut total = 0;
        while total < 4 * 1024 * 1024 {
            match b.read(&mut sink) {
                Ok(n) => total += n,
                Err(_) => {
                    r.run_once(10).unwrap();
                }
            }
            r.run_pending();
        }
        assert!(!io.is_throttled());
        assert_eq!(io.backlog(), 0);
    }

    #[test]
    fn test_peer_close_detected() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();
        drop(b);

        for _ in 0..10 {
            r.run_once(10).unwrap();
            r.run_pending();
            if io.is_closed() {
                break;
            }
        }
        assert!(io.is_closed());
        assert_eq!(io.close_reason(), Some(CloseReason::Peer));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_dispatch_and_touch() {
        let mut r = reactor();
        let (protocol, counters) = recorder(Some(Duration::from_secs(30)));
        let (a, mut b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();
        let before = io.last_active();

        std::thread::sleep(Duration::from_millis(5));
        b.write_all(b"data").unwrap();
        for _ in 0..10 {
            r.run_once(10).unwrap();
            r.run_pending();
            if counters.data.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
        assert_eq!(counters.data.load(Ordering::SeqCst), 1);
        assert!(io.last_active() > before);
    }

    #[test]
    fn test_sweep_schedules_exact_count() {
        let mut r = reactor();
        let (protocol, counters) = recorder(Some(Duration::from_secs(10)));
        let mut peers = Vec::new();
        let mut ios = Vec::new();
        for _ in 0..5 {
            let (a, b) = UnixStream::pair().unwrap();
            ios.push(r.attach(a, protocol.clone(), None, None).unwrap());
            peers.push(b);
        }
        r.run_pending();

        let now = r.tick();
        // Two idle for a minute, three active just now.
        r.registry.touch(&ios[0], now - 60_000);
        r.registry.touch(&ios[1], now - 59_000);

        assert_eq!(r.sweep_timeouts(), 2);
        r.run_pending();
        assert_eq!(counters.timeouts.load(Ordering::SeqCst), 2);
        assert_eq!(r.sweep_timeouts(), 0);
    }

    #[test]
    fn test_default_timeout_closes() {
        struct Quiet;
        impl Handler for Quiet {}
        let mut r = reactor();
        let protocol = Protocol::builder(Quiet)
            .timeout(Duration::from_secs(1))
            .build();
        let (a, _b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();
        let now = r.tick();
        r.registry.touch(&io, now - 5_000);

        assert_eq!(r.sweep_timeouts(), 1);
        r.run_pending();
        assert!(io.is_closed());
        assert_eq!(io.close_reason(), Some(CloseReason::Timeout));
    }

    #[test]
    fn test_sink_state_keeps_flushing() {
        let mut r = reactor();
        let (protocol, counters) = recorder(None);
        let (a, mut b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.run_pending();

        r.protocol_set(&io, None);
        assert!(io.protocol().is_none());
        assert!(r.poll.interest(io.id()).is_empty());
        io.write(&b"still"[..]);
        io.close();
        r.run_pending();

        let mut got = Vec::new();
        b.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"still");
        // The sink has no protocol to notify.
        assert_eq!(counters.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timers_fire_and_finish() {
        let mut r = reactor();
        let fired = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let done = finished.clone();
        r.run_every(
            Duration::from_millis(1),
            Repeat::Times(3),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
                true
            },
            Some(Box::new(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while finished.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            r.run_once(5).unwrap();
        }
        r.run_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(r.timer_count(), 0);
    }

    #[test]
    fn test_cancel_timer_runs_finish() {
        let mut r = reactor();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let id = r.run_every(
            Duration::from_secs(60),
            Repeat::Forever,
            |_| true,
            Some(Box::new(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(r.cancel_timer(id));
        assert!(!r.cancel_timer(id));
        r.run_pending();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_defer_from_other_thread_wakes_poll() {
        let mut r = reactor();
        let handle = r.handle();
        let seen = Arc::new(Mutex::new(false));
        let flag = seen.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.defer(move |_| *flag.lock().unwrap() = true);
        });

        let started = Instant::now();
        r.run_once(5_000).unwrap();
        thread.join().unwrap();
        r.run_pending();
        assert!(*seen.lock().unwrap());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_handle_stop() {
        let r = reactor();
        let handle = r.handle();
        assert!(!handle.is_stopping());
        handle.stop();
        assert!(r.stop_requested());
    }

    #[test]
    fn test_user_hooks() {
        struct Hooks(Arc<AtomicUsize>);
        impl Handler for Hooks {
            fn on_user1(&self, _r: &mut Reactor, _io: &Io) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn on_user3(&self, _r: &mut Reactor, _io: &Io) {
                self.0.fetch_add(100, Ordering::SeqCst);
            }
        }
        let mut r = reactor();
        let calls = Arc::new(AtomicUsize::new(0));
        let protocol = Protocol::builder(Hooks(calls.clone())).build();
        let (a, _b) = UnixStream::pair().unwrap();
        let io = r.attach(a, protocol, None, None).unwrap();
        r.call_user_hook(&io, UserHook::One);
        r.call_user_hook(&io, UserHook::Two);
        r.call_user_hook(&io, UserHook::Three);
        r.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 101);
    }
}
