//! `CaptureController` owns the platform session and its lifecycle.
//!
//! # State machine
//!
//! ```text
//!            start (sync)             worker: configured + running
//!   Idle ───────────────► Starting ─────────────────────────────► Running
//!    ▲                        │ worker: configuration failed           │
//!    │◄───────────────────────┘                                        │ stop (sync)
//!    │                 worker: session stopped                         ▼
//!    └──────────────────────────────────────────────────────────── Stopping
//! ```
//!
//! # Threading model
//!
//! Every session mutation happens on one dedicated worker thread, fed by an
//! unbounded command channel, so commands settle strictly in submission
//! order. Session calls block (pipeline state changes, thread joins), so the
//! worker never runs on an async executor. Only the immediate
//! `Idle → Starting` and `Running → Stopping` edges are taken on the
//! caller's thread, atomically with the enqueue. Completions run on the
//! worker, never inline with the call that supplied them.
//!
//! Dropping the controller shuts the worker down, stops the session and
//! waits for both.
//!
//! Frames never touch the worker: the session delivers them to the
//! [`FrameRelay`], which reads the lifecycle with a single atomic load.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::consumer::VideoFrameConsumer;
use crate::lifecycle::{LifecycleCell, LifecycleState};
use crate::negotiator::FormatNegotiator;
use crate::reconfigure::{self, ChangeNotifier, Plan, ReconfigurationHandler, SessionChange};
use crate::relay::FrameRelay;
use crate::session::{CaptureSession, FrameHandler};
use crate::stats::FrameStats;

/// Called exactly once when an operation has settled. Settled does not
/// mean succeeded; check [`CaptureController::state`].
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Command {
    Start { configuration: Option<CaptureConfiguration>, on_complete: Option<Completion> },
    Stop { on_complete: Option<Completion> },
    Reconfigure { change: SessionChange },
    Shutdown,
}

/// State the worker publishes for callers to read.
#[derive(Debug)]
struct Published {
    desired: CaptureConfiguration,
    active_format: Option<PixelFormat>,
}

// ── CaptureController ────────────────────────────────────────────────────────

/// Screen capture controller.
pub struct CaptureController<S: CaptureSession> {
    state:     Arc<LifecycleCell>,
    session:   Arc<Mutex<S>>,
    relay:     Arc<FrameRelay>,
    consumer:  Arc<dyn VideoFrameConsumer>,
    negotiator: FormatNegotiator,
    published: Arc<Mutex<Published>>,
    /// Locked across the synchronous pre-transition and the enqueue.
    commands:  Mutex<mpsc::UnboundedSender<Command>>,
    reconfiguration: ReconfigurationHandler,
    worker:    Option<JoinHandle<()>>,
}

impl<S: CaptureSession> CaptureController<S> {
    /// Take ownership of `session` and spawn the worker thread.
    ///
    /// Fails only if the thread cannot be spawned. `configuration` is what [`start_capture_screen`] uses until a
    /// reconfiguration records something else.
    ///
    /// [`start_capture_screen`]: CaptureController::start_capture_screen
    pub fn new(
        session: S,
        consumer: Arc<dyn VideoFrameConsumer>,
        configuration: CaptureConfiguration,
    ) -> Result<Self, CaptureError> {
        Self::build(session, consumer, configuration, FormatNegotiator::default(), None)
    }

    /// Like [`new`](CaptureController::new), and subscribe to platform
    /// change notifications for the controller's lifetime.
    pub fn with_change_notifier(
        session: S,
        consumer: Arc<dyn VideoFrameConsumer>,
        configuration: CaptureConfiguration,
        notifier: &ChangeNotifier,
    ) -> Result<Self, CaptureError> {
        Self::build(session, consumer, configuration, FormatNegotiator::default(), Some(notifier))
    }

    pub fn with_negotiator(
        session: S,
        consumer: Arc<dyn VideoFrameConsumer>,
        configuration: CaptureConfiguration,
        negotiator: FormatNegotiator,
    ) -> Result<Self, CaptureError> {
        Self::build(session, consumer, configuration, negotiator, None)
    }

    fn build(
        session: S,
        consumer: Arc<dyn VideoFrameConsumer>,
        configuration: CaptureConfiguration,
        negotiator: FormatNegotiator,
        notifier: Option<&ChangeNotifier>,
    ) -> Result<Self, CaptureError> {
        let state = Arc::new(LifecycleCell::default());
        let relay = Arc::new(FrameRelay::new(Arc::downgrade(&state), consumer.clone()));
        let session = Arc::new(Mutex::new(session));
        let published = Arc::new(Mutex::new(Published { desired: configuration, active_format: None }));

        let (tx, rx) = mpsc::unbounded_channel();
        let reconfiguration = match notifier {
            Some(notifier) => ReconfigurationHandler::attach(notifier, tx.downgrade()),
            None => ReconfigurationHandler::detached(),
        };

        let worker = Worker {
            state: state.clone(),
            session: session.clone(),
            relay: relay.clone(),
            consumer: consumer.clone(),
            negotiator,
            published: published.clone(),
            generation: 0,
            session_active: false,
        };
        let worker = thread::Builder::new()
            .name("capture-controller".to_owned())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            state,
            session,
            relay,
            consumer,
            negotiator,
            published,
            commands: Mutex::new(tx),
            reconfiguration,
            worker: Some(worker),
        })
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// Most efficient output format for the current consumer. No side effects.
    pub fn preferred_output_pixel_format(&self) -> PixelFormat {
        self.negotiator
            .select_format(None, &self.consumer.supported_pixel_formats())
            .unwrap_or(self.negotiator.canonical())
    }

    /// Format the running session emits, if capture has been started.
    pub fn active_format(&self) -> Option<PixelFormat> {
        self.published.lock().active_format
    }

    /// Configuration the next [`start_capture_screen`](Self::start_capture_screen) uses.
    pub fn desired_configuration(&self) -> CaptureConfiguration {
        self.published.lock().desired.clone()
    }

    /// Read-only access to the platform session.
    pub fn capture_session<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.session.lock())
    }

    pub fn relay(&self) -> &Arc<FrameRelay> {
        &self.relay
    }

    pub fn stats(&self) -> &FrameStats {
        self.relay.stats()
    }

    /// Whether platform change notifications reach this controller.
    pub fn is_subscribed(&self) -> bool {
        self.reconfiguration.is_attached()
    }

    // ── Start / stop ─────────────────────────────────────────────────────────

    /// Start capturing with `configuration`.
    ///
    /// From `Idle` the state moves to `Starting` before this returns. While
    /// `Stopping` the start runs after the stop settles. While `Starting` or
    /// `Running` it is a no-op. `on_complete` fires in every case.
    pub fn start_capture(&self, configuration: CaptureConfiguration, on_complete: Option<Completion>) {
        self.submit_start(Some(configuration), on_complete);
    }

    /// Start capturing with the recorded desired configuration.
    pub fn start_capture_screen(&self, on_complete: Option<Completion>) {
        self.submit_start(None, on_complete);
    }

    /// Stop capturing; `on_complete` fires once the session has stopped, or
    /// on the worker right away when already idle.
    pub fn stop_capture_with_completion_handler(&self, on_complete: Option<Completion>) {
        let commands = self.commands.lock();
        if self.state.transition(LifecycleState::Running, LifecycleState::Stopping) {
            debug!("capture stopping");
        }
        send(&commands, Command::Stop { on_complete });
    }

    /// Fire-and-forget stop.
    pub fn stop_capture(&self) {
        self.stop_capture_with_completion_handler(None);
    }

    /// Queue a device/format/orientation/interruption change.
    pub fn handle_change(&self, change: SessionChange) {
        send(&self.commands.lock(), Command::Reconfigure { change });
    }

    /// Re-derive inputs and output format from the current consumer and
    /// desired configuration.
    pub fn reconfigure_capture_session_input(&self) {
        self.handle_change(SessionChange::device());
    }

    /// Start and wait until the start has settled. Returns the state seen
    /// right after settling.
    pub async fn start(&self, configuration: CaptureConfiguration) -> LifecycleState {
        let (tx, rx) = oneshot::channel();
        self.start_capture(configuration, Some(Box::new(move || {
            let _ = tx.send(());
        })));
        let _ = rx.await;
        self.state()
    }

    /// Stop and wait until the stop has settled.
    pub async fn stop(&self) -> LifecycleState {
        let (tx, rx) = oneshot::channel();
        self.stop_capture_with_completion_handler(Some(Box::new(move || {
            let _ = tx.send(());
        })));
        let _ = rx.await;
        self.state()
    }

    fn submit_start(&self, configuration: Option<CaptureConfiguration>, on_complete: Option<Completion>) {
        let commands = self.commands.lock();
        if self.state.transition(LifecycleState::Idle, LifecycleState::Starting) {
            debug!("capture starting");
        }
        send(&commands, Command::Start { configuration, on_complete });
    }
}

impl<S: CaptureSession> Drop for CaptureController<S> {
    fn drop(&mut self) {
        self.reconfiguration.detach();
        send(&self.commands.lock(), Command::Shutdown);
        let Some(worker) = self.worker.take() else { return };
        // The last handle can be released by a completion on the worker itself.
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("capture worker panicked");
        }
    }
}

fn send(commands: &mpsc::UnboundedSender<Command>, command: Command) {
    if commands.send(command).is_err() {
        warn!("capture worker gone; command dropped");
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

struct Worker<S: CaptureSession> {
    state:      Arc<LifecycleCell>,
    session:    Arc<Mutex<S>>,
    relay:      Arc<FrameRelay>,
    consumer:   Arc<dyn VideoFrameConsumer>,
    negotiator: FormatNegotiator,
    published:  Arc<Mutex<Published>>,
    /// Generation of the last committed session configuration.
    generation: u64,
    /// Whether this worker started the session and has not stopped it. The
    /// shared state can already read `Starting` for a start queued behind
    /// the current command, so it cannot answer this.
    session_active: bool,
}

impl<S: CaptureSession> Worker<S> {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Start { configuration, on_complete } => {
                    self.start(configuration);
                    complete(on_complete);
                }
                Command::Stop { on_complete } => {
                    self.stop();
                    complete(on_complete);
                }
                Command::Reconfigure { change } => self.reconfigure(change),
                Command::Shutdown => break,
            }
        }
        self.teardown();
    }

    fn start(&mut self, configuration: Option<CaptureConfiguration>) {
        // A `Stopping` state here means a stop was issued after this start
        // while running; that stop settles next.
        if self.session_active {
            debug!("start ignored: capture already running");
            return;
        }
        self.state.transition(LifecycleState::Idle, LifecycleState::Starting);

        let configuration = configuration.unwrap_or_else(|| self.published.lock().desired.clone());
        match self.configure_and_run(&configuration) {
            Ok(format) => {
                {
                    let mut published = self.published.lock();
                    published.desired = configuration.clone();
                    published.active_format = Some(format);
                }
                self.session_active = true;
                self.state.store(LifecycleState::Running);
                info!(
                    "Capture running: display={} {} @{}fps format={}",
                    configuration.display_index, configuration.resolution, configuration.frame_rate, format
                );
            }
            Err(e) => {
                match &e {
                    CaptureError::Configuration { .. } => error!("Capture start failed: {e}"),
                    _ => warn!("Capture start failed: {e}"),
                }
                let mut session = self.session.lock();
                if session.is_running() {
                    session.stop_running();
                }
                drop(session);
                self.published.lock().active_format = None;
                self.state.store(LifecycleState::Idle);
            }
        }
    }

    fn configure_and_run(&mut self, configuration: &CaptureConfiguration) -> Result<PixelFormat, CaptureError> {
        configuration.validate()?;
        let supported = self.consumer.supported_pixel_formats();
        let format = self.negotiator.select_format(configuration.preferred_format, &supported)?;

        let next = self.generation + 1;
        let mut session = self.session.lock();
        session.begin_configuration();
        let wired = session
            .set_input(configuration)
            .and_then(|_| session.set_output_format(format));
        session.set_frame_handler(FrameHandler::new(&self.relay));
        // Always close the configuration block, even when wiring failed.
        let committed = session.commit_configuration(next);
        wired?;
        committed?;
        self.generation = next;

        self.relay.begin_run(self.generation, configuration.frame_interval());
        session.start_running()?;
        Ok(format)
    }

    fn stop(&mut self) {
        if !self.session_active {
            debug!("stop ignored: capture idle");
            return;
        }
        self.session_active = false;
        self.state.store(LifecycleState::Stopping);
        {
            let mut session = self.session.lock();
            if session.is_running() {
                session.stop_running();
            }
        }
        self.published.lock().active_format = None;
        self.state.store(LifecycleState::Idle);
        info!("Capture stopped");
    }

    fn reconfigure(&mut self, change: SessionChange) {
        let state = self.state.load();
        let (desired, active) = {
            let published = self.published.lock();
            (published.desired.clone(), published.active_format)
        };
        // An explicit set on the change takes precedence inside `plan`.
        let consumer_formats: BTreeSet<PixelFormat> = if change.supported_formats.is_some() {
            BTreeSet::new()
        } else {
            self.consumer.supported_pixel_formats()
        };

        let plan = match reconfigure::plan(state, &change, &desired, active, &consumer_formats, &self.negotiator) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Reconfiguration ({:?}) rejected: {e}", change.kind);
                return;
            }
        };

        match plan {
            Plan::Record(configuration) | Plan::Unchanged(configuration) => {
                debug!("Reconfiguration ({:?}): recorded for {} state", change.kind, state);
                self.published.lock().desired = configuration;
            }
            Plan::InPlace { configuration, format } => self.apply_in_place(configuration, format),
            Plan::Restart(configuration) => {
                warn!(
                    "Capture session interrupted ({}); restarting",
                    change.reason.as_deref().unwrap_or("no reason given")
                );
                self.restart(configuration);
            }
        }
    }

    /// Swap input/output wiring while the session keeps running. Frames are
    /// dropped until the commit lands; the consumer never sees a stop.
    fn apply_in_place(&mut self, configuration: CaptureConfiguration, format: PixelFormat) {
        self.relay.begin_update();
        let next = self.generation + 1;
        let result = {
            let mut session = self.session.lock();
            session.begin_configuration();
            let wired = session
                .set_input(&configuration)
                .and_then(|_| session.set_output_format(format));
            let committed = session.commit_configuration(next);
            wired.and(committed)
        };

        match result {
            Ok(()) => {
                self.generation = next;
                self.relay.end_update(next);
                let mut published = self.published.lock();
                published.desired = configuration;
                published.active_format = Some(format);
                info!("Capture reconfigured in place: format={} generation={}", format, next);
            }
            Err(e) if e.is_interruption() => {
                warn!("In-place reconfiguration interrupted: {e}; restarting");
                self.relay.end_update(self.generation);
                self.restart(configuration);
            }
            Err(e) => {
                warn!("In-place reconfiguration failed, keeping previous configuration: {e}");
                self.relay.end_update(self.generation);
            }
        }
    }

    fn restart(&mut self, configuration: CaptureConfiguration) {
        self.stop();
        self.start(Some(configuration));
    }

    fn teardown(&mut self) {
        let mut session = self.session.lock();
        if session.is_running() {
            session.stop_running();
        }
        self.session_active = false;
        self.state.store(LifecycleState::Idle);
        debug!("capture worker finished");
    }
}

fn complete(on_complete: Option<Completion>) {
    if let Some(callback) = on_complete {
        callback();
    }
}
