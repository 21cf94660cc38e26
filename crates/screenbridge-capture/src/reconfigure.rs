//! Reaction to device, format, orientation and interruption changes.
//!
//! Platform glue posts [`SessionChange`]s to a [`ChangeNotifier`]. A
//! controller created with [`CaptureController::with_change_notifier`]
//! owns a [`ReconfigurationHandler`] that subscribes on construction and
//! unsubscribes when the controller is dropped. Changes are queued onto the
//! controller's worker, which decides what to do with [`plan`]:
//!
//! | State | Change | Action |
//! |-------|--------|--------|
//! | not running | any | record the configuration for the next start |
//! | running | interruption | stop + start |
//! | running | negotiated format or input differs | in-place update |
//! | running | nothing differs | keep going |
//!
//! [`CaptureController::with_change_notifier`]: crate::CaptureController::with_change_notifier

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use screenbridge_core::{CaptureConfiguration, CaptureError, PixelFormat};
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::debug;

use crate::controller::Command;
use crate::lifecycle::LifecycleState;
use crate::negotiator::FormatNegotiator;

// ── Change description ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Input device attached, removed or switched.
    Device,
    /// Desired format or resolution changed.
    Format,
    Orientation,
    /// The platform session was invalidated (e.g. the display was taken by
    /// another process).
    Interruption,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionChange {
    pub kind: ChangeKind,
    /// New desired configuration; `None` keeps the current one.
    pub configuration: Option<CaptureConfiguration>,
    /// Formats to negotiate against for this change; `None` asks the
    /// consumer.
    pub supported_formats: Option<BTreeSet<PixelFormat>>,
    pub reason: Option<String>,
}

impl SessionChange {
    pub fn new(kind: ChangeKind) -> Self {
        Self { kind, configuration: None, supported_formats: None, reason: None }
    }

    pub fn device() -> Self {
        Self::new(ChangeKind::Device)
    }

    pub fn format(configuration: CaptureConfiguration) -> Self {
        Self::new(ChangeKind::Format).with_configuration(configuration)
    }

    pub fn orientation() -> Self {
        Self::new(ChangeKind::Orientation)
    }

    pub fn interruption(reason: impl Into<String>) -> Self {
        Self { reason: Some(reason.into()), ..Self::new(ChangeKind::Interruption) }
    }

    pub fn with_configuration(mut self, configuration: CaptureConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn with_supported_formats(mut self, formats: impl IntoIterator<Item = PixelFormat>) -> Self {
        self.supported_formats = Some(formats.into_iter().collect());
        self
    }
}

// ── Observer registry ────────────────────────────────────────────────────────

type Observer = Box<dyn Fn(&SessionChange) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id:   u64,
    observers: BTreeMap<u64, Observer>,
}

/// Explicit registry for platform change notifications.
///
/// Cloning shares the registry. Observers run on the notifying thread and
/// must not subscribe or unsubscribe from inside the callback.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: impl Fn(&SessionChange) + Send + Sync + 'static) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.insert(id, Box::new(observer));
        Subscription { id, registry: Arc::downgrade(&self.registry) }
    }

    /// Deliver `change` to every observer. Returns how many were notified.
    pub fn notify(&self, change: &SessionChange) -> usize {
        let registry = self.registry.lock();
        for observer in registry.observers.values() {
            observer(change);
        }
        registry.observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.registry.lock().observers.len()
    }
}

/// Registration guard; the observer is removed when this is dropped.
pub struct Subscription {
    id:       u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().observers.remove(&self.id);
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

/// Owns the controller's change subscription.
pub struct ReconfigurationHandler {
    subscription: Option<Subscription>,
}

impl ReconfigurationHandler {
    pub(crate) fn detached() -> Self {
        Self { subscription: None }
    }

    /// Subscribe to `notifier`, queueing every change onto the controller.
    ///
    /// Holds only a weak sender so the subscription never keeps the worker
    /// alive.
    pub(crate) fn attach(notifier: &ChangeNotifier, commands: WeakUnboundedSender<Command>) -> Self {
        let subscription = notifier.subscribe(move |change| {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Reconfigure { change: change.clone() });
            }
        });
        debug!("reconfiguration handler subscribed");
        Self { subscription: Some(subscription) }
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn detach(&mut self) {
        if self.subscription.take().is_some() {
            debug!("reconfiguration handler unsubscribed");
        }
    }
}

impl Drop for ReconfigurationHandler {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Planning ─────────────────────────────────────────────────────────────────

/// What the controller should do about a change.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
    /// Not running: remember the configuration for the next start.
    Record(CaptureConfiguration),
    /// Running and nothing effective changed.
    Unchanged(CaptureConfiguration),
    InPlace { configuration: CaptureConfiguration, format: PixelFormat },
    Restart(CaptureConfiguration),
}

/// Decide how to handle `change`. Pure; runs on the controller worker.
pub(crate) fn plan(
    state: LifecycleState,
    change: &SessionChange,
    desired: &CaptureConfiguration,
    active_format: Option<PixelFormat>,
    consumer_formats: &BTreeSet<PixelFormat>,
    negotiator: &FormatNegotiator,
) -> Result<Plan, CaptureError> {
    let configuration = change.configuration.clone().unwrap_or_else(|| desired.clone());

    if state != LifecycleState::Running {
        return Ok(Plan::Record(configuration));
    }
    if change.kind == ChangeKind::Interruption {
        return Ok(Plan::Restart(configuration));
    }

    configuration.validate()?;
    let supported = change.supported_formats.as_ref().unwrap_or(consumer_formats);
    let format = negotiator.select_format(configuration.preferred_format, supported)?;

    if active_format != Some(format) || input_differs(&configuration, desired) {
        Ok(Plan::InPlace { configuration, format })
    } else {
        Ok(Plan::Unchanged(configuration))
    }
}

fn input_differs(a: &CaptureConfiguration, b: &CaptureConfiguration) -> bool {
    a.resolution != b.resolution || a.frame_rate != b.frame_rate || a.display_index != b.display_index
}
