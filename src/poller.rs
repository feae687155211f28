//! Background polling scheduler.
//!
//! Periodically drives the command client for every enabled device, keeping
//! a reachability/health picture of the fleet. The loop wakes at the
//! earliest next-due time across all enabled devices rather than on a fixed
//! tick, and recomputes immediately when configuration changes, so devices
//! with different intervals never force a shared fine-grained tick.
//!
//! Each due poll runs as its own task: one device's slow or dead link can
//! never delay another device's due poll. A poll failure only updates that
//! device's [`PollState`]; the loop itself never dies.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::client::DeviceClient;
use crate::error::{Error, Result};
use crate::identifiers::DeviceKey;

// ============================================================================
// Constants
// ============================================================================

/// Poll interval bounds, in seconds.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;
/// Upper poll interval bound, in seconds.
pub const MAX_POLL_INTERVAL_SECS: u64 = 3600;

/// Consecutive failures before a device is marked unreachable.
const UNREACHABLE_THRESHOLD: u32 = 3;

/// Stored error messages are truncated to this length.
const MAX_ERROR_LEN: usize = 500;

/// Wake period while no device is enabled; config changes wake the loop
/// sooner.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Grace period for in-flight polls on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// PollConfig
// ============================================================================

/// Per-device polling configuration, supplied by the external config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between poll attempts (10–3600).
    pub interval_secs: u64,

    /// Whether the scheduler polls this device at all.
    pub enabled: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

impl PollConfig {
    /// Validates the interval bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an interval outside 10–3600 s.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&self.interval_secs) {
            return Err(Error::config(format!(
                "poll interval {}s outside {MIN_POLL_INTERVAL_SECS}-{MAX_POLL_INTERVAL_SECS}s",
                self.interval_secs
            )));
        }
        Ok(())
    }

    /// Returns the interval as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ============================================================================
// PollState
// ============================================================================

/// Per-device health picture, consumed by the external persistence layer
/// and status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    /// Whether the device is currently considered reachable.
    pub reachable: bool,

    /// Poll failures since the last success.
    pub consecutive_failures: u32,

    /// Wall-clock time of the last poll attempt.
    pub last_attempt: Option<SystemTime>,

    /// Wall-clock time of the last successful poll.
    pub last_success: Option<SystemTime>,

    /// Last error message, truncated to 500 characters.
    pub last_error: Option<String>,

    /// Raw payload of the most recent successful snapshot.
    pub last_payload: Option<String>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            reachable: true,
            consecutive_failures: 0,
            last_attempt: None,
            last_success: None,
            last_error: None,
            last_payload: None,
        }
    }
}

impl PollState {
    /// Records a successful poll.
    ///
    /// Any single success resets the failure counter and restores
    /// reachability.
    pub fn record_success(&mut self, payload: impl Into<String>) {
        self.reachable = true;
        self.consecutive_failures = 0;
        self.last_success = Some(SystemTime::now());
        self.last_error = None;
        self.last_payload = Some(payload.into());
    }

    /// Records a failed poll.
    ///
    /// Reachability flips to `false` only once the failure streak reaches
    /// the threshold. Returns `true` when this call caused the transition.
    pub fn record_failure(&mut self, error: &str) -> bool {
        self.consecutive_failures += 1;

        let mut message = error.to_owned();
        if message.len() > MAX_ERROR_LEN {
            let mut end = MAX_ERROR_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        self.last_error = Some(message);

        let transitioned =
            self.reachable && self.consecutive_failures >= UNREACHABLE_THRESHOLD;
        if self.consecutive_failures >= UNREACHABLE_THRESHOLD {
            self.reachable = false;
        }
        transitioned
    }
}

// ============================================================================
// DeviceSched
// ============================================================================

/// Scheduler-internal bookkeeping for one device.
#[derive(Debug, Default)]
struct DeviceSched {
    config: PollConfig,
    state: PollState,

    /// Monotonic time of the last attempt, for due-time arithmetic.
    last_attempt_mono: Option<Instant>,

    /// A poll task for this device is currently running.
    in_flight: bool,
}

impl DeviceSched {
    /// Next due instant, or `None` when not schedulable.
    fn next_due(&self) -> Option<Instant> {
        if !self.config.enabled || self.in_flight {
            return None;
        }
        match self.last_attempt_mono {
            None => Some(Instant::now()),
            Some(last) => Some(last + self.config.interval()),
        }
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Background task polling every enabled device on its own interval.
///
/// # Example
///
/// ```ignore
/// let poller = Poller::new(client);
/// poller.set_config(&key, PollConfig::default())?;
/// poller.start();
/// // ...
/// poller.shutdown().await;
/// ```
pub struct Poller {
    client: Arc<DeviceClient>,
    devices: RwLock<FxHashMap<DeviceKey, DeviceSched>>,

    /// Wakes the loop early when configuration changes.
    config_changed: Notify,

    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

// ============================================================================
// Poller - Constructor
// ============================================================================

impl Poller {
    /// Creates a poller over the given client. Call [`start`](Self::start)
    /// to begin polling.
    #[must_use]
    pub fn new(client: Arc<DeviceClient>) -> Arc<Self> {
        Self::with_grace(client, SHUTDOWN_GRACE)
    }

    /// Creates a poller with a custom shutdown grace period.
    #[must_use]
    pub fn with_grace(client: Arc<DeviceClient>, grace: Duration) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            client,
            devices: RwLock::new(FxHashMap::default()),
            config_changed: Notify::new(),
            shutdown_tx,
            task: Mutex::new(None),
            grace,
        })
    }
}

// ============================================================================
// Poller - Configuration
// ============================================================================

impl Poller {
    /// Inserts or updates a device's polling configuration.
    ///
    /// Takes effect without restarting the loop: the scheduler recomputes
    /// its wake time immediately. A new device with no poll history is due
    /// at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an out-of-range interval.
    pub fn set_config(&self, device: &DeviceKey, config: PollConfig) -> Result<()> {
        config.validate()?;

        {
            let mut devices = self.devices.write();
            let sched = devices.entry(device.clone()).or_default();
            sched.config = config;
        }

        debug!(
            device = %device,
            interval_s = config.interval_secs,
            enabled = config.enabled,
            "Poll config updated"
        );
        self.config_changed.notify_one();
        Ok(())
    }

    /// Returns a device's polling configuration.
    #[must_use]
    pub fn config(&self, device: &DeviceKey) -> Option<PollConfig> {
        self.devices.read().get(device).map(|s| s.config)
    }

    /// Removes a device entirely, dropping its state and history.
    pub fn remove_device(&self, device: &DeviceKey) {
        self.devices.write().remove(device);
        self.config_changed.notify_one();
        debug!(device = %device, "Device removed from poller");
    }

    /// Returns a device's health picture.
    #[must_use]
    pub fn state(&self, device: &DeviceKey) -> Option<PollState> {
        self.devices.read().get(device).map(|s| s.state.clone())
    }

    /// Returns the health picture of every known device.
    #[must_use]
    pub fn states(&self) -> Vec<(DeviceKey, PollState)> {
        self.devices
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.state.clone()))
            .collect()
    }
}

// ============================================================================
// Poller - Lifecycle
// ============================================================================

impl Poller {
    /// Starts the polling loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Poller already running");
            return;
        }

        let poller = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            poller.run_loop().await;
        }));
        info!("Poller started");
    }

    /// Gracefully stops the loop.
    ///
    /// Polls that have not started are cancelled; in-flight polls get the
    /// grace period, then are aborted.
    pub async fn shutdown(&self) {
        info!("Poller shutting down");
        let _ = self.shutdown_tx.send(true);
        self.config_changed.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            // The loop drains in-flight polls itself within the grace
            // period; give it that long plus a margin.
            if tokio::time::timeout(self.grace + Duration::from_secs(1), task)
                .await
                .is_err()
            {
                warn!("Poller loop did not stop within grace period");
            }
        }
        info!("Poller stopped");
    }
}

// ============================================================================
// Poller - Loop
// ============================================================================

impl Poller {
    async fn run_loop(self: Arc<Self>) {
        debug!("Poll loop started");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut in_flight: JoinSet<(DeviceKey, Result<String>)> = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Launch everything due and find the earliest future due time.
            let next_due = self.launch_due_polls(&mut in_flight);
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                _ = shutdown_rx.changed() => {}

                () = self.config_changed.notified() => {
                    debug!("Poll loop woken by config change");
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((device, outcome)) => self.finish_poll(&device, outcome),
                        Err(e) => warn!(error = %e, "Poll task aborted"),
                    }
                }

                () = tokio::time::sleep_until(wake_at.into()) => {}
            }
        }

        // Drain in-flight polls within the grace period, then cancel.
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Ok((device, outcome)) = joined {
                    self.finish_poll(&device, outcome);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "In-flight polls cancelled at shutdown"
            );
            in_flight.abort_all();
        }

        debug!("Poll loop exited");
    }

    /// Spawns a poll task for every due device; returns the earliest future
    /// due time among the rest.
    fn launch_due_polls(
        self: &Arc<Self>,
        in_flight: &mut JoinSet<(DeviceKey, Result<String>)>,
    ) -> Option<Instant> {
        let now = Instant::now();
        let mut due: Vec<DeviceKey> = Vec::new();
        let mut earliest: Option<Instant> = None;

        {
            let mut devices = self.devices.write();
            for (key, sched) in devices.iter_mut() {
                let Some(next) = sched.next_due() else {
                    continue;
                };

                if next <= now {
                    sched.in_flight = true;
                    sched.last_attempt_mono = Some(now);
                    sched.state.last_attempt = Some(SystemTime::now());
                    due.push(key.clone());
                } else if earliest.is_none_or(|e| next < e) {
                    earliest = Some(next);
                }
            }
        }

        for device in due {
            debug!(device = %device, "Polling device");
            let client = Arc::clone(&self.client);
            let key = device.clone();
            in_flight.spawn(async move {
                let outcome = client
                    .snapshot(&key)
                    .await
                    .map(|snapshot| snapshot.raw().to_owned());
                (key, outcome)
            });
        }

        earliest
    }

    /// Applies one poll outcome to the device's state.
    fn finish_poll(&self, device: &DeviceKey, outcome: Result<String>) {
        let mut devices = self.devices.write();
        let Some(sched) = devices.get_mut(device) else {
            // Removed while the poll was in flight; nothing to update.
            return;
        };
        sched.in_flight = false;

        match outcome {
            Ok(payload) => {
                sched.state.record_success(payload);
                debug!(device = %device, "Poll succeeded");
            }
            Err(e) => {
                let message = e.to_string();
                let transitioned = sched.state.record_failure(&message);
                if transitioned {
                    warn!(
                        device = %device,
                        failures = sched.state.consecutive_failures,
                        error = %message,
                        "Device marked unreachable"
                    );
                } else {
                    warn!(
                        device = %device,
                        attempt = sched.state.consecutive_failures,
                        error = %message,
                        "Poll failed"
                    );
                }
            }
        }
    }
}

// ============================================================================
// Poller - Manual Poll
// ============================================================================

impl Poller {
    /// Polls one device immediately, bypassing its interval.
    ///
    /// Updates the device's [`PollState`] exactly like a scheduled poll.
    /// Useful for an on-demand "check now" from the API layer.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownDevice`] if the device was never configured
    /// - The poll's own failure, after state has been updated
    pub async fn poll_now(&self, device: &DeviceKey) -> Result<PollState> {
        {
            let mut devices = self.devices.write();
            let sched = devices
                .get_mut(device)
                .ok_or_else(|| Error::unknown_device(device.clone()))?;
            sched.last_attempt_mono = Some(Instant::now());
            sched.state.last_attempt = Some(SystemTime::now());
        }

        let outcome = self
            .client
            .snapshot(device)
            .await
            .map(|snapshot| snapshot.raw().to_owned());
        self.finish_poll(device, outcome);

        self.state(device)
            .ok_or_else(|| Error::unknown_device(device.clone()))
    }
}

// ============================================================================
// Tests
// ============================================================================
