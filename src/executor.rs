//! Runs sweep plans against a connected session.
//!
//! Two execution modes:
//! - **Host-paced**: one set/measure round trip per point, clocked by the
//!   host between points.
//! - **Instrument-timed**: the whole plan compiled into one script loop that
//!   runs on the instrument inside a single blocking query.
//!
//! Whatever happens, a run ends with the output zeroed and disabled.

use crate::dialect::DialectKind;
use crate::error::SmuError;
use crate::safety::{validate_delay, validate_voltage, FastLimit};
use crate::session::InstrumentSession;
use crate::types::Measurement;
use crate::waveform::{voltages, SweepPoint};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Multiplier applied to the nominal loop duration when budgeting the
/// transport timeout of an instrument-timed sweep.
pub const FAST_TIMEOUT_MARGIN: f64 = 8.0;

const FAST_TIMEOUT_FLOOR_MS: f64 = 20_000.0;
const FAST_TIMEOUT_CEILING_MS: f64 = 300_000.0;

/// Granularity of cancellable waits.
const WAIT_SLICE: Duration = Duration::from_millis(10);

pub const DEFAULT_LIVE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_LIVE_MAX_POINTS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    HostPaced,
    InstrumentTimed,
}

/// Timeout needed for an instrument-timed loop over `points` points.
///
/// `points · max(delay, 1 µs) · 1000 · FAST_TIMEOUT_MARGIN` milliseconds,
/// clamped to 20 s..300 s. The session never lowers an existing timeout.
pub fn fast_sweep_timeout(points: usize, delay: Duration) -> Duration {
    let per_point = delay.as_secs_f64().max(1e-6);
    let millis = (points as f64 * per_point * 1000.0 * FAST_TIMEOUT_MARGIN)
        .clamp(FAST_TIMEOUT_FLOOR_MS, FAST_TIMEOUT_CEILING_MS);
    Duration::from_millis(millis as u64)
}

/// Points to run, how to run them and the spacing between them.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    points: Vec<SweepPoint>,
    mode: ExecutionMode,
    delay_s: f64,
    fast_limit: FastLimit,
}

impl SweepPlan {
    pub fn new(points: Vec<SweepPoint>, mode: ExecutionMode, delay_s: f64) -> Result<Self, SmuError> {
        if points.is_empty() {
            return Err(SmuError::EmptyPlan);
        }
        Ok(Self {
            points,
            mode,
            delay_s,
            fast_limit: FastLimit::default(),
        })
    }

    pub fn with_fast_limit(mut self, fast_limit: FastLimit) -> Self {
        self.fast_limit = fast_limit;
        self
    }

    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn delay_s(&self) -> f64 {
        self.delay_s
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Check every level and the delay. Pure; runs before any I/O.
    pub fn validate(&self) -> Result<Duration, SmuError> {
        for point in &self.points {
            validate_voltage(point.target_voltage)?;
        }
        let fast_limit = match self.mode {
            ExecutionMode::HostPaced => None,
            ExecutionMode::InstrumentTimed => Some(self.fast_limit),
        };
        validate_delay(self.delay_s, fast_limit)
    }
}

/// Shared stop flag. Clones observe the same flag, so one can be handed to
/// a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns `false` if cancelled.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(d) if now >= d => return true,
                Some(d) => d - now,
                None => WAIT_SLICE,
            };
            thread::sleep(WAIT_SLICE.min(remaining));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub points_emitted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepProgress {
    /// 1-based index of the point just emitted.
    pub index: usize,
    pub total: usize,
    pub elapsed: Duration,
    /// Remaining time at the average pace so far.
    pub eta: Duration,
}

impl SweepProgress {
    pub fn new(index: usize, total: usize, elapsed: Duration) -> Self {
        let eta = if index == 0 || index >= total {
            Duration::ZERO
        } else {
            elapsed.div_f64(index as f64).mul_f64((total - index) as f64)
        };
        Self {
            index,
            total,
            elapsed,
            eta,
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.index as f64 / self.total as f64
    }
}

/// Receives everything a run produces.
pub trait SweepObserver {
    fn on_status(&mut self, _status: &str) {}

    fn on_progress(&mut self, _progress: &SweepProgress) {}

    fn on_measurement(&mut self, point: &SweepPoint, measurement: Measurement);
}

pub struct SweepExecutor<'a> {
    session: &'a mut InstrumentSession,
    cancel: CancelToken,
    state: SweepState,
}

impl<'a> SweepExecutor<'a> {
    pub fn new(session: &'a mut InstrumentSession) -> Self {
        Self {
            session,
            cancel: CancelToken::new(),
            state: SweepState::Idle,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request the running sweep to stop after its current point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    pub fn execute(
        &mut self,
        plan: &SweepPlan,
        observer: &mut dyn SweepObserver,
    ) -> Result<SweepReport, SmuError> {
        let delay = plan.validate()?;
        match (plan.mode(), self.session.dialect_kind()) {
            (_, None) => return Err(SmuError::NotConnected),
            (ExecutionMode::InstrumentTimed, Some(DialectKind::Line)) => {
                return Err(SmuError::FastModeUnavailable);
            }
            _ => {}
        }

        self.state = SweepState::Running;
        info!(
            "Starting {:?} sweep: {} points, delay {:?}",
            plan.mode(),
            plan.len(),
            delay
        );

        let result = match plan.mode() {
            ExecutionMode::HostPaced => self.run_host_paced(plan, delay, observer),
            ExecutionMode::InstrumentTimed => self.run_instrument_timed(plan, delay, observer),
        };

        self.session.zero_and_disable_output();

        match result {
            Ok(report) => {
                self.state = match report.outcome {
                    SweepOutcome::Completed => SweepState::Completed,
                    SweepOutcome::Cancelled => SweepState::Aborted,
                };
                let status = match report.outcome {
                    SweepOutcome::Completed => format!("Sweep complete ({} points)", report.points_emitted),
                    SweepOutcome::Cancelled => format!(
                        "Sweep stopped after {} of {} points",
                        report.points_emitted, report.total
                    ),
                };
                info!("{status}");
                observer.on_status(&status);
                Ok(report)
            }
            Err(e) => {
                self.state = SweepState::Aborted;
                error!("Sweep aborted: {e}");
                observer.on_status(&format!("Sweep failed: {e}"));
                Err(e)
            }
        }
    }

    fn run_host_paced(
        &mut self,
        plan: &SweepPlan,
        delay: Duration,
        observer: &mut dyn SweepObserver,
    ) -> Result<SweepReport, SmuError> {
        self.session.zero_and_disable_output();
        observer.on_status(&format!("Running sweep of {} points", plan.len()));

        let total = plan.len();
        let started = Instant::now();
        for (index, point) in plan.points().iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(cancelled(index, total));
            }

            self.session.set_voltage(point.target_voltage)?;
            let current = self.session.measure_current()?;
            debug!("Point {}/{}: {} V -> {current:e} A", index + 1, total, point.target_voltage);
            observer.on_measurement(point, Measurement::new(point.target_voltage, current));
            observer.on_progress(&SweepProgress::new(index + 1, total, started.elapsed()));

            if index + 1 < total && !self.cancel.wait(delay) {
                return Ok(cancelled(index + 1, total));
            }
        }
        Ok(SweepReport {
            outcome: SweepOutcome::Completed,
            points_emitted: total,
            total,
        })
    }

    fn run_instrument_timed(
        &mut self,
        plan: &SweepPlan,
        delay: Duration,
        observer: &mut dyn SweepObserver,
    ) -> Result<SweepReport, SmuError> {
        let levels = voltages(plan.points());
        let total = levels.len();
        let budget = fast_sweep_timeout(total, delay);
        observer.on_status(&format!(
            "Running instrument-timed sweep of {total} points (timeout {} s)",
            budget.as_secs()
        ));

        let started = Instant::now();
        let results = {
            let mut guard = self.session.raise_timeout(budget)?;
            guard.run_timed_sweep(&levels, delay)?
        };
        let elapsed = started.elapsed();
        info!("Instrument loop returned {} of {total} points in {elapsed:?}", results.len());

        let emitted = results.len().min(total);
        for (index, (point, measurement)) in plan.points().iter().zip(results).enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(cancelled(index, total));
            }
            observer.on_measurement(point, measurement);
            observer.on_progress(&SweepProgress::new(index + 1, total, elapsed));
        }
        Ok(SweepReport {
            outcome: SweepOutcome::Completed,
            points_emitted: emitted,
            total,
        })
    }
}

fn cancelled(points_emitted: usize, total: usize) -> SweepReport {
    info!("Sweep cancelled after {points_emitted} points");
    SweepReport {
        outcome: SweepOutcome::Cancelled,
        points_emitted,
        total,
    }
}

/// One live-mode reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    pub elapsed_s: f64,
    pub measurement: Measurement,
}

/// Repeated current readings at the session's present level.
pub struct LiveSampler<'a> {
    session: &'a mut InstrumentSession,
    cancel: CancelToken,
    interval: Duration,
    max_points: usize,
    history: VecDeque<LiveSample>,
}

impl<'a> LiveSampler<'a> {
    pub fn new(session: &'a mut InstrumentSession, interval: Duration, max_points: usize) -> Self {
        Self {
            session,
            cancel: CancelToken::new(),
            interval,
            max_points: max_points.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn history(&self) -> &VecDeque<LiveSample> {
        &self.history
    }

    /// Sample until cancelled, until `limit` samples were taken, or until a
    /// reading fails. Returns the number of samples taken.
    pub fn run(
        &mut self,
        limit: Option<usize>,
        observer: &mut dyn SweepObserver,
    ) -> Result<usize, SmuError> {
        if !self.session.is_ready() {
            return Err(SmuError::NotConnected);
        }
        observer.on_status("Live measurement running");
        let started = Instant::now();
        let mut taken = 0;

        while !self.cancel.is_cancelled() && limit.is_none_or(|l| taken < l) {
            let voltage = self.session.last_voltage();
            let current = match self.session.measure_current() {
                Ok(c) => c,
                Err(e) => {
                    observer.on_status(&format!("Live measurement stopped: {e}"));
                    return Err(e);
                }
            };
            let measurement = Measurement::new(voltage, current);
            if self.history.len() == self.max_points {
                self.history.pop_front();
            }
            self.history.push_back(LiveSample {
                elapsed_s: started.elapsed().as_secs_f64(),
                measurement,
            });
            observer.on_measurement(&SweepPoint::untagged(voltage), measurement);
            taken += 1;

            if limit.is_some_and(|l| taken >= l) {
                break;
            }
            self.cancel.wait(self.interval);
        }
        observer.on_status("Live measurement stopped");
        Ok(taken)
    }
}
