//! Time-stepped wiper drive model.

use crate::codec::{SetRequest, TelemetryEvent, WiperMode};
use crate::hal::WiperEcu;
use crate::timebase::{Clock, TimeBase};
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MIN_POSITION: f32 = 0.0;
const MAX_POSITION: f32 = 180.0;
const REACHED_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub initial_position: f32,
    /// Steps reported as "ending" before the blade snaps to its target.
    pub grace_steps: u32,
    /// Upper bound of the position jitter added during the grace window.
    pub position_jitter: f32,
    pub current_baseline: f32,
    /// Drive current jitter is drawn from `[-current_jitter, current_jitter)`.
    pub current_jitter: f32,
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            initial_position: 15.0,
            grace_steps: 3,
            position_jitter: 0.1,
            current_baseline: 10.0,
            current_jitter: 0.05,
            seed: None,
        }
    }
}

impl SimConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug)]
struct SimState {
    position: f32,
    target: f32,
    /// Degrees per millisecond, signed toward the target.
    step: f32,
    wiping: bool,
    cycle_ending: bool,
    ending_count: u32,
    counter: u8,
    last_step_ms: u64,
    last_set_ms: u64,
    rng: StdRng,
}

pub struct WiperSimulator {
    config: SimConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl WiperSimulator {
    pub fn new(config: SimConfig) -> Self {
        Self::with_clock(config, Arc::new(TimeBase::new()))
    }

    pub fn with_clock(config: SimConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let now = clock.now_ms();
        let initial = config.initial_position.clamp(MIN_POSITION, MAX_POSITION);
        Self {
            state: Mutex::new(SimState {
                position: initial,
                target: initial,
                step: 0.0,
                wiping: false,
                cycle_ending: false,
                ending_count: 0,
                counter: 0,
                last_step_ms: now,
                last_set_ms: now,
                rng,
            }),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model_set(&self, request: &SetRequest) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let now = self.clock.now_ms();

        state.wiping = request.mode == WiperMode::Wipe;
        state.target = request.target_position.clamp(MIN_POSITION, MAX_POSITION);
        let magnitude = f32::from(request.frequency) * 180.0 / 60_000.0;
        state.step = if state.position > state.target {
            -magnitude
        } else {
            magnitude
        };
        state.cycle_ending = false;
        state.ending_count = 0;
        state.last_set_ms = now;
        state.last_step_ms = now;

        debug!(
            "model_set {}: moving {:.2} -> {:.2}, {:.5} deg/ms, wiping={}",
            request, state.position, state.target, state.step, state.wiping
        );
    }

    /// Advances the model to the clock's current time and returns a fresh sample.
    pub fn model_step(&self) -> TelemetryEvent {
        let mut guard = self.lock();
        let state = &mut *guard;
        let now = self.clock.now_ms();
        let elapsed_ms = now.saturating_sub(state.last_step_ms);
        state.last_step_ms = now;
        state.counter = state.counter.wrapping_add(1);

        let mut current = 0.0;
        let reached;

        if state.wiping {
            let mut next = state.position + elapsed_ms as f32 * state.step;
            let crossed = state.cycle_ending
                || (state.step >= 0.0 && next >= state.target)
                || (state.step < 0.0 && next <= state.target);

            if crossed {
                if state.ending_count < self.config.grace_steps {
                    state.cycle_ending = true;
                    state.ending_count += 1;
                    state.step = 0.0;
                    let jitter = self.config.position_jitter;
                    next = state.target + jitter_in(&mut state.rng, 0.0, jitter);
                    reached = false;
                    trace!("wipe cycle ending at {next:.2}, target {:.2}", state.target);
                } else {
                    debug!(
                        "reached target {:.2} in {} ms",
                        state.target,
                        now.saturating_sub(state.last_set_ms)
                    );
                    state.wiping = false;
                    state.cycle_ending = false;
                    state.ending_count = 0;
                    next = state.target;
                    reached = true;
                }
            } else {
                reached = false;
            }

            if state.wiping {
                if next < -1.0 {
                    next = MIN_POSITION;
                } else if next > 181.0 {
                    next = MAX_POSITION;
                }
                let jitter = self.config.current_jitter;
                current = self.config.current_baseline + jitter_in(&mut state.rng, -jitter, jitter);
            }
            state.position = next;
        } else {
            reached = (state.position - state.target).abs() < REACHED_TOLERANCE;
        }

        let event = TelemetryEvent {
            seq: state.counter,
            actual_position: state.position.clamp(MIN_POSITION, MAX_POSITION),
            drive_current: current,
            is_wiping: u8::from(state.wiping),
            is_ending_wipe_cycle: u8::from(state.cycle_ending),
            is_position_reached: u8::from(reached),
            ..TelemetryEvent::default()
        };
        trace!("model_step elapsed={elapsed_ms}ms {event}");
        event
    }

    pub fn is_cycle_ending(&self) -> bool {
        self.lock().cycle_ending
    }
}

impl WiperEcu for WiperSimulator {
    fn apply(&self, request: &SetRequest) {
        self.model_set(request);
    }

    fn sample(&self) -> TelemetryEvent {
        self.model_step()
    }

    fn is_cycle_ending(&self) -> bool {
        WiperSimulator::is_cycle_ending(self)
    }
}

fn jitter_in(rng: &mut StdRng, low: f32, high: f32) -> f32 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}
