//! Client-side prediction with replay reconciliation
//!
//! Each local tick runs the shared movement step immediately and records the
//! applied input. An authoritative correction resets the predicted state to
//! the server's values for that tick and replays every newer recorded input
//! in order, which lands exactly where the server will be given the same
//! inputs.

use tracing::{debug, warn};

use crate::game::constants::input::HISTORY_LENGTH;
use crate::game::input_history::InputHistory;
use crate::game::movement::{self, InputState, MotionState, MovementParams};
use crate::game::Tick;

/// Authoritative state of the owned entity at the end of `tick`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub tick: Tick,
    pub state: MotionState,
    /// Input the server held on that tick
    pub input: InputState,
}

/// What a reconcile pass did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// State reset and `replayed` newer ticks re-simulated
    Replayed {
        tick: Tick,
        replayed: usize,
        /// Planar distance between the old and the new prediction
        error: f32,
        /// Whether the server held the input we recorded for `tick`
        input_matched: bool,
    },
    /// Correction older than the retained history; applied verbatim
    Snapped { tick: Tick, error: f32 },
}

impl ReconcileOutcome {
    pub fn error(&self) -> f32 {
        match self {
            ReconcileOutcome::Replayed { error, .. } | ReconcileOutcome::Snapped { error, .. } => {
                *error
            }
        }
    }
}

pub struct Predictor {
    params: MovementParams,
    dt: f32,
    state: MotionState,
    history: InputHistory,
    pending: Option<Correction>,
    last_corrected: Option<Tick>,
}

impl Predictor {
    pub fn new(params: MovementParams, dt: f32, history_length: usize) -> Self {
        Self {
            params,
            dt,
            state: MotionState::default(),
            history: InputHistory::new(history_length),
            pending: None,
            last_corrected: None,
        }
    }

    /// Start over from a known state (spawn, teleport)
    pub fn reset(&mut self, state: MotionState) {
        self.state = state;
        self.history.clear();
        self.pending = None;
        self.last_corrected = None;
    }

    #[inline]
    pub fn state(&self) -> MotionState {
        self.state
    }

    #[inline]
    pub fn history(&self) -> &InputHistory {
        &self.history
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Predict one tick. Any queued correction is reconciled first.
    pub fn predict(&mut self, tick: Tick, input: InputState) -> MotionState {
        if self.pending.is_some() {
            self.reconcile();
        }
        self.state = movement::step(self.state, input, &self.params, self.dt);
        self.history.push(tick, input);
        self.state
    }

    /// Queue an authoritative correction. Only the newest one is kept;
    /// returns false when `correction` is older than what is already known.
    pub fn queue_correction(&mut self, correction: Correction) -> bool {
        if let Some(pending) = &self.pending {
            if correction.tick < pending.tick {
                return false;
            }
        }
        if self.last_corrected.is_some_and(|last| correction.tick < last) {
            return false;
        }
        self.pending = Some(correction);
        true
    }

    /// Apply the queued correction, if any
    pub fn reconcile(&mut self) -> Option<ReconcileOutcome> {
        let correction = self.pending.take()?;
        self.last_corrected = Some(correction.tick);
        let previous = self.state.position;

        let replayable = match self.history.oldest_tick() {
            Some(oldest) => correction.tick.saturating_add(1) >= oldest,
            None => false,
        };

        if !replayable {
            warn!(
                "Correction for tick {} is outside the input history ({:?}..={:?}), snapping",
                correction.tick,
                self.history.oldest_tick(),
                self.history.newest_tick()
            );
            self.state = correction.state;
            self.history.clear();
            return Some(ReconcileOutcome::Snapped {
                tick: correction.tick,
                error: previous.planar_distance_to(self.state.position),
            });
        }

        let input_matched = self
            .history
            .input_at(correction.tick)
            .map_or(true, |recorded| recorded == correction.input);

        let mut state = correction.state;
        let mut replayed = 0;
        for (_, input) in self.history.after(correction.tick) {
            state = movement::step(state, input, &self.params, self.dt);
            replayed += 1;
        }
        self.state = state;

        let error = previous.planar_distance_to(state.position);
        if error > 0.0 {
            debug!(
                "Reconciled from tick {}: replayed {} ticks, error {:.3}",
                correction.tick, replayed, error
            );
        }
        Some(ReconcileOutcome::Replayed {
            tick: correction.tick,
            replayed,
            error,
            input_matched,
        })
    }
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new(
            MovementParams::default(),
            crate::game::constants::sim::DT,
            HISTORY_LENGTH,
        )
    }
}
