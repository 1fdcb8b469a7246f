//! Per-connection input sequencing and clock drift detection
//!
//! Client inputs are tagged with the tick they should apply on. The
//! sequencer admits inputs whose lead over the server tick lies inside a
//! configurable window, holds them keyed by tick, and releases them in
//! strictly ascending order when the simulation reaches that tick.
//!
//! Every tagged message (inputs, dropped or not, and heartbeats) is a sample
//! of the client's lead. Once enough fresh samples are in, a mean lead
//! outside the window produces a single tick adjustment for the client,
//! followed by a settle period during which samples are ignored.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::game::constants::input::{
    DESYNC_LIMIT, MAX_LEAD, MIN_FRESH_SAMPLES, MIN_LEAD, SETTLE_TICKS,
};
use crate::game::movement::InputState;
use crate::game::Tick;

/// Sequencer tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerConfig {
    /// Smallest accepted `input_tick - server_tick`
    pub min_lead: i64,
    /// Largest accepted `input_tick - server_tick`
    pub max_lead: i64,
    /// Samples required before a drift decision
    pub min_fresh_samples: usize,
    /// Ticks after an adjustment during which samples are ignored
    pub settle_ticks: u64,
    /// Absolute tick difference treated as a connection fault
    pub desync_limit: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            min_lead: MIN_LEAD,
            max_lead: MAX_LEAD,
            min_fresh_samples: MIN_FRESH_SAMPLES,
            settle_ticks: SETTLE_TICKS,
            desync_limit: DESYNC_LIMIT,
        }
    }
}

impl SequencerConfig {
    /// Lead the drift correction aims for
    #[inline]
    pub fn target_lead(&self) -> f64 {
        (self.min_lead + self.max_lead) as f64 / 2.0
    }
}

/// Why an input was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived with too little lead (or for a tick already simulated)
    Late,
    /// Arrived too far ahead
    Early,
    /// Tick already held or released
    Duplicate,
}

/// Outcome of one received input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequencerError {
    #[error("Client tick {client} is {diff} ticks from server tick {server} (limit {limit})")]
    Desync {
        client: Tick,
        server: Tick,
        diff: i64,
        limit: u64,
    },
}

/// Counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerStats {
    pub accepted: u64,
    pub dropped_late: u64,
    pub dropped_early: u64,
    pub dropped_duplicate: u64,
    pub adjustments: u64,
}

impl SequencerStats {
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped_late + self.dropped_early + self.dropped_duplicate
    }
}

/// Inputs released for one tick, ascending
pub type Released = SmallVec<[(Tick, InputState); 4]>;

pub struct InputSequencer {
    config: SequencerConfig,
    pending: BTreeMap<Tick, InputState>,
    last_released: Option<Tick>,
    sample_sum: i64,
    sample_count: usize,
    settle_until: Tick,
    adjustment: Option<i64>,
    stats: SequencerStats,
}

impl InputSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            pending: BTreeMap::new(),
            last_released: None,
            sample_sum: 0,
            sample_count: 0,
            settle_until: 0,
            adjustment: None,
            stats: SequencerStats::default(),
        }
    }

    #[inline]
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Admit or drop one input. `server_tick` is the last completed tick.
    pub fn receive(
        &mut self,
        server_tick: Tick,
        input_tick: Tick,
        input: InputState,
    ) -> Result<Admission, SequencerError> {
        let diff = self.check_desync(server_tick, input_tick)?;
        self.sample(server_tick, diff);

        let admission = if diff < self.config.min_lead {
            self.stats.dropped_late += 1;
            Admission::Dropped(DropReason::Late)
        } else if diff > self.config.max_lead {
            self.stats.dropped_early += 1;
            Admission::Dropped(DropReason::Early)
        } else if self.pending.contains_key(&input_tick)
            || self.last_released.is_some_and(|released| input_tick <= released)
        {
            self.stats.dropped_duplicate += 1;
            Admission::Dropped(DropReason::Duplicate)
        } else {
            self.pending.insert(input_tick, input);
            self.stats.accepted += 1;
            Admission::Accepted
        };
        Ok(admission)
    }

    /// Record a clock sample from a message that carries no input
    pub fn observe(&mut self, server_tick: Tick, client_tick: Tick) -> Result<(), SequencerError> {
        let diff = self.check_desync(server_tick, client_tick)?;
        self.sample(server_tick, diff);
        Ok(())
    }

    /// Hand over every held input with tick <= `tick`, oldest first
    pub fn release(&mut self, tick: Tick) -> Released {
        let later = match tick.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.pending, later);
        if let Some((&newest, _)) = ready.iter().next_back() {
            self.last_released = Some(newest);
        }
        ready.into_iter().collect()
    }

    /// Pending tick adjustment for the client, if drift was detected
    #[inline]
    pub fn take_adjustment(&mut self) -> Option<i64> {
        self.adjustment.take()
    }

    fn check_desync(&self, server_tick: Tick, client_tick: Tick) -> Result<i64, SequencerError> {
        let diff = client_tick as i128 - server_tick as i128;
        if diff.unsigned_abs() > self.config.desync_limit as u128 {
            return Err(SequencerError::Desync {
                client: client_tick,
                server: server_tick,
                diff: diff.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
                limit: self.config.desync_limit,
            });
        }
        Ok(diff as i64)
    }

    fn sample(&mut self, server_tick: Tick, diff: i64) {
        if server_tick < self.settle_until {
            return;
        }
        self.sample_sum += diff;
        self.sample_count += 1;
        if self.sample_count < self.config.min_fresh_samples.max(1) {
            return;
        }

        let mean = self.sample_sum as f64 / self.sample_count as f64;
        self.sample_sum = 0;
        self.sample_count = 0;

        if mean < self.config.min_lead as f64 || mean > self.config.max_lead as f64 {
            let delta = (self.config.target_lead() - mean).round() as i64;
            if delta != 0 {
                self.adjustment = Some(delta);
                self.stats.adjustments += 1;
                self.settle_until = server_tick + self.config.settle_ticks;
            }
        }
    }
}

impl Default for InputSequencer {
    fn default() -> Self {
        Self::new(SequencerConfig::default())
    }
}
