//! Client tick counter
//!
//! The counter advances once per local fixed step regardless of network
//! traffic. It starts `initial_lead` ticks ahead of the server tick reported
//! at connect time, and jumps once per server-issued adjustment.

use crate::game::constants::input::{INITIAL_LEAD, MAX_ADJUSTMENT};
use crate::game::Tick;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Ticks ahead of the server tick to start at
    pub initial_lead: u64,
    /// Largest adjustment magnitude accepted
    pub max_adjustment: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_lead: INITIAL_LEAD,
            max_adjustment: MAX_ADJUSTMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Tick adjustment received before connection response")]
    NotSynced,
    #[error("Implausible tick adjustment {delta} (max {max})")]
    Implausible { delta: i64, max: u64 },
}

#[derive(Debug, Clone)]
pub struct TickSynchronizer {
    config: SyncConfig,
    tick: Tick,
    synced: bool,
    steps: u64,
    adjustments: u64,
}

impl TickSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            tick: 0,
            synced: false,
            steps: 0,
            adjustments: 0,
        }
    }

    /// Establish the offset from the server tick in the connection response
    pub fn on_connection_response(&mut self, server_tick: Tick) -> Tick {
        self.tick = server_tick.saturating_add(self.config.initial_lead);
        self.synced = true;
        self.tick
    }

    /// One local fixed step
    #[inline]
    pub fn advance(&mut self) -> Tick {
        self.tick = self.tick.saturating_add(1);
        self.steps += 1;
        self.tick
    }

    /// Shift once by a signed delta. Oversized shifts are refused untouched.
    pub fn apply_adjustment(&mut self, delta: i64) -> Result<Tick, SyncError> {
        if !self.synced {
            return Err(SyncError::NotSynced);
        }
        if delta.unsigned_abs() > self.config.max_adjustment {
            return Err(SyncError::Implausible {
                delta,
                max: self.config.max_adjustment,
            });
        }
        self.tick = self.tick.saturating_add_signed(delta);
        self.adjustments += 1;
        Ok(self.tick)
    }

    /// Server-relative tick of the latest step
    #[inline]
    pub fn current(&self) -> Tick {
        self.tick
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Local steps taken; never jumps
    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[inline]
    pub fn adjustments_applied(&self) -> u64 {
        self.adjustments
    }
}

impl Default for TickSynchronizer {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_ahead_of_server() {
        let mut sync = TickSynchronizer::new(SyncConfig {
            initial_lead: 3,
            max_adjustment: 50,
        });
        assert!(!sync.is_synced());
        assert_eq!(sync.on_connection_response(500), 503);
        assert_eq!(sync.advance(), 504);
        assert_eq!(sync.advance(), 505);
        assert_eq!(sync.steps(), 2);
    }

    #[test]
    fn test_adjustment_applied_once() {
        let mut sync = TickSynchronizer::default();
        sync.on_connection_response(100);
        let before = sync.current();

        assert_eq!(sync.apply_adjustment(-5), Ok(before - 5));
        assert_eq!(sync.advance(), before - 4, "adjustment is a single jump, not a drift");
        assert_eq!(sync.adjustments_applied(), 1);

        assert_eq!(sync.apply_adjustment(7), Ok(before + 3));
        assert_eq!(sync.adjustments_applied(), 2);
        assert_eq!(sync.steps(), 1, "local step count never jumps");
    }

    #[test]
    fn test_implausible_adjustment_rejected() {
        let mut sync = TickSynchronizer::new(SyncConfig {
            initial_lead: 2,
            max_adjustment: 10,
        });
        sync.on_connection_response(1000);

        let result = sync.apply_adjustment(-11);
        assert_eq!(result, Err(SyncError::Implausible { delta: -11, max: 10 }));
        assert_eq!(sync.current(), 1002);
        assert_eq!(sync.adjustments_applied(), 0);
        assert!(sync.apply_adjustment(10).is_ok());
    }

    #[test]
    fn test_adjustment_before_sync_rejected() {
        let mut sync = TickSynchronizer::default();
        assert_eq!(sync.apply_adjustment(1), Err(SyncError::NotSynced));
    }

    #[test]
    fn test_negative_adjustment_saturates() {
        let mut sync = TickSynchronizer::default();
        sync.on_connection_response(0);
        assert_eq!(sync.apply_adjustment(-100), Ok(0));
    }
}
