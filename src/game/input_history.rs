//! Fixed-length record of the inputs applied on recent ticks.
//!
//! Slot 0 is always the newest entry. Ticks are contiguous: pushing a tick
//! that does not directly follow the newest one starts a fresh history.

use std::collections::VecDeque;

use crate::game::movement::InputState;
use crate::game::Tick;

#[derive(Debug, Clone)]
pub struct InputHistory {
    entries: VecDeque<(Tick, InputState)>,
    capacity: usize,
}

impl InputHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record the input applied on `tick`, evicting the oldest entry when full
    pub fn push(&mut self, tick: Tick, input: InputState) {
        if let Some(newest) = self.newest_tick() {
            if newest.checked_add(1) != Some(tick) {
                self.entries.clear();
            }
        }
        self.entries.push_front((tick, input));
        self.entries.truncate(self.capacity);
    }

    /// Entry `ticks_ago` slots back from the newest
    #[inline]
    pub fn get(&self, ticks_ago: usize) -> Option<(Tick, InputState)> {
        self.entries.get(ticks_ago).copied()
    }

    pub fn input_at(&self, tick: Tick) -> Option<InputState> {
        let newest = self.newest_tick()?;
        let ticks_ago = newest.checked_sub(tick)?;
        self.get(ticks_ago as usize).map(|(_, input)| input)
    }

    #[inline]
    pub fn newest_tick(&self) -> Option<Tick> {
        self.entries.front().map(|(tick, _)| *tick)
    }

    #[inline]
    pub fn oldest_tick(&self) -> Option<Tick> {
        self.entries.back().map(|(tick, _)| *tick)
    }

    /// Entries strictly newer than `tick`, oldest first
    pub fn after(&self, tick: Tick) -> impl Iterator<Item = (Tick, InputState)> + '_ {
        self.entries
            .iter()
            .rev()
            .copied()
            .filter(move |(entry_tick, _)| *entry_tick > tick)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
