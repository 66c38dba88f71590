//! Chain break detection.
//!
//! # Design
//! The chain can be read from either end. A device that is cut off from the end a frame is sent
//! from does not answer and its slot reads as all ones. A read that sees a run of silent
//! devices up to the far end is retried from the other end. With a single clean break the
//! healthy extents seen from the two ends add up to the chain length. A shorter sum means a
//! second break, a longer one an inconsistent result.
use core::ops::{Index, IndexMut};

use serde::Serialize;

use crate::transport::Direction;

/// Break tracking of one read or write from one end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakData {
    /// A silent device has been seen.
    pub first_break: bool,
    /// All devices after the first silent one were silent or corrupt.
    pub break_string: bool,
    pub crc_error: bool,
    pub ack_error: bool,
    /// Number of devices up to and including the last good one.
    pub break_idx: u8,
    pub break_idx_prev: u8,
}

impl Default for BreakData {
    fn default() -> Self {
        Self {
            first_break: false,
            break_string: false,
            crc_error: false,
            ack_error: false,
            break_idx: 0,
            break_idx_prev: u8::MAX,
        }
    }
}

impl BreakData {
    /// Reset before a transfer.
    pub fn prepare(&mut self) {
        *self = Self {
            break_idx_prev: self.break_idx_prev,
            ..Default::default()
        };
    }

    /// The device in wire slot `slot` answered correctly.
    pub fn answered(&mut self, slot: usize) {
        self.break_idx = (slot + 1) as u8;
        if self.first_break {
            self.break_string = false;
        }
    }

    /// A device answered with all ones.
    pub fn silent(&mut self) {
        if !self.first_break {
            self.first_break = true;
            self.break_string = true;
        }
    }

    /// The device in wire slot `slot` answered with a corrupted payload.
    pub fn corrupt(&mut self, slot: usize) {
        if self.first_break && slot > self.break_idx as usize {
            self.break_string = false;
        }
    }

    /// A device did not acknowledge.
    pub fn nak(&mut self) {
        self.ack_error = true;
        self.silent();
    }

    /// Remember the extent of a completed read with a break.
    pub fn commit(&mut self) {
        if self.break_string {
            self.break_idx_prev = self.break_idx;
        }
    }
}

/// Classification of the breaks seen from both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// One break: both ends together reach every device.
    Single,
    /// More than one break.
    Double,
    /// The two ends overlap.
    Inconsistent,
}

/// Break state of both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Breaks([BreakData; 2]);

impl Index<Direction> for Breaks {
    type Output = BreakData;

    fn index(&self, dir: Direction) -> &BreakData {
        &self.0[dir.index()]
    }
}

impl IndexMut<Direction> for Breaks {
    fn index_mut(&mut self, dir: Direction) -> &mut BreakData {
        &mut self.0[dir.index()]
    }
}

impl Breaks {
    /// Classify the break seen from either end.
    ///
    /// Returns `None` if neither end saw a trailing run of silent devices, otherwise the
    /// outcome and the number of devices reachable from both ends together.
    pub fn classify(&self, num_devs: usize) -> Option<(Outcome, u8)> {
        let (a, b) = (&self[Direction::A], &self[Direction::B]);
        if !(a.break_string || b.break_string) {
            return None;
        }
        let sum = a.break_idx as usize + b.break_idx as usize;
        let outcome = match sum.cmp(&num_devs) {
            core::cmp::Ordering::Less => Outcome::Double,
            core::cmp::Ordering::Equal => Outcome::Single,
            core::cmp::Ordering::Greater => Outcome::Inconsistent,
        };
        Some((outcome, sum.min(u8::MAX as usize) as u8))
    }
}

/// Break flags passed to the pack layer with every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BreakReport {
    pub detected: bool,
    pub double: bool,
    pub error: bool,
    /// Number of healthy devices seen from the A end.
    pub idx: u8,
}

impl BreakReport {
    pub fn record(&mut self, outcome: Outcome, idx: u8) {
        self.detected = true;
        match outcome {
            Outcome::Single => {}
            Outcome::Double => self.double = true,
            Outcome::Inconsistent => self.error = true,
        }
        self.idx = idx;
    }
}
