/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Boards next to the motherboard that take part in clocking.

use crate::config::ClockSource;
use crate::error::Result;

/// Direction of the aux board's trigger I/O buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerDirection {
    Input,
    Output,
}

/// Reference input the aux board routes to the motherboard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeSourceBoard {
    Internal,
    External,
}

/// Clocking aux board: reference and PPS source multiplexer, GPSDO and
/// reference export.
pub trait ClockingAuxBoard: Send {
    fn set_source(&mut self, clock_source: ClockSource, time_source: TimeSourceBoard) -> Result<()>;
    fn export_clock(&mut self, enable: bool) -> Result<()>;
    fn set_trig(&mut self, enable: bool, direction: TriggerDirection) -> Result<()>;
    fn is_gps_supported(&self) -> bool;
    fn is_nsync_supported(&self) -> bool;
    /// Sources the board may forward to its reference output.
    fn valid_clock_exports(&self) -> Vec<ClockSource>;
}

/// The part of a daughterboard that must follow motherboard clock resets.
pub trait Daughterboard: Send {
    fn reset_clock(&mut self, reset: bool) -> Result<()>;
}
