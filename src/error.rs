/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
use core::fmt::Debug;

/// Everything that can go wrong while sequencing the clock tree.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("register transport failed: {0}")]
    CommunicationError(String),
    #[error("GPIO access failed: {0}")]
    Gpio(String),

    #[error("invalid board configuration: {0}")]
    Config(String),
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("unsupported master clock rate {rate} Hz: {reason}")]
    UnsupportedRate { rate: f64, reason: String },
    #[error("unsupported {converter} resampling factor {factor}")]
    UnsupportedFactor {
        factor: u32,
        converter: &'static str,
    },
    #[error("no divider set reproduces {target} Hz from {reference} Hz")]
    UnsupportedRatio { target: f64, reference: f64 },
    #[error("unsupported combination of reference clock ({ref_freq:.2E} Hz) and PPS source ({pps_source}) for PPS sync")]
    UnsupportedCombination { ref_freq: f64, pps_source: String },
    #[error("invalid PPS delay: {0}")]
    InvalidDelay(String),
    #[error("external reference clock frequency {0} Hz must be within 1..=50 MHz in 40 kHz steps")]
    InvalidReferenceFrequency(f64),

    /// Raised by tile drivers and edge callbacks that give up waiting.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("timeout while resetting or enabling the {0} chain")]
    ResetTimeout(&'static str),
    #[error("MMCM failed to lock within the expected time")]
    MmcmLockTimeout,
    #[error("{converter} tiles failed to sync properly (latencies {latencies:?})")]
    SyncFailure {
        converter: &'static str,
        latencies: Vec<u32>,
    },

    #[error("{device} signature {found:#X} does not match expected value {expected:#X}")]
    SignatureMismatch {
        device: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("{device} revision {found:#X} is incompatible: {reason}")]
    RevisionMismatch {
        device: &'static str,
        found: u32,
        reason: String,
    },

    #[error("RFDC driver call failed: {0}")]
    Rfdc(String),
    #[error("{0} has not been configured yet")]
    NotConfigured(&'static str),
    #[error("no clocking aux board available")]
    NoAuxBoard,
    #[error("RFDC is not powered on")]
    RfdcNotPowered,
    #[error("clock control lock poisoned")]
    Poisoned,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub(crate) fn bus_error<E: Debug>(e: E) -> Error {
    Error::CommunicationError(format!("{:?}", e))
}

pub(crate) fn gpio_error<E: Debug>(e: E) -> Error {
    Error::Gpio(format!("{:?}", e))
}
