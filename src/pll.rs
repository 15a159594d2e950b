/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Pieces shared by both PLL drivers.

use crate::error::{Error, Result};

/// Lock bits of a two-stage PLL, read fresh from hardware.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PllStatus {
    pub pll1_locked: bool,
    pub pll2_locked: bool,
}

impl PllStatus {
    pub fn is_locked(&self) -> bool {
        self.pll1_locked && self.pll2_locked
    }
}

/// Read-only view of a PLL's lock state, for tasks that must not touch the
/// rest of the device.
pub trait LockProbe: Send + Sync {
    fn status(&self) -> Result<PllStatus>;
}

/// `hz` as an exact integer, if it is one.
pub(crate) fn to_hz(hz: f64) -> Option<u64> {
    if hz > 0.0 && hz.fract() == 0.0 && hz < u64::MAX as f64 {
        Some(hz as u64)
    } else {
        None
    }
}

pub(crate) fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Integer `(r, n)` such that `input / r * n == output` with the phase
/// detector running at the greatest common rate of both.
pub(crate) fn integer_dividers(
    input: f64,
    output: f64,
    max_r: u32,
    max_n: u32,
) -> Result<(u32, u32)> {
    let unsupported = Error::UnsupportedRatio {
        target: output,
        reference: input,
    };
    let (input_hz, output_hz) = match (to_hz(input), to_hz(output)) {
        (Some(i), Some(o)) => (i, o),
        _ => return Err(unsupported),
    };
    let pfd = gcd(input_hz, output_hz);
    let r = input_hz / pfd;
    let n = output_hz / pfd;
    if r > max_r as u64 || n > max_n as u64 {
        return Err(unsupported);
    }
    Ok((r as u32, n as u32))
}
