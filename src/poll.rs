/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Bounded waits.
//!
//! Every hardware wait in the clock tree is "check a status bit, sleep,
//! check again" with a fixed interval and an upper bound. [`poll_with_timeout`]
//! is the one place that loop lives.

use core::time::Duration;

use crate::error::Result;
use crate::hal::blocking::delay::{DelayMs, DelayUs};

/// Blocking delay provider used for every wait in this crate.
pub trait Delay: DelayUs<u32> + DelayMs<u32> + Send {}

impl<T> Delay for T where T: DelayUs<u32> + DelayMs<u32> + Send {}

/// [`Delay`] backed by `std::thread::sleep`.
#[derive(Debug, Default, Copy, Clone)]
pub struct StdDelay;

impl DelayUs<u32> for StdDelay {
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Evaluates `predicate`, then keeps re-evaluating it every `interval` until
/// `timeout` has been spent sleeping.
///
/// Returns `Ok(true)` as soon as the predicate holds and `Ok(false)` if it
/// never did. Errors from the predicate abort the wait.
pub fn poll_with_timeout<D, F>(
    delay: &mut D,
    timeout: Duration,
    interval: Duration,
    mut predicate: F,
) -> Result<bool>
where
    D: Delay + ?Sized,
    F: FnMut() -> Result<bool>,
{
    if predicate()? {
        return Ok(true);
    }

    let interval_us = interval.as_micros().max(1) as u32;
    let attempts = (timeout.as_micros() / interval_us as u128) as u32;
    for _ in 0..attempts {
        DelayUs::<u32>::delay_us(&mut *delay, interval_us);
        if predicate()? {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct CountingDelay {
        slept_us: u64,
        naps: u32,
    }

    impl DelayUs<u32> for CountingDelay {
        fn delay_us(&mut self, us: u32) {
            self.slept_us += us as u64;
            self.naps += 1;
        }
    }

    impl DelayMs<u32> for CountingDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.slept_us += ms as u64 * 1000;
            self.naps += 1;
        }
    }

    #[test]
    fn satisfied_predicate_does_not_sleep() {
        let mut delay = CountingDelay::default();
        let done = poll_with_timeout(
            &mut delay,
            Duration::from_millis(5),
            Duration::from_millis(1),
            || Ok(true),
        )
        .unwrap();
        assert!(done);
        assert_eq!(delay.naps, 0);
    }

    #[test]
    fn gives_up_after_timeout() {
        let mut delay = CountingDelay::default();
        let mut checks = 0;
        let done = poll_with_timeout(
            &mut delay,
            Duration::from_millis(1500),
            Duration::from_millis(10),
            || {
                checks += 1;
                Ok(false)
            },
        )
        .unwrap();
        assert!(!done);
        assert_eq!(checks, 151);
        assert_eq!(delay.slept_us, 1_500_000);
    }

    #[test]
    fn succeeds_on_late_edge() {
        let mut delay = CountingDelay::default();
        let mut checks = 0;
        let done = poll_with_timeout(
            &mut delay,
            Duration::from_micros(1000),
            Duration::from_micros(200),
            || {
                checks += 1;
                Ok(checks == 4)
            },
        )
        .unwrap();
        assert!(done);
        assert_eq!(delay.naps, 3);
    }

    #[test]
    fn predicate_errors_abort_the_wait() {
        let mut delay = CountingDelay::default();
        let result = poll_with_timeout(
            &mut delay,
            Duration::from_millis(2),
            Duration::from_millis(1),
            || Err(Error::CommunicationError("gone".into())),
        );
        assert!(matches!(result, Err(Error::CommunicationError(_))));
        assert_eq!(delay.naps, 0);
    }
}
