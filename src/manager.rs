/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Motherboard manager: the orchestrator behind a single lock, plus the
//! background tasks that watch the board while a session is up.
//!
//! The tasks never see the orchestrator itself. The reference-lock monitor
//! gets read-only [`LockProbe`]s and an LED, each DIO fault monitor gets its
//! fault line and the external power enable of its port.

use core::fmt::{self, Debug};
use log::{error, trace, warn};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{gpio_error, Error, Result};
use crate::hal::digital::v2::OutputPin;
use crate::orchestrator::ClockOrchestrator;
use crate::pll::LockProbe;

/// Update period of the reference-lock LED.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Longest a fault monitor blocks on its line before checking for shutdown.
pub const FAULT_WAIT: Duration = Duration::from_millis(100);

/// Edge-triggered fault input of a DIO port.
pub trait FaultLine: Send {
    /// Blocks until a fault edge arrives or `timeout` passes. Returns
    /// whether an edge was seen.
    fn wait_for_edge(&mut self, timeout: Duration) -> Result<bool>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DioPort {
    A,
    B,
}

impl fmt::Display for DioPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DioPort::A => f.write_str("A"),
            DioPort::B => f.write_str("B"),
        }
    }
}

/// Shutdown flag a task can sleep on.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
        }
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.lock().map(|stopped| *stopped).unwrap_or(true)
    }

    /// Sleeps for `timeout` unless stopped first. Returns whether the task
    /// should exit.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = match self.stopped.lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        match self.cond.wait_timeout_while(guard, timeout, |stopped| !*stopped) {
            Ok((stopped, _)) => *stopped,
            Err(_) => true,
        }
    }
}

struct Task {
    name: String,
    stop: Arc<StopSignal>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
    join_timeout: Duration,
}

impl Task {
    fn spawn<F>(name: String, join_timeout: Duration, body: F) -> Self
    where
        F: FnOnce(&StopSignal) + Send + 'static,
    {
        let stop = Arc::new(StopSignal::default());
        let (done_tx, done) = mpsc::channel();
        let task_stop = stop.clone();
        trace!("Spawning {}...", name);
        let handle = thread::spawn(move || {
            body(&task_stop);
            let _ = done_tx.send(());
        });
        Task {
            name,
            stop,
            done,
            handle,
            join_timeout,
        }
    }

    /// Stops the task and waits for it at most `join_timeout`. Returns
    /// whether it finished.
    fn shut_down(self) -> bool {
        self.stop.stop();
        match self.done.recv_timeout(self.join_timeout) {
            Ok(()) => self.handle.join().is_ok(),
            Err(RecvTimeoutError::Disconnected) => {
                // The body panicked before reporting back.
                let _ = self.handle.join();
                false
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

fn ref_locked(probes: &[Box<dyn LockProbe>]) -> bool {
    probes.iter().all(|probe| match probe.status() {
        Ok(status) => status.is_locked(),
        Err(e) => {
            warn!("Could not read PLL lock status: {}", e);
            false
        }
    })
}

fn ref_lock_monitor<L>(probes: Vec<Box<dyn LockProbe>>, mut led: L, interval: Duration, stop: &StopSignal)
where
    L: OutputPin,
    L::Error: Debug,
{
    trace!("Launching monitor loop...");
    loop {
        let result = if ref_locked(&probes) {
            led.set_high()
        } else {
            led.set_low()
        };
        if let Err(e) = result {
            warn!("Could not update the REF LED: {}", gpio_error(e));
        }
        if stop.wait(interval) {
            break;
        }
    }
    trace!("Terminating monitor loop.");
}

fn dio_fault_monitor<F, O>(port: DioPort, mut line: F, mut ext_power: O, stop: &StopSignal)
where
    F: FaultLine,
    O: OutputPin,
    O::Error: Debug,
{
    trace!("Launching DIO {} fault monitor...", port);
    while !stop.is_stopped() {
        match line.wait_for_edge(FAULT_WAIT) {
            Ok(false) => {}
            Ok(true) => {
                warn!("DIO fault occurred on port {} - turning off external power", port);
                if let Err(e) = ext_power.set_low() {
                    error!("Could not turn off external power of DIO port {}: {}", port, gpio_error(e));
                }
            }
            Err(e) => {
                error!("DIO {} fault line failed, stopping its monitor: {}", port, e);
                break;
            }
        }
    }
    trace!("Terminating DIO {} fault monitor.", port);
}

/// Owns the clock orchestrator and the board's background tasks.
///
/// Every caller goes through the same mutex, so reconfigurations are never
/// interleaved.
pub struct MboardManager<P> {
    clocks: Arc<Mutex<ClockOrchestrator<P>>>,
    tasks: Vec<Task>,
}

impl<P> MboardManager<P> {
    pub fn new(clocks: ClockOrchestrator<P>) -> Self {
        MboardManager {
            clocks: Arc::new(Mutex::new(clocks)),
            tasks: Vec::new(),
        }
    }

    /// Handle for other control-plane threads.
    pub fn clocks(&self) -> Arc<Mutex<ClockOrchestrator<P>>> {
        self.clocks.clone()
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ClockOrchestrator<P>>> {
        self.clocks.lock().map_err(|_| Error::Poisoned)
    }

    /// Runs `f` with exclusive access to the orchestrator.
    pub fn with_clocks<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ClockOrchestrator<P>) -> Result<R>,
    {
        let mut clocks = self.lock()?;
        f(&mut clocks)
    }

    /// Starts watching the fault line of a DIO port. A fault switches the
    /// port's external power off.
    pub fn spawn_dio_fault_monitor<F, O>(&mut self, port: DioPort, line: F, ext_power: O)
    where
        F: FaultLine + 'static,
        O: OutputPin + Send + 'static,
        O::Error: Debug,
    {
        self.tasks.push(Task::spawn(
            format!("DIO {} fault monitor", port),
            3 * FAULT_WAIT,
            move |stop| dio_fault_monitor(port, line, ext_power, stop),
        ));
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stops all background tasks. Returns the names of tasks that did not
    /// finish in time; those are left detached.
    pub fn tear_down(&mut self) -> Vec<String> {
        trace!("Tearing down motherboard tasks...");
        let mut stuck = Vec::new();
        for task in self.tasks.drain(..) {
            let name = task.name.clone();
            if !task.shut_down() {
                error!("Could not terminate {}! This could result in resource leaks.", name);
                stuck.push(name);
            }
        }
        stuck
    }
}

impl<P, E> MboardManager<P>
where
    P: OutputPin<Error = E>,
    E: Debug,
{
    /// Starts driving `led` from the reference lock state every `interval`.
    pub fn spawn_ref_lock_monitor<L>(&mut self, led: L, interval: Duration) -> Result<()>
    where
        L: OutputPin + Send + 'static,
        L::Error: Debug,
    {
        let (spll, rpll) = self.lock()?.lock_probes();
        let probes: Vec<Box<dyn LockProbe>> = vec![Box::new(spll), Box::new(rpll)];
        self.tasks.push(Task::spawn(
            "ref lock monitor".into(),
            3 * interval,
            move |stop| ref_lock_monitor(probes, led, interval, stop),
        ));
        Ok(())
    }
}

impl<P> Drop for MboardManager<P> {
    fn drop(&mut self) {
        self.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::testing::{rig, FakePin, Journal};
    use std::time::Instant;

    fn eventually(journal: &Journal, call: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if journal.calls().iter().any(|c| c == call) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    struct ChannelFault(mpsc::Receiver<()>);

    impl FaultLine for ChannelFault {
        fn wait_for_edge(&mut self, timeout: Duration) -> Result<bool> {
            match self.0.recv_timeout(timeout) {
                Ok(()) => Ok(true),
                Err(RecvTimeoutError::Timeout) => Ok(false),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Gpio("fault line closed".into())),
            }
        }
    }

    /// Ignores the timeout it is given.
    struct StuckFault;

    impl FaultLine for StuckFault {
        fn wait_for_edge(&mut self, _timeout: Duration) -> Result<bool> {
            thread::sleep(Duration::from_secs(2));
            Ok(false)
        }
    }

    #[test]
    fn led_follows_reference_lock() {
        let (rig, clocks) = rig(&BoardConfig::default(), false);
        let mut manager = MboardManager::new(clocks);
        let led = FakePin::new("led", false, &rig.journal);
        manager
            .spawn_ref_lock_monitor(led, Duration::from_millis(10))
            .unwrap();
        assert!(eventually(&rig.journal, "led high"));

        rig.rpll.set(0x0D, 0b100);
        assert!(eventually(&rig.journal, "led low"));
        assert!(manager.tear_down().is_empty());
        assert_eq!(manager.running_tasks(), 0);
    }

    #[test]
    fn dio_fault_cuts_external_power() {
        let (rig, clocks) = rig(&BoardConfig::default(), false);
        let mut manager = MboardManager::new(clocks);
        let (fault, line) = mpsc::channel();
        let power = FakePin::new("dio_a_power", true, &rig.journal);
        manager.spawn_dio_fault_monitor(DioPort::A, ChannelFault(line), power.clone());

        fault.send(()).unwrap();
        assert!(eventually(&rig.journal, "dio_a_power low"));
        assert!(!power.is_set_high());
        assert!(manager.tear_down().is_empty());
    }

    #[test]
    fn stuck_task_is_reported_not_awaited() {
        let (_rig, clocks) = rig(&BoardConfig::default(), false);
        let mut manager = MboardManager::new(clocks);
        let power = FakePin::new("dio_b_power", true, &Journal::default());
        manager.spawn_dio_fault_monitor(DioPort::B, StuckFault, power);

        let started = Instant::now();
        assert_eq!(manager.tear_down(), vec!["DIO B fault monitor".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn callers_share_one_orchestrator() {
        let (_rig, clocks) = rig(&BoardConfig::default(), false);
        let manager = MboardManager::new(clocks);
        let handle = manager.clocks();
        let rate = manager.with_clocks(|clocks| Ok(clocks.get_ref_clock_freq())).unwrap();
        assert_eq!(handle.lock().unwrap().get_ref_clock_freq(), rate);
    }
}
