/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Simulated register windows and fake collaborators for unit tests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::aux_board::{ClockingAuxBoard, Daughterboard, TimeSourceBoard, TriggerDirection};
use crate::config::{BoardConfig, ClockSource};
use crate::cpld::{DbEnable, MboardCpld, OLDEST_REQ_COMPAT_REV, REQ_COMPAT_REV, SIGNATURE};
use crate::error::Result;
use crate::hal::blocking::delay::{DelayMs, DelayUs};
use crate::hal::digital::v2::{InputPin, OutputPin};
use crate::mboard_regs::{ClockCtrl, MboardRegs};
use crate::orchestrator::{ClockHardware, ClockOrchestrator};
use crate::reference_pll::ReferencePll;
use crate::regs::RegisterInterface;
use crate::rfdc::{Converter, RfdcResetSequencer, RfdcTileController};
use crate::rfdc_regs::{ChainStatus, RfdcRegs};
use crate::sample_pll::SamplePll;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Poke {
        window: &'static str,
        addr: u32,
        value: u32,
    },
    Call(String),
}

/// Ordered record of everything the code under test did to the hardware.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn call(&self, call: String) {
        self.push(Event::Call(call));
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn pokes(&self, name: &str) -> Vec<(u32, u32)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Poke {
                    window,
                    addr,
                    value,
                } if window == name => Some((addr, value)),
                _ => None,
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

/// Maps `(addr, written, previous)` to the value the register holds
/// afterwards.
type PokeHook = Box<dyn Fn(u32, u32, u32) -> u32 + Send + Sync>;

/// Register window backed by a map. Unwritten registers read as zero.
pub struct SimRegs {
    name: &'static str,
    values: Mutex<HashMap<u32, u32>>,
    reads: Mutex<HashMap<u32, usize>>,
    journal: Journal,
    hook: Option<PokeHook>,
}

impl SimRegs {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::attached(name, &Journal::default())
    }

    pub fn attached(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self::build(name, journal, None))
    }

    fn with_hook(name: &'static str, journal: &Journal, hook: PokeHook) -> Arc<Self> {
        Arc::new(Self::build(name, journal, Some(hook)))
    }

    fn build(name: &'static str, journal: &Journal, hook: Option<PokeHook>) -> Self {
        SimRegs {
            name,
            values: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            journal: journal.clone(),
            hook,
        }
    }

    /// Sets a register behind the back of the code under test.
    pub fn set(&self, addr: u32, value: u32) {
        self.values.lock().unwrap().insert(addr, value);
    }

    pub fn get(&self, addr: u32) -> u32 {
        self.values.lock().unwrap().get(&addr).copied().unwrap_or(0)
    }

    pub fn was_read(&self, addr: u32) -> bool {
        self.reads_of(addr) > 0
    }

    pub fn reads_of(&self, addr: u32) -> usize {
        self.reads.lock().unwrap().get(&addr).copied().unwrap_or(0)
    }

    pub fn journal_for(&self, name: &str) -> Vec<(u32, u32)> {
        self.journal.pokes(name)
    }
}

impl RegisterInterface for SimRegs {
    fn peek32(&self, addr: u32) -> Result<u32> {
        *self.reads.lock().unwrap().entry(addr).or_insert(0) += 1;
        Ok(self.get(addr))
    }

    fn poke32(&self, addr: u32, value: u32) -> Result<()> {
        self.journal.push(Event::Poke {
            window: self.name,
            addr,
            value,
        });
        let mut values = self.values.lock().unwrap();
        let previous = values.get(&addr).copied().unwrap_or(0);
        let stored = match &self.hook {
            Some(hook) => hook(addr, value, previous),
            None => value,
        };
        values.insert(addr, stored);
        Ok(())
    }
}

/// MB CPLD with a matching identity and the PRC running.
pub fn cpld_sim(journal: &Journal) -> Arc<SimRegs> {
    let status = DbEnable::PLL_REF_CLOCK_ENABLED.bits();
    let sim = SimRegs::with_hook(
        "cpld",
        journal,
        Box::new(move |addr, value, previous| {
            if addr != 0x20 {
                return value;
            }
            let enabled = if value & DbEnable::ENABLE_PRC.bits() != 0 {
                status
            } else if value & DbEnable::DISABLE_PRC.bits() != 0 {
                0
            } else {
                previous & status
            };
            (value & !status) | enabled
        }),
    );
    sim.set(0x0, SIGNATURE);
    sim.set(0x4, REQ_COMPAT_REV);
    sim.set(0x8, OLDEST_REQ_COMPAT_REV);
    sim.set(0x10, 0x0ABC_DEF0);
    sim.set(0x20, status);
    sim
}

/// Sample PLL with a valid chip id and both loops locked. The lock
/// readback registers ignore writes.
pub fn spll_sim(journal: &Journal) -> Arc<SimRegs> {
    let sim = SimRegs::with_hook(
        "spll",
        journal,
        Box::new(|addr, value, previous| match addr {
            0x182 | 0x183 => previous,
            _ => value,
        }),
    );
    sim.set(0x003, 0x06);
    sim.set(0x004, 0x63);
    sim.set(0x005, 0xD1);
    sim.set(0x182, 0x02);
    sim.set(0x183, 0x02);
    sim
}

/// Reference PLL reporting no loss of lock.
pub fn rpll_sim(journal: &Journal) -> Arc<SimRegs> {
    SimRegs::attached("rpll", journal)
}

/// Motherboard FPGA at the expected compat number. A PLL sync trigger
/// reports done right away while `sync_done` is set.
pub fn mb_sim(journal: &Journal, sync_done: Arc<AtomicBool>) -> Arc<SimRegs> {
    let sim = SimRegs::with_hook(
        "mb",
        journal,
        Box::new(move |addr, value, _| {
            if addr != 0x18 {
                return value;
            }
            let done = ClockCtrl::PLL_SYNC_DONE.bits();
            if value & ClockCtrl::PLL_SYNC_TRIGGER.bits() != 0 && sync_done.load(Ordering::SeqCst) {
                value | done
            } else {
                value & !done
            }
        }),
    );
    sim.set(0x0, 0x0007_0002);
    sim.set(0x18, 0x0005_0000);
    sim
}

/// RFDC glue with chain resets that complete and a locked MMCM.
/// `bandwidths` are the fabric DSP bandwidths of both slots in MHz.
pub fn rfdc_sim(journal: &Journal, bandwidths: [u32; 2]) -> Arc<SimRegs> {
    let sim = SimRegs::attached("rfdc", journal);
    sim.set(
        0x12008,
        (ChainStatus::ADC_SEQ_DONE | ChainStatus::DAC_SEQ_DONE).bits(),
    );
    sim.set(0x16008, 1 << 20);
    sim.set(0x13008, bandwidths[0] | bandwidths[1] << 16);
    sim
}

#[derive(Debug, Default, Copy, Clone)]
pub struct NoDelay;

impl DelayUs<u32> for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

fn kind(is_dac: bool) -> &'static str {
    if is_dac {
        "dac"
    } else {
        "adc"
    }
}

fn tag(converter: Converter) -> String {
    format!("{}/{} {}", converter.tile, converter.block, kind(converter.is_dac))
}

/// Tile driver that journals every call. Tiles report the requested sync
/// latency unless overridden.
pub struct FakeTiles {
    journal: Journal,
    latencies: HashMap<(u32, bool), u32>,
    synced: HashMap<bool, u32>,
    nco: HashMap<Converter, f64>,
    fail_startup: bool,
}

impl FakeTiles {
    pub fn new(journal: &Journal) -> Self {
        FakeTiles {
            journal: journal.clone(),
            latencies: HashMap::new(),
            synced: HashMap::new(),
            nco: HashMap::new(),
            fail_startup: false,
        }
    }

    pub fn with_latency(mut self, tile: u32, is_dac: bool, latency: u32) -> Self {
        self.latencies.insert((tile, is_dac), latency);
        self
    }

    pub fn failing_startup(mut self) -> Self {
        self.fail_startup = true;
        self
    }
}

impl RfdcTileController for FakeTiles {
    fn startup_tiles(&mut self, is_dac: bool) -> Result<()> {
        self.journal.call(format!("startup_tiles {}", kind(is_dac)));
        if self.fail_startup {
            return Err(crate::error::Error::Rfdc("tile startup failed".into()));
        }
        Ok(())
    }

    fn reset_mixer_settings(&mut self, converter: Converter) -> Result<()> {
        self.journal.call(format!("reset_mixer_settings {}", tag(converter)));
        Ok(())
    }

    fn set_sample_rate(&mut self, tile: u32, is_dac: bool, rate: f64) -> Result<()> {
        self.journal
            .call(format!("set_sample_rate {} {} {}", tile, kind(is_dac), rate));
        Ok(())
    }

    fn set_data_fifo_state(&mut self, tile: u32, is_dac: bool, enable: bool) -> Result<()> {
        self.journal
            .call(format!("set_data_fifo_state {} {} {}", tile, kind(is_dac), enable));
        Ok(())
    }

    fn set_resampling_factor(&mut self, converter: Converter, factor: u32) -> Result<()> {
        self.journal
            .call(format!("set_resampling_factor {} {}", tag(converter), factor));
        Ok(())
    }

    fn set_fabric_words(&mut self, converter: Converter, words: u32) -> Result<()> {
        self.journal
            .call(format!("set_fabric_words {} {}", tag(converter), words));
        Ok(())
    }

    fn clear_data_fifo_interrupts(&mut self, converter: Converter) -> Result<()> {
        self.journal
            .call(format!("clear_data_fifo_interrupts {}", tag(converter)));
        Ok(())
    }

    fn set_nco_event_source_sysref(&mut self, converter: Converter) -> Result<()> {
        self.journal
            .call(format!("set_nco_event_source_sysref {}", tag(converter)));
        Ok(())
    }

    fn sync_tiles(&mut self, tiles: &[u32], is_dac: bool, latency: u32) -> Result<()> {
        self.journal
            .call(format!("sync_tiles {} {:?} {}", kind(is_dac), tiles, latency));
        self.synced.insert(is_dac, latency);
        Ok(())
    }

    fn get_tile_latency(&mut self, tile: u32, is_dac: bool) -> Result<u32> {
        let overridden = self.latencies.get(&(tile, is_dac)).copied();
        Ok(overridden.unwrap_or_else(|| self.synced.get(&is_dac).copied().unwrap_or(0)))
    }

    fn set_nco_freq(&mut self, converter: Converter, freq: f64) -> Result<()> {
        self.journal
            .call(format!("set_nco_freq {} {}", tag(converter), freq));
        self.nco.insert(converter, freq);
        Ok(())
    }

    fn get_nco_freq(&mut self, converter: Converter) -> Result<f64> {
        Ok(self.nco.get(&converter).copied().unwrap_or(0.0))
    }
}

/// Clocking aux board with GPS and nsync fitted.
pub struct FakeAux {
    journal: Journal,
}

impl ClockingAuxBoard for FakeAux {
    fn set_source(&mut self, clock_source: ClockSource, time_source: TimeSourceBoard) -> Result<()> {
        let time_source = match time_source {
            TimeSourceBoard::Internal => "internal",
            TimeSourceBoard::External => "external",
        };
        self.journal
            .call(format!("aux.set_source {} {}", clock_source, time_source));
        Ok(())
    }

    fn export_clock(&mut self, enable: bool) -> Result<()> {
        self.journal.call(format!("aux.export_clock {}", enable));
        Ok(())
    }

    fn set_trig(&mut self, enable: bool, direction: TriggerDirection) -> Result<()> {
        self.journal
            .call(format!("aux.set_trig {} {:?}", enable, direction));
        Ok(())
    }

    fn is_gps_supported(&self) -> bool {
        true
    }

    fn is_nsync_supported(&self) -> bool {
        true
    }

    fn valid_clock_exports(&self) -> Vec<ClockSource> {
        vec![ClockSource::Internal, ClockSource::Gpsdo]
    }
}

pub struct FakeDboard {
    slot: usize,
    journal: Journal,
}

impl Daughterboard for FakeDboard {
    fn reset_clock(&mut self, reset: bool) -> Result<()> {
        self.journal
            .call(format!("db{}.reset_clock {}", self.slot, reset));
        Ok(())
    }
}

/// GPIO line usable as either end. Output changes are journalled under
/// the line's name.
#[derive(Clone)]
pub struct FakePin {
    name: &'static str,
    level: Arc<AtomicBool>,
    journal: Journal,
}

impl FakePin {
    pub fn new(name: &'static str, level: bool, journal: &Journal) -> Self {
        FakePin {
            name,
            level: Arc::new(AtomicBool::new(level)),
            journal: journal.clone(),
        }
    }

    pub fn set(&self, level: bool) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub fn is_set_high(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl OutputPin for FakePin {
    type Error = Infallible;

    fn set_low(&mut self) -> core::result::Result<(), Infallible> {
        self.journal.call(format!("{} low", self.name));
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> core::result::Result<(), Infallible> {
        self.journal.call(format!("{} high", self.name));
        self.set(true);
        Ok(())
    }
}

impl InputPin for FakePin {
    type Error = Infallible;

    fn is_high(&self) -> core::result::Result<bool, Infallible> {
        Ok(self.is_set_high())
    }

    fn is_low(&self) -> core::result::Result<bool, Infallible> {
        Ok(!self.is_set_high())
    }
}

/// Handles into a simulated motherboard.
pub struct Rig {
    pub journal: Journal,
    pub mb: Arc<SimRegs>,
    pub cpld: Arc<SimRegs>,
    pub spll: Arc<SimRegs>,
    pub rpll: Arc<SimRegs>,
    pub rfdc: Arc<SimRegs>,
    pub brc_select: FakePin,
    pub rfdc_powered: FakePin,
    pub sync_done: Arc<AtomicBool>,
}

/// Simulated motherboard with two daughterboards, 400 MHz fabric DSP on
/// both, and optionally a clocking aux board.
pub fn rig(config: &BoardConfig, with_aux: bool) -> (Rig, ClockOrchestrator<FakePin>) {
    let journal = Journal::default();
    let sync_done = Arc::new(AtomicBool::new(true));
    let mb = mb_sim(&journal, sync_done.clone());
    let cpld = cpld_sim(&journal);
    let spll = spll_sim(&journal);
    let rpll = rpll_sim(&journal);
    let rfdc = rfdc_sim(&journal, [400, 400]);
    let tiles = FakeTiles::new(&journal);
    let brc_select = FakePin::new("brc_select", false, &journal);
    let rfdc_powered = FakePin::new("rfdc_powered", true, &journal);

    let aux: Option<Box<dyn ClockingAuxBoard>> = if with_aux {
        Some(Box::new(FakeAux {
            journal: journal.clone(),
        }))
    } else {
        None
    };
    let dboards: Vec<Box<dyn Daughterboard>> = (0..config.rfdc_map.len())
        .map(|slot| {
            Box::new(FakeDboard {
                slot,
                journal: journal.clone(),
            }) as Box<dyn Daughterboard>
        })
        .collect();

    let hw = ClockHardware {
        mboard_regs: MboardRegs::new(mb.clone()),
        cpld: MboardCpld::new(cpld.clone()),
        spll: SamplePll::new(spll.clone()),
        rpll: ReferencePll::new(rpll.clone()),
        rfdc: RfdcResetSequencer::new(
            RfdcRegs::new(rfdc.clone()),
            Box::new(tiles),
            config.rfdc_map.clone(),
        ),
        aux,
        dboards,
        brc_select: brc_select.clone(),
        delay: Box::new(NoDelay),
    };
    let clocks = ClockOrchestrator::new(hw, config).unwrap();

    let rig = Rig {
        journal,
        mb,
        cpld,
        spll,
        rpll,
        rfdc,
        brc_select,
        rfdc_powered,
        sync_done,
    };
    (rig, clocks)
}

