/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Clock and time source selection, master clock rate changes and PPS
//! alignment.
//!
//! [`ClockOrchestrator`] owns every controller taking part in the clock tree
//! and is the only place that knows the order in which they have to be reset,
//! reconfigured and released.

use core::time::Duration;
use std::collections::BTreeMap;

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::aux_board::{ClockingAuxBoard, Daughterboard, TimeSourceBoard, TriggerDirection};
use crate::config::{
    is_valid_sync_source, lookup_master_clock_rate, BoardConfig, ClockSource, McrEntry, PpsSource, SessionArgs,
    TimeSource, TriggerIoDirection, DEFAULT_CLOCK_SOURCE, DEFAULT_GPSDO_CLOCK_FREQ, DEFAULT_MASTER_CLOCK_RATE,
    DEFAULT_TIME_SOURCE, MASTER_CLOCK_RATES, VALID_SYNC_SOURCES,
};
use crate::cpld::MboardCpld;
use crate::error::{gpio_error, Error, Result};
use crate::hal::blocking::delay::DelayMs;
use crate::hal::digital::v2::{InputPin, OutputPin};
use crate::mboard_regs::{ClockCtrl, MboardRegs, PpsCtrl, PpsSelect};
use crate::pll::{to_hz, PllStatus};
use crate::poll::{poll_with_timeout, Delay};
use crate::reference_pll::{BrcSelect, ReferencePll, ReferencePllLockProbe};
use crate::rfdc::RfdcResetSequencer;
use crate::sample_pll::{SamplePll, SamplePllLockProbe};

const PLL_SYNC_TIMEOUT: Duration = Duration::from_millis(1500);
const PLL_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Stale PPS edges are gone after one full period.
const PPS_FLUSH_MS: u32 = 1000;
const DEFAULT_PPS_DELAY: f64 = 1.0;

/// Fixed pipeline offsets of the PPS forwarding HDL.
const PPS_BRC_DELAY_OFFSET: u32 = 1;
const PPS_PRC_DELAY_OFFSET: i64 = 4;
const PPS_PRC_DIVIDER_OFFSET: i64 = 2;
const PPS_PRC_DIVIDER_SHIFT: u32 = 28;

const EXT_CLOCK_FREQ_MIN: u64 = 1_000_000;
const EXT_CLOCK_FREQ_MAX: u64 = 50_000_000;
const EXT_CLOCK_FREQ_STEP: u64 = 40_000;

bitflags! {
    /// Parts of the clock tree that can be held in reset.
    pub struct ResetDomains: u8 {
        const DB_CLOCK = 1 << 0;
        const CPLD = 1 << 1;
        const RFDC = 1 << 2;
        const SPLL = 1 << 3;
        const RPLL = 1 << 4;
    }
}

/// Consumers first, sources last. Release walks this backwards.
const RESET_ASSERT_ORDER: [ResetDomains; 5] = [
    ResetDomains::DB_CLOCK,
    ResetDomains::CPLD,
    ResetDomains::RFDC,
    ResetDomains::SPLL,
    ResetDomains::RPLL,
];

/// The domains of `domains` in the order they are asserted (`assert`) or
/// released.
pub fn reset_order(assert: bool, domains: ResetDomains) -> Vec<ResetDomains> {
    let selected = RESET_ASSERT_ORDER.iter().copied().filter(|&d| domains.contains(d));
    if assert {
        selected.collect()
    } else {
        selected.rev().collect()
    }
}

fn domain_name(domain: ResetDomains) -> &'static str {
    match domain {
        ResetDomains::DB_CLOCK => "db_clock",
        ResetDomains::CPLD => "cpld",
        ResetDomains::RFDC => "rfdc",
        ResetDomains::SPLL => "spll",
        _ => "rpll",
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockState {
    Unconfigured,
    Reset,
    Configuring,
    Locked,
    /// Configured, but at least one PLL stage or the PPS sync did not
    /// confirm.
    Degraded,
}

/// Sensor record as reported to the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorValue {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub unit: String,
    pub value: String,
}

/// `(RPLL input select, rate)` for each named reference source fitted on
/// motherboard revision `mboard_rev`.
pub fn rpll_reference_sources(mboard_rev: u32) -> BTreeMap<&'static str, (u8, f64)> {
    let mut sources = BTreeMap::new();
    if mboard_rev == 2 {
        sources.insert("wr_dac", (1, 25e6));
    }
    sources.insert("100M_reliable_clk", (2, 100e6));
    sources
}

/// PPS select field value for a reference frequency and PPS source.
pub fn pps_select(ref_freq: f64, pps_source: PpsSource) -> Result<PpsSelect> {
    match pps_source {
        PpsSource::ExternalPps if ref_freq == 10e6 => Ok(PpsSelect::External),
        PpsSource::InternalPps if ref_freq == 10e6 => Ok(PpsSelect::Internal10MHz),
        PpsSource::InternalPps if ref_freq == 25e6 => Ok(PpsSelect::Internal25MHz),
        _ => Err(Error::UnsupportedCombination {
            ref_freq,
            pps_source: pps_source.to_string(),
        }),
    }
}

fn check_ext_clock_freq(freq: f64) -> Result<f64> {
    match to_hz(freq) {
        Some(hz)
            if (EXT_CLOCK_FREQ_MIN..=EXT_CLOCK_FREQ_MAX).contains(&hz) && hz % EXT_CLOCK_FREQ_STEP == 0 =>
        {
            Ok(freq)
        }
        _ => Err(Error::InvalidReferenceFrequency(freq)),
    }
}

/// Time source that goes with `clock_source` when the current pairing is
/// not valid.
fn matching_time_source(clock_source: ClockSource) -> TimeSource {
    match clock_source {
        ClockSource::External => TimeSource::External,
        ClockSource::Gpsdo => TimeSource::Gpsdo,
        ClockSource::Mboard | ClockSource::Internal | ClockSource::Nsync => TimeSource::Internal,
    }
}

fn matching_clock_source(time_source: TimeSource) -> ClockSource {
    match time_source {
        TimeSource::External => ClockSource::External,
        TimeSource::Gpsdo => ClockSource::Gpsdo,
        TimeSource::Internal | TimeSource::Qsfp0 => ClockSource::Mboard,
    }
}

/// Controllers and board capabilities the orchestrator drives.
pub struct ClockHardware<P> {
    pub mboard_regs: MboardRegs,
    pub cpld: MboardCpld,
    pub spll: SamplePll,
    pub rpll: ReferencePll,
    pub rfdc: RfdcResetSequencer,
    pub aux: Option<Box<dyn ClockingAuxBoard>>,
    pub dboards: Vec<Box<dyn Daughterboard>>,
    /// High routes the motherboard reference to the BRC, low the aux board.
    pub brc_select: P,
    pub delay: Box<dyn Delay>,
}

pub struct ClockOrchestrator<P> {
    mb: MboardRegs,
    cpld: MboardCpld,
    spll: SamplePll,
    rpll: ReferencePll,
    rfdc: RfdcResetSequencer,
    aux: Option<Box<dyn ClockingAuxBoard>>,
    dboards: Vec<Box<dyn Daughterboard>>,
    brc_select: P,
    delay: Box<dyn Delay>,

    rpll_reference_sources: BTreeMap<&'static str, (u8, f64)>,
    rpll_ref_source: String,
    clock_source: ClockSource,
    time_source: TimeSource,
    ext_clock_freq: f64,
    int_clock_freq: f64,
    mgt_clock_rate: f64,
    master_clock_rate: f64,
    pps_export: bool,
    trig_direction: TriggerIoDirection,
    state: ClockState,
}

impl<P, E> ClockOrchestrator<P>
where
    P: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    pub fn new(hw: ClockHardware<P>, config: &BoardConfig) -> Result<Self> {
        let master_clock_rate = config.master_clock_rate.unwrap_or(DEFAULT_MASTER_CLOCK_RATE);
        if lookup_master_clock_rate(master_clock_rate).is_none() {
            return Err(Error::UnsupportedRate {
                rate: master_clock_rate,
                reason: "not a supported master clock rate".into(),
            });
        }
        let ext_clock_freq = check_ext_clock_freq(config.ext_clock_freq)?;
        let clock_source = config.clock_source.unwrap_or(if hw.aux.is_some() {
            ClockSource::Internal
        } else {
            ClockSource::Mboard
        });

        let rpll_reference_sources = rpll_reference_sources(config.mboard_rev);
        let mut rpll = hw.rpll;
        let mut rates = [None, None];
        for &(select, rate) in rpll_reference_sources.values() {
            rates[select as usize - 1] = Some(rate);
        }
        rpll.set_reference_rates(rates);

        Ok(ClockOrchestrator {
            mb: hw.mboard_regs,
            cpld: hw.cpld,
            spll: hw.spll,
            rpll,
            rfdc: hw.rfdc,
            aux: hw.aux,
            dboards: hw.dboards,
            brc_select: hw.brc_select,
            delay: hw.delay,
            rpll_reference_sources,
            rpll_ref_source: config.rpll_ref_source.clone(),
            clock_source,
            time_source: config.time_source,
            ext_clock_freq,
            int_clock_freq: config.int_clock_freq,
            mgt_clock_rate: config.mgt_clock_rate,
            master_clock_rate,
            pps_export: config.pps_export,
            trig_direction: config.trig_direction,
            state: ClockState::Unconfigured,
        })
    }

    /// Full motherboard bring-up, up to a synchronised RFDC at the default
    /// master clock rate.
    pub fn init<I>(&mut self, rfdc_powered: &I) -> Result<()>
    where
        I: InputPin,
        I::Error: core::fmt::Debug,
    {
        self.cpld.check_signature()?;
        self.cpld.check_compat_version()?;
        self.cpld.trace_git_hash()?;

        if !rfdc_powered.is_high().map_err(gpio_error)? {
            error!("RFDC is not powered on");
            return Err(Error::RfdcNotPowered);
        }

        self.init_clocks()?;
        self.cpld.enable_pll_ref_clk(true)?;
        self.mb.check_fpga_compat()?;

        // The converter chains come up in an unknown state; cycle them once.
        let sample_rate = self.get_spll_freq()?;
        self.rfdc.set_reset_rfdc(true, sample_rate, &mut *self.delay)?;
        self.rfdc.set_reset_rfdc(false, sample_rate, &mut *self.delay)?;
        self.rfdc.rfdc_sync()?;

        let master_clock_rate = self.default_master_clock_rate()?;
        self.set_master_clock_rate(master_clock_rate)?;
        info!("Clocking initialized: {:?}", self.state);
        Ok(())
    }

    /// First-time configuration of the reference side of the clock tree.
    pub fn init_clocks(&mut self) -> Result<()> {
        self.reset_clocks(true, ResetDomains::CPLD)?;
        self.state = ClockState::Configuring;
        self.set_brc_source(self.clock_source)?;
        let source = self.rpll_ref_source.clone();
        self.config_rpll(self.mgt_clock_rate, self.int_clock_freq, &source)?;
        let entry = self.current_mcr_entry()?;
        self.config_spll(&entry)?;
        self.reset_clocks(false, ResetDomains::CPLD)?;
        self.evaluate_lock()?;
        Ok(())
    }

    /// Asserts or releases the resets of `domains`.
    ///
    /// Assertion runs from the clock consumers up to the reference PLL,
    /// release in exactly the opposite order.
    pub fn reset_clocks(&mut self, value: bool, domains: ResetDomains) -> Result<()> {
        for domain in reset_order(value, domains) {
            trace!(
                "{} {}",
                if value { "Resetting" } else { "Releasing" },
                domain_name(domain)
            );
            self.reset_domain(domain, value)?;
        }
        if value {
            self.state = ClockState::Reset;
        }
        Ok(())
    }

    fn reset_domain(&mut self, domain: ResetDomains, value: bool) -> Result<()> {
        match domain {
            ResetDomains::DB_CLOCK => {
                for db in self.dboards.iter_mut() {
                    db.reset_clock(value)?;
                }
                Ok(())
            }
            ResetDomains::CPLD => self.cpld.enable_pll_ref_clk(!value),
            ResetDomains::RFDC => {
                let sample_rate = if value { 0.0 } else { self.get_spll_freq()? };
                self.rfdc.set_reset_rfdc(value, sample_rate, &mut *self.delay)
            }
            ResetDomains::SPLL => self.spll.reset(value, true),
            _ => self.rpll.reset(value, true),
        }
    }

    fn pll_status(&self) -> Result<(PllStatus, PllStatus)> {
        Ok((self.spll.get_status()?, self.rpll.get_status()?))
    }

    fn is_locked(&self) -> Result<bool> {
        let (spll, rpll) = self.pll_status()?;
        Ok(spll.is_locked() && rpll.is_locked())
    }

    fn evaluate_lock(&mut self) -> Result<ClockState> {
        let (spll, rpll) = self.pll_status()?;
        self.state = if spll.is_locked() && rpll.is_locked() {
            ClockState::Locked
        } else {
            warn!("Clock tree did not lock: SPLL {:?}, RPLL {:?}", spll, rpll);
            ClockState::Degraded
        };
        Ok(self.state)
    }

    pub fn clock_state(&self) -> ClockState {
        self.state
    }

    pub fn get_clock_sources(&self) -> Vec<ClockSource> {
        let mut sources = vec![ClockSource::Mboard];
        if let Some(aux) = &self.aux {
            sources.push(ClockSource::Internal);
            sources.push(ClockSource::External);
            if aux.is_nsync_supported() {
                sources.push(ClockSource::Nsync);
            }
            if aux.is_gps_supported() {
                sources.push(ClockSource::Gpsdo);
            }
        }
        sources
    }

    pub fn get_time_sources(&self) -> Vec<TimeSource> {
        let mut sources = vec![TimeSource::Internal, TimeSource::External, TimeSource::Qsfp0];
        if self.aux.as_ref().map_or(false, |aux| aux.is_gps_supported()) {
            sources.push(TimeSource::Gpsdo);
        }
        sources
    }

    /// Valid `(clock, time)` pairs among the available sources.
    pub fn get_sync_sources(&self) -> Vec<(ClockSource, TimeSource)> {
        let clock_sources = self.get_clock_sources();
        let time_sources = self.get_time_sources();
        VALID_SYNC_SOURCES
            .iter()
            .copied()
            .filter(|(c, t)| clock_sources.contains(c) && time_sources.contains(t))
            .collect()
    }

    pub fn get_clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub fn get_time_source(&self) -> TimeSource {
        self.time_source
    }

    fn validate_sync_source(&self, clock_source: ClockSource, time_source: TimeSource) -> Result<()> {
        if !self.get_clock_sources().contains(&clock_source) {
            return Err(Error::InvalidSelection(format!(
                "clock source {} is not available",
                clock_source
            )));
        }
        if !self.get_time_sources().contains(&time_source) {
            return Err(Error::InvalidSelection(format!(
                "time source {} is not available",
                time_source
            )));
        }
        if !is_valid_sync_source(clock_source, time_source) {
            return Err(Error::InvalidSelection(format!(
                "clock source {} cannot be combined with time source {}",
                clock_source, time_source
            )));
        }
        Ok(())
    }

    /// Switches clock and time source together.
    ///
    /// Invalid selections are rejected before anything is touched. If the
    /// switch itself fails, the board is put back on the default sources
    /// and the original error is returned.
    pub fn set_sync_source(&mut self, clock_source: ClockSource, time_source: TimeSource) -> Result<()> {
        self.validate_sync_source(clock_source, time_source)?;
        self.apply_with_fallback(clock_source, time_source, false)
    }

    fn apply_with_fallback(&mut self, clock_source: ClockSource, time_source: TimeSource, force: bool) -> Result<()> {
        let err = match self.apply_sync_source(clock_source, time_source, force) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if (clock_source, time_source) != (DEFAULT_CLOCK_SOURCE, DEFAULT_TIME_SOURCE) {
            error!(
                "Setting clock source to {} and time source to {} failed ({}), falling back to {}/{}",
                clock_source, time_source, err, DEFAULT_CLOCK_SOURCE, DEFAULT_TIME_SOURCE
            );
            if let Err(fallback_err) = self.apply_sync_source(DEFAULT_CLOCK_SOURCE, DEFAULT_TIME_SOURCE, true) {
                error!("Falling back to default sources failed as well: {}", fallback_err);
            }
        }
        Err(err)
    }

    fn apply_sync_source(&mut self, clock_source: ClockSource, time_source: TimeSource, force: bool) -> Result<()> {
        if !force && (clock_source, time_source) == (self.clock_source, self.time_source) && self.is_locked()? {
            trace!("Nothing to do -- clock and time source are already set and locked.");
            return Ok(());
        }
        info!(
            "Setting clock source to {} and time source to {}",
            clock_source, time_source
        );
        let domains = ResetDomains::DB_CLOCK | ResetDomains::CPLD | ResetDomains::RFDC | ResetDomains::SPLL;

        self.time_source = time_source;
        self.reset_clocks(true, domains)?;
        self.state = ClockState::Configuring;
        self.set_brc_source(clock_source)?;
        let entry = self.current_mcr_entry()?;
        self.config_spll(&entry)?;
        self.reset_clocks(false, domains)?;
        self.evaluate_lock()?;
        self.rfdc.rfdc_sync()?;
        self.config_pps_to_timekeeper()?;

        // These share a connector with the PPS input and cannot be forwarded.
        if matches!(clock_source, ClockSource::External | ClockSource::Mboard) {
            if let Some(aux) = self.aux.as_mut() {
                aux.export_clock(false)?;
            }
        }
        Ok(())
    }

    /// Sets the clock source, moving the time source along if the current
    /// one cannot be combined with it.
    pub fn set_clock_source(&mut self, clock_source: ClockSource) -> Result<()> {
        let mut time_source = self.time_source;
        if !is_valid_sync_source(clock_source, time_source) {
            time_source = matching_time_source(clock_source);
            warn!(
                "Time source '{}' is not compatible with clock source '{}', switching time source to '{}'",
                self.time_source, clock_source, time_source
            );
        }
        self.set_sync_source(clock_source, time_source)
    }

    pub fn set_time_source(&mut self, time_source: TimeSource) -> Result<()> {
        let mut clock_source = self.clock_source;
        if !is_valid_sync_source(clock_source, time_source) {
            clock_source = matching_clock_source(time_source);
            warn!(
                "Clock source '{}' is not compatible with time source '{}', switching clock source to '{}'",
                self.clock_source, time_source, clock_source
            );
        }
        self.set_sync_source(clock_source, time_source)
    }

    /// Routes the BRC either from the motherboard or from the aux board.
    fn set_brc_source(&mut self, clock_source: ClockSource) -> Result<()> {
        if clock_source == ClockSource::Mboard {
            self.brc_select.set_high().map_err(gpio_error)?;
            if let Some(aux) = self.aux.as_mut() {
                aux.export_clock(false)?;
            }
        } else {
            let aux = self.aux.as_mut().ok_or_else(|| {
                error!("Clock source {} requires a clocking aux board", clock_source);
                Error::NoAuxBoard
            })?;
            self.brc_select.set_low().map_err(gpio_error)?;
            let time_source_board = if clock_source == ClockSource::External
                && self.time_source == TimeSource::External
            {
                TimeSourceBoard::External
            } else {
                TimeSourceBoard::Internal
            };
            aux.set_source(clock_source, time_source_board)?;
        }
        self.clock_source = clock_source;
        Ok(())
    }

    /// Frequency of the reference feeding the sample PLL.
    ///
    /// Every aux board source other than the GPSDO runs at the frequency
    /// last given to [`set_ref_clock_freq`](Self::set_ref_clock_freq).
    pub fn get_ref_clock_freq(&self) -> f64 {
        match self.clock_source {
            ClockSource::Mboard => self.int_clock_freq,
            ClockSource::Gpsdo => DEFAULT_GPSDO_CLOCK_FREQ,
            ClockSource::External | ClockSource::Internal | ClockSource::Nsync => self.ext_clock_freq,
        }
    }

    /// Sets the expected external reference frequency.
    ///
    /// When the external reference is in use the clock tree is reconfigured
    /// right away, even though the sources themselves do not change.
    pub fn set_ref_clock_freq(&mut self, freq: f64) -> Result<()> {
        self.ext_clock_freq = check_ext_clock_freq(freq)?;
        debug!("External reference clock frequency set to {} Hz", freq);
        if self.clock_source == ClockSource::External {
            info!("Applying new external reference clock frequency");
            let (clock_source, time_source) = (self.clock_source, self.time_source);
            self.apply_with_fallback(clock_source, time_source, true)?;
        }
        Ok(())
    }

    /// Configures the reference PLL from the named input.
    ///
    /// The BRC bypasses the PLL when the primary reference already runs at
    /// the requested rate.
    pub fn config_rpll(&mut self, mgt_rate: f64, brc_rate: f64, source: &str) -> Result<()> {
        let &(ref_select, _) = self
            .rpll_reference_sources
            .get(source)
            .ok_or_else(|| Error::InvalidSelection(format!("{} is not a valid RPLL reference source", source)))?;
        let brc_select = if self.rpll.reference_rates()[0] == Some(brc_rate) {
            BrcSelect::Bypass
        } else {
            BrcSelect::Pll
        };
        self.rpll.config(ref_select, brc_rate, mgt_rate, brc_select)?;
        self.int_clock_freq = brc_rate;
        Ok(())
    }

    fn current_mcr_entry(&self) -> Result<McrEntry> {
        lookup_master_clock_rate(self.master_clock_rate)
            .copied()
            .ok_or(Error::UnsupportedRate {
                rate: self.master_clock_rate,
                reason: "not a supported master clock rate".into(),
            })
    }

    fn config_spll(&mut self, entry: &McrEntry) -> Result<()> {
        self.spll.init()?;
        let ref_freq = self.get_ref_clock_freq();
        trace!(
            "Configuring SPLL to {} Hz from {} Hz (legacy mode: {})",
            entry.sample_clock_freq,
            ref_freq,
            entry.legacy_mode
        );
        self.spll.config(entry.sample_clock_freq, ref_freq, entry.legacy_mode)?;
        Ok(())
    }

    /// Master clock rate matching the fabric DSP of daughterboard 0.
    pub fn default_master_clock_rate(&self) -> Result<f64> {
        let (decimation, halfband) = self.rfdc.get_rfdc_resampling_factor(0)?;
        MASTER_CLOCK_RATES
            .iter()
            .find(|entry| entry.decimation == decimation && entry.halfband == halfband)
            .map(|entry| entry.master_clock_rate)
            .ok_or(Error::UnsupportedFactor {
                factor: decimation,
                converter: "RFDC",
            })
    }

    /// Moves the sample clock to the one `rate` needs and re-syncs the
    /// converters.
    ///
    /// The FPGA image fixes the RFDC decimation; a rate that needs a
    /// different one is refused for every daughterboard before anything is
    /// reset.
    pub fn set_master_clock_rate(&mut self, rate: f64) -> Result<()> {
        let entry = *lookup_master_clock_rate(rate).ok_or(Error::UnsupportedRate {
            rate,
            reason: "not a supported master clock rate".into(),
        })?;
        for db in 0..self.rfdc.num_dboards() {
            let (decimation, halfband) = self.rfdc.get_rfdc_resampling_factor(db)?;
            if (decimation, halfband) != (entry.decimation, entry.halfband) {
                return Err(Error::UnsupportedRate {
                    rate,
                    reason: format!(
                        "daughterboard {} FPGA image is built for decimation {} (half-band: {}), \
                         this rate needs {} (half-band: {})",
                        db, decimation, halfband, entry.decimation, entry.halfband
                    ),
                });
            }
        }

        info!("Setting master clock rate to {} Hz", rate);
        let domains = ResetDomains::RFDC | ResetDomains::CPLD | ResetDomains::DB_CLOCK;
        self.reset_clocks(true, domains)?;
        self.state = ClockState::Configuring;
        self.config_spll(&entry)?;
        self.master_clock_rate = rate;
        self.reset_clocks(false, domains)?;
        self.evaluate_lock()?;
        self.rfdc.rfdc_sync()?;
        self.config_pps_to_timekeeper()
    }

    pub fn get_master_clock_rate(&self) -> f64 {
        self.master_clock_rate
    }

    pub fn get_spll_freq(&self) -> Result<f64> {
        self.spll.output_freq().ok_or(Error::NotConfigured("sample PLL"))
    }

    pub fn get_prc_rate(&self) -> Result<f64> {
        self.spll.prc_rate().ok_or(Error::NotConfigured("sample PLL"))
    }

    fn config_pps_to_timekeeper(&mut self) -> Result<()> {
        let pps_source = if self.time_source == TimeSource::Internal {
            PpsSource::InternalPps
        } else {
            PpsSource::ExternalPps
        };
        if !self.sync_spll_clocks(pps_source)? {
            self.state = ClockState::Degraded;
        }
        self.configure_pps_forwarding(true, DEFAULT_PPS_DELAY)
    }

    /// Aligns the SPLL PLL1 divider to the BRC at a PPS edge.
    ///
    /// Returns whether the FPGA confirmed the sync.
    pub fn sync_spll_clocks(&mut self, pps_source: PpsSource) -> Result<bool> {
        let select = pps_select(self.get_ref_clock_freq(), pps_source)?;
        let mb = &self.mb;
        let delay = &mut self.delay;
        let synced = self.spll.pll1_r_divider_sync(&mut || -> Result<bool> {
            let config = MboardRegs::with_pps_select(mb.clock_ctrl()?, select);
            mb.set_clock_ctrl(config | ClockCtrl::PLL_SYNC_TRIGGER.bits())?;
            let done = poll_with_timeout(&mut **delay, PLL_SYNC_TIMEOUT, PLL_SYNC_INTERVAL, || {
                mb.is_pll_sync_done()
            });
            mb.set_clock_ctrl(config)?;
            let done = done?;
            if !done {
                error!("PLL_SYNC_DONE not received within timeout");
            }
            Ok(done)
        })?;
        Ok(synced)
    }

    /// Programs the PPS forwarding to the daughterboards, `delay` seconds
    /// after the PPS edge.
    pub fn configure_pps_forwarding(&mut self, enable: bool, delay: f64) -> Result<()> {
        if !(delay > 0.0 && delay <= 1.0) {
            return Err(Error::InvalidDelay(format!(
                "PPS delay {} must be greater than 0 and at most 1 second",
                delay
            )));
        }
        let prc_rate = self.get_prc_rate()?;
        let prc_delay = (delay * prc_rate) as i64 - PPS_PRC_DELAY_OFFSET;
        if prc_delay <= 0 {
            return Err(Error::InvalidDelay(format!(
                "PPS delay {} is too short for a {} Hz PRC",
                delay, prc_rate
            )));
        }
        let prc_delay = prc_delay as u32 & PpsCtrl::PRC_DELAY.bits();
        let prc_divider = (((self.master_clock_rate / prc_rate) as i64 - PPS_PRC_DIVIDER_OFFSET) & 0x3) as u32;
        let brc_delay = self.mb.pll_sync_delay()? + PPS_BRC_DELAY_OFFSET;
        let brc_delay = u8::try_from(brc_delay).map_err(|_| {
            Error::InvalidDelay(format!(
                "PPS BRC delay {} does not fit the 8-bit delay field",
                brc_delay
            ))
        })?;
        let pps_ctrl = PpsCtrl::from_bits_truncate(prc_delay | prc_divider << PPS_PRC_DIVIDER_SHIFT);
        trace!(
            "PPS forwarding: BRC delay {}, PRC delay {}, divider {}",
            brc_delay,
            prc_delay,
            prc_divider
        );

        self.mb.set_pps_brc_delay(brc_delay)?;
        self.mb.set_pps_ctrl(pps_ctrl)?;
        if enable {
            DelayMs::<u32>::delay_ms(&mut *self.delay, PPS_FLUSH_MS);
            self.mb.set_pps_ctrl(pps_ctrl | PpsCtrl::ENABLE)?;
        }
        Ok(())
    }

    /// Points the trigger I/O connector at `direction`.
    ///
    /// The side that starts driving the line is always switched last.
    pub fn set_trigger_io(&mut self, direction: TriggerIoDirection) -> Result<()> {
        let aux = self.aux.as_mut().ok_or(Error::NoAuxBoard)?;
        let value = MboardRegs::with_trigger_io(
            self.mb.clock_ctrl()?,
            direction == TriggerIoDirection::PpsOutput,
        );
        match direction {
            TriggerIoDirection::Input => {
                self.mb.set_clock_ctrl(value)?;
                aux.set_trig(true, TriggerDirection::Input)
            }
            TriggerIoDirection::PpsOutput => {
                aux.set_trig(true, TriggerDirection::Output)?;
                self.mb.set_clock_ctrl(value)
            }
            TriggerIoDirection::Off => {
                self.mb.set_clock_ctrl(value)?;
                aux.set_trig(false, TriggerDirection::Output)
            }
        }
    }

    /// Enables or disables forwarding the current reference on the aux
    /// board's reference output.
    pub fn set_clock_source_out(&mut self, enable: bool) -> Result<()> {
        if enable && self.time_source == TimeSource::External {
            return Err(Error::InvalidSelection(
                "cannot export the reference clock while using the external time source".into(),
            ));
        }
        let clock_source = self.clock_source;
        let aux = self.aux.as_mut().ok_or(Error::NoAuxBoard)?;
        if enable && !aux.valid_clock_exports().contains(&clock_source) {
            return Err(Error::InvalidSelection(format!(
                "clock source {} cannot be exported",
                clock_source
            )));
        }
        aux.export_clock(enable)
    }

    pub fn get_ref_lock_sensor(&self) -> Result<SensorValue> {
        let locked = self.is_locked()?;
        Ok(SensorValue {
            name: "ref_locked".into(),
            kind: "BOOLEAN".into(),
            unit: if locked { "locked" } else { "unlocked" }.into(),
            value: locked.to_string(),
        })
    }

    /// Applies per-session overrides. PPS export to the trigger connector is
    /// held off while the clocks are being changed.
    pub fn session_init(&mut self, args: &SessionArgs) -> Result<()> {
        if let Some(aux) = self.aux.as_mut() {
            aux.set_trig(false, TriggerDirection::Output)?;
        }
        let clock_source = args.clock_source.unwrap_or(self.clock_source);
        let time_source = args.time_source.unwrap_or(self.time_source);
        self.set_sync_source(clock_source, time_source)?;
        if let Some(rate) = args.master_clock_rate {
            self.set_master_clock_rate(rate)?;
        }
        if let Some(aux) = self.aux.as_mut() {
            let pps_export = args.pps_export.unwrap_or(self.pps_export);
            let direction = args.trig_direction.unwrap_or(self.trig_direction);
            let (enable, direction) = match direction {
                TriggerIoDirection::Off => (false, TriggerDirection::Output),
                TriggerIoDirection::Input => (pps_export, TriggerDirection::Input),
                TriggerIoDirection::PpsOutput => (pps_export, TriggerDirection::Output),
            };
            aux.set_trig(enable, direction)?;
        }
        Ok(())
    }

    /// Leaves the board on the default sources if the session left the
    /// reference unlocked.
    pub fn session_deinit(&mut self) -> Result<()> {
        if self.get_ref_lock_sensor()?.value != "true" {
            error!(
                "Reference clock is not locked, falling back to {}/{}",
                DEFAULT_CLOCK_SOURCE, DEFAULT_TIME_SOURCE
            );
            self.set_sync_source(DEFAULT_CLOCK_SOURCE, DEFAULT_TIME_SOURCE)?;
        }
        Ok(())
    }

    /// Lock readback for tasks that must not reconfigure anything.
    pub fn lock_probes(&self) -> (SamplePllLockProbe, ReferencePllLockProbe) {
        (self.spll.lock_probe(), self.rpll.lock_probe())
    }

    pub fn rfdc(&mut self) -> &mut RfdcResetSequencer {
        &mut self.rfdc
    }

    pub fn get_num_timekeepers(&self) -> Result<u32> {
        self.mb.get_num_timekeepers()
    }

    pub fn get_timekeeper_time(&self, tk_idx: u32, last_pps: bool) -> Result<u64> {
        self.mb.get_timekeeper_time(tk_idx, last_pps)
    }

    pub fn set_timekeeper_time(&self, tk_idx: u32, ticks: u64, next_pps: bool) -> Result<()> {
        self.mb.set_timekeeper_time(tk_idx, ticks, next_pps)
    }

    pub fn set_tick_period(&self, tk_idx: u32, period: u64) -> Result<()> {
        self.mb.set_tick_period(tk_idx, period)
    }
}
