/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! RF data converter reset, resampling and multi-tile sync.
//!
//! The register side lives in [`RfdcRegs`](crate::rfdc_regs::RfdcRegs); the
//! converter tiles themselves are driven through an [`RfdcTileController`],
//! normally a binding to the vendor RFDC driver.

use std::collections::BTreeSet;

use log::{trace, warn};

use crate::config::{Channel, Direction, RfdcSlotMap};
use crate::error::{Error, Result};
use crate::poll::Delay;
use crate::rfdc_regs::RfdcRegs;

/// Datasheet latency targets for multi-tile sync, in sample clocks.
pub const ADC_SYNC_LATENCY: u32 = 1228;
pub const DAC_SYNC_LATENCY: u32 = 800;

/// One converter block on one tile.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Converter {
    pub tile: u32,
    pub block: u32,
    pub is_dac: bool,
}

impl Converter {
    pub fn adc(tile: u32, block: u32) -> Self {
        Converter {
            tile,
            block,
            is_dac: false,
        }
    }

    pub fn dac(tile: u32, block: u32) -> Self {
        Converter {
            tile,
            block,
            is_dac: true,
        }
    }

    fn kind(&self) -> &'static str {
        if self.is_dac {
            "DAC"
        } else {
            "ADC"
        }
    }
}

/// Converter tile driver.
///
/// Tile-wide calls take the tile index and converter type; block-level
/// calls take a [`Converter`].
pub trait RfdcTileController: Send {
    /// Restarts every ADC tile, or every DAC tile.
    fn startup_tiles(&mut self, is_dac: bool) -> Result<()>;
    fn reset_mixer_settings(&mut self, converter: Converter) -> Result<()>;
    fn set_sample_rate(&mut self, tile: u32, is_dac: bool, rate: f64) -> Result<()>;
    fn set_data_fifo_state(&mut self, tile: u32, is_dac: bool, enable: bool) -> Result<()>;
    fn set_resampling_factor(&mut self, converter: Converter, factor: u32) -> Result<()>;
    /// Fabric read (DAC) or write (ADC) words per clock.
    fn set_fabric_words(&mut self, converter: Converter, words: u32) -> Result<()>;
    fn clear_data_fifo_interrupts(&mut self, converter: Converter) -> Result<()>;
    /// Points the NCO reset event at the analog SYSREF.
    fn set_nco_event_source_sysref(&mut self, converter: Converter) -> Result<()>;
    fn sync_tiles(&mut self, tiles: &[u32], is_dac: bool, latency: u32) -> Result<()>;
    fn get_tile_latency(&mut self, tile: u32, is_dac: bool) -> Result<u32>;
    fn set_nco_freq(&mut self, converter: Converter, freq: f64) -> Result<()>;
    fn get_nco_freq(&mut self, converter: Converter) -> Result<f64>;
}

/// Fabric words per clock for a resampling factor.
///
/// DACs cannot run at factor 0 or 1.
pub fn fabric_words(factor: u32, is_dac: bool) -> Result<u32> {
    let words = match (is_dac, factor) {
        (false, 0) | (false, 1) => Some(16),
        (false, 2) => Some(8),
        (false, 4) => Some(4),
        (false, 8) => Some(2),
        (true, 2) => Some(16),
        (true, 4) => Some(8),
        (true, 8) => Some(4),
        _ => None,
    };
    words.ok_or(Error::UnsupportedFactor {
        factor,
        converter: if is_dac { "DAC" } else { "ADC" },
    })
}

/// `items` with repeats removed, keeping the first occurrence of each.
pub(crate) fn dedup_first_seen(items: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

/// Drives the converter tiles through reset, resampling setup and sync.
pub struct RfdcResetSequencer {
    regs: RfdcRegs,
    tiles: Box<dyn RfdcTileController>,
    rfdc_map: Vec<RfdcSlotMap>,
}

impl RfdcResetSequencer {
    pub fn new(regs: RfdcRegs, tiles: Box<dyn RfdcTileController>, rfdc_map: Vec<RfdcSlotMap>) -> Self {
        RfdcResetSequencer {
            regs,
            tiles,
            rfdc_map,
        }
    }

    pub fn regs(&self) -> &RfdcRegs {
        &self.regs
    }

    pub fn num_dboards(&self) -> u32 {
        self.rfdc_map.len() as u32
    }

    pub fn get_rfdc_resampling_factor(&self, db: u32) -> Result<(u32, bool)> {
        self.regs.get_rfdc_resampling_factor(db)
    }

    /// Puts the converter datapath into reset, or brings it back up at
    /// `sample_rate`.
    pub fn set_reset_rfdc(&mut self, reset: bool, sample_rate: f64, delay: &mut dyn Delay) -> Result<()> {
        if reset {
            self.regs.set_reset_adc_dac_chains(true, delay)?;
            self.regs.log_status()?;
            return self.regs.set_reset_mmcm(true);
        }

        self.regs.set_reset_mmcm(false)?;
        self.regs.wait_for_mmcm_locked(delay)?;
        self.regs.set_gated_clock_enables(true)?;
        self.regs.set_reset_adc_dac_chains(false, delay)?;

        for &is_dac in &[false, true] {
            if let Err(e) = self.tiles.startup_tiles(is_dac) {
                warn!(
                    "Failed to restart {} tiles: {}",
                    if is_dac { "DAC" } else { "ADC" },
                    e
                );
            }
        }

        let active = self.active_converters()?;
        for &(converter, factor) in &active {
            self.tiles.reset_mixer_settings(converter)?;
            self.tiles.set_sample_rate(converter.tile, converter.is_dac, sample_rate)?;
            self.set_interpolation_decimation(converter, factor)?;
        }

        self.regs.log_status()?;

        for &(converter, _) in &active {
            self.tiles.set_nco_event_source_sysref(converter)?;
        }
        Ok(())
    }

    /// Every converter wired to a daughterboard, with the resampling factor
    /// its fabric DSP requires.
    pub fn active_converters(&self) -> Result<BTreeSet<(Converter, u32)>> {
        let mut active = BTreeSet::new();
        for (db, slot) in self.rfdc_map.iter().enumerate() {
            let (factor, _) = self.regs.get_rfdc_resampling_factor(db as u32)?;
            for &(tile, block) in &slot.adc {
                active.insert((Converter::adc(tile, block), factor));
            }
            for &(tile, block) in &slot.dac {
                active.insert((Converter::dac(tile, block), factor));
            }
        }
        Ok(active)
    }

    /// Programs the resampling factor with the tile FIFO stopped.
    ///
    /// The factor is checked before the FIFO is touched, so an unsupported
    /// value leaves the converter running as it was.
    pub fn set_interpolation_decimation(&mut self, converter: Converter, factor: u32) -> Result<()> {
        let words = fabric_words(factor, converter.is_dac)?;
        trace!(
            "{} {}/{}: resampling {} with {} fabric words",
            converter.kind(),
            converter.tile,
            converter.block,
            factor,
            words
        );
        self.tiles.set_data_fifo_state(converter.tile, converter.is_dac, false)?;
        self.tiles.set_resampling_factor(converter, factor)?;
        self.tiles.set_fabric_words(converter, words)?;
        self.tiles.clear_data_fifo_interrupts(converter)?;
        self.tiles.set_data_fifo_state(converter.tile, converter.is_dac, true)
    }

    /// ADC and DAC tiles in map order, each listed once.
    pub fn tiles_to_sync(&self) -> (Vec<u32>, Vec<u32>) {
        let adc = dedup_first_seen(
            self.rfdc_map
                .iter()
                .flat_map(|slot| slot.adc.iter().map(|&(tile, _)| tile)),
        );
        let dac = dedup_first_seen(
            self.rfdc_map
                .iter()
                .flat_map(|slot| slot.dac.iter().map(|&(tile, _)| tile)),
        );
        (adc, dac)
    }

    /// Multi-tile sync of all ADC tiles and all DAC tiles.
    ///
    /// Fails if the tiles of either group do not end up with one common
    /// latency.
    pub fn rfdc_sync(&mut self) -> Result<()> {
        let (adc_tiles, dac_tiles) = self.tiles_to_sync();
        self.tiles.sync_tiles(&adc_tiles, false, ADC_SYNC_LATENCY)?;
        self.tiles.sync_tiles(&dac_tiles, true, DAC_SYNC_LATENCY)?;

        self.check_latencies(&adc_tiles, false)?;
        self.check_latencies(&dac_tiles, true)
    }

    fn check_latencies(&mut self, tiles: &[u32], is_dac: bool) -> Result<()> {
        let converter = if is_dac { "DAC" } else { "ADC" };
        let latencies = tiles
            .iter()
            .map(|&tile| self.tiles.get_tile_latency(tile, is_dac))
            .collect::<Result<Vec<_>>>()?;
        trace!("{} tile latencies: {:?}", converter, latencies);
        if latencies.windows(2).any(|pair| pair[0] != pair[1]) {
            return Err(Error::SyncFailure {
                converter,
                latencies,
            });
        }
        Ok(())
    }

    /// Converters behind a daughterboard slot, ADCs first.
    pub fn find_converters(&self, slot: usize, direction: Direction, channel: Channel) -> Result<Vec<Converter>> {
        let map = self
            .rfdc_map
            .get(slot)
            .ok_or_else(|| Error::InvalidSelection(format!("no daughterboard in slot {}", slot)))?;
        let channels: &[usize] = match channel {
            Channel::Zero => &[0],
            Channel::One => &[1],
            Channel::Both => &[0, 1],
        };

        let mut converters = Vec::new();
        if direction != Direction::Tx {
            converters.extend(channels.iter().map(|&ch| {
                let (tile, block) = map.adc[ch];
                Converter::adc(tile, block)
            }));
        }
        if direction != Direction::Rx {
            converters.extend(channels.iter().map(|&ch| {
                let (tile, block) = map.dac[ch];
                Converter::dac(tile, block)
            }));
        }
        Ok(converters)
    }

    fn single_converter(&self, slot: usize, direction: Direction, channel: Channel) -> Result<Converter> {
        match self.find_converters(slot, direction, channel)?.as_slice() {
            [converter] => Ok(*converter),
            _ => Err(Error::InvalidSelection(format!(
                "NCO access needs exactly one converter, got direction {} channel {}",
                direction, channel
            ))),
        }
    }

    /// Sets one converter's NCO and returns the frequency it actually took.
    pub fn set_nco_freq(&mut self, slot: usize, direction: Direction, channel: Channel, freq: f64) -> Result<f64> {
        let converter = self.single_converter(slot, direction, channel)?;
        self.tiles.set_nco_freq(converter, freq)?;
        self.tiles.get_nco_freq(converter)
    }

    pub fn get_nco_freq(&mut self, slot: usize, direction: Direction, channel: Channel) -> Result<f64> {
        let converter = self.single_converter(slot, direction, channel)?;
        self.tiles.get_nco_freq(converter)
    }

    pub fn enable_iq_swap(&self, enable: bool, db_id: u32, block_id: u32, is_dac: bool) -> Result<()> {
        self.regs.enable_iq_swap(enable, db_id, block_id, is_dac)
    }
}
