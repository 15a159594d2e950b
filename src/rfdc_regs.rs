/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! FPGA registers around the RF data converter: MMCM, gated clocks, chain
//! resets and the fabric DSP description.

use core::time::Duration;

use log::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::poll::{poll_with_timeout, Delay};
use crate::regs::Regs;

const MMCM_LOCK_TIMEOUT: Duration = Duration::from_millis(1);
const MMCM_LOCK_INTERVAL: Duration = Duration::from_micros(200);
const CHAIN_RESET_TIMEOUT: Duration = Duration::from_millis(5);
const CHAIN_RESET_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Copy, Clone)]
enum Register {
    IqSwap = 0x10000,
    MmcmReset = 0x11000,
    RfResetControl = 0x12000,
    RfResetStatus = 0x12008,
    RfStatus = 0x13000,
    FabricDspInfo = 0x13008,
    RfPllControl = 0x16000,
    RfPllStatus = 0x16008,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    pub struct GatedClocks: u32 {
        const DATA_CLK = 1;
        const DATA_CLK_2X = 1 << 4;
        const RF_CLK = 1 << 8;
        const RF_CLK_2X = 1 << 12;
    }
}

bitflags! {
    pub struct ChainReset: u32 {
        const ADC_RESET = 1 << 4;
        const DAC_RESET = 1 << 8;
    }
}

bitflags! {
    pub struct ChainStatus: u32 {
        const ADC_SEQ_DONE = 1 << 7;
        const DAC_SEQ_DONE = 1 << 11;
    }
}

const DATA_CLK_PLL_LOCKED: u32 = 1 << 20;

/// MMCM reset is active low.
const MMCM_IN_RESET: u32 = 0;
const MMCM_RUNNING: u32 = 1;

/// DSP present in the FPGA image for one daughterboard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FabricDspInfo {
    pub bandwidth_mhz: u32,
    pub rx_channels: u32,
    pub tx_channels: u32,
}

/// RFDC resampling for each fabric DSP bandwidth, as
/// `(bandwidth MHz, factor, half-band)`.
const RESAMPLING_BY_BANDWIDTH: [(u32, u32, bool); 3] = [(100, 8, false), (200, 2, true), (400, 2, false)];
const DEFAULT_RESAMPLING: (u32, bool) = (2, false);

pub struct RfdcRegs {
    regs: Regs,
    converter_chains_in_reset: bool,
}

impl RfdcRegs {
    /// Chains are assumed to be in reset until the first release.
    pub fn new(regs: Regs) -> Self {
        RfdcRegs {
            regs,
            converter_chains_in_reset: true,
        }
    }

    fn read(&self, reg: Register) -> Result<u32> {
        self.regs.peek32(reg.addr())
    }

    fn write(&self, reg: Register, value: u32) -> Result<()> {
        self.regs.poke32(reg.addr(), value)
    }

    pub fn enable_iq_swap(&self, enable: bool, db_id: u32, block_id: u32, is_dac: bool) -> Result<()> {
        let bit = (is_dac as u32) * 8 + db_id * 4 + block_id;
        let value = self.read(Register::IqSwap)?;
        self.write(
            Register::IqSwap,
            (value & !(1 << bit)) | ((enable as u32) << bit),
        )
    }

    pub fn set_reset_mmcm(&self, reset: bool) -> Result<()> {
        self.write(
            Register::MmcmReset,
            if reset { MMCM_IN_RESET } else { MMCM_RUNNING },
        )
    }

    /// The MMCM locks within 100 µs per datasheet; waits up to 1 ms.
    pub fn wait_for_mmcm_locked(&self, delay: &mut dyn Delay) -> Result<()> {
        let regs = &self.regs;
        let locked = poll_with_timeout(delay, MMCM_LOCK_TIMEOUT, MMCM_LOCK_INTERVAL, || {
            Ok(regs.peek32(Register::RfPllStatus.addr())? & DATA_CLK_PLL_LOCKED != 0)
        })?;
        if !locked {
            error!("MMCM failed to lock in the expected time.");
            return Err(Error::MmcmLockTimeout);
        }
        trace!("RF MMCM lock detected.");
        Ok(())
    }

    pub fn set_gated_clock_enables(&self, enable: bool) -> Result<()> {
        let value = if enable {
            GatedClocks::all()
        } else {
            GatedClocks::empty()
        };
        self.write(Register::RfPllControl, value.bits())
    }

    pub fn get_fabric_dsp_info(&self, db: u32) -> Result<FabricDspInfo> {
        let dsp_info = self.read(Register::FabricDspInfo)?;
        let info = FabricDspInfo {
            bandwidth_mhz: (dsp_info >> (16 * db)) & 0xFFF,
            rx_channels: (dsp_info >> (12 + 16 * db)) & 0x3,
            tx_channels: (dsp_info >> (14 + 16 * db)) & 0x3,
        };
        trace!("Fabric DSP for dboard {}: {:?}", db, info);
        Ok(info)
    }

    /// `(factor, half-band)` the RFDC must run at for daughterboard `db`.
    ///
    /// Images without RF DSP (bandwidth 0) or with an unknown bandwidth use
    /// the 400 MHz setting.
    pub fn get_rfdc_resampling_factor(&self, db: u32) -> Result<(u32, bool)> {
        let bandwidth = self.get_fabric_dsp_info(db)?.bandwidth_mhz;
        let resampling = RESAMPLING_BY_BANDWIDTH
            .iter()
            .find(|&&(bw, _, _)| bw == bandwidth)
            .map(|&(_, factor, halfband)| (factor, halfband))
            .unwrap_or_else(|| {
                trace!("  Using default resampling!");
                DEFAULT_RESAMPLING
            });
        trace!("  RFDC resampling:  {}", resampling.0);
        Ok(resampling)
    }

    fn pulse_chain_reset(
        &self,
        converter: &'static str,
        reset: ChainReset,
        done: ChainStatus,
        delay: &mut dyn Delay,
    ) -> Result<()> {
        trace!("Resetting {} chain", converter);
        self.write(Register::RfResetControl, reset.bits())?;
        let regs = &self.regs;
        let finished = poll_with_timeout(delay, CHAIN_RESET_TIMEOUT, CHAIN_RESET_INTERVAL, || {
            Ok(regs.peek32(Register::RfResetStatus.addr())? & done.bits() != 0)
        })?;
        if !finished {
            error!("Timeout while resetting or enabling {} chain.", converter);
            return Err(Error::ResetTimeout(converter));
        }
        self.write(Register::RfResetControl, 0)
    }

    /// Resets the ADC chains, then the DAC chains, or releases both.
    ///
    /// Asserting while the chains are already in reset only warns; the
    /// reset bits are not toggled a second time.
    pub fn set_reset_adc_dac_chains(&mut self, reset: bool, delay: &mut dyn Delay) -> Result<()> {
        if !reset {
            self.write(Register::RfResetControl, 0)?;
            self.converter_chains_in_reset = false;
            return Ok(());
        }
        if self.converter_chains_in_reset {
            warn!("Converters are already in reset. The reset bit will NOT be toggled.");
            return Ok(());
        }
        self.pulse_chain_reset("ADC", ChainReset::ADC_RESET, ChainStatus::ADC_SEQ_DONE, delay)?;
        self.pulse_chain_reset("DAC", ChainReset::DAC_RESET, ChainStatus::DAC_SEQ_DONE, delay)?;
        self.converter_chains_in_reset = true;
        Ok(())
    }

    pub fn converter_chains_in_reset(&self) -> bool {
        self.converter_chains_in_reset
    }

    /// Dumps the AXI-stream handshake state of both daughterboards.
    pub fn log_status(&self) -> Result<()> {
        let status = self.read(Register::RfStatus)?;
        for db in 0..2 {
            let s = status >> (16 * db);
            debug!("Daughterboard {}", db);
            debug!("  @RFDC");
            debug!("    DAC(1:0) TREADY    : {:02b}", s & 0x3);
            debug!("    DAC(1:0) TVALID    : {:02b}", (s >> 2) & 0x3);
            debug!("    ADC(1:0) I TREADY  : {:02b}", (s >> 6) & 0x3);
            debug!("    ADC(1:0) I TVALID  : {:02b}", (s >> 10) & 0x3);
            debug!("    ADC(1:0) Q TREADY  : {:02b}", (s >> 4) & 0x3);
            debug!("    ADC(1:0) Q TVALID  : {:02b}", (s >> 8) & 0x3);
            debug!("  @USER");
            debug!("    ADC(1:0) OUT TVALID: {:02b}", (s >> 12) & 0x3);
            debug!("    ADC(1:0) OUT TREADY: {:02b}", (s >> 14) & 0x3);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rfdc_sim, Journal, NoDelay};

    #[test]
    fn resampling_by_bandwidth() {
        let sim = rfdc_sim(&Journal::default(), [400, 100]);
        let regs = RfdcRegs::new(sim.clone());
        assert_eq!(regs.get_rfdc_resampling_factor(0).unwrap(), (2, false));
        assert_eq!(regs.get_rfdc_resampling_factor(1).unwrap(), (8, false));

        sim.set(0x13008, 200);
        assert_eq!(regs.get_rfdc_resampling_factor(0).unwrap(), (2, true));
        assert_eq!(regs.get_rfdc_resampling_factor(1).unwrap(), (2, false));
    }

    #[test]
    fn dsp_info_fields() {
        let sim = rfdc_sim(&Journal::default(), [400, 400]);
        sim.set(0x13008, (100 | 2 << 12 | 1 << 14) << 16 | 400);
        let info = RfdcRegs::new(sim).get_fabric_dsp_info(1).unwrap();
        assert_eq!(
            info,
            FabricDspInfo {
                bandwidth_mhz: 100,
                rx_channels: 2,
                tx_channels: 1
            }
        );
    }

    #[test]
    fn chain_reset_runs_adc_then_dac() {
        let journal = Journal::default();
        let sim = rfdc_sim(&journal, [400, 400]);
        let mut regs = RfdcRegs::new(sim);
        regs.set_reset_adc_dac_chains(false, &mut NoDelay).unwrap();
        journal.clear();
        regs.set_reset_adc_dac_chains(true, &mut NoDelay).unwrap();
        assert!(regs.converter_chains_in_reset());
        assert_eq!(
            journal.pokes("rfdc"),
            vec![(0x12000, 1 << 4), (0x12000, 0), (0x12000, 1 << 8), (0x12000, 0)]
        );
    }

    #[test]
    fn chain_reset_is_not_toggled_twice() {
        let journal = Journal::default();
        let sim = rfdc_sim(&journal, [400, 400]);
        let mut regs = RfdcRegs::new(sim);
        regs.set_reset_adc_dac_chains(true, &mut NoDelay).unwrap();
        assert!(journal.pokes("rfdc").is_empty());
    }

    #[test]
    fn chain_reset_times_out_without_done() {
        let sim = rfdc_sim(&Journal::default(), [400, 400]);
        sim.set(0x12008, ChainStatus::ADC_SEQ_DONE.bits());
        let mut regs = RfdcRegs::new(sim.clone());
        regs.set_reset_adc_dac_chains(false, &mut NoDelay).unwrap();
        assert_eq!(
            regs.set_reset_adc_dac_chains(true, &mut NoDelay),
            Err(Error::ResetTimeout("DAC"))
        );
        assert_eq!(sim.reads_of(0x12008), 1 + 6);
    }

    #[test]
    fn mmcm_lock_timeout() {
        let sim = rfdc_sim(&Journal::default(), [400, 400]);
        let regs = RfdcRegs::new(sim.clone());
        regs.wait_for_mmcm_locked(&mut NoDelay).unwrap();
        sim.set(0x16008, 0);
        assert_eq!(
            regs.wait_for_mmcm_locked(&mut NoDelay),
            Err(Error::MmcmLockTimeout)
        );
    }

    #[test]
    fn iq_swap_bit_position() {
        let sim = rfdc_sim(&Journal::default(), [400, 400]);
        let regs = RfdcRegs::new(sim.clone());
        regs.enable_iq_swap(true, 1, 1, true).unwrap();
        assert_eq!(sim.get(0x10000), 1 << 13);
        regs.enable_iq_swap(false, 1, 1, true).unwrap();
        assert_eq!(sim.get(0x10000), 0);
    }
}
