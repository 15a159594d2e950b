/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
/*!
Sample PLL (LMK04832 class dual-loop jitter cleaner).

PLL1 disciplines a 100 MHz VCXO to the base reference clock. PLL2 multiplies
the VCXO up to the sample clock VCO. The sample clock leaves the VCO
undivided; the PLL reference clock (PRC) routed to the daughterboards uses
a fixed divider that depends on the operating mode.

The chip registers are 8 bits wide behind a 24 bit SPI frame, see
[`SpiFrame::SAMPLE_PLL`](crate::regs::SpiFrame::SAMPLE_PLL).
*/

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pll::{integer_dividers, LockProbe, PllStatus};
use crate::regs::Regs;

pub const VCXO_FREQ: f64 = 100e6;
pub const VCO_MIN: f64 = 2.94e9;
pub const VCO_MAX: f64 = 3.1e9;

const SAMPLE_DIVIDER: u32 = 1;
const PRC_DIVIDER_NORMAL: u32 = 48;
const PRC_DIVIDER_LEGACY: u32 = 60;

const MAX_PLL1_R: u32 = 0x3FFF;
const MAX_PLL1_N: u32 = 0x3FFF;
const MAX_PLL2_R: u32 = 0xFFF;
const MAX_PLL2_N: u32 = 0x3_FFFF;

const ID_DEVICE_TYPE: u8 = 0x06;
const ID_PROD: u16 = 0x63D1;

#[derive(Debug, Copy, Clone)]
enum Register {
    Reset = 0x000,
    IdDeviceType = 0x003,
    IdProdMsb = 0x004,
    IdProdLsb = 0x005,
    SampleDivLsb = 0x100,
    SampleDivMsb = 0x102,
    PrcDivLsb = 0x108,
    PrcDivMsb = 0x10A,
    Pll1RSync = 0x145,
    Clkin0RMsb = 0x153,
    Clkin0RLsb = 0x154,
    Pll1NMsb = 0x159,
    Pll1NLsb = 0x15A,
    Pll2RMsb = 0x160,
    Pll2RLsb = 0x161,
    Pll2NMsb = 0x166,
    Pll2NMid = 0x167,
    Pll2NLsb = 0x168,
    Pll2Pd = 0x173,
    RbPll1Ld = 0x182,
    RbPll2Ld = 0x183,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    struct ResetBits: u8 {
        const RESET = 0b1000_0000;
    }
}

bitflags! {
    struct SyncBits: u8 {
        const PLL1R_SYNC_EN = 0b0100_0000;
        const PLL1R_SYNC_SRC_PIN = 0b0001_0000;
    }
}

bitflags! {
    struct Pll2PdBits: u8 {
        const PLL2_PRE_PD = 0b0100_0000;
        const PLL2_PD = 0b0010_0000;
    }
}

bitflags! {
    pub struct LockDetectBits: u8 {
        const LD_LOST = 0b0000_0100;
        const LD = 0b0000_0010;
        const CLR_LD_LOST = 0b0000_0001;
    }
}

/// Divider settings for one sample clock.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SpllConfig {
    pub output_freq: f64,
    pub ref_freq: f64,
    pub legacy_mode: bool,
    pub pll1_r: u32,
    pub pll1_n: u32,
    pub pll2_r: u32,
    pub pll2_n: u32,
    pub prc_divider: u32,
}

impl SpllConfig {
    /// Computes the dividers producing `output_freq` from `ref_freq`.
    pub fn plan(output_freq: f64, ref_freq: f64, legacy_mode: bool) -> Result<Self> {
        let vco = output_freq * SAMPLE_DIVIDER as f64;
        if !(VCO_MIN..=VCO_MAX).contains(&vco) {
            return Err(Error::UnsupportedRatio {
                target: output_freq,
                reference: ref_freq,
            });
        }
        let (pll1_r, pll1_n) = integer_dividers(ref_freq, VCXO_FREQ, MAX_PLL1_R, MAX_PLL1_N)
            .map_err(|_| Error::UnsupportedRatio {
                target: output_freq,
                reference: ref_freq,
            })?;
        let (pll2_r, pll2_n) = integer_dividers(VCXO_FREQ, vco, MAX_PLL2_R, MAX_PLL2_N)?;
        Ok(SpllConfig {
            output_freq,
            ref_freq,
            legacy_mode,
            pll1_r,
            pll1_n,
            pll2_r,
            pll2_n,
            prc_divider: if legacy_mode {
                PRC_DIVIDER_LEGACY
            } else {
                PRC_DIVIDER_NORMAL
            },
        })
    }

    pub fn prc_rate(&self) -> f64 {
        self.output_freq * SAMPLE_DIVIDER as f64 / self.prc_divider as f64
    }
}

fn read_status(regs: &Regs) -> Result<PllStatus> {
    let pll1 = LockDetectBits::from_bits_truncate(regs.peek32(Register::RbPll1Ld.addr())? as u8);
    let pll2 = LockDetectBits::from_bits_truncate(regs.peek32(Register::RbPll2Ld.addr())? as u8);
    Ok(PllStatus {
        pll1_locked: pll1.contains(LockDetectBits::LD),
        pll2_locked: pll2.contains(LockDetectBits::LD),
    })
}

pub struct SamplePll {
    regs: Regs,
    desired: Option<SpllConfig>,
    programmed: bool,
    in_reset: bool,
}

impl SamplePll {
    pub fn new(regs: Regs) -> Self {
        SamplePll {
            regs,
            desired: None,
            programmed: false,
            in_reset: false,
        }
    }

    fn read(&self, reg: Register) -> Result<u8> {
        Ok(self.regs.peek32(reg.addr())? as u8)
    }

    fn write(&self, reg: Register, value: u8) -> Result<()> {
        self.regs.poke32(reg.addr(), value as u32)
    }

    /// Checks the chip identity.
    pub fn init(&self) -> Result<()> {
        let device_type = self.read(Register::IdDeviceType)?;
        let prod = (self.read(Register::IdProdMsb)? as u16) << 8 | self.read(Register::IdProdLsb)? as u16;
        if device_type != ID_DEVICE_TYPE || prod != ID_PROD {
            return Err(Error::SignatureMismatch {
                device: "sample PLL",
                expected: (ID_DEVICE_TYPE as u32) << 16 | ID_PROD as u32,
                found: (device_type as u32) << 16 | prod as u32,
            });
        }
        trace!("Sample PLL identity OK");
        Ok(())
    }

    /// Requests a new sample clock.
    ///
    /// While the chip is held in reset the settings are only remembered and
    /// get programmed when the reset is released; `Ok(None)` is returned in
    /// that case. Otherwise the chip is programmed and its lock status is
    /// returned. A missing lock is logged, not treated as an error.
    pub fn config(
        &mut self,
        output_freq: f64,
        ref_freq: f64,
        legacy_mode: bool,
    ) -> Result<Option<PllStatus>> {
        let config = SpllConfig::plan(output_freq, ref_freq, legacy_mode)?;
        self.desired = Some(config);
        if self.in_reset {
            debug!(
                "Sample PLL held in reset, deferring {} Hz configuration",
                output_freq
            );
            return Ok(None);
        }
        self.program(&config).map(Some)
    }

    fn program(&mut self, config: &SpllConfig) -> Result<PllStatus> {
        trace!("Programming sample PLL: {:?}", config);
        self.write(
            Register::Pll2Pd,
            (Pll2PdBits::PLL2_PD | Pll2PdBits::PLL2_PRE_PD).bits(),
        )?;

        self.write(Register::Clkin0RMsb, (config.pll1_r >> 8) as u8 & 0x3F)?;
        self.write(Register::Clkin0RLsb, config.pll1_r as u8)?;
        self.write(Register::Pll1NMsb, (config.pll1_n >> 8) as u8 & 0x3F)?;
        self.write(Register::Pll1NLsb, config.pll1_n as u8)?;

        self.write(Register::Pll2RMsb, (config.pll2_r >> 8) as u8 & 0x0F)?;
        self.write(Register::Pll2RLsb, config.pll2_r as u8)?;
        self.write(Register::Pll2NMsb, (config.pll2_n >> 16) as u8 & 0x03)?;
        self.write(Register::Pll2NMid, (config.pll2_n >> 8) as u8)?;
        self.write(Register::Pll2NLsb, config.pll2_n as u8)?;

        self.write(Register::SampleDivLsb, SAMPLE_DIVIDER as u8)?;
        self.write(Register::SampleDivMsb, (SAMPLE_DIVIDER >> 8) as u8 & 0x03)?;
        self.write(Register::PrcDivLsb, config.prc_divider as u8)?;
        self.write(Register::PrcDivMsb, (config.prc_divider >> 8) as u8 & 0x03)?;

        self.write(Register::Pll2Pd, 0)?;
        self.write(Register::RbPll1Ld, LockDetectBits::CLR_LD_LOST.bits())?;
        self.write(Register::RbPll2Ld, LockDetectBits::CLR_LD_LOST.bits())?;
        self.programmed = true;

        let status = self.get_status()?;
        if !status.is_locked() {
            warn!(
                "Sample PLL did not lock at {} Hz: {:?}",
                config.output_freq, status
            );
        }
        Ok(status)
    }

    /// Asserts (`value`) or releases a reset.
    ///
    /// A hard reset returns every register to its power-on default, so the
    /// last requested configuration is programmed again on release. A soft
    /// reset only powers PLL2 down and back up; the dividers survive it.
    pub fn reset(&mut self, value: bool, hard: bool) -> Result<()> {
        if !hard {
            trace!("Sample PLL soft reset: {}", value);
            let pd = if value {
                Pll2PdBits::PLL2_PD.bits()
            } else {
                0
            };
            return self.write(Register::Pll2Pd, pd);
        }

        if value {
            self.write(Register::Reset, ResetBits::RESET.bits())?;
            self.programmed = false;
            self.in_reset = true;
            return Ok(());
        }

        self.write(Register::Reset, 0)?;
        self.in_reset = false;
        if let Some(config) = self.desired {
            self.program(&config)?;
        }
        Ok(())
    }

    pub fn get_status(&self) -> Result<PllStatus> {
        read_status(&self.regs)
    }

    /// Synchronises the PLL1 R divider to an external edge.
    ///
    /// The sync input is armed, `trigger` is expected to produce the edge
    /// and report whether it was seen, and the input is disarmed again even
    /// when the trigger fails.
    pub fn pll1_r_divider_sync(
        &mut self,
        trigger: &mut dyn FnMut() -> Result<bool>,
    ) -> Result<bool> {
        self.write(
            Register::Pll1RSync,
            (SyncBits::PLL1R_SYNC_EN | SyncBits::PLL1R_SYNC_SRC_PIN).bits(),
        )?;
        let synced = trigger();
        let disarmed = self.write(Register::Pll1RSync, 0);
        let synced = synced?;
        disarmed?;
        Ok(synced)
    }

    pub fn is_programmed(&self) -> bool {
        self.programmed
    }

    /// Sample clock currently requested, programmed or not.
    pub fn output_freq(&self) -> Option<f64> {
        self.desired.map(|c| c.output_freq)
    }

    pub fn is_legacy_mode(&self) -> bool {
        self.desired.map(|c| c.legacy_mode).unwrap_or(false)
    }

    pub fn prc_rate(&self) -> Option<f64> {
        self.desired.map(|c| c.prc_rate())
    }

    pub fn lock_probe(&self) -> SamplePllLockProbe {
        SamplePllLockProbe {
            regs: self.regs.clone(),
        }
    }
}

/// Lock readback of the sample PLL and nothing else.
pub struct SamplePllLockProbe {
    regs: Regs,
}

impl LockProbe for SamplePllLockProbe {
    fn status(&self) -> Result<PllStatus> {
        read_status(&self.regs)
    }
}
