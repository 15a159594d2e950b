/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Reference PLL (LMK03328 class) generating the motherboard base reference
//! clock and the MGT reference clock.

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pll::{to_hz, LockProbe, PllStatus};
use crate::regs::Regs;

/// I²C address of the reference PLL.
pub const I2C_ADDRESS: u8 = 0x54;

pub const VCO_MIN: f64 = 4.8e9;
pub const VCO_MAX: f64 = 5.4e9;

const MAX_N: u32 = 0xFFF;
const MAX_OUTPUT_DIVIDER: u32 = 0x100;

#[derive(Debug, Copy, Clone)]
enum Register {
    DevCtl = 0x0C,
    Status = 0x0D,
    RefSel = 0x0E,
    Pll1NMsb = 0x34,
    Pll1NLsb = 0x35,
    Pll2NMsb = 0x50,
    Pll2NLsb = 0x51,
    Out0Div = 0x6A,
    Out4Div = 0x7A,
    Out4Mux = 0x7B,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    struct DevCtlBits: u8 {
        const RESETN_SW = 0b1000_0000;
        const PLL2_PDN = 0b0000_0100;
        const PLL1_PDN = 0b0000_0010;
    }
}

bitflags! {
    /// Loss-of-lock flags, set while a loop is unlocked.
    pub struct StatusBits: u8 {
        const LOL_PLL2 = 0b0000_0100;
        const LOL_PLL1 = 0b0000_0010;
    }
}

const OUT4_MUX_BYPASS: u8 = 0x01;

/// What drives the base reference clock output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrcSelect {
    /// Primary reference passed straight through.
    Bypass,
    /// Synthesised by PLL2.
    Pll,
}

/// Feedback divider and output divider of one loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoopPlan {
    pub n: u32,
    pub output_divider: u32,
}

impl LoopPlan {
    /// Smallest output divider that places the VCO in range with an integer
    /// feedback divider from `reference`.
    pub fn find(reference: f64, output: f64) -> Result<Self> {
        let unsupported = Error::UnsupportedRatio {
            target: output,
            reference,
        };
        let (ref_hz, out_hz) = match (to_hz(reference), to_hz(output)) {
            (Some(r), Some(o)) => (r, o),
            _ => return Err(unsupported),
        };
        (1..=MAX_OUTPUT_DIVIDER)
            .map(|div| (div, out_hz * div as u64))
            .filter(|&(_, vco)| (VCO_MIN..=VCO_MAX).contains(&(vco as f64)))
            .find(|&(_, vco)| vco % ref_hz == 0 && vco / ref_hz <= MAX_N as u64)
            .map(|(div, vco)| LoopPlan {
                n: (vco / ref_hz) as u32,
                output_divider: div,
            })
            .ok_or(unsupported)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RpllConfig {
    /// 1 selects PRIREF, 2 selects SECREF.
    pub ref_select: u8,
    pub brc_rate: f64,
    pub mgt_rate: f64,
    pub brc_select: BrcSelect,
    pub mgt_loop: LoopPlan,
    pub brc_loop: Option<LoopPlan>,
}

fn read_status(regs: &Regs) -> Result<PllStatus> {
    let lol = StatusBits::from_bits_truncate(regs.peek32(Register::Status.addr())? as u8);
    Ok(PllStatus {
        pll1_locked: !lol.contains(StatusBits::LOL_PLL1),
        pll2_locked: !lol.contains(StatusBits::LOL_PLL2),
    })
}

pub struct ReferencePll {
    regs: Regs,
    reference_rates: [Option<f64>; 2],
    desired: Option<RpllConfig>,
    in_reset: bool,
}

impl ReferencePll {
    pub fn new(regs: Regs) -> Self {
        ReferencePll {
            regs,
            reference_rates: [None, None],
            desired: None,
            in_reset: false,
        }
    }

    fn write(&self, reg: Register, value: u8) -> Result<()> {
        self.regs.poke32(reg.addr(), value as u32)
    }

    /// Rates present on PRIREF and SECREF.
    pub fn set_reference_rates(&mut self, rates: [Option<f64>; 2]) {
        self.reference_rates = rates;
    }

    pub fn reference_rates(&self) -> [Option<f64>; 2] {
        self.reference_rates
    }

    pub fn plan(
        &self,
        ref_select: u8,
        brc_rate: f64,
        mgt_rate: f64,
        brc_select: BrcSelect,
    ) -> Result<RpllConfig> {
        let reference = match ref_select {
            1 | 2 => self.reference_rates[ref_select as usize - 1],
            _ => None,
        }
        .ok_or_else(|| {
            Error::InvalidSelection(format!("no reference rate known for input {}", ref_select))
        })?;

        let brc_loop = match brc_select {
            BrcSelect::Bypass => {
                if self.reference_rates[0] != Some(brc_rate) {
                    return Err(Error::InvalidSelection(format!(
                        "cannot bypass PRIREF ({:?}) to produce a {} Hz BRC",
                        self.reference_rates[0], brc_rate
                    )));
                }
                None
            }
            BrcSelect::Pll => Some(LoopPlan::find(reference, brc_rate)?),
        };

        Ok(RpllConfig {
            ref_select,
            brc_rate,
            mgt_rate,
            brc_select,
            mgt_loop: LoopPlan::find(reference, mgt_rate)?,
            brc_loop,
        })
    }

    /// Programs both loops; deferred until release while held in reset.
    pub fn config(
        &mut self,
        ref_select: u8,
        brc_rate: f64,
        mgt_rate: f64,
        brc_select: BrcSelect,
    ) -> Result<Option<PllStatus>> {
        let config = self.plan(ref_select, brc_rate, mgt_rate, brc_select)?;
        self.desired = Some(config);
        if self.in_reset {
            debug!("Reference PLL held in reset, deferring configuration");
            return Ok(None);
        }
        self.program(&config).map(Some)
    }

    fn program(&mut self, config: &RpllConfig) -> Result<PllStatus> {
        trace!("Programming reference PLL: {:?}", config);
        let sel = config.ref_select & 0x3;
        self.write(Register::RefSel, sel | sel << 2)?;

        self.write(Register::Pll1NMsb, (config.mgt_loop.n >> 8) as u8 & 0x0F)?;
        self.write(Register::Pll1NLsb, config.mgt_loop.n as u8)?;
        self.write(Register::Out0Div, (config.mgt_loop.output_divider - 1) as u8)?;

        match config.brc_loop {
            Some(brc) => {
                self.write(Register::Pll2NMsb, (brc.n >> 8) as u8 & 0x0F)?;
                self.write(Register::Pll2NLsb, brc.n as u8)?;
                self.write(Register::Out4Div, (brc.output_divider - 1) as u8)?;
                self.write(Register::Out4Mux, 0)?;
            }
            None => self.write(Register::Out4Mux, OUT4_MUX_BYPASS)?,
        }

        let status = self.get_status()?;
        if !status.is_locked() {
            warn!("Reference PLL did not lock: {:?}", status);
        }
        Ok(status)
    }

    /// Hard reset toggles the software reset and re-programs the last
    /// configuration on release; soft reset powers both loops down and up.
    pub fn reset(&mut self, value: bool, hard: bool) -> Result<()> {
        if !hard {
            let pdn = if value {
                DevCtlBits::RESETN_SW | DevCtlBits::PLL1_PDN | DevCtlBits::PLL2_PDN
            } else {
                DevCtlBits::RESETN_SW
            };
            return self.write(Register::DevCtl, pdn.bits());
        }
        if value {
            self.write(Register::DevCtl, 0)?;
            self.in_reset = true;
            return Ok(());
        }
        self.write(Register::DevCtl, DevCtlBits::RESETN_SW.bits())?;
        self.in_reset = false;
        if let Some(config) = self.desired {
            self.program(&config)?;
        }
        Ok(())
    }

    pub fn get_status(&self) -> Result<PllStatus> {
        read_status(&self.regs)
    }

    pub fn brc_rate(&self) -> Option<f64> {
        self.desired.map(|c| c.brc_rate)
    }

    pub fn lock_probe(&self) -> ReferencePllLockProbe {
        ReferencePllLockProbe {
            regs: self.regs.clone(),
        }
    }
}

pub struct ReferencePllLockProbe {
    regs: Regs,
}

impl LockProbe for ReferencePllLockProbe {
    fn status(&self) -> Result<PllStatus> {
        read_status(&self.regs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rpll_sim, Journal};
    use proptest::prelude::*;

    fn rpll(journal: &Journal) -> (std::sync::Arc<crate::testing::SimRegs>, ReferencePll) {
        let sim = rpll_sim(journal);
        let mut pll = ReferencePll::new(sim.clone());
        pll.set_reference_rates([Some(25e6), Some(100e6)]);
        (sim, pll)
    }

    #[test]
    fn loop_plans() {
        assert_eq!(
            LoopPlan::find(100e6, 156.25e6).unwrap(),
            LoopPlan {
                n: 50,
                output_divider: 32
            }
        );
        assert_eq!(
            LoopPlan::find(100e6, 25e6).unwrap(),
            LoopPlan {
                n: 48,
                output_divider: 192
            }
        );
        assert!(matches!(
            LoopPlan::find(100e6, 1e3),
            Err(Error::UnsupportedRatio { .. })
        ));
    }

    #[test]
    fn bypass_needs_matching_primary_reference() {
        let (_, pll) = rpll(&Journal::default());
        let config = pll.plan(2, 25e6, 156.25e6, BrcSelect::Bypass).unwrap();
        assert_eq!(config.brc_loop, None);
        assert!(matches!(
            pll.plan(2, 10e6, 156.25e6, BrcSelect::Bypass),
            Err(Error::InvalidSelection(_))
        ));
        assert!(matches!(
            pll.plan(3, 25e6, 156.25e6, BrcSelect::Pll),
            Err(Error::InvalidSelection(_))
        ));
    }

    #[test]
    fn config_selects_reference_and_outputs() {
        let journal = Journal::default();
        let (sim, mut pll) = rpll(&journal);
        let status = pll.config(2, 25e6, 156.25e6, BrcSelect::Pll).unwrap().unwrap();
        assert!(status.is_locked());
        assert_eq!(sim.get(0x0E), 0b1010);
        assert_eq!(sim.get(0x35), 50);
        assert_eq!(sim.get(0x6A), 31);
        assert_eq!(sim.get(0x51), 48);
        assert_eq!(sim.get(0x7A), 191);
        assert_eq!(sim.get(0x7B), 0);
        assert_eq!(pll.brc_rate(), Some(25e6));
    }

    #[test]
    fn loss_of_lock_bits_are_inverted() {
        let (sim, pll) = rpll(&Journal::default());
        assert!(pll.get_status().unwrap().is_locked());
        sim.set(0x0D, StatusBits::LOL_PLL2.bits() as u32);
        let status = pll.lock_probe().status().unwrap();
        assert!(status.pll1_locked);
        assert!(!status.pll2_locked);
    }

    #[test]
    fn hard_reset_reprograms_on_release() {
        let journal = Journal::default();
        let (_, mut pll) = rpll(&journal);
        pll.reset(true, true).unwrap();
        assert_eq!(pll.config(2, 25e6, 156.25e6, BrcSelect::Bypass).unwrap(), None);
        pll.reset(false, true).unwrap();
        let pokes = journal.pokes("rpll");
        assert_eq!(pokes[0], (0x0C, 0));
        assert_eq!(pokes[1], (0x0C, 0x80));
        assert_eq!(pokes.last(), Some(&(0x7B, 1)));
    }

    proptest! {
        #[test]
        fn mgt_plan_reproduces_rate(mgt in prop::sample::select(vec![100e6, 125e6, 156.25e6, 161.1328125e6])) {
            if let Ok(plan) = LoopPlan::find(100e6, mgt) {
                let vco = 100e6 * plan.n as f64;
                prop_assert!((VCO_MIN..=VCO_MAX).contains(&vco));
                prop_assert_eq!(vco / plan.output_divider as f64, mgt);
            }
        }
    }
}
