/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
/*!
Clock, reset and RF data converter bring-up for X4xx-class SDR motherboards,
based on the [`embedded-hal`] traits.

## The Device

An X4xx motherboard derives every converter and timekeeper clock from two
PLLs. The reference PLL (LMK03328, I²C) turns a 100 MHz on-board reference
into the base reference clock (BRC) and the transceiver clock. The sample PLL
(LMK04832, SPI) cleans up the BRC and produces the RFSoC sample clock and the
PLL reference clock (PRC) for the daughterboards. A CPLD gates the PRC and
the daughterboard resets, and the FPGA fabric holds the RF data converter
(RFDC) glue, the PPS routing and the timekeepers.

[`ClockOrchestrator`] sequences all of them: reset domains in a fixed order,
sync source selection with a fallback to the on-board reference, master
clock rate changes, multi-tile sync and PPS forwarding into the sample clock
domain.

## Usage

Wrap each register block in a [`RegisterInterface`]. Buses get
[`regs::SpiRegs`] and [`regs::I2cRegs`], memory-mapped windows implement the
trait directly:

```ignore
let cpld: Regs = Arc::new(SpiRegs::new(spi0, SpiFrame::CPLD));
let spll: Regs = Arc::new(SpiRegs::new(spi1, SpiFrame::SAMPLE_PLL));
let rpll: Regs = Arc::new(I2cRegs::new(i2c, reference_pll::I2C_ADDRESS));
```

Then hand the drivers to the orchestrator and bring the clocks up:

```ignore
let config = BoardConfig::from_json(&std::fs::read_to_string("x4xx.json")?)?;
let hw = ClockHardware {
    mboard_regs: MboardRegs::new(mb_regs),
    cpld: MboardCpld::new(cpld),
    spll: SamplePll::new(spll),
    rpll: ReferencePll::new(rpll),
    rfdc: RfdcResetSequencer::new(RfdcRegs::new(rfdc_regs), tiles, config.rfdc_map.clone()),
    aux: None,
    dboards,
    brc_select,
    delay: Box::new(StdDelay),
};
let mut clocks = ClockOrchestrator::new(hw, &config)?;
clocks.init(&rfdc_powered)?;
clocks.set_sync_source(ClockSource::External, TimeSource::External)?;
```

Long-running services put it in an [`MboardManager`], which serialises
callers and runs the reference-lock and DIO fault monitors.

[`embedded-hal`]: https://github.com/japaric/embedded-hal
*/
//#![deny(missing_docs)]

#[macro_use]
extern crate bitflags;
use embedded_hal as hal;

pub mod aux_board;
pub mod config;
pub mod cpld;
pub mod ctrlport;
pub mod error;
pub mod manager;
pub mod mboard_regs;
pub mod orchestrator;
pub mod pll;
pub mod poll;
pub mod reference_pll;
pub mod regs;
pub mod rfdc;
pub mod rfdc_regs;
pub mod sample_pll;

#[cfg(test)]
mod testing;

pub use crate::config::{BoardConfig, ClockSource, SessionArgs, TimeSource};
pub use crate::error::{Error, Result};
pub use crate::manager::MboardManager;
pub use crate::orchestrator::{ClockHardware, ClockOrchestrator, ClockState};
pub use crate::regs::{RegisterInterface, Regs};
