/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Control port endpoint: SPI clock dividers for the PL-side CPLD masters
//! and windows onto the CPLDs behind them.

use std::sync::Arc;

use log::error;

use crate::error::{Error, Result};
use crate::regs::{Regs, Window};

pub const MB_PL_CPLD_SIGNATURE: u32 = 0x3FDC_5C47;
pub const MB_PL_CPLD_MIN_REVISION: u32 = 0x2008_2009;
pub const MIN_MB_CPLD_SPI_DIVIDER: u32 = 2;
pub const MIN_DB_CPLD_SPI_DIVIDER: u32 = 5;

#[derive(Debug, Copy, Clone)]
enum Register {
    Ipass = 0x00_0010,
    MbPlSpiConfig = 0x00_0020,
    DbSpiConfig = 0x00_0024,
    MbPlCpld = 0x00_8000,
    Db0Cpld = 0x01_0000,
    Db1Cpld = 0x01_8000,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }
}

#[derive(Debug, Copy, Clone)]
enum PlCpldRegister {
    Signature = 0x0,
    Revision = 0x4,
}

pub struct CtrlportRegs {
    regs: Regs,
    mb_pl_cpld: Regs,
    db_cpld: [Regs; 2],
}

impl CtrlportRegs {
    /// Programs the minimum SPI dividers and verifies the PL CPLD identity.
    pub fn new(regs: Regs) -> Result<Self> {
        let ctrlport = CtrlportRegs {
            mb_pl_cpld: Arc::new(Window::new(regs.clone(), Register::MbPlCpld.addr())),
            db_cpld: [
                Arc::new(Window::new(regs.clone(), Register::Db0Cpld.addr())),
                Arc::new(Window::new(regs.clone(), Register::Db1Cpld.addr())),
            ],
            regs,
        };
        ctrlport.set_mb_pl_cpld_divider(MIN_MB_CPLD_SPI_DIVIDER)?;
        ctrlport.set_db_divider_value(MIN_DB_CPLD_SPI_DIVIDER)?;
        ctrlport.check_mb_pl_cpld()?;
        Ok(ctrlport)
    }

    fn set_divider(&self, reg: Register, what: &str, min: u32, divider: u32) -> Result<()> {
        if divider < min || divider > 0xFFFF {
            error!("Cannot set {} SPI divider to invalid value {}", what, divider);
            return Err(Error::InvalidSelection(format!(
                "{} SPI divider {} outside {}..=65535",
                what, divider, min
            )));
        }
        self.regs.poke32(reg.addr(), divider)
    }

    pub fn set_mb_pl_cpld_divider(&self, divider: u32) -> Result<()> {
        self.set_divider(
            Register::MbPlSpiConfig,
            "MB CPLD",
            MIN_MB_CPLD_SPI_DIVIDER,
            divider,
        )
    }

    pub fn set_db_divider_value(&self, divider: u32) -> Result<()> {
        self.set_divider(Register::DbSpiConfig, "DB", MIN_DB_CPLD_SPI_DIVIDER, divider)
    }

    fn check_mb_pl_cpld(&self) -> Result<()> {
        let signature = self.mb_pl_cpld.peek32(PlCpldRegister::Signature as u32)?;
        if signature != MB_PL_CPLD_SIGNATURE {
            error!(
                "MB PL CPLD signature {:X} does not match expected value {:X}",
                signature, MB_PL_CPLD_SIGNATURE
            );
            return Err(Error::SignatureMismatch {
                device: "MB PL CPLD",
                expected: MB_PL_CPLD_SIGNATURE,
                found: signature,
            });
        }
        let revision = self.mb_pl_cpld.peek32(PlCpldRegister::Revision as u32)?;
        if revision < MB_PL_CPLD_MIN_REVISION {
            error!(
                "MB PL CPLD revision {:X} is out of date. Expected value {:X}.",
                revision, MB_PL_CPLD_MIN_REVISION
            );
            return Err(Error::RevisionMismatch {
                device: "MB PL CPLD",
                found: revision,
                reason: format!(
                    "out of date, at least {:#X} required",
                    MB_PL_CPLD_MIN_REVISION
                ),
            });
        }
        Ok(())
    }

    /// Register window of the CPLD on daughterboard `db_id`.
    pub fn db_cpld_iface(&self, db_id: usize) -> Regs {
        self.db_cpld[db_id.min(1)].clone()
    }

    pub fn mb_pl_cpld_iface(&self) -> Regs {
        self.mb_pl_cpld.clone()
    }

    /// Forwards the iPass cable-present status to the CMI partner.
    pub fn enable_cable_present_forwarding(&self, enable: bool) -> Result<()> {
        self.regs.poke32(Register::Ipass.addr(), enable as u32)
    }
}
