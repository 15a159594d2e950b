/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Motherboard CPLD: PLL reference clock gate and daughterboard resets.

use log::{error, trace, warn};

use crate::error::{Error, Result};
use crate::regs::Regs;

pub const SIGNATURE: u32 = 0x0A52_2D27;
/// Oldest compatible revision this crate understands. Bumped only on
/// breaking CPLD changes.
pub const OLDEST_REQ_COMPAT_REV: u32 = 0x2012_2114;
pub const REQ_COMPAT_REV: u32 = 0x2012_2114;
const GIT_HASH_MIN_REV: u32 = 0x2010_0809;

#[derive(Debug, Copy, Clone)]
enum Register {
    Signature = 0x0000,
    CompatRev = 0x0004,
    OldestCompatRev = 0x0008,
    GitHash = 0x0010,
    DbEnable = 0x0020,
    SerialNoLo = 0x0034,
    SerialNoHi = 0x0038,
    Cmi = 0x003C,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    /// Write side of `DB_ENABLE` is a set of one-shot commands, the read side
    /// reports state.
    pub struct DbEnable: u32 {
        const PLL_REF_CLOCK_ENABLED = 1 << 2;
        const ENABLE_CLK_DB0 = 1 << 8;
        const ENABLE_CLK_DB1 = 1 << 9;
        const ENABLE_PRC = 1 << 10;
        const DISABLE_CLK_DB0 = 1 << 12;
        const DISABLE_CLK_DB1 = 1 << 13;
        const DISABLE_PRC = 1 << 14;
        const RELEASE_RST_DB0 = 1 << 16;
        const RELEASE_RST_DB1 = 1 << 17;
        const ASSERT_RST_DB0 = 1 << 20;
        const ASSERT_RST_DB1 = 1 << 21;
    }
}

/// Splits an encoded git hash into the short hash and the dirty flag.
pub fn parse_encoded_git_hash(encoded: u32) -> (u32, bool) {
    (encoded & 0x0FFF_FFFF, encoded & 0xF000_0000 != 0)
}

pub struct MboardCpld {
    regs: Regs,
}

impl MboardCpld {
    pub fn new(regs: Regs) -> Self {
        MboardCpld { regs }
    }

    fn read(&self, reg: Register) -> Result<u32> {
        self.regs.peek32(reg.addr())
    }

    fn write(&self, reg: Register, value: u32) -> Result<()> {
        self.regs.poke32(reg.addr(), value)
    }

    pub fn check_signature(&self) -> Result<()> {
        let found = self.read(Register::Signature)?;
        if found != SIGNATURE {
            error!(
                "MB CPLD signature {:X} does not match expected value {:X}",
                found, SIGNATURE
            );
            return Err(Error::SignatureMismatch {
                device: "MB CPLD",
                expected: SIGNATURE,
                found,
            });
        }
        Ok(())
    }

    pub fn check_compat_version(&self) -> Result<()> {
        let found = self.read(Register::OldestCompatRev)?;
        let reason = if found < OLDEST_REQ_COMPAT_REV {
            "oldest compatible revision is out of date, update the CPLD image"
        } else if found > REQ_COMPAT_REV {
            "oldest compatible revision is unknown, downgrade the CPLD image"
        } else {
            return Ok(());
        };
        error!("MB CPLD {}", reason);
        Err(Error::RevisionMismatch {
            device: "MB CPLD",
            found,
            reason: reason.into(),
        })
    }

    pub fn has_compat_version(&self, min_required_version: u32) -> Result<bool> {
        Ok(self.read(Register::CompatRev)? >= min_required_version)
    }

    pub fn trace_git_hash(&self) -> Result<()> {
        if !self.has_compat_version(GIT_HASH_MIN_REV)? {
            trace!("MB CPLD build GIT Hash register not present");
            return Ok(());
        }
        let (hash, dirty) = parse_encoded_git_hash(self.read(Register::GitHash)?);
        trace!(
            "MB CPLD build GIT Hash: {:07x} ({})",
            hash,
            if dirty { "dirty" } else { "clean" }
        );
        Ok(())
    }

    pub fn is_pll_ref_clk_enabled(&self) -> Result<bool> {
        Ok(self.read(Register::DbEnable)? & DbEnable::PLL_REF_CLOCK_ENABLED.bits() != 0)
    }

    /// Gates or ungates the PLL reference clock to the daughterboards.
    ///
    /// Older CPLD images do not report the PRC state, so a readback mismatch
    /// is only logged.
    pub fn enable_pll_ref_clk(&self, enable: bool) -> Result<()> {
        let was_enabled = self.is_pll_ref_clk_enabled()?;
        if enable {
            if was_enabled {
                warn!("PRC is already enabled. Writing enable anyway.");
            }
            self.write(Register::DbEnable, DbEnable::ENABLE_PRC.bits())?;
            if !self.is_pll_ref_clk_enabled()? {
                warn!("PRC enable failed!");
            }
        } else {
            if !was_enabled {
                warn!("PRC is already in reset. Writing reset anyway.");
            }
            self.write(Register::DbEnable, DbEnable::DISABLE_PRC.bits())?;
            if self.is_pll_ref_clk_enabled()? {
                warn!("PRC reset failed!");
            }
        }
        Ok(())
    }

    fn update_db_enable(&self, set: DbEnable, clear: DbEnable) -> Result<()> {
        let value = self.read(Register::DbEnable)?;
        self.write(Register::DbEnable, (value | set.bits()) & !clear.bits())
    }

    /// Releases (`enable`) or asserts the reset of daughterboard `db_id`.
    pub fn enable_daughterboard(&self, db_id: usize, enable: bool) -> Result<()> {
        let (release, assert) = match db_id {
            0 => (DbEnable::RELEASE_RST_DB0, DbEnable::ASSERT_RST_DB0),
            _ => (DbEnable::RELEASE_RST_DB1, DbEnable::ASSERT_RST_DB1),
        };
        if enable {
            self.update_db_enable(release, assert)
        } else {
            self.update_db_enable(assert, release)
        }
    }

    pub fn enable_daughterboard_support_clock(&self, db_id: usize, enable: bool) -> Result<()> {
        let (on, off) = match db_id {
            0 => (DbEnable::ENABLE_CLK_DB0, DbEnable::DISABLE_CLK_DB0),
            _ => (DbEnable::ENABLE_CLK_DB1, DbEnable::DISABLE_CLK_DB1),
        };
        if enable {
            self.update_db_enable(on, off)
        } else {
            self.update_db_enable(off, on)
        }
    }

    /// Serial number as printed on the label, a hex string of up to 8 chars.
    pub fn set_serial_number(&self, serial: &str) -> Result<()> {
        let serial = serial.trim_end_matches('\0');
        if serial.is_empty() || serial.len() > 8 {
            return Err(Error::InvalidSelection(format!(
                "serial number {:?} must be 1 to 8 characters",
                serial
            )));
        }
        let value = u64::from_str_radix(serial, 16).map_err(|_| {
            Error::InvalidSelection(format!("serial number {:?} is not hexadecimal", serial))
        })?;
        self.write(Register::SerialNoLo, (value & 0xFFFF_FFFF) as u32)?;
        self.write(Register::SerialNoHi, (value >> 32) as u32)
    }

    /// Tells the CMI partner whether this device is ready for PCIe.
    pub fn set_cmi_device_ready(&self, ready: bool) -> Result<()> {
        self.write(Register::Cmi, ready as u32)
    }

    pub fn get_cmi_status(&self) -> Result<bool> {
        Ok(self.read(Register::Cmi)? != 0)
    }
}
