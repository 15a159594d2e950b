/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Motherboard FPGA register block: compat number, clock and PPS control,
//! timekeepers.

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::regs::Regs;

/// FPGA compat number this crate was written against.
pub const FPGA_COMPAT: (u32, u32) = (7, 2);

#[derive(Debug, Copy, Clone)]
enum Register {
    CompatNum = 0x0000,
    DeviceId = 0x0010,
    ClockCtrl = 0x0018,
    PpsCtrl = 0x001C,
    NumTimekeepers = 0x0048,
    SerialNoLo = 0x004C,
    SerialNoHi = 0x0050,
    TimeNowLo = 0x1000,
    TimeEventLo = 0x1008,
    TimeCtrl = 0x1010,
    TimeLastPpsLo = 0x1014,
    TimeBasePeriodLo = 0x101C,
}

impl Register {
    pub fn addr(&self) -> u32 {
        *self as u32
    }

    /// Address of this register in timekeeper `tk_idx`.
    fn timekeeper(&self, tk_idx: u32) -> u32 {
        self.addr() + tk_idx * TIMEKEEPER_STRIDE
    }
}

const TIMEKEEPER_STRIDE: u32 = 12;

bitflags! {
    pub struct ClockCtrl: u32 {
        const PPS_SELECT = 0x0000_0003;
        const TRIGGER_IO_SELECT = 0x0000_0030;
        const TRIG_IO_PPS_OUTPUT = 0x0000_0010;
        const PLL_SYNC_TRIGGER = 0x0000_0100;
        const PLL_SYNC_DONE = 0x0000_0200;
        const PLL_SYNC_DELAY = 0x00FF_0000;
        const PPS_BRC_DELAY = 0xFF00_0000;
    }
}

bitflags! {
    pub struct PpsCtrl: u32 {
        const PRC_DELAY = 0x03FF_FFFF;
        const PRC_DIVIDER = 0x3000_0000;
        const ENABLE = 0x8000_0000;
    }
}

bitflags! {
    struct TimeCtrlBits: u32 {
        const SET_NOW = 0b001;
        const SET_NEXT_PPS = 0b010;
    }
}

const DEVICE_ID_PCIE_PRESENT: u32 = 0x8000_0000;

/// PPS source select field of the clock control register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PpsSelect {
    Internal25MHz = 0,
    Internal10MHz = 1,
    External = 2,
}

impl PpsSelect {
    pub fn bits(&self) -> u32 {
        *self as u32
    }
}

/// Owner of the motherboard register window.
pub struct MboardRegs {
    regs: Regs,
}

impl MboardRegs {
    pub fn new(regs: Regs) -> Self {
        MboardRegs { regs }
    }

    fn read(&self, reg: Register) -> Result<u32> {
        self.regs.peek32(reg.addr())
    }

    fn write(&self, reg: Register, value: u32) -> Result<()> {
        self.regs.poke32(reg.addr(), value)
    }

    /// Returns `(major, minor)`.
    pub fn get_compat_number(&self) -> Result<(u32, u32)> {
        let compat = self.read(Register::CompatNum)?;
        Ok(((compat >> 16) & 0xFF, compat & 0xFF))
    }

    /// Fails unless the major number matches and the minor number is at
    /// least the expected one. A newer minor is accepted with a warning.
    pub fn check_fpga_compat(&self) -> Result<()> {
        let (major, minor) = self.get_compat_number()?;
        debug!("Actual FPGA compat number: {}.{}", major, minor);
        let (expected_major, expected_minor) = FPGA_COMPAT;
        if major != expected_major {
            return Err(Error::RevisionMismatch {
                device: "FPGA",
                found: major,
                reason: format!("major compat number must be {}", expected_major),
            });
        }
        if minor < expected_minor {
            return Err(Error::RevisionMismatch {
                device: "FPGA",
                found: minor,
                reason: format!("minor compat number must be at least {}", expected_minor),
            });
        }
        if minor > expected_minor {
            warn!(
                "FPGA compat number {}.{} is newer than expected {}.{}",
                major, minor, expected_major, expected_minor
            );
        }
        Ok(())
    }

    /// Stores up to eight bytes of serial number, zero padded, little endian.
    pub fn set_serial_number(&self, serial: &[u8]) -> Result<()> {
        if serial.is_empty() || serial.len() > 8 {
            return Err(Error::InvalidSelection(format!(
                "serial number must be 1 to 8 bytes, got {}",
                serial.len()
            )));
        }
        let mut padded = [0u8; 8];
        padded[..serial.len()].copy_from_slice(serial);
        let lo = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]);
        let hi = u32::from_le_bytes([padded[4], padded[5], padded[6], padded[7]]);
        self.write(Register::SerialNoLo, lo)?;
        self.write(Register::SerialNoHi, hi)
    }

    pub fn set_device_id(&self, device_id: u16) -> Result<()> {
        trace!("Writing MB_DEVICE_ID with {:#010X}", device_id);
        self.write(Register::DeviceId, device_id as u32)
    }

    pub fn get_device_id(&self) -> Result<u16> {
        Ok((self.read(Register::DeviceId)? & 0xFFFF) as u16)
    }

    pub fn is_pcie_present(&self) -> Result<bool> {
        Ok(self.read(Register::DeviceId)? & DEVICE_ID_PCIE_PRESENT != 0)
    }

    pub fn clock_ctrl(&self) -> Result<u32> {
        self.read(Register::ClockCtrl)
    }

    pub fn set_clock_ctrl(&self, value: u32) -> Result<()> {
        self.write(Register::ClockCtrl, value)
    }

    pub fn is_pll_sync_done(&self) -> Result<bool> {
        Ok(self.clock_ctrl()? & ClockCtrl::PLL_SYNC_DONE.bits() != 0)
    }

    /// Delay programmed by the FPGA between the sync trigger and the PLL sync.
    pub fn pll_sync_delay(&self) -> Result<u32> {
        Ok((self.clock_ctrl()? & ClockCtrl::PLL_SYNC_DELAY.bits()) >> 16)
    }

    /// Rewrites the PPS delay in the base reference clock domain.
    pub fn set_pps_brc_delay(&self, delay: u8) -> Result<()> {
        let value = self.clock_ctrl()?;
        self.set_clock_ctrl((value & !ClockCtrl::PPS_BRC_DELAY.bits()) | ((delay as u32) << 24))
    }

    /// Clock control word with `select` in the PPS select field.
    pub fn with_pps_select(value: u32, select: PpsSelect) -> u32 {
        (value & !ClockCtrl::PPS_SELECT.bits()) | select.bits()
    }

    /// Clock control word routing the trigger I/O either from the FPGA PPS
    /// or to nobody.
    pub fn with_trigger_io(value: u32, pps_output: bool) -> u32 {
        let value = value & !ClockCtrl::TRIGGER_IO_SELECT.bits();
        if pps_output {
            value | ClockCtrl::TRIG_IO_PPS_OUTPUT.bits()
        } else {
            value
        }
    }

    pub fn set_pps_ctrl(&self, value: PpsCtrl) -> Result<()> {
        self.write(Register::PpsCtrl, value.bits())
    }

    pub fn get_num_timekeepers(&self) -> Result<u32> {
        self.read(Register::NumTimekeepers)
    }

    fn read_u64(&self, addr_lo: u32) -> Result<u64> {
        let lo = self.regs.peek32(addr_lo)? as u64;
        let hi = self.regs.peek32(addr_lo + 4)? as u64;
        Ok(hi << 32 | lo)
    }

    fn write_u64(&self, addr_lo: u32, value: u64) -> Result<()> {
        self.regs.poke32(addr_lo, (value & 0xFFFF_FFFF) as u32)?;
        self.regs.poke32(addr_lo + 4, (value >> 32) as u32)
    }

    /// Time in ticks, either now or latched at the last PPS edge.
    pub fn get_timekeeper_time(&self, tk_idx: u32, last_pps: bool) -> Result<u64> {
        let reg = if last_pps {
            Register::TimeLastPpsLo
        } else {
            Register::TimeNowLo
        };
        self.read_u64(reg.timekeeper(tk_idx))
    }

    pub fn set_timekeeper_time(&self, tk_idx: u32, ticks: u64, next_pps: bool) -> Result<()> {
        trace!(
            "Setting time on timekeeper {} to {} {}",
            tk_idx,
            ticks,
            if next_pps { "on next pps" } else { "now" }
        );
        self.write_u64(Register::TimeEventLo.timekeeper(tk_idx), ticks)?;
        let ctrl = if next_pps {
            TimeCtrlBits::SET_NEXT_PPS
        } else {
            TimeCtrlBits::SET_NOW
        };
        self.regs
            .poke32(Register::TimeCtrl.timekeeper(tk_idx), ctrl.bits())
    }

    /// Tick period as a 64-bit fixed point value split over two registers.
    pub fn set_tick_period(&self, tk_idx: u32, period: u64) -> Result<()> {
        self.write_u64(Register::TimeBasePeriodLo.timekeeper(tk_idx), period)
    }
}
