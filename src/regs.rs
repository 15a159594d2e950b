/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Register windows.
//!
//! Every controller in this crate talks to its hardware through a
//! [`RegisterInterface`]: 32-bit peek/poke at a byte offset inside one named
//! window. The window may be memory mapped (UIO), or framed over SPI or I²C;
//! the adapters for the latter two are built on the `embedded-hal` blocking
//! bus traits.

use std::sync::{Arc, Mutex};

use crate::error::{bus_error, Error, Result};
use crate::hal::blocking::i2c;
use crate::hal::blocking::spi;

/// 32-bit register access to one register window.
pub trait RegisterInterface: Send + Sync {
    fn peek32(&self, addr: u32) -> Result<u32>;
    fn poke32(&self, addr: u32, value: u32) -> Result<()>;
}

/// Shared handle to a register window.
pub type Regs = Arc<dyn RegisterInterface>;

/// Offset view into a larger window, e.g. a CPLD behind the ctrlport bridge.
pub struct Window {
    parent: Regs,
    offset: u32,
}

impl Window {
    pub fn new(parent: Regs, offset: u32) -> Self {
        Window { parent, offset }
    }
}

impl RegisterInterface for Window {
    fn peek32(&self, addr: u32) -> Result<u32> {
        self.parent.peek32(self.offset + addr)
    }

    fn poke32(&self, addr: u32, value: u32) -> Result<()> {
        self.parent.poke32(self.offset + addr, value)
    }
}

/// Layout of one SPI register transaction.
///
/// A frame is `bytes` long, sent MSB first. The address sits at
/// `addr_shift`, the data at `data_shift`, and the read or write flag is
/// OR'ed in depending on the direction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SpiFrame {
    pub bytes: usize,
    pub addr_shift: u32,
    pub data_shift: u32,
    pub data_mask: u64,
    pub read_flag: u64,
    pub write_flag: u64,
}

impl SpiFrame {
    /// Motherboard CPLD: 48 bit frame, 15 bit address, 32 bit data.
    pub const CPLD: SpiFrame = SpiFrame {
        bytes: 6,
        addr_shift: 32,
        data_shift: 0,
        data_mask: 0xFFFF_FFFF,
        read_flag: 0,
        write_flag: 1 << 47,
    };

    /// Sample PLL: 24 bit frame, 15 bit address, 8 bit data.
    pub const SAMPLE_PLL: SpiFrame = SpiFrame {
        bytes: 3,
        addr_shift: 8,
        data_shift: 0,
        data_mask: 0xFF,
        read_flag: 1 << 23,
        write_flag: 0,
    };

    fn encode(&self, flag: u64, addr: u32, data: u32) -> [u8; 8] {
        let word =
            flag | ((addr as u64) << self.addr_shift) | ((data as u64 & self.data_mask) << self.data_shift);
        word.to_be_bytes()
    }

    fn decode(&self, frame: &[u8]) -> u32 {
        let word = frame.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
        ((word >> self.data_shift) & self.data_mask) as u32
    }
}

/// Register window framed over a blocking SPI bus.
pub struct SpiRegs<SPI> {
    spi: Mutex<SPI>,
    frame: SpiFrame,
}

impl<SPI, E> SpiRegs<SPI>
where
    SPI: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E> + Send,
    E: core::fmt::Debug,
{
    pub fn new(spi: SPI, frame: SpiFrame) -> Self {
        SpiRegs {
            spi: Mutex::new(spi),
            frame,
        }
    }

    pub fn release(self) -> Result<SPI> {
        self.spi.into_inner().map_err(|_| Error::Poisoned)
    }
}

impl<SPI, E> RegisterInterface for SpiRegs<SPI>
where
    SPI: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E> + Send,
    E: core::fmt::Debug,
{
    fn peek32(&self, addr: u32) -> Result<u32> {
        let bytes = self.frame.bytes;
        let encoded = self.frame.encode(self.frame.read_flag, addr, 0);
        let mut buffer = [0u8; 8];
        buffer[..bytes].copy_from_slice(&encoded[8 - bytes..]);

        let mut bus = self.spi.lock().map_err(|_| Error::Poisoned)?;
        let response = spi::Transfer::transfer(&mut *bus, &mut buffer[..bytes]).map_err(bus_error)?;
        Ok(self.frame.decode(response))
    }

    fn poke32(&self, addr: u32, value: u32) -> Result<()> {
        let bytes = self.frame.bytes;
        let encoded = self.frame.encode(self.frame.write_flag, addr, value);

        let mut bus = self.spi.lock().map_err(|_| Error::Poisoned)?;
        spi::Write::write(&mut *bus, &encoded[8 - bytes..]).map_err(bus_error)
    }
}

/// Register window on an I²C device with one-byte register addresses and
/// one-byte data.
pub struct I2cRegs<I2C> {
    i2c: Mutex<I2C>,
    address: u8,
}

impl<I2C, E> I2cRegs<I2C>
where
    I2C: i2c::WriteRead<Error = E> + i2c::Write<Error = E> + Send,
    E: core::fmt::Debug,
{
    pub fn new(i2c: I2C, address: u8) -> Self {
        I2cRegs {
            i2c: Mutex::new(i2c),
            address,
        }
    }

    fn reg(addr: u32) -> Result<u8> {
        if addr > 0xFF {
            return Err(Error::CommunicationError(format!(
                "register address {:#x} does not fit in one byte",
                addr
            )));
        }
        Ok(addr as u8)
    }
}

impl<I2C, E> RegisterInterface for I2cRegs<I2C>
where
    I2C: i2c::WriteRead<Error = E> + i2c::Write<Error = E> + Send,
    E: core::fmt::Debug,
{
    fn peek32(&self, addr: u32) -> Result<u32> {
        let reg = Self::reg(addr)?;
        let mut buffer = [0u8; 1];
        let mut bus = self.i2c.lock().map_err(|_| Error::Poisoned)?;
        i2c::WriteRead::write_read(&mut *bus, self.address, &[reg], &mut buffer)
            .map_err(bus_error)?;
        Ok(buffer[0] as u32)
    }

    fn poke32(&self, addr: u32, value: u32) -> Result<()> {
        let reg = Self::reg(addr)?;
        let mut bus = self.i2c.lock().map_err(|_| Error::Poisoned)?;
        i2c::Write::write(&mut *bus, self.address, &[reg, value as u8]).map_err(bus_error)
    }
}
