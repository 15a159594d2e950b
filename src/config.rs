/*
   Copyright 2018 Ilya Epifanov

   Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
   http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
   http://opensource.org/licenses/MIT>, at your option. This file may not be
   copied, modified, or distributed except according to those terms.
*/
//! Board tables and the startup configuration map.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! wire_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match *self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(Error::InvalidSelection(format!(
                        "{} is not a valid {}",
                        s,
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

/// Where the base reference clock comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// Motherboard-local oscillator through the reference PLL.
    Mboard,
    /// Clocking aux board, on-board oscillator.
    Internal,
    /// Clocking aux board, external reference input.
    External,
    Gpsdo,
    Nsync,
}

wire_names!(ClockSource {
    Mboard => "mboard",
    Internal => "internal",
    External => "external",
    Gpsdo => "gpsdo",
    Nsync => "nsync",
});

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    Internal,
    External,
    Qsfp0,
    Gpsdo,
}

wire_names!(TimeSource {
    Internal => "internal",
    External => "external",
    Qsfp0 => "qsfp0",
    Gpsdo => "gpsdo",
});

/// PPS edge used for the SPLL divider sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PpsSource {
    InternalPps,
    ExternalPps,
}

wire_names!(PpsSource {
    InternalPps => "internal_pps",
    ExternalPps => "external_pps",
});

/// Direction of the clocking aux board trigger I/O connector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerIoDirection {
    Off,
    Input,
    PpsOutput,
}

wire_names!(TriggerIoDirection {
    Off => "off",
    Input => "input",
    PpsOutput => "pps_output",
});

/// Converter direction of a daughterboard channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
    Both,
}

wire_names!(Direction {
    Rx => "rx",
    Tx => "tx",
    Both => "both",
});

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Channel {
    Zero,
    One,
    Both,
}

wire_names!(Channel {
    Zero => "0",
    One => "1",
    Both => "both",
});

pub const DEFAULT_INT_CLOCK_FREQ: f64 = 25e6;
pub const DEFAULT_GPSDO_CLOCK_FREQ: f64 = 10e6;
pub const DEFAULT_EXT_CLOCK_FREQ: f64 = 10e6;
pub const DEFAULT_MGT_CLOCK_RATE: f64 = 156.25e6;
pub const DEFAULT_MASTER_CLOCK_RATE: f64 = 122.88e6;
pub const DEFAULT_RPLL_REF_SOURCE: &str = "100M_reliable_clk";
pub const DEFAULT_CLOCK_SOURCE: ClockSource = ClockSource::Mboard;
pub const DEFAULT_TIME_SOURCE: TimeSource = TimeSource::Internal;

/// Every `(clock, time)` pairing the board can be set to.
pub const VALID_SYNC_SOURCES: [(ClockSource, TimeSource); 7] = [
    (ClockSource::Mboard, TimeSource::Internal),
    (ClockSource::Internal, TimeSource::Internal),
    (ClockSource::External, TimeSource::External),
    (ClockSource::External, TimeSource::Internal),
    (ClockSource::Gpsdo, TimeSource::Gpsdo),
    (ClockSource::Gpsdo, TimeSource::Internal),
    (ClockSource::Nsync, TimeSource::Internal),
];

pub fn is_valid_sync_source(clock_source: ClockSource, time_source: TimeSource) -> bool {
    VALID_SYNC_SOURCES.contains(&(clock_source, time_source))
}

/// Sample PLL settings for one master clock rate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct McrEntry {
    pub master_clock_rate: f64,
    pub sample_clock_freq: f64,
    /// RFDC decimation the FPGA image must be built with.
    pub decimation: u32,
    pub legacy_mode: bool,
    pub halfband: bool,
}

const fn mcr(
    master_clock_rate: f64,
    sample_clock_freq: f64,
    decimation: u32,
    legacy_mode: bool,
    halfband: bool,
) -> McrEntry {
    McrEntry {
        master_clock_rate,
        sample_clock_freq,
        decimation,
        legacy_mode,
        halfband,
    }
}

/// Supported master clock rates, in order of preference for a given
/// decimation.
pub const MASTER_CLOCK_RATES: [McrEntry; 5] = [
    mcr(491.52e6, 2.94912e9, 2, false, false),
    mcr(245.76e6, 2.94912e9, 2, false, true),
    mcr(122.88e6, 2.94912e9, 8, false, false),
    mcr(500e6, 3e9, 2, false, false),
    mcr(200e6, 3e9, 4, true, false),
];

pub fn lookup_master_clock_rate(rate: f64) -> Option<&'static McrEntry> {
    MASTER_CLOCK_RATES
        .iter()
        .find(|entry| entry.master_clock_rate == rate)
}

/// Tile/block pairs wired to one daughterboard slot, channel 0 first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfdcSlotMap {
    pub adc: [(u32, u32); 2],
    pub dac: [(u32, u32); 2],
}

pub fn default_rfdc_map() -> Vec<RfdcSlotMap> {
    vec![
        RfdcSlotMap {
            adc: [(0, 1), (0, 0)],
            dac: [(0, 0), (0, 1)],
        },
        RfdcSlotMap {
            adc: [(2, 1), (2, 0)],
            dac: [(1, 0), (1, 1)],
        },
    ]
}

/// Startup map resolved once at bring-up and handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Motherboard revision from the board identity EEPROM.
    pub mboard_rev: u32,
    /// `None` picks the aux board oscillator when an aux board is fitted and
    /// the motherboard clock otherwise.
    pub clock_source: Option<ClockSource>,
    pub time_source: TimeSource,
    pub ext_clock_freq: f64,
    pub master_clock_rate: Option<f64>,
    pub int_clock_freq: f64,
    pub mgt_clock_rate: f64,
    pub rpll_ref_source: String,
    pub pps_export: bool,
    pub trig_direction: TriggerIoDirection,
    pub rfdc_map: Vec<RfdcSlotMap>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            mboard_rev: 3,
            clock_source: None,
            time_source: DEFAULT_TIME_SOURCE,
            ext_clock_freq: DEFAULT_EXT_CLOCK_FREQ,
            master_clock_rate: None,
            int_clock_freq: DEFAULT_INT_CLOCK_FREQ,
            mgt_clock_rate: DEFAULT_MGT_CLOCK_RATE,
            rpll_ref_source: DEFAULT_RPLL_REF_SOURCE.into(),
            pps_export: true,
            trig_direction: TriggerIoDirection::PpsOutput,
            rfdc_map: default_rfdc_map(),
        }
    }
}

impl BoardConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BoardConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        if config.rfdc_map.is_empty() {
            return Err(Error::Config("rfdc_map lists no daughterboard slots".into()));
        }
        Ok(config)
    }
}

/// Per-session overrides passed to `session_init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionArgs {
    pub clock_source: Option<ClockSource>,
    pub time_source: Option<TimeSource>,
    pub master_clock_rate: Option<f64>,
    pub pps_export: Option<bool>,
    pub trig_direction: Option<TriggerIoDirection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_and_print() {
        assert_eq!("gpsdo".parse::<ClockSource>().unwrap(), ClockSource::Gpsdo);
        assert_eq!("qsfp0".parse::<TimeSource>().unwrap(), TimeSource::Qsfp0);
        assert_eq!(
            "external_pps".parse::<PpsSource>().unwrap(),
            PpsSource::ExternalPps
        );
        assert_eq!(TriggerIoDirection::PpsOutput.to_string(), "pps_output");
        assert!(matches!(
            "rubidium".parse::<ClockSource>(),
            Err(Error::InvalidSelection(_))
        ));
    }

    #[test]
    fn valid_pairs_exclude_qsfp0() {
        assert!(is_valid_sync_source(ClockSource::External, TimeSource::Internal));
        assert!(!is_valid_sync_source(ClockSource::Mboard, TimeSource::External));
        for &clock in &[
            ClockSource::Mboard,
            ClockSource::Internal,
            ClockSource::External,
            ClockSource::Gpsdo,
            ClockSource::Nsync,
        ] {
            assert!(!is_valid_sync_source(clock, TimeSource::Qsfp0));
        }
    }

    #[test]
    fn master_clock_rate_table() {
        let entry = lookup_master_clock_rate(491.52e6).unwrap();
        assert_eq!(entry.sample_clock_freq, 2.94912e9);
        assert_eq!(entry.decimation, 2);
        assert!(!entry.legacy_mode && !entry.halfband);
        assert!(lookup_master_clock_rate(200e6).unwrap().legacy_mode);
        assert!(lookup_master_clock_rate(250e6).is_none());
    }

    #[test]
    fn board_config_from_partial_json() {
        let config = BoardConfig::from_json(
            r#"{ "mboard_rev": 2, "clock_source": "external", "ext_clock_freq": 20e6 }"#,
        )
        .unwrap();
        assert_eq!(config.mboard_rev, 2);
        assert_eq!(config.clock_source, Some(ClockSource::External));
        assert_eq!(config.ext_clock_freq, 20e6);
        assert_eq!(config.rfdc_map, default_rfdc_map());
        assert_eq!(config.trig_direction, TriggerIoDirection::PpsOutput);
    }

    #[test]
    fn board_config_rejects_garbage() {
        assert!(matches!(
            BoardConfig::from_json(r#"{ "time_source": "sundial" }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            BoardConfig::from_json(r#"{ "rfdc_map": [] }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn session_args_round_trip_through_json() {
        let args: SessionArgs =
            serde_json::from_str(r#"{ "master_clock_rate": 245.76e6, "trig_direction": "input" }"#)
                .unwrap();
        assert_eq!(args.master_clock_rate, Some(245.76e6));
        assert_eq!(args.trig_direction, Some(TriggerIoDirection::Input));
        assert_eq!(args.clock_source, None);
    }
}
