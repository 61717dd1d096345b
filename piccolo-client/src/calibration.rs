//! Conversion between raw register values and physical units.
use std::{collections::BTreeMap, fs, path::Path};

use serde::Deserialize;

use crate::error::ClientError;

const DEFAULT_CLOCK_MHZ: f64 = 125.0;
/// Full scale of the 14-bit ADC.
const DEFAULT_FULL_SCALE: f64 = 8192.0;

fn default_clock_mhz() -> f64 {
    DEFAULT_CLOCK_MHZ
}

fn default_full_scale() -> f64 {
    DEFAULT_FULL_SCALE
}

/// Gain and offset of one ADC channel.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
pub struct ChannelCalibration {
    pub gain: f64,
    pub offset: f64,
}

/// The physical quantity a measurement register holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Quantity {
    /// Peak intensity in volts.
    Intensity,
    /// Integrated intensity in volt-milliseconds.
    Area,
    /// Duration in milliseconds.
    Width,
}

impl Quantity {
    /// Derives the quantity and the channel from a register name such as
    /// `high_intensity_thresh[1]`. Names without an index refer to channel 0.
    pub fn of_register(name: &str) -> Option<(Quantity, usize)> {
        let base = name.split('[').next().unwrap_or(name);
        let quantity = if base.contains("intensity") {
            Quantity::Intensity
        } else if base.contains("area") {
            Quantity::Area
        } else if base.contains("width") {
            Quantity::Width
        } else {
            return None;
        };
        Some((quantity, channel_index(name)?))
    }
}

fn channel_index(name: &str) -> Option<usize> {
    match name.split_once('[') {
        None => Some(0),
        Some((_, index)) => index.strip_suffix(']')?.parse().ok(),
    }
}

/// Per-channel ADC calibration and the gateware clock, loaded once before streaming.
///
/// The file format is
///
/// ```json
/// {
///     "voltage_calibration": { "0": { "gain": 1.0, "offset": 0.0 }, "1": { "gain": 1.0, "offset": 0.0 } },
///     "clock_MHz": 125,
///     "full_scale": 8192
/// }
/// ```
///
/// `clock_MHz` and `full_scale` are optional.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Calibration {
    #[serde(rename = "voltage_calibration")]
    channels: BTreeMap<usize, ChannelCalibration>,
    #[serde(rename = "clock_MHz", default = "default_clock_mhz")]
    clock_mhz: f64,
    #[serde(default = "default_full_scale")]
    full_scale: f64,
}

impl Calibration {
    pub fn new(channels: impl IntoIterator<Item = (usize, ChannelCalibration)>) -> Calibration {
        Calibration {
            channels: channels.into_iter().collect(),
            clock_mhz: DEFAULT_CLOCK_MHZ,
            full_scale: DEFAULT_FULL_SCALE,
        }
    }

    pub fn with_clock_mhz(mut self, clock_mhz: f64) -> Self {
        self.clock_mhz = clock_mhz;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Calibration, ClientError> {
        let calibration: Calibration = serde_json::from_str(json)?;
        calibration.validate()?;
        Ok(calibration)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Calibration, ClientError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ClientError::CalibrationIo {
            path: path.to_path_buf(),
            source,
        })?;
        let calibration = Calibration::from_json_str(&json)?;
        log::info!(
            "Loaded calibration for {} channels from {}",
            calibration.channels.len(),
            path.display()
        );
        Ok(calibration)
    }

    fn validate(&self) -> Result<(), ClientError> {
        if !(self.clock_mhz > 0.0) {
            return Err(ClientError::InvalidCalibration(format!(
                "clock_MHz must be positive, got {}",
                self.clock_mhz
            )));
        }
        if !(self.full_scale > 0.0) {
            return Err(ClientError::InvalidCalibration(format!(
                "full_scale must be positive, got {}",
                self.full_scale
            )));
        }
        if let Some((channel, _)) = self.channels.iter().find(|(_, c)| c.gain == 0.0) {
            return Err(ClientError::InvalidCalibration(format!(
                "gain of channel {} is zero",
                channel
            )));
        }
        Ok(())
    }

    pub fn clock_mhz(&self) -> f64 {
        self.clock_mhz
    }

    pub fn channel(&self, channel: usize) -> Result<&ChannelCalibration, ClientError> {
        self.channels
            .get(&channel)
            .ok_or(ClientError::MissingChannel(channel))
    }

    fn cycles_per_ms(&self) -> f64 {
        self.clock_mhz * 1000.0
    }

    /// Converts a raw register value of `channel` to `quantity`'s physical unit.
    pub fn to_physical(&self, quantity: Quantity, channel: usize, raw: f64) -> Result<f64, ClientError> {
        Ok(match quantity {
            Quantity::Intensity => self.volts(channel, raw)?,
            Quantity::Area => self.volts(channel, raw)? / self.cycles_per_ms(),
            Quantity::Width => raw / self.cycles_per_ms(),
        })
    }

    /// Inverse of [`Calibration::to_physical`], rounded to the nearest raw value.
    pub fn to_raw(&self, quantity: Quantity, channel: usize, physical: f64) -> Result<i64, ClientError> {
        let raw = match quantity {
            Quantity::Intensity => self.raw_from_volts(channel, physical)?,
            Quantity::Area => self.raw_from_volts(channel, physical * self.cycles_per_ms())?,
            Quantity::Width => physical * self.cycles_per_ms(),
        };
        Ok(raw.round() as i64)
    }

    fn volts(&self, channel: usize, raw: f64) -> Result<f64, ClientError> {
        let ChannelCalibration { gain, offset } = *self.channel(channel)?;
        Ok((raw - offset) * gain / self.full_scale)
    }

    fn raw_from_volts(&self, channel: usize, volts: f64) -> Result<f64, ClientError> {
        let ChannelCalibration { gain, offset } = *self.channel(channel)?;
        Ok(volts * self.full_scale / gain + offset)
    }
}
