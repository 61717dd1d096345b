use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Every fixed frame and every JSON header on the wire is exactly this long.
pub const FRAME_LEN: usize = 16;

/// Number of samples per channel the device acquires by default.
pub const DEFAULT_SAMPLES_PER_CHANNEL: usize = 4096;

/// Upper bound for a JSON payload announced in a length header.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Number of bytes of one sample on the buffer stream.
pub const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

/// The TCP ports of the four services of one instrument.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ports {
    /// Receives shutdown requests.
    pub control: u16,
    /// Replies to acquire requests with the latest raw sample buffer.
    pub buffer_stream: u16,
    /// Pushes register snapshots at a fixed cadence.
    pub state_stream: u16,
    /// Receives register write requests.
    pub state_set: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            control: 5000,
            buffer_stream: 5001,
            state_stream: 5002,
            state_set: 5003,
        }
    }
}

/// The action requested by a fixed 16-byte command frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    /// Request one buffer from the buffer stream.
    Acquire,
    /// Terminate the server process.
    Shutdown,
    /// Any opcode the protocol does not define.
    Unknown(u32),
}

impl Opcode {
    const ACQUIRE: u32 = 3;
    const SHUTDOWN: u32 = 99;

    pub fn from_code(code: u32) -> Opcode {
        match code {
            Self::ACQUIRE => Opcode::Acquire,
            Self::SHUTDOWN => Opcode::Shutdown,
            other => Opcode::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Opcode::Acquire => Self::ACQUIRE,
            Opcode::Shutdown => Self::SHUTDOWN,
            Opcode::Unknown(code) => code,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Acquire => write!(f, "acquire ({})", Self::ACQUIRE),
            Opcode::Shutdown => write!(f, "shutdown ({})", Self::SHUTDOWN),
            Opcode::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// The decoded value of a single register.
///
/// Integer registers carry a number; bitfield registers carry a string of binary digits
/// such as `"101"`. On the wire both are plain JSON values.
///
/// Integers above `i64::MAX` are accepted and wrap into the low 64 bits; registers
/// keep at most 32 of them anyway.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged, from = "WireValue")]
pub enum RegisterValue {
    Int(i64),
    Bits(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
    Int(i64),
    Wide(u64),
    Bits(String),
}

impl From<WireValue> for RegisterValue {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Int(value) => RegisterValue::Int(value),
            WireValue::Wide(value) => RegisterValue::Int(value as i64),
            WireValue::Bits(bits) => RegisterValue::Bits(bits),
        }
    }
}

impl RegisterValue {
    /// The integer payload, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RegisterValue::Int(value) => Some(*value),
            RegisterValue::Bits(_) => None,
        }
    }

    /// The binary-digit payload, if this is a bitfield value.
    pub fn as_bits(&self) -> Option<&str> {
        match self {
            RegisterValue::Int(_) => None,
            RegisterValue::Bits(bits) => Some(bits),
        }
    }
}

impl From<i64> for RegisterValue {
    fn from(value: i64) -> Self {
        RegisterValue::Int(value)
    }
}

impl From<&str> for RegisterValue {
    fn from(value: &str) -> Self {
        RegisterValue::Bits(value.to_string())
    }
}

impl From<String> for RegisterValue {
    fn from(value: String) -> Self {
        RegisterValue::Bits(value)
    }
}

impl Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Int(value) => write!(f, "{}", value),
            RegisterValue::Bits(bits) => write!(f, "0b{}", bits),
        }
    }
}

/// One full read pass over every register, keyed by register name.
///
/// A snapshot is not transactionally consistent: registers written while the pass
/// was running may show old and new values side by side.
pub type Snapshot = BTreeMap<String, RegisterValue>;

/// Payload of the state-set service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    pub name: String,
    pub value: RegisterValue,
}

impl SetRequest {
    pub fn new(name: impl Into<String>, value: impl Into<RegisterValue>) -> SetRequest {
        SetRequest {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The latest two-channel acquisition as transferred on the buffer stream.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SampleBuffer {
    ch1: Vec<f32>,
    ch2: Vec<f32>,
}

impl SampleBuffer {
    /// Creates a buffer from both channels. Both channels must hold the same number of samples.
    pub fn new(ch1: Vec<f32>, ch2: Vec<f32>) -> Result<SampleBuffer, ProtocolError> {
        if ch1.len() != ch2.len() {
            return Err(ProtocolError::InvalidFormat(format!(
                "Channel length mismatch: {} vs {}",
                ch1.len(),
                ch2.len()
            )));
        }
        Ok(SampleBuffer { ch1, ch2 })
    }

    /// A buffer of `samples_per_channel` zero samples on both channels.
    pub fn zeros(samples_per_channel: usize) -> SampleBuffer {
        SampleBuffer {
            ch1: vec![0.0; samples_per_channel],
            ch2: vec![0.0; samples_per_channel],
        }
    }

    /// Size of the raw reply for `samples_per_channel` samples.
    pub fn byte_len(samples_per_channel: usize) -> usize {
        2 * samples_per_channel * SAMPLE_SIZE
    }

    pub fn samples_per_channel(&self) -> usize {
        self.ch1.len()
    }

    pub fn ch1(&self) -> &[f32] {
        &self.ch1
    }

    pub fn ch2(&self) -> &[f32] {
        &self.ch2
    }

    pub fn into_channels(self) -> (Vec<f32>, Vec<f32>) {
        (self.ch1, self.ch2)
    }
}
