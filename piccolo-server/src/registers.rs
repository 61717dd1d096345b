//! Compilation of declarative register catalogs into byte-exact encode/decode rules.
//!
//! A catalog is a JSON document listing the registers of one gateware revision:
//!
//! ```json
//! {
//!   "fpga_inputs": [
//!     { "name": "low_intensity_thresh", "addr": ["0x0010", "0x0014"], "dtype": "14'sd", "default": 0 }
//!   ],
//!   "fpga_outputs": [
//!     { "name": "droplet_id", "addr": "0x0100", "dtype": "32'd" }
//!   ]
//! }
//! ```
//!
//! Entries with a list of addresses expand into one register per address, named
//! `name[0]`, `name[1]`, ... Every register occupies a 4-byte block of the mapped region.
use std::{collections::HashMap, fs, path::Path};

use piccolo_protocol::RegisterValue;
use serde::Deserialize;

use crate::error::{ConfigError, RegisterError};

/// Size of the memory block behind every register.
pub const BLOCK_LEN: usize = 4;

/// The closed set of register data types, named after their Verilog declarations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DataType {
    /// `32'd`
    U32,
    /// `32'sd`
    I32,
    /// `16'b`
    Bits16,
    /// `14'sd`
    I14,
    /// `3'b`
    Bits3,
    /// `2'b`
    Bits2,
    /// `1'b`
    Bits1,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::U32,
        DataType::I32,
        DataType::Bits16,
        DataType::I14,
        DataType::Bits3,
        DataType::Bits2,
        DataType::Bits1,
    ];

    pub fn from_tag(tag: &str) -> Option<DataType> {
        DataType::ALL.into_iter().find(|dtype| dtype.tag() == tag)
    }

    pub fn tag(self) -> &'static str {
        match self {
            DataType::U32 => "32'd",
            DataType::I32 => "32'sd",
            DataType::Bits16 => "16'b",
            DataType::I14 => "14'sd",
            DataType::Bits3 => "3'b",
            DataType::Bits2 => "2'b",
            DataType::Bits1 => "1'b",
        }
    }

    /// Number of bytes the value is packed into at the start of its block.
    pub fn packed_len(self) -> usize {
        match self {
            DataType::U32 | DataType::I32 => 4,
            DataType::Bits16 | DataType::I14 => 2,
            DataType::Bits3 | DataType::Bits2 | DataType::Bits1 => 1,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            DataType::U32 | DataType::I32 => 32,
            DataType::Bits16 => 16,
            DataType::I14 => 14,
            DataType::Bits3 => 3,
            DataType::Bits2 => 2,
            DataType::Bits1 => 1,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, DataType::I32 | DataType::I14)
    }

    /// Bitfields travel as strings of binary digits instead of integers.
    pub fn is_bitfield(self) -> bool {
        matches!(
            self,
            DataType::Bits16 | DataType::Bits3 | DataType::Bits2 | DataType::Bits1
        )
    }

    fn mask(self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    /// Encodes `value` into a zero-filled block.
    ///
    /// Values wider than the register are truncated to its bit width. Bitfields accept
    /// binary literals (with or without `0b` prefix) as well as plain integers.
    pub fn encode(self, value: &RegisterValue) -> Result<[u8; BLOCK_LEN], RegisterError> {
        let raw = match value {
            RegisterValue::Int(value) => *value as u64,
            RegisterValue::Bits(bits) if self.is_bitfield() => parse_bits(bits)?,
            RegisterValue::Bits(bits) => return Err(RegisterError::ExpectedInteger(bits.clone())),
        } & self.mask();

        let mut block = [0u8; BLOCK_LEN];
        block[..self.packed_len()].copy_from_slice(&raw.to_le_bytes()[..self.packed_len()]);
        Ok(block)
    }

    pub fn decode(self, block: [u8; BLOCK_LEN]) -> RegisterValue {
        let raw = block[..self.packed_len()]
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
            & self.mask();

        if self.is_bitfield() {
            RegisterValue::Bits(format!("{:b}", raw))
        } else if self.is_signed() && raw & (1 << (self.bits() - 1)) != 0 {
            RegisterValue::Int(raw as i64 - (1i64 << self.bits()))
        } else {
            RegisterValue::Int(raw as i64)
        }
    }
}

/// Parses binary digits of any length; digits beyond the low 64 bits are shifted out.
fn parse_bits(bits: &str) -> Result<u64, RegisterError> {
    let digits = bits.strip_prefix("0b").unwrap_or(bits);
    if digits.is_empty() {
        return Err(RegisterError::InvalidBits(bits.to_string()));
    }
    digits.bytes().try_fold(0u64, |acc, digit| match digit {
        b'0' | b'1' => Ok((acc << 1) | u64::from(digit - b'0')),
        _ => Err(RegisterError::InvalidBits(bits.to_string())),
    })
}

/// Whether the host or the gateware drives a register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// A single compiled register.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterDescriptor {
    name: String,
    address: usize,
    dtype: DataType,
    direction: Direction,
    default: Option<RegisterValue>,
}

impl RegisterDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte offset of the register block inside the mapped region.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn default_value(&self) -> Option<&RegisterValue> {
        self.default.as_ref()
    }

    pub fn encode(&self, value: &RegisterValue) -> Result<[u8; BLOCK_LEN], RegisterError> {
        self.dtype.encode(value)
    }

    pub fn decode(&self, block: [u8; BLOCK_LEN]) -> RegisterValue {
        self.dtype.decode(block)
    }
}

/// Catalog file as written by hand.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default, rename = "fpga_inputs")]
    pub inputs: Vec<RegisterEntry>,
    #[serde(default, rename = "fpga_outputs")]
    pub outputs: Vec<RegisterEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    pub addr: Address,
    pub dtype: String,
    #[serde(default)]
    pub default: Option<DefaultValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Address {
    Single(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    /// One default per address; `null` leaves that register untouched.
    PerAddress(Vec<Option<RegisterValue>>),
    /// Applied to every address.
    Broadcast(RegisterValue),
}

impl CatalogConfig {
    pub fn from_json_str(json: &str) -> Result<CatalogConfig, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<CatalogConfig, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

fn parse_address(name: &str, addr: &str) -> Result<usize, ConfigError> {
    let digits = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr);
    usize::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidAddress {
        name: name.to_string(),
        addr: addr.to_string(),
    })
}

/// All registers of one gateware revision, in declaration order. Immutable once compiled.
#[derive(Clone, Debug, Default)]
pub struct RegisterCatalog {
    registers: Vec<RegisterDescriptor>,
    by_name: HashMap<String, usize>,
}

impl RegisterCatalog {
    /// Expands multi-address entries and resolves every data type tag.
    pub fn compile(config: &CatalogConfig) -> Result<RegisterCatalog, ConfigError> {
        let mut catalog = RegisterCatalog::default();
        let sections = [
            (Direction::Input, &config.inputs),
            (Direction::Output, &config.outputs),
        ];
        for (direction, entries) in sections {
            for entry in entries {
                catalog.add_entry(entry, direction)?;
            }
        }
        log::debug!("Compiled register catalog with {} registers", catalog.len());
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<RegisterCatalog, ConfigError> {
        Self::compile(&CatalogConfig::from_file(path)?)
    }

    fn add_entry(&mut self, entry: &RegisterEntry, direction: Direction) -> Result<(), ConfigError> {
        let dtype = DataType::from_tag(&entry.dtype).ok_or_else(|| ConfigError::UnsupportedType {
            name: entry.name.clone(),
            tag: entry.dtype.clone(),
        })?;

        match &entry.addr {
            Address::Single(addr) => {
                let default = match &entry.default {
                    None => None,
                    Some(DefaultValue::Broadcast(value)) => Some(value.clone()),
                    Some(DefaultValue::PerAddress(values)) if values.len() == 1 => values[0].clone(),
                    Some(DefaultValue::PerAddress(values)) => {
                        return Err(ConfigError::DefaultCountMismatch {
                            name: entry.name.clone(),
                            addresses: 1,
                            defaults: values.len(),
                        });
                    }
                };
                let address = parse_address(&entry.name, addr)?;
                self.insert(entry.name.clone(), address, dtype, direction, default)
            }
            Address::List(addrs) => {
                if let Some(DefaultValue::PerAddress(values)) = &entry.default
                    && values.len() != addrs.len()
                {
                    return Err(ConfigError::DefaultCountMismatch {
                        name: entry.name.clone(),
                        addresses: addrs.len(),
                        defaults: values.len(),
                    });
                }
                for (index, addr) in addrs.iter().enumerate() {
                    let name = format!("{}[{}]", entry.name, index);
                    let default = match &entry.default {
                        None => None,
                        Some(DefaultValue::Broadcast(value)) => Some(value.clone()),
                        Some(DefaultValue::PerAddress(values)) => values[index].clone(),
                    };
                    let address = parse_address(&name, addr)?;
                    self.insert(name, address, dtype, direction, default)?;
                }
                Ok(())
            }
        }
    }

    fn insert(
        &mut self,
        name: String,
        address: usize,
        dtype: DataType,
        direction: Direction,
        default: Option<RegisterValue>,
    ) -> Result<(), ConfigError> {
        if self.by_name.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        if let Some(value) = &default {
            dtype
                .encode(value)
                .map_err(|source| ConfigError::InvalidDefault {
                    name: name.clone(),
                    source,
                })?;
        }
        log::trace!(
            "Register {} at 0x{:04x} as {} ({:?})",
            name,
            address,
            dtype.tag(),
            direction
        );
        self.by_name.insert(name.clone(), self.registers.len());
        self.registers.push(RegisterDescriptor {
            name,
            address,
            dtype,
            direction,
            default,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RegisterDescriptor, RegisterError> {
        self.by_name
            .get(name)
            .map(|index| &self.registers[*index])
            .ok_or_else(|| RegisterError::UnknownName(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Number of bytes a memory region needs to back every register.
    pub fn extent(&self) -> usize {
        self.registers
            .iter()
            .map(|register| register.address + BLOCK_LEN)
            .max()
            .unwrap_or(0)
    }
}
