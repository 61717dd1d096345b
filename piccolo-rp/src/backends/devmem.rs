//! # Physical Memory Backend
//!
//! Registers of the Piccolo gateware and the ADC sample buffers of the scope core,
//! both mapped from `/dev/mem`.
//!
//! ## Example Usage
//!
//! ```ignore
//! use crate::backends::devmem::{DevMemRegisters, ScopeAcquisition};
//!
//! let registers = DevMemRegisters::new("/dev/mem", 0x4060_0000, 0x2000)?;
//! let scope = ScopeAcquisition::new("/dev/mem", 0x4010_0000, Duration::from_millis(100))?;
//! ```
use std::{
    fs::OpenOptions,
    io,
    num::NonZero,
    path::Path,
    ptr::{NonNull, read_volatile, write_volatile},
    thread,
    time::{Duration, Instant},
};

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use piccolo_protocol::SampleBuffer;
use piccolo_server::{Acquisition, RegisterMemory, registers::BLOCK_LEN};

/// A shared read/write mapping of a physical address range.
struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by this value and only accessed through
// volatile reads and writes; moving it to another thread does not alias it.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    fn new(path: impl AsRef<Path>, physical_base: u64, len: usize) -> io::Result<MappedRegion> {
        let device_path = path.as_ref();
        log::debug!("Opening memory device: {}", device_path.display());
        let file = OpenOptions::new().read(true).write(true).open(device_path)?;

        let offset: nix::libc::off_t = physical_base.try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Base address 0x{:x} out of range", physical_base),
            )
        })?;
        let length = NonZero::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Empty mapping"))?;

        let base = unsafe {
            log::debug!(
                "Mapping physical memory at 0x{:x} (size=0x{:x})",
                physical_base,
                len
            );
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                offset,
            )?
        };
        log::info!("Mapped 0x{:x} bytes at 0x{:x}", len, physical_base);
        Ok(MappedRegion {
            base: base.cast(),
            len,
        })
    }

    fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { read_volatile(self.base.as_ptr().add(offset).cast::<u32>()) }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { write_volatile(self.base.as_ptr().add(offset).cast::<u32>(), value) }
    }

    fn read_u8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len);
        unsafe { read_volatile(self.base.as_ptr().add(offset)) }
    }

    fn write_u8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len);
        unsafe { write_volatile(self.base.as_ptr().add(offset), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

/// Register memory of the Piccolo gateware.
pub struct DevMemRegisters {
    region: MappedRegion,
}

impl DevMemRegisters {
    pub fn new(path: impl AsRef<Path>, physical_base: u64, len: usize) -> io::Result<DevMemRegisters> {
        Ok(DevMemRegisters {
            region: MappedRegion::new(path, physical_base, len)?,
        })
    }
}

impl RegisterMemory for DevMemRegisters {
    fn size(&self) -> usize {
        self.region.len
    }

    fn read_block(&self, offset: usize) -> [u8; BLOCK_LEN] {
        if offset % 4 == 0 {
            return self.region.read_u32(offset).to_ne_bytes();
        }
        let mut block = [0u8; BLOCK_LEN];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = self.region.read_u8(offset + i);
        }
        block
    }

    fn write_block(&mut self, offset: usize, block: [u8; BLOCK_LEN]) {
        if offset % 4 == 0 {
            self.region.write_u32(offset, u32::from_ne_bytes(block));
            return;
        }
        for (i, byte) in block.into_iter().enumerate() {
            self.region.write_u8(offset + i, byte);
        }
    }
}

const CONFIG_OFFSET: usize = 0x0;
const TRIGGER_SOURCE_OFFSET: usize = 0x4;
const DECIMATION_OFFSET: usize = 0x14;
const WRITE_POINTER_OFFSET: usize = 0x18;
const CH1_BUFFER_OFFSET: usize = 0x1_0000;
const CH2_BUFFER_OFFSET: usize = 0x2_0000;

const ARM: u32 = 0x1;
const TRIGGER_NOW: u32 = 0x1;
/// 125 MS/s / 128, about 1 MS/s.
const DECIMATION: u32 = 128;

/// Samples held by each channel buffer of the scope core.
pub const BUFFER_SAMPLES: usize = 16384;
/// Full scale of the signed 14-bit ADC samples.
const FULL_SCALE: f32 = 8192.0;

const MAP_SIZE: usize = CH2_BUFFER_OFFSET + BUFFER_SAMPLES * 4;

/// Acquisition from the scope core: arms the core, triggers immediately and reads the
/// samples preceding the write pointer from both channel buffers.
pub struct ScopeAcquisition {
    region: MappedRegion,
    /// The scope core has no interrupt lines, so the trigger is polled.
    /// This timeout defines how long a poll may take before issuing a timeout error.
    poll_timeout: Duration,
}

impl ScopeAcquisition {
    pub fn new(
        path: impl AsRef<Path>,
        physical_base: u64,
        poll_timeout: Duration,
    ) -> io::Result<ScopeAcquisition> {
        let region = MappedRegion::new(path, physical_base, MAP_SIZE)?;
        region.write_u32(DECIMATION_OFFSET, DECIMATION);
        log::debug!("Scope decimation set to {}", DECIMATION);
        Ok(ScopeAcquisition {
            region,
            poll_timeout,
        })
    }

    /// Index of the oldest of the `samples` most recent samples.
    fn window_start(&self, samples: usize) -> usize {
        let write_pointer = self.region.read_u32(WRITE_POINTER_OFFSET) as usize % BUFFER_SAMPLES;
        let first = (write_pointer + BUFFER_SAMPLES - samples) % BUFFER_SAMPLES;
        log::trace!(
            "Reading {} samples starting at {} (write pointer {})",
            samples,
            first,
            write_pointer
        );
        first
    }

    fn trigger(&self) -> io::Result<()> {
        self.region.write_u32(CONFIG_OFFSET, ARM);
        self.region.write_u32(TRIGGER_SOURCE_OFFSET, TRIGGER_NOW);

        let start = Instant::now();
        while start.elapsed() < self.poll_timeout {
            if self.region.read_u32(TRIGGER_SOURCE_OFFSET) == 0 {
                return Ok(());
            }
            thread::yield_now();
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "Timed out while waiting for the scope trigger",
        ))
    }

    fn read_channel(&self, buffer_offset: usize, first: usize, samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| {
                let index = (first + i) % BUFFER_SAMPLES;
                let raw = self.region.read_u32(buffer_offset + 4 * index) & 0x3fff;
                let signed = if raw & 0x2000 != 0 {
                    raw as i32 - 0x4000
                } else {
                    raw as i32
                };
                signed as f32 / FULL_SCALE
            })
            .collect()
    }
}

impl Acquisition for ScopeAcquisition {
    fn acquire(&mut self, samples_per_channel: usize) -> io::Result<SampleBuffer> {
        if samples_per_channel > BUFFER_SAMPLES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Requested {} samples, the scope buffer holds {}",
                    samples_per_channel, BUFFER_SAMPLES
                ),
            ));
        }
        self.trigger()?;
        let first = self.window_start(samples_per_channel);

        let ch1 = self.read_channel(CH1_BUFFER_OFFSET, first, samples_per_channel);
        let ch2 = self.read_channel(CH2_BUFFER_OFFSET, first, samples_per_channel);
        SampleBuffer::new(ch1, ch2).map_err(io::Error::other)
    }
}
