//! # Piccolo Server Library
//!
//! This crate provides the device side of the Piccolo instrument protocol: it compiles a
//! register catalog, guards the register memory against concurrent access and serves the
//! four Piccolo TCP services.
//!
//! ## Architecture
//!
//! The crate is built around two backend traits and one server:
//!
//! - **[`RegisterMemory`]**: the addressable region holding the register blocks
//!   (memory-mapped device registers on hardware, [`store::HeapMemory`] otherwise)
//! - **[`Acquisition`]**: the source of two-channel sample buffers
//!   (the ADC on hardware, [`acquisition::TestPattern`] otherwise)
//! - **[`server::Server`]**: binds one listener per service and serves every accepted
//!   connection on its own task
//!
//! ## How It Works
//!
//! 1. A [`registers::RegisterCatalog`] is compiled from its JSON description
//! 2. The catalog and a [`RegisterMemory`] form a [`store::RegisterStore`]
//! 3. The store and an [`Acquisition`] are wrapped in a [`server::Server`]
//! 4. The server accepts connections on all four ports until it receives a shutdown opcode
//!
//! ## Basic Usage
//!
//! ```ignore
//! use piccolo_server::{
//!     acquisition::TestPattern,
//!     registers::RegisterCatalog,
//!     server::Builder,
//!     store::{HeapMemory, RegisterStore},
//! };
//!
//! let catalog = RegisterCatalog::from_file("piccolo_mmap.json")?;
//! let store = RegisterStore::new(catalog, HeapMemory::new(0x2000))?;
//! let server = Builder::new().build(TestPattern::default(), store)?;
//! server.listen("0.0.0.0".parse()?).await?;
//! ```
//!
//! ## Configuration
//!
//! Server behavior can be customized via [`server::Config`]:
//!
//! - **ports**: the four service ports (default: 5000 to 5003)
//! - **samples_per_channel**: buffer length of the buffer stream (default: 4096)
//! - **stream_interval**: cadence of the state stream (default: 100 ms)
//! - **acquisition_interval**: pause between two acquisitions (default: 10 ms)
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Enable logging to see:
//! - Client connections and disconnections per service
//! - Register writes and applied defaults
//! - Unknown opcodes and protocol errors
//!
//! ## Thread Model
//!
//! Every accepted connection runs on its own tokio task; acquisition runs on a dedicated
//! thread. The register store is the only state shared between connections and every
//! single register access is serialized by one lock.
use std::io;

use piccolo_protocol::SampleBuffer;

pub mod acquisition;
pub mod error;
pub mod registers;
pub mod server;
pub mod store;

use registers::BLOCK_LEN;

/// Backing memory of the register store.
///
/// Implementors only move raw blocks; all interpretation happens in
/// [`registers::RegisterDescriptor`]. Offsets are validated against [`RegisterMemory::size`]
/// when the [`store::RegisterStore`] is created, so implementations may assume
/// `offset + 4 <= size()`.
pub trait RegisterMemory: Send {
    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Reads the 4-byte block at `offset`.
    fn read_block(&self, offset: usize) -> [u8; BLOCK_LEN];

    /// Writes the 4-byte block at `offset`.
    fn write_block(&mut self, offset: usize, block: [u8; BLOCK_LEN]);
}

/// Source of the waveforms served on the buffer stream.
///
/// See the `piccolo-rp` crate for the hardware implementation.
pub trait Acquisition: Send + 'static {
    /// Acquire the most recent `samples_per_channel` samples of both channels.
    ///
    /// Called in a loop from a dedicated thread; errors are logged and the call is retried.
    fn acquire(&mut self, samples_per_channel: usize) -> io::Result<SampleBuffer>;
}
