//! # Piccolo Protocol Library
//!
//! This crate implements the wire format spoken between a Piccolo instrument (an
//! FPGA-backed acquisition and sorting device) and the host applications controlling it.
//!
//! ## Overview
//!
//! The instrument exposes four independent TCP services, one per capability:
//!
//! - **Control** (default port 5000): receives opcode frames; opcode `99` shuts the server down
//! - **Buffer stream** (5001): replies to opcode `3` with the latest two-channel sample buffer
//! - **State stream** (5002): pushes a JSON snapshot of all registers roughly every 100 ms
//! - **State set** (5003): receives JSON register write requests
//!
//! ## Frame Formats
//!
//! - **Opcode frame**: 16 bytes, a little-endian `u32` opcode followed by 12 zero bytes
//! - **Sample buffer**: `2 × N` little-endian `f32`, channel 1 then channel 2, without header
//! - **JSON frame**: a 16-byte header (little-endian `u32` payload length, 12 zero bytes)
//!   followed by exactly that many bytes of UTF-8 JSON
//!
//! ## Basic Usage
//!
//! ### Writing an Opcode Frame
//!
//! ```
//! use piccolo_protocol::Opcode;
//!
//! let mut buffer = Vec::new();
//! Opcode::Acquire.write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//! assert_eq!(buffer, [3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
//! ```
//!
//! ### Exchanging JSON Frames
//!
//! ```
//! use piccolo_protocol::{SetRequest, codec::{read_json_frame, write_json_frame}};
//! use std::io::Cursor;
//!
//! let request = SetRequest::new("low_intensity_thresh[0]", 1234i64);
//! let mut buffer = Vec::new();
//! write_json_frame(&mut buffer, &request).expect("Writing to vector shouldn't fail");
//!
//! let mut reader = Cursor::new(buffer);
//! let received: Option<SetRequest> = read_json_frame(&mut reader, 1024).expect("Frame should parse");
//! assert_eq!(received, Some(request));
//! ```
//!
//! ## Partial Delivery
//!
//! All blocking readers in [`codec`] accumulate bytes until a frame is complete; a peer
//! that closes the stream mid-frame yields `Ok(None)` and never a truncated frame.
//!
//! ## Async Support
//!
//! With the `tokio` feature enabled, the [`framed`] module provides
//! [`tokio_util::codec`] implementations of the same frames.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod framed;
