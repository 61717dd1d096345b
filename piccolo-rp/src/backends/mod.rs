//! Hardware backends of the Piccolo server.
pub mod devmem;
