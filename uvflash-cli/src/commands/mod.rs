//! Command implementations.
//!
//! Radio memory commands live in `memory`, image handling in `firmware`
//! and bootloader flashing in `flash`.

pub(crate) mod completions;
pub(crate) mod firmware;
pub(crate) mod flash;
pub(crate) mod memory;
pub(crate) mod ports;
