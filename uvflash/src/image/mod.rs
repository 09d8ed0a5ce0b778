//! Firmware image handling.

pub mod firmware;

pub use firmware::{
    Firmware, FirmwareForm, UnpackOptions, classify, has_crc_validation, is_raw_firmware,
    pack_firmware, unpack_firmware, unpack_firmware_version,
};
