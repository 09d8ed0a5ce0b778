//! Wire protocols spoken by the supported radios.
//!
//! - [`frame`]: marker/length/XOR/CRC framing shared by both families
//! - [`k5`]: K5 and K1 EEPROM access and the opcodes of the K5 bootloader
//! - [`tk11`]: TK11 internal-flash access with typed messages
//! - [`retry`]: the retry combinator wrapped around TK11 memory operations

pub mod crc;
pub mod frame;
pub mod k5;
pub mod obfuscation;
pub mod retry;
pub mod tk11;

pub use frame::{Frame, FrameScanner, encode_frame};
pub use k5::{K5Codec, Opcode};
pub use retry::RetryPolicy;
pub use tk11::{MessageType, Tk11Codec};
