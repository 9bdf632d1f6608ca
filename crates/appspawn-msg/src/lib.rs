//! Wire protocol of the spawn daemon
//!
//! Pure data transformation: no I/O happens in this crate.

pub mod codec;
pub mod flags;
pub mod message;
pub mod reply;
pub mod tlv;

pub use codec::{DecodeError, decode, encode};
pub use flags::{AppFlag, FlagBitmap};
pub use message::{MsgType, SpawnMessage, is_safe_name};
pub use reply::{FailureCode, Reply};
pub use tlv::{DacInfo, DomainInfo, TlvRecord};
