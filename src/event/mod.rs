//! The `event` module defines the unit of work consumed from the broker, a VM
//! description, and the codec translating it to and from payload bytes.

pub mod codec;
pub mod message;

pub use codec::{CodecError, decode, encode};
pub use message::{DEFAULT_FAIL_COUNT, VmEvent};
