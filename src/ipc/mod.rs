//! Host/module message transport
//!
//! Framing, the channel itself, and the re-entrant call loop.

pub mod call;
pub mod channel;
pub mod message;

pub use call::{call, call_until, handle_msg, notify, wait_for};
pub use channel::{Channel, ROOT_SOCKET_ENV, ROOT_SOCKET_FD};
pub use message::{encode_payload, split_id, syscall_id, Frame, Message, Reader};
