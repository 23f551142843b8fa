//! # stormware-gmail
//!
//! Read-only Gmail connector: labels, message search, full messages with
//! text bodies, and attachment downloads.

pub mod gmail;
pub mod types;

pub use gmail::Gmail;
pub use types::{Address, Attachment, Label, Message, MessagePart, Query};
