//! Low-level building blocks for the D-Bus wire format.
//!
//! This crate has no opinion about policy, sockets, or async runtimes. It
//! covers only the bytes: endianness markers, the fixed set of message
//! types and header field codes, alignment arithmetic, and the two string
//! subtypes (object paths and type signatures) that the header uses.
//!
//! Higher layers (a filtering proxy, a plain client) build frame parsing
//! and routing on top of this.

#![deny(missing_docs)]

pub use self::error::{Error, ErrorKind, Result};
mod error;

pub use self::proto::{Endianness, Flags, HeaderField, MessageType, Type};
mod proto;

pub use self::frame::{read_u32, write_u32, Frame};
mod frame;

pub use self::align::padding_to;
mod align;

pub use self::object_path::{validate as validate_object_path, ObjectPath, LOCAL_PATH};
mod object_path;

pub use self::signature::Signature;
mod signature;

pub mod sasl;
