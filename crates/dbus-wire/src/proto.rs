//! Raw protocol codes: endianness, message type, header field keys, flags,
//! and signature type codes.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor};

macro_rules! raw_enum {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[doc = $variant_doc:literal])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        $vis struct $name(pub $repr);

        impl $name {
            $(
                $(#[doc = $variant_doc])*
                $vis const $variant: Self = Self($value);
            )*

            /// The raw byte value of this code.
            #[inline]
            $vis const fn raw(self) -> $repr {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    Self(other) => write!(f, "UNKNOWN({other:?})"),
                }
            }
        }
    }
}

macro_rules! raw_set {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[doc = $variant_doc:literal])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub $repr);

        impl $name {
            $(
                $(#[doc = $variant_doc])*
                $vis const $variant: Self = Self($value);
            )*
        }

        impl BitOr for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl BitAnd for $name {
            type Output = bool;

            #[inline]
            fn bitand(self, rhs: Self) -> Self::Output {
                self.0 & rhs.0 != 0
            }
        }

        impl BitXor for $name {
            type Output = Self;

            #[inline]
            fn bitxor(self, rhs: Self) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }
    }
}

raw_enum! {
    /// The endianness of a message, taken from the first byte of the header.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian, marked by ASCII `l`.
        LITTLE = b'l',
        /// Big endian, marked by ASCII `B`.
        BIG = b'B',
    }
}

impl Endianness {
    /// The endianness native to this platform.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// The endianness native to this platform.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;

    /// Parse a marker byte, rejecting anything other than `l` or `B`.
    pub fn from_marker(byte: u8) -> Result<Self, crate::Error> {
        match byte {
            b'l' => Ok(Self::LITTLE),
            b'B' => Ok(Self::BIG),
            other => Err(crate::ErrorKind::InvalidEndianness(other).into()),
        }
    }
}

raw_enum! {
    /// The type of a message, the second byte of the header.
    #[repr(u8)]
    pub enum MessageType {
        /// Method call, may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply; the first body argument, if present, is the error
        /// message.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    /// Flags carried in the third byte of the header.
    #[repr(u8)]
    pub enum Flags {
        /// No flags set.
        EMPTY = 0,
        /// No reply is expected even for a message type that normally
        /// prompts one.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not auto-start an owner for the destination.
        NO_AUTO_START = 2,
        /// The caller will wait for interactive authorization.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_set();
        let mut this = *self;

        for (name, flag) in [
            ("NO_REPLY_EXPECTED", Self::NO_REPLY_EXPECTED),
            ("NO_AUTO_START", Self::NO_AUTO_START),
            (
                "ALLOW_INTERACTIVE_AUTHORIZATION",
                Self::ALLOW_INTERACTIVE_AUTHORIZATION,
            ),
        ] {
            if this & flag {
                s.entry(&name);
                this = this ^ flag;
            }
        }

        s.finish()
    }
}

raw_enum! {
    /// A header field key, the first byte of each `(yv)` header entry.
    #[repr(u8)]
    pub enum HeaderField {
        /// The object the call targets or the signal originates from.
        PATH = 1,
        /// The interface a method call or signal belongs to.
        INTERFACE = 2,
        /// The member (method or signal) name.
        MEMBER = 3,
        /// The name of the error, for error replies.
        ERROR_NAME = 4,
        /// The serial this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection this message is intended for.
        DESTINATION = 6,
        /// The unique name of the sending connection.
        SENDER = 7,
        /// The signature of the message body.
        SIGNATURE = 8,
        /// The number of Unix file descriptors accompanying the message.
        UNIX_FDS = 9,
    }
}

raw_enum! {
    /// A type code used inside of a [`Signature`][crate::Signature].
    #[repr(u8)]
    pub enum Type {
        /// Terminates a signature.
        INVALID = 0,
        /// 8-bit unsigned integer, `y`.
        BYTE = b'y',
        /// Boolean, `b`.
        BOOLEAN = b'b',
        /// 16-bit signed integer, `n`.
        INT16 = b'n',
        /// 16-bit unsigned integer, `q`.
        UINT16 = b'q',
        /// 32-bit signed integer, `i`.
        INT32 = b'i',
        /// 32-bit unsigned integer, `u`.
        UINT32 = b'u',
        /// 64-bit signed integer, `x`.
        INT64 = b'x',
        /// 64-bit unsigned integer, `t`.
        UINT64 = b't',
        /// IEEE754 double, `d`.
        DOUBLE = b'd',
        /// UTF-8 string, `s`.
        STRING = b's',
        /// Object path, `o`.
        OBJECT_PATH = b'o',
        /// Type signature, `g`.
        SIGNATURE = b'g',
        /// Array, `a`.
        ARRAY = b'a',
        /// Opens a struct, `(`.
        OPEN_PAREN = b'(',
        /// Closes a struct, `)`.
        CLOSE_PAREN = b')',
        /// Variant, `v`.
        VARIANT = b'v',
        /// Opens a dict entry, `{`.
        OPEN_BRACE = b'{',
        /// Closes a dict entry, `}`.
        CLOSE_BRACE = b'}',
        /// Unix file descriptor index, `h`.
        UNIX_FD = b'h',
    }
}

impl HeaderField {
    /// Parse a raw header field key, rejecting anything the protocol does
    /// not define. Unlike [`MessageType`] or [`Endianness`], this set is not
    /// meant to grow forward-compatibly here: an unrecognized key fails the
    /// whole frame closed (spec §4.1, §7).
    pub fn from_raw(byte: u8) -> Option<Self> {
        match byte {
            1..=9 => Some(Self(byte)),
            _ => None,
        }
    }
}

impl MessageType {
    /// Parse a raw message type byte, rejecting anything outside of the four
    /// defined message types.
    pub fn from_raw(byte: u8) -> Option<Self> {
        match byte {
            1..=4 => Some(Self(byte)),
            _ => None,
        }
    }
}
