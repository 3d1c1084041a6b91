//! Wire ABI.
//!
//! Every frame starts with a fixed-size [`Header`] followed by a
//! [`DataHeader`] and `len` payload bytes. Both structs are packed and use
//! native (little-endian) byte order; name fields are NUL-padded byte
//! arrays. Header-only acknowledgements omit the data header entirely.

#![allow(missing_docs)]

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Maximum length of a user or group name, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// On-wire size of a name field (name plus NUL padding).
pub const NAME_FIELD: usize = MAX_NAME_LEN + 1;

/// Absolute ceiling on a single payload, independent of the configured
/// per-message limits. A frame advertising more than this is rejected
/// before any allocation happens.
pub const MAX_WIRE_PAYLOAD: u32 = 13_107_200;

/// Leading fixed part of every frame.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    /// Operation discriminator; see [`Op`]. Negative values are reserved.
    pub op: i32,
    /// Originating user, NUL-padded.
    pub sender: [u8; NAME_FIELD],
}

/// Second fixed part of a full frame, describing the payload.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DataHeader {
    /// Destination user or group, NUL-padded.
    pub receiver: [u8; NAME_FIELD],
    /// Number of payload bytes that follow.
    pub len: u32,
}

/// Operation codes. The integer values are part of the protocol and must
/// not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Op {
    /// Register a new user and bind it to the requesting connection.
    Register = 0,
    /// Bind an already registered user to the requesting connection.
    Connect = 1,
    /// Post a text message to a user or group.
    PostTxt = 2,
    /// Broadcast a text message to every other registered user.
    PostTxtAll = 3,
    /// Post a file to a user or group; arrives as two back-to-back frames.
    PostFile = 4,
    /// Fetch a previously posted file by name.
    GetFile = 5,
    /// Fetch the most recent messages addressed to the requester.
    GetPrevMsgs = 6,
    /// List the users currently online.
    UsrList = 7,
    /// Delete the requesting user.
    Unregister = 8,
    /// Unbind the requesting connection.
    Disconnect = 9,
    /// Create a named group owned by the requester.
    CreateGroup = 10,
    /// Join a named group.
    AddGroup = 11,
    /// Leave a named group.
    DelGroup = 12,
    /// Delete a named group; only its creator may do this.
    UnregisterGroup = 13,

    /// Success reply.
    Ok = 20,
    /// Generic failure reply.
    Fail = 21,
    /// Name already taken (or already a member).
    NickAlready = 22,
    /// No such user or group.
    NickUnknown = 23,
    /// Payload exceeded the configured limit.
    MsgTooLong = 24,
    /// No file with the requested name.
    NoSuchFile = 25,

    /// Text delivery to a recipient.
    TxtMessage = 30,
    /// File-notification delivery to a recipient.
    FileMessage = 31,

    /// No operation; internal.
    Noop = 100,
}

impl Op {
    /// Whether this opcode is a request a client may legitimately send.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Op::Register
                | Op::Connect
                | Op::PostTxt
                | Op::PostTxtAll
                | Op::PostFile
                | Op::GetFile
                | Op::GetPrevMsgs
                | Op::UsrList
                | Op::Unregister
                | Op::Disconnect
                | Op::CreateGroup
                | Op::AddGroup
                | Op::DelGroup
                | Op::UnregisterGroup
        )
    }
}

/// Encodes `name` into a NUL-padded wire field, truncating at
/// [`MAX_NAME_LEN`] bytes.
pub fn name_field(name: &str) -> [u8; NAME_FIELD] {
    let mut field = [0u8; NAME_FIELD];
    let bytes = name.as_bytes();
    let n = bytes.len().min(MAX_NAME_LEN);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// Decodes a NUL-padded wire field back into a string.
pub fn decode_name(field: &[u8; NAME_FIELD]) -> String {
    let end = memchr::memchr(0, field).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Whether `name` is acceptable as a username: non-empty, at most
/// [`MAX_NAME_LEN`] bytes, and not starting with a punctuation character.
pub fn valid_username(name: &str) -> bool {
    match name.as_bytes().first() {
        Some(first) => name.len() <= MAX_NAME_LEN && !first.is_ascii_punctuation(),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(size_of::<Header>(), 37);
        assert_eq!(size_of::<DataHeader>(), 37);
    }

    #[test]
    fn opcode_roundtrip() {
        for op in [Op::Register, Op::PostFile, Op::Ok, Op::FileMessage, Op::Noop] {
            let raw: i32 = op.into();
            assert_eq!(Op::try_from(raw), Ok(op));
        }
        assert!(Op::try_from(-1).is_err());
        assert!(Op::try_from(14).is_err());
    }

    #[test]
    fn request_ops() {
        assert!(Op::Register.is_request());
        assert!(Op::UnregisterGroup.is_request());
        assert!(!Op::Ok.is_request());
        assert!(!Op::TxtMessage.is_request());
        assert!(!Op::Noop.is_request());
    }

    #[test]
    fn name_field_roundtrip() {
        let field = name_field("alice");
        assert_eq!(field[5], 0);
        assert_eq!(decode_name(&field), "alice");

        let long = "x".repeat(40);
        assert_eq!(decode_name(&name_field(&long)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn username_validation() {
        assert!(valid_username("alice"));
        assert!(valid_username(&"x".repeat(32)));
        assert!(!valid_username(""));
        assert!(!valid_username(&"x".repeat(33)));
        assert!(!valid_username("#deleted_user"));
        assert!(!valid_username(".hidden"));
    }
}
