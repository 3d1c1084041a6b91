//! Stream codec.
//!
//! Reads and writes whole frames on any byte stream. Reads loop until the
//! requested bytes arrive; a partial transfer is not an error. A peer that
//! closes the stream cleanly between frames yields `Ok(None)`, a close in
//! the middle of a frame is an I/O error.

use std::io;
use std::io::IoSlice;
use std::io::Read;
use std::io::Write;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use super::abi;
use super::abi::DataHeader;
use super::abi::Header;

/// A frame as it arrives off the wire, before opcode validation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Raw operation discriminator; may lie outside the [`abi::Op`] space.
    pub op: i32,
    /// Sender field, NUL-trimmed.
    pub sender: String,
    /// Receiver field, NUL-trimmed.
    pub receiver: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Reads one full frame (header, data header, payload).
///
/// Returns `Ok(None)` if the peer closed the stream before the first header
/// byte.
pub fn read_message(r: &mut impl Read) -> io::Result<Option<RawMessage>> {
    let mut head = [0u8; size_of::<Header>()];
    if !read_exact_or_close(r, &mut head)? {
        return Ok(None);
    }
    let header = Header::read_from_bytes(&head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;

    match read_data(r)? {
        Some((receiver, payload)) => Ok(Some(RawMessage {
            op: header.op,
            sender: abi::decode_name(&header.sender),
            receiver,
            payload,
        })),
        None => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}

/// Reads one data part (data header plus payload), as in the second frame
/// of a file post.
///
/// Returns `Ok(None)` if the peer closed the stream before the first byte.
pub fn read_data(r: &mut impl Read) -> io::Result<Option<(String, Vec<u8>)>> {
    let mut head = [0u8; size_of::<DataHeader>()];
    if !read_exact_or_close(r, &mut head)? {
        return Ok(None);
    }
    let data = DataHeader::read_from_bytes(&head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short data header"))?;

    let len = data.len;
    if len > abi::MAX_WIRE_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload of {len} bytes exceeds the wire ceiling"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() && !read_exact_or_close(r, &mut payload)? {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(Some((abi::decode_name(&data.receiver), payload)))
}

/// Writes one full frame.
pub fn write_message(
    w: &mut impl Write,
    op: i32,
    sender: &str,
    receiver: &str,
    payload: &[u8],
) -> io::Result<()> {
    let header = Header {
        op,
        sender: abi::name_field(sender),
    };
    let data = DataHeader {
        receiver: abi::name_field(receiver),
        len: payload.len() as u32,
    };
    let mut parts: SmallVec<[IoSlice<'_>; 3]> = smallvec![
        IoSlice::new(header.as_bytes()),
        IoSlice::new(data.as_bytes()),
    ];
    if !payload.is_empty() {
        parts.push(IoSlice::new(payload));
    }
    write_all_vectored(w, &mut parts)
}

/// Writes one bare data part (data header plus payload), as in the second
/// frame of a file post.
pub fn write_data(w: &mut impl Write, receiver: &str, payload: &[u8]) -> io::Result<()> {
    let data = DataHeader {
        receiver: abi::name_field(receiver),
        len: payload.len() as u32,
    };
    let mut parts: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(data.as_bytes())];
    if !payload.is_empty() {
        parts.push(IoSlice::new(payload));
    }
    write_all_vectored(w, &mut parts)
}

/// Writes a header-only acknowledgement.
pub fn write_ack(w: &mut impl Write, op: i32, sender: &str) -> io::Result<()> {
    let header = Header {
        op,
        sender: abi::name_field(sender),
    };
    w.write_all(header.as_bytes())
}

/// Reads one header-only acknowledgement: the raw op and the sender field.
///
/// Returns `Ok(None)` if the peer closed the stream before the first byte.
pub fn read_ack(r: &mut impl Read) -> io::Result<Option<(i32, String)>> {
    let mut head = [0u8; size_of::<Header>()];
    if !read_exact_or_close(r, &mut head)? {
        return Ok(None);
    }
    let header = Header::read_from_bytes(&head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;
    Ok(Some((header.op, abi::decode_name(&header.sender))))
}

/// Reads exactly `buf.len()` bytes, looping over short reads. Returns
/// `false` if the peer closed the stream before the first byte; a close
/// after that is an error.
fn read_exact_or_close(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn write_all_vectored(w: &mut impl Write, bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
    let mut bufs = bufs;
    let mut remaining: usize = bufs.iter().map(|b| b.len()).sum();
    while remaining > 0 {
        match w.write_vectored(bufs) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                remaining -= n;
                IoSlice::advance_slices(&mut bufs, n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
