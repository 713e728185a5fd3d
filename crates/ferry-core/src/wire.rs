//! Ferry wire format — the binary framing used on data channels.
//!
//! These types ARE the protocol. Every field, every size, every flag bit is
//! part of the wire format; changing anything here is a breaking change.
//!
//! All multi-byte integers are big-endian. The header struct uses zerocopy
//! byteorder types for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// The fixed 16-byte header preceding every data-channel payload.
///
/// The receiver can classify, size-check, and checksum a frame before
/// touching the payload. The AES-GCM nonce is never transmitted — it is
/// reconstructed from `seq` (see `crypto::data_nonce`).
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Frame kind tag. See [`FrameKind`].
    pub kind: u8,

    /// Chunk sequence number, dense from 0 across a transfer.
    pub seq: U32<BigEndian>,

    /// Payload length in bytes, not including this header.
    /// A frame whose actual size differs from `16 + len` is a hard
    /// framing error and triggers a retransmit request for `seq`.
    pub len: U32<BigEndian>,

    /// Byte offset of this chunk in the file.
    pub offset: U32<BigEndian>,

    /// Bit flags:
    ///   bit 0: this is the final chunk of the file
    ///   bit 1: the payload is AES-GCM ciphertext
    ///   bits 2-7: reserved, must be zero
    pub flags: u8,

    /// 16-bit wrap-around sum of the first min(len, 100) payload bytes.
    pub checksum: U16<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 16]);

/// Header length on the wire.
pub const HEADER_LEN: usize = 16;

/// Final-chunk flag bit.
pub const FLAG_LAST: u8 = 0b0000_0001;

/// Encrypted-payload flag bit.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Number of leading payload bytes covered by the checksum.
pub const CHECKSUM_SPAN: usize = 100;

// ── Frame Kind ────────────────────────────────────────────────────────────────

/// Frame kind tags carried in the first header byte.
///
/// `VideoData` and `Fec` are reserved by the protocol for an ack-less
/// streaming mode; this engine decodes but does not handle them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// An encrypted file chunk requiring acknowledgement.
    Data = 0x01,
    /// A bare cumulative acknowledgement.
    Ack = 0x02,
    /// A selective acknowledgement (see [`Sack`]).
    Sack = 0x03,
    /// Reserved: ack-less streaming chunk.
    VideoData = 0x04,
    /// Reserved: forward-error-correction repair frame.
    Fec = 0x05,
    /// A control record routed over a data channel.
    Control = 0x06,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Ack),
            0x03 => Ok(FrameKind::Sack),
            0x04 => Ok(FrameKind::VideoData),
            0x05 => Ok(FrameKind::Fec),
            0x06 => Ok(FrameKind::Control),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Checksum ──────────────────────────────────────────────────────────────────

/// 16-bit wrap-around sum of the first min(len, 100) payload bytes.
///
/// This is a transit-damage tripwire, not an integrity guarantee — AES-GCM
/// authentication and the end-to-end digest provide those.
pub fn checksum(payload: &[u8]) -> u16 {
    let span = payload.len().min(CHECKSUM_SPAN);
    payload[..span]
        .iter()
        .fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

// ── Frame encode / decode ─────────────────────────────────────────────────────

/// A decoded data-channel frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u32,
    pub offset: u32,
    pub is_last: bool,
    pub is_encrypted: bool,
    pub payload: Bytes,
}

/// Encode a frame into a single wire message: 16-byte header + payload.
pub fn encode_frame(
    kind: FrameKind,
    seq: u32,
    offset: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let header = FrameHeader {
        kind: kind.into(),
        seq: U32::new(seq),
        len: U32::new(payload.len() as u32),
        offset: U32::new(offset),
        flags,
        checksum: U16::new(checksum(payload)),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a wire message into a [`Frame`].
///
/// Length and checksum mismatches are hard framing errors; both carry the
/// claimed `seq` so the receiver can request a retransmit of that chunk.
pub fn decode_frame(buf: &[u8]) -> Result<Frame, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::HeaderTooShort(buf.len()));
    }

    let header = FrameHeader::read_from_prefix(&buf[..HEADER_LEN])
        .ok_or(WireError::HeaderTooShort(buf.len()))?;

    let seq = header.seq.get();
    let declared = header.len.get() as usize;
    let actual = buf.len() - HEADER_LEN;
    if declared != actual {
        return Err(WireError::LengthMismatch {
            seq,
            declared,
            actual,
        });
    }

    let payload = &buf[HEADER_LEN..];
    let computed = checksum(payload);
    let expected = header.checksum.get();
    if computed != expected {
        return Err(WireError::ChecksumMismatch {
            seq,
            expected,
            computed,
        });
    }

    Ok(Frame {
        kind: FrameKind::try_from(header.kind)?,
        seq,
        offset: header.offset.get(),
        is_last: header.flags & FLAG_LAST != 0,
        is_encrypted: header.flags & FLAG_ENCRYPTED != 0,
        payload: Bytes::copy_from_slice(payload),
    })
}

// ── Selective acknowledgement ─────────────────────────────────────────────────

/// A selective acknowledgement: a cumulative lower bound plus coalesced
/// inclusive ranges of received sequence numbers above it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sack {
    /// Length of the contiguous received prefix: every seq < `cumulative_ack`
    /// has been received and persisted. 0 means nothing is acknowledged yet.
    pub cumulative_ack: u32,
    /// Inclusive (start, end) ranges received at or above the cumulative point.
    pub ranges: Vec<(u32, u32)>,
}

impl Sack {
    /// Coalesce a batch of acknowledged seqs into ranges at or above
    /// `cumulative_ack`.
    ///
    /// `sequences` need not be sorted; duplicates are tolerated. Seqs below
    /// the cumulative point are already covered and are dropped.
    pub fn from_sequences(cumulative_ack: u32, sequences: &[u32]) -> Self {
        let mut seqs: Vec<u32> = sequences
            .iter()
            .copied()
            .filter(|&s| s >= cumulative_ack)
            .collect();
        seqs.sort_unstable();
        seqs.dedup();

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for s in seqs {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == s => *end = s,
                Some((_, end)) if *end >= s => {}
                _ => ranges.push((s, s)),
            }
        }
        Self {
            cumulative_ack,
            ranges,
        }
    }

    /// Every seq acknowledged by this SACK's ranges (the cumulative prefix
    /// is not enumerated).
    pub fn acked_in_ranges(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }

    /// Binary encoding: [u32 cumulative][u16 count][(u32 start, u32 end)...],
    /// big-endian throughout. Used when a SACK rides a data channel.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.ranges.len() * 8);
        out.extend_from_slice(&self.cumulative_ack.to_be_bytes());
        out.extend_from_slice(&(self.ranges.len() as u16).to_be_bytes());
        for &(start, end) in &self.ranges {
            out.extend_from_slice(&start.to_be_bytes());
            out.extend_from_slice(&end.to_be_bytes());
        }
        out
    }

    /// Decode the binary SACK payload.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 6 {
            return Err(WireError::SackTruncated(buf.len()));
        }
        let cumulative_ack = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let count = u16::from_be_bytes(buf[4..6].try_into().unwrap()) as usize;
        if buf.len() != 6 + count * 8 {
            return Err(WireError::SackTruncated(buf.len()));
        }
        let mut ranges = Vec::with_capacity(count);
        for i in 0..count {
            let base = 6 + i * 8;
            let start = u32::from_be_bytes(buf[base..base + 4].try_into().unwrap());
            let end = u32::from_be_bytes(buf[base + 4..base + 8].try_into().unwrap());
            if end < start {
                return Err(WireError::SackRangeInverted { start, end });
            }
            ranges.push((start, end));
        }
        Ok(Self {
            cumulative_ack,
            ranges,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame shorter than the {HEADER_LEN}-byte header: {0} bytes")]
    HeaderTooShort(usize),

    #[error("unknown frame kind tag: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("seq {seq}: declared payload length {declared} but {actual} bytes followed the header")]
    LengthMismatch {
        seq: u32,
        declared: usize,
        actual: usize,
    },

    #[error("seq {seq}: checksum mismatch (header 0x{expected:04x}, computed 0x{computed:04x})")]
    ChecksumMismatch {
        seq: u32,
        expected: u16,
        computed: u16,
    },

    #[error("SACK payload truncated: {0} bytes")]
    SackTruncated(usize),

    #[error("SACK range inverted: ({start}, {end})")]
    SackRangeInverted { start: u32, end: u32 },
}

impl WireError {
    /// The seq a framing error implicates, when one was readable.
    /// The receiver uses this to request a retransmit of the damaged chunk.
    pub fn seq(&self) -> Option<u32> {
        match self {
            WireError::LengthMismatch { seq, .. } | WireError::ChecksumMismatch { seq, .. } => {
                Some(*seq)
            }
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
