use std::fmt;
use std::io;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::bytes::Bytes;
use crate::consts::{
    EAK_ENTRY_SIZE, FIXED_HEADER_SIZE, MAX_EAK_ENTRIES, RDP_VERSION, SYN_HEADER_SIZE,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("packet is too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid flag combination: {0}")]
    InvalidFlags(Flags),
    #[error("header length of {0} words does not match the packet flags")]
    BadHeaderLength(u8),
    #[error("length mismatch: header says {expected} bytes but got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("payload of {0} bytes does not fit the data length field")]
    PayloadTooLarge(usize),
    #[error("too many EAK entries: {0}")]
    TooManyEakEntries(usize),
    #[error("variable header does not match the SYN/EAK flags")]
    VariableHeaderMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Control bits of byte 0. Bits 1-0 hold the version and are not flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const SYN = 0b1000_0000;
        const ACK = 0b0100_0000;
        const EAK = 0b0010_0000;
        const RST = 0b0001_0000;
        const NUL = 0b0000_1000;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}

const VERSION_MASK: u8 = 0b0000_0011;
const FIXED_HEADER_WORDS: u8 = (FIXED_HEADER_SIZE / 2) as u8;
const SYN_HEADER_WORDS: u8 = ((FIXED_HEADER_SIZE + SYN_HEADER_SIZE) / 2) as u8;
const SEQUENCED_BIT: u8 = 0b1000_0000;

/// Connection parameters carried by SYN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynOptions {
    /// Maximum number of unacknowledged segments the sender of the SYN will buffer.
    pub max_segments: u16,
    /// Largest packet, including IP/UDP overhead, the sender of the SYN accepts.
    pub max_segment_size: u16,
    pub sequenced: bool,
}

impl Bytes for SynOptions {
    const SIZE: usize = SYN_HEADER_SIZE;

    fn write_to(&self, writer: &mut impl WriteBytesExt) -> std::result::Result<(), io::Error> {
        writer.write_u16::<BigEndian>(self.max_segments)?;
        writer.write_u16::<BigEndian>(self.max_segment_size)?;
        writer.write_u8(if self.sequenced { SEQUENCED_BIT } else { 0 })?;
        writer.write_u8(0)?;
        Ok(())
    }

    fn read_from(reader: &mut impl ReadBytesExt) -> std::result::Result<Self, io::Error> {
        let max_segments = reader.read_u16::<BigEndian>()?;
        let max_segment_size = reader.read_u16::<BigEndian>()?;
        let sequenced = reader.read_u8()? & SEQUENCED_BIT != 0;
        let _pad = reader.read_u8()?;
        Ok(Self {
            max_segments,
            max_segment_size,
            sequenced,
        })
    }
}

/// The variable part of the header, present only on SYN and EAK packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableHeader<'a> {
    None,
    Syn(SynOptions),
    Eak(&'a [u32]),
}

impl VariableHeader<'_> {
    fn size(&self) -> usize {
        match self {
            VariableHeader::None => 0,
            VariableHeader::Syn(_) => SynOptions::SIZE,
            VariableHeader::Eak(entries) => entries.len() * EAK_ENTRY_SIZE,
        }
    }
}

/// Read-only, zero-copy view over an encoded packet.
///
/// Construct it with [`PacketView::parse`], which checks that the buffer is a
/// well-formed packet; every accessor afterwards reads straight from the slice.
#[derive(Clone, Copy)]
pub struct PacketView<'a> {
    buf: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_SIZE {
            return Err(Error::TooShort(buf.len()));
        }
        let view = Self { buf };
        if view.version() != RDP_VERSION {
            return Err(Error::UnsupportedVersion(view.version()));
        }
        let flags = view.flags();
        if flags.contains(Flags::SYN | Flags::EAK) {
            return Err(Error::InvalidFlags(flags));
        }
        let header_len = view.header_len();
        let header_size = header_len as usize * 2;
        let header_ok = if flags.contains(Flags::SYN) {
            header_len == SYN_HEADER_WORDS
        } else if flags.contains(Flags::EAK) {
            header_size > FIXED_HEADER_SIZE && (header_size - FIXED_HEADER_SIZE) % EAK_ENTRY_SIZE == 0
        } else {
            header_len == FIXED_HEADER_WORDS
        };
        if !header_ok {
            return Err(Error::BadHeaderLength(header_len));
        }
        let expected = header_size + view.data_len() as usize;
        if expected != buf.len() {
            return Err(Error::LengthMismatch {
                expected,
                actual: buf.len(),
            });
        }
        Ok(view)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.buf[0])
    }
    /// Returns true if every bit in `flags` is set.
    pub fn has(&self, flags: Flags) -> bool {
        self.flags().contains(flags)
    }
    pub fn version(&self) -> u8 {
        self.buf[0] & VERSION_MASK
    }
    /// Header length in 16-bit words.
    pub fn header_len(&self) -> u8 {
        self.buf[1]
    }
    pub fn data_len(&self) -> u16 {
        BigEndian::read_u16(&self.buf[2..4])
    }
    pub fn seq(&self) -> u32 {
        BigEndian::read_u32(&self.buf[4..8])
    }
    pub fn ack(&self) -> u32 {
        BigEndian::read_u32(&self.buf[8..12])
    }
    pub fn syn_options(&self) -> Option<SynOptions> {
        if !self.has(Flags::SYN) {
            return None;
        }
        let mut reader = self
            .buf
            .get(FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + SynOptions::SIZE)?;
        SynOptions::read_from(&mut reader).ok()
    }
    /// Out-of-order sequence numbers listed by an EAK packet. Empty for any other packet.
    pub fn eak_entries(&self) -> impl Iterator<Item = u32> + 'a {
        let buf = self.buf;
        let end = if self.has(Flags::EAK) {
            self.header_len() as usize * 2
        } else {
            FIXED_HEADER_SIZE
        };
        buf.get(FIXED_HEADER_SIZE..end)
            .unwrap_or_default()
            .chunks_exact(EAK_ENTRY_SIZE)
            .map(BigEndian::read_u32)
    }
    /// The data following the header, cut short if the buffer holds less than `data_len` bytes.
    pub fn payload(&self) -> &'a [u8] {
        let buf = self.buf;
        let start = self.header_len() as usize * 2;
        let end = (start + self.data_len() as usize).min(buf.len());
        buf.get(start..end).unwrap_or_default()
    }
    pub fn to_packet(&self) -> Packet {
        Packet {
            buf: self.buf.to_vec(),
        }
    }
}

impl fmt::Display for PacketView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} seq={} ack={} len={}",
            self.flags(),
            self.seq(),
            self.ack(),
            self.data_len()
        )?;
        if self.has(Flags::EAK) {
            write!(f, " eak={}", self.eak_entries().count())?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for PacketView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An owned, encoded packet whose header fields can be rewritten in place.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Encodes a complete packet. The header and data length fields are derived
    /// from `header` and `payload`.
    pub fn encode(
        flags: Flags,
        seq: u32,
        ack: u32,
        header: VariableHeader<'_>,
        payload: &[u8],
    ) -> Result<Self> {
        let matches_flags = match header {
            VariableHeader::None => !flags.intersects(Flags::SYN | Flags::EAK),
            VariableHeader::Syn(_) => flags.contains(Flags::SYN) && !flags.contains(Flags::EAK),
            VariableHeader::Eak(_) => flags.contains(Flags::EAK) && !flags.contains(Flags::SYN),
        };
        if !matches_flags {
            return Err(Error::VariableHeaderMismatch);
        }
        if let VariableHeader::Eak(entries) = header {
            if entries.is_empty() {
                return Err(Error::VariableHeaderMismatch);
            }
            if entries.len() > MAX_EAK_ENTRIES {
                return Err(Error::TooManyEakEntries(entries.len()));
            }
        }
        let data_len =
            u16::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge(payload.len()))?;
        let header_size = FIXED_HEADER_SIZE + header.size();
        let mut buf = Vec::with_capacity(header_size + payload.len());
        buf.push(flags.bits() | RDP_VERSION);
        buf.push((header_size / 2) as u8);
        // writes into a Vec cannot fail
        let _ = buf.write_u16::<BigEndian>(data_len);
        let _ = buf.write_u32::<BigEndian>(seq);
        let _ = buf.write_u32::<BigEndian>(ack);
        match header {
            VariableHeader::None => {}
            VariableHeader::Syn(opts) => {
                let _ = opts.write_to(&mut buf);
            }
            VariableHeader::Eak(entries) => {
                for &entry in entries {
                    let _ = buf.write_u32::<BigEndian>(entry);
                }
            }
        }
        buf.extend_from_slice(payload);
        Ok(Self { buf })
    }

    /// Copies and validates a received buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(PacketView::parse(buf)?.to_packet())
    }

    /// SYN, or SYN+ACK when acknowledging the peer's SYN.
    pub fn syn(seq: u32, ack: Option<u32>, opts: SynOptions) -> Self {
        let flags = match ack {
            Some(_) => Flags::SYN | Flags::ACK,
            None => Flags::SYN,
        };
        Self::infallible(flags, seq, ack.unwrap_or(0), VariableHeader::Syn(opts), &[])
    }
    pub fn pure_ack(seq: u32, ack: u32) -> Self {
        Self::infallible(Flags::ACK, seq, ack, VariableHeader::None, &[])
    }
    /// ACK+EAK listing out-of-order sequence numbers, truncated to what the header can hold.
    /// Falls back to a plain ACK when `entries` is empty.
    pub fn eak(seq: u32, ack: u32, entries: &[u32]) -> Self {
        if entries.is_empty() {
            return Self::pure_ack(seq, ack);
        }
        let entries = &entries[..entries.len().min(MAX_EAK_ENTRIES)];
        Self::infallible(
            Flags::ACK | Flags::EAK,
            seq,
            ack,
            VariableHeader::Eak(entries),
            &[],
        )
    }
    /// RST, or RST+ACK when `ack` is given.
    pub fn rst(seq: u32, ack: Option<u32>) -> Self {
        let flags = match ack {
            Some(_) => Flags::RST | Flags::ACK,
            None => Flags::RST,
        };
        Self::infallible(flags, seq, ack.unwrap_or(0), VariableHeader::None, &[])
    }
    /// The reset an endpoint without synchronized state sends in answer to `view`:
    /// RST with seq=ack+1 if the packet carried an ACK, otherwise RST+ACK acknowledging its seq.
    /// Resets are never answered.
    pub fn reset_for(view: &PacketView<'_>) -> Option<Self> {
        if view.has(Flags::RST) {
            None
        } else if view.has(Flags::ACK) {
            Some(Self::rst(view.ack().wrapping_add(1), None))
        } else {
            Some(Self::rst(0, Some(view.seq())))
        }
    }
    pub fn nul(seq: u32, ack: u32) -> Self {
        Self::infallible(Flags::NUL | Flags::ACK, seq, ack, VariableHeader::None, &[])
    }
    pub fn data(seq: u32, ack: u32, payload: &[u8]) -> Result<Self> {
        Self::encode(Flags::ACK, seq, ack, VariableHeader::None, payload)
    }

    fn infallible(
        flags: Flags,
        seq: u32,
        ack: u32,
        header: VariableHeader<'_>,
        payload: &[u8],
    ) -> Self {
        match Self::encode(flags, seq, ack, header, payload) {
            Ok(packet) => packet,
            Err(e) => unreachable!("control packet failed to encode: {e}"),
        }
    }

    pub fn view(&self) -> PacketView<'_> {
        PacketView { buf: &self.buf }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn flags(&self) -> Flags {
        self.view().flags()
    }
    pub fn has(&self, flags: Flags) -> bool {
        self.view().has(flags)
    }
    pub fn seq(&self) -> u32 {
        self.view().seq()
    }
    pub fn ack(&self) -> u32 {
        self.view().ack()
    }
    pub fn payload(&self) -> &[u8] {
        self.view().payload()
    }

    /// Replaces the control bits, leaving the version bits alone.
    pub fn set_flags(&mut self, flags: Flags) {
        self.buf[0] = (self.buf[0] & !Flags::all().bits()) | flags.bits();
    }
    pub fn set_flag(&mut self, flag: Flags) {
        self.buf[0] |= flag.bits();
    }
    pub fn clear_flag(&mut self, flag: Flags) {
        self.buf[0] &= !flag.bits();
    }
    pub fn set_version(&mut self, version: u8) {
        self.buf[0] = (self.buf[0] & !VERSION_MASK) | (version & VERSION_MASK);
    }
    pub fn set_header_len(&mut self, words: u8) {
        self.buf[1] = words;
    }
    pub fn set_data_len(&mut self, len: u16) {
        BigEndian::write_u16(&mut self.buf[2..4], len);
    }
    pub fn set_seq(&mut self, seq: u32) {
        BigEndian::write_u32(&mut self.buf[4..8], seq);
    }
    pub fn set_ack(&mut self, ack: u32) {
        BigEndian::write_u32(&mut self.buf[8..12], ack);
    }
    /// Overwrites the SYN variable header. Does nothing on a non-SYN packet or one too short
    /// to hold the options.
    pub fn set_syn_options(&mut self, opts: SynOptions) {
        if !self.has(Flags::SYN) {
            return;
        }
        let Some(mut writer) = self
            .buf
            .get_mut(FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + SynOptions::SIZE)
        else {
            return;
        };
        let _ = opts.write_to(&mut writer);
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.view(), f)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.view(), f)
    }
}
