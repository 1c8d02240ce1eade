use std::io;

use byteorder::{ReadBytesExt, WriteBytesExt};

/// A fixed-layout value that lives inside a packet header.
pub trait Bytes: Sized {
    const SIZE: usize;
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}
