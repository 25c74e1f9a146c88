//! Lightweight reader for the JVM class file format.
//!
//! Only the subset needed to build runtime class descriptors is decoded:
//! constants are located but not materialized, attribute bodies are
//! skipped unless the loader asks for them.
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

pub const MAGIC: u32 = 0xcafe_babe;

/// Constant pool offsets are stored in 16 bits with the top bit reserved.
pub const MAX_CONSTANT_OFFSET: usize = 0x7fff;

pub const CONSTANT_UTF8: u8 = 1;
pub const CONSTANT_INTEGER: u8 = 3;
pub const CONSTANT_FLOAT: u8 = 4;
pub const CONSTANT_LONG: u8 = 5;
pub const CONSTANT_DOUBLE: u8 = 6;
pub const CONSTANT_CLASS: u8 = 7;
pub const CONSTANT_STRING: u8 = 8;
pub const CONSTANT_FIELDREF: u8 = 9;
pub const CONSTANT_METHODREF: u8 = 10;
pub const CONSTANT_INTERFACE_METHODREF: u8 = 11;
pub const CONSTANT_NAME_AND_TYPE: u8 = 12;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("class file truncated at byte {0}")]
    Truncated(usize),
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported constant #{index} with tag {tag}")]
    UnsupportedConstant { index: u16, tag: u8 },
    #[error("constant #{index} at offset {offset} is out of range")]
    ConstantOffsetTooLarge { index: u16, offset: usize },
}

type Result<T> = std::result::Result<T, ClassFormatError>;

/// Big-endian cursor over class file bytes.
#[derive(Debug, Clone)]
pub struct ClassReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ClassReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub fn at(bytes: &'a [u8], position: usize) -> Self {
        let mut reader = Self::new(bytes);
        reader.cursor.set_position(position as u64);
        reader
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn u8(&mut self) -> Result<u8> {
        let at = self.position();
        self.cursor
            .read_u8()
            .map_err(|_| ClassFormatError::Truncated(at))
    }

    pub fn u16(&mut self) -> Result<u16> {
        let at = self.position();
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| ClassFormatError::Truncated(at))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let at = self.position();
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| ClassFormatError::Truncated(at))
    }

    /// Advances past `n` bytes, failing if they are not all present.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        let at = self.position();
        let len = self.cursor.get_ref().len();
        if at + n > len {
            return Err(ClassFormatError::Truncated(len));
        }
        self.cursor
            .seek(SeekFrom::Current(n as i64))
            .map_err(|_| ClassFormatError::Truncated(at))?;
        Ok(())
    }

    /// Skips an attribute table: name index, length and body per entry.
    pub fn skip_attributes(&mut self) -> Result<()> {
        let count = self.u16()?;
        for _ in 0..count {
            self.u16()?;
            let len = self.u32()? as usize;
            self.skip(len)?;
        }
        Ok(())
    }
}

/// Location of every constant of a class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantLayout {
    /// Byte offset of each constant's tag; entry 0 is reserved.
    pub offsets: Vec<u16>,
    /// Offset of the access flags following the pool.
    pub end: usize,
}

/// Checks the magic number and locates every constant pool entry.
pub fn scan_constant_pool(bytes: &[u8]) -> Result<ConstantLayout> {
    let mut reader = ClassReader::new(bytes);
    let magic = reader.u32()?;
    if magic != MAGIC {
        return Err(ClassFormatError::BadMagic(magic));
    }
    reader.skip(4)?;
    let count = reader.u16()?;
    let mut offsets = Vec::with_capacity(count as usize);
    offsets.push(0);
    for index in 1..count {
        let offset = reader.position();
        if offset > MAX_CONSTANT_OFFSET {
            return Err(ClassFormatError::ConstantOffsetTooLarge { index, offset });
        }
        offsets.push(offset as u16);
        skip_constant(&mut reader, index)?;
    }
    Ok(ConstantLayout {
        offsets,
        end: reader.position(),
    })
}

fn skip_constant(reader: &mut ClassReader, index: u16) -> Result<()> {
    let tag = reader.u8()?;
    match tag {
        CONSTANT_UTF8 => {
            let len = reader.u16()? as usize;
            reader.skip(len)
        }
        CONSTANT_INTEGER
        | CONSTANT_FLOAT
        | CONSTANT_FIELDREF
        | CONSTANT_METHODREF
        | CONSTANT_INTERFACE_METHODREF
        | CONSTANT_NAME_AND_TYPE => reader.skip(4),
        CONSTANT_CLASS | CONSTANT_STRING => reader.skip(2),
        _ => Err(ClassFormatError::UnsupportedConstant { index, tag }),
    }
}

/// Reads a whole class file from disk.
pub fn read_class_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;
    Ok(buffer)
}
