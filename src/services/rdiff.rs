//! Decoder for librsync ("rdiff") delta streams.
//!
//! A delta is the magic `0x72730236` followed by commands, all integers
//! big-endian:
//!
//! | opcode        | meaning                                             |
//! |---------------|-----------------------------------------------------|
//! | `0x00`        | end of stream                                       |
//! | `0x01..=0x40` | literal, length is the opcode itself                |
//! | `0x41..=0x44` | literal, length follows in 1/2/4/8 bytes            |
//! | `0x45..=0x54` | copy from basis, offset and length in 1/2/4/8 bytes |

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::errors::{Result, UpdaterError};

pub const DELTA_MAGIC: u32 = 0x7273_0236;

const OP_END: u8 = 0x00;
const OP_LITERAL_MAX_INLINE: u8 = 0x40;
const OP_LITERAL_N1: u8 = 0x41;
const OP_LITERAL_N8: u8 = 0x44;
const OP_COPY_FIRST: u8 = 0x45;
const OP_COPY_LAST: u8 = 0x54;

const COPY_BUFFER: usize = 64 * 1024;

fn width_for_index(index: u8) -> usize {
    1usize << index
}

fn width_index_for(value: u64) -> u8 {
    if value <= u8::MAX as u64 {
        0
    } else if value <= u16::MAX as u64 {
        1
    } else if value <= u32::MAX as u64 {
        2
    } else {
        3
    }
}

fn corrupt(message: impl Into<String>) -> UpdaterError {
    UpdaterError::PatchFailed(format!("corrupt delta: {}", message.into()))
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            corrupt(format!("truncated {}", what))
        } else {
            UpdaterError::Io(err)
        }
    })
}

fn read_uint<R: Read>(reader: &mut R, width: usize, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact_or_corrupt(reader, &mut buf[8 - width..], what)?;
    Ok(u64::from_be_bytes(buf))
}

/// Statistics of one applied delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub literal_bytes: u64,
    pub copied_bytes: u64,
}

impl DeltaStats {
    pub fn output_len(&self) -> u64 {
        self.literal_bytes + self.copied_bytes
    }
}

/// Reconstructs the new file from `basis` and `delta` into `out`.
pub fn apply_delta<B, D, W>(basis: &mut B, delta: &mut D, out: &mut W) -> Result<DeltaStats>
where
    B: Read + Seek,
    D: Read,
    W: Write,
{
    let magic = read_uint(delta, 4, "magic")? as u32;
    if magic != DELTA_MAGIC {
        return Err(corrupt(format!("bad magic {:#010x}", magic)));
    }

    let basis_len = basis.seek(SeekFrom::End(0))?;
    let mut stats = DeltaStats::default();
    let mut buffer = vec![0u8; COPY_BUFFER];

    loop {
        let mut opcode = [0u8; 1];
        read_exact_or_corrupt(delta, &mut opcode, "command")?;
        let opcode = opcode[0];

        match opcode {
            OP_END => return Ok(stats),
            1..=OP_LITERAL_MAX_INLINE => {
                let len = opcode as u64;
                copy_stream(delta, out, len, &mut buffer, "literal")?;
                stats.literal_bytes += len;
            }
            OP_LITERAL_N1..=OP_LITERAL_N8 => {
                let width = width_for_index(opcode - OP_LITERAL_N1);
                let len = read_uint(delta, width, "literal length")?;
                copy_stream(delta, out, len, &mut buffer, "literal")?;
                stats.literal_bytes += len;
            }
            OP_COPY_FIRST..=OP_COPY_LAST => {
                let code = opcode - OP_COPY_FIRST;
                let offset = read_uint(delta, width_for_index(code / 4), "copy offset")?;
                let len = read_uint(delta, width_for_index(code % 4), "copy length")?;
                let end = offset
                    .checked_add(len)
                    .ok_or_else(|| corrupt("copy range overflows"))?;
                if end > basis_len {
                    return Err(corrupt(format!(
                        "copy {}..{} beyond basis of {} bytes",
                        offset, end, basis_len
                    )));
                }
                basis.seek(SeekFrom::Start(offset))?;
                copy_stream(basis, out, len, &mut buffer, "basis")?;
                stats.copied_bytes += len;
            }
            other => return Err(corrupt(format!("unknown opcode {:#04x}", other))),
        }
    }
}

fn copy_stream<R: Read, W: Write>(
    reader: &mut R,
    out: &mut W,
    mut remaining: u64,
    buffer: &mut [u8],
    what: &str,
) -> Result<()> {
    while remaining > 0 {
        let step = remaining.min(buffer.len() as u64) as usize;
        read_exact_or_corrupt(reader, &mut buffer[..step], what)?;
        out.write_all(&buffer[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}

/// Builds delta streams in the same format [`apply_delta`] reads.
#[derive(Debug)]
pub struct DeltaWriter {
    bytes: Vec<u8>,
}

impl Default for DeltaWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaWriter {
    pub fn new() -> Self {
        Self {
            bytes: DELTA_MAGIC.to_be_bytes().to_vec(),
        }
    }

    fn push_uint(&mut self, value: u64, index: u8) {
        let width = width_for_index(index);
        self.bytes
            .extend_from_slice(&value.to_be_bytes()[8 - width..]);
    }

    pub fn literal(mut self, data: &[u8]) -> Self {
        if data.is_empty() {
            return self;
        }
        let len = data.len() as u64;
        if len <= OP_LITERAL_MAX_INLINE as u64 {
            self.bytes.push(len as u8);
        } else {
            let index = width_index_for(len);
            self.bytes.push(OP_LITERAL_N1 + index);
            self.push_uint(len, index);
        }
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn copy(mut self, offset: u64, len: u64) -> Self {
        if len == 0 {
            return self;
        }
        let offset_index = width_index_for(offset);
        let len_index = width_index_for(len);
        self.bytes
            .push(OP_COPY_FIRST + offset_index * 4 + len_index);
        self.push_uint(offset, offset_index);
        self.push_uint(len, len_index);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.bytes.push(OP_END);
        self.bytes
    }
}
