use std::collections::HashMap;

use crate::error::{DecodeError, EncodeError};

/// Bounds-checked big-endian cursor over a received message.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn buf(&self) -> &'a [u8] {
        self.buf
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::BufferTruncated { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Writer into a fixed-capacity buffer, carrying the name compression table
/// for one encode pass.
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    /// Lower-cased label suffix -> offset of its first occurrence.
    names: HashMap<Vec<Vec<u8>>, u16>,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            names: HashMap::new(),
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    fn full(&self) -> EncodeError {
        EncodeError::BufferFull {
            capacity: self.buf.len(),
        }
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            return Err(self.full());
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub(crate) fn u8(&mut self, value: u8) -> Result<(), EncodeError> {
        self.bytes(&[value])
    }

    pub(crate) fn u16(&mut self, value: u16) -> Result<(), EncodeError> {
        self.bytes(&value.to_be_bytes())
    }

    pub(crate) fn u32(&mut self, value: u32) -> Result<(), EncodeError> {
        self.bytes(&value.to_be_bytes())
    }

    /// Overwrite two bytes already written at `at`.
    pub(crate) fn patch_u16(&mut self, at: usize, value: u16) {
        self.buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn compression_target(&self, suffix: &[Vec<u8>]) -> Option<u16> {
        self.names.get(suffix).copied()
    }

    pub(crate) fn remember_suffix(&mut self, suffix: Vec<Vec<u8>>, offset: usize) {
        // Pointers carry 14 bits of offset.
        if offset < 0x4000 {
            self.names.entry(suffix).or_insert(offset as u16);
        }
    }
}
