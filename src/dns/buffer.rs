//! Byte buffers used to read and write DNS messages

use derive_more::Display;

#[derive(Debug, Display)]
pub enum BufferError {
    #[display(fmt = "end of buffer")]
    EndOfBuffer,
    #[display(fmt = "label longer than 63 octets: {}", _0)]
    LabelTooLong(String),
    #[display(fmt = "too many compression jumps")]
    TooManyJumps,
    #[display(fmt = "invalid label type {:#x}", _0)]
    InvalidLabel(u8),
}

impl std::error::Error for BufferError {}

type Result<T> = std::result::Result<T, BufferError>;

/// Sequential access to a DNS message.
///
/// Names are read in fully qualified form (`example.com.`, root is `.`)
/// with compression pointers followed. Names are always written without
/// compression; the writer accepts names with or without the final dot.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for b in bytes {
            self.write(*b)?;
        }
        Ok(())
    }

    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let trimmed = qname.trim_end_matches('.');
        if !trimmed.is_empty() {
            for label in trimmed.split('.') {
                let len = label.len();
                if len > 0x3f {
                    return Err(BufferError::LabelTooLong(label.to_string()));
                }
                self.write_u8(len as u8)?;
                self.write_bytes(label.as_bytes())?;
            }
        }
        self.write_u8(0)
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let hi = self.read()? as u16;
        let lo = self.read()? as u16;
        Ok((hi << 8) | lo)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.pos();
        let bytes = self.get_range(start, len)?.to_vec();
        self.step(len)?;
        Ok(bytes)
    }

    /// Reads a (possibly compressed) domain name into `outstr`.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;

        loop {
            if jumps > 16 {
                return Err(BufferError::TooManyJumps);
            }

            let len = self.get(pos)?;

            // two high bits set means a compression pointer
            if (len & 0xC0) == 0xC0 {
                if !jumped {
                    self.seek(pos + 2)?;
                }
                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            } else if (len & 0xC0) != 0 {
                return Err(BufferError::InvalidLabel(len));
            }

            pos += 1;
            if len == 0 {
                break;
            }

            let label = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(label).to_lowercase());
            outstr.push('.');
            pos += len as usize;
        }

        if outstr.is_empty() {
            outstr.push('.');
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Growable buffer used for both building outgoing messages and parsing
/// messages received from the network.
#[derive(Default, Clone, Debug)]
pub struct VectorPacketBuffer {
    pub buf: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buf: Vec::new(),
            pos: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buf: bytes.to_vec(),
            pos: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        let res = *self.buf.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;
        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buf.get(pos).copied().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.buf
            .get(start..start + len)
            .ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos == self.buf.len() {
            self.buf.push(val);
        } else {
            self.buf[self.pos] = val;
        }
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        match self.buf.get_mut(pos) {
            Some(slot) => {
                *slot = val;
                Ok(())
            }
            None => Err(BufferError::EndOfBuffer),
        }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;
        Ok(())
    }
}
