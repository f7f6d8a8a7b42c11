//! Reading and writing frames on byte streams.
//!
//! Frames are self-delimiting: the reader takes the 8-byte size first, sizes
//! its buffer from it and then reads the remainder.

use std::io::{ErrorKind, Read, Write};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Reads until `buf` is full or the stream ends. Returns the number of bytes
/// read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads framed messages from a byte stream.
///
/// The frame buffer is kept between calls and only grows.
pub struct FrameReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Creates a new FrameReader wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
        }
    }

    /// Reads one raw frame, header included.
    ///
    /// Returns `Ok(None)` if the stream ended cleanly before the first byte
    /// of a header. A stream ending anywhere else is
    /// [`ProtocolError::IncompleteMessage`].
    pub fn read_frame(&mut self) -> ProtocolResult<Option<&[u8]>> {
        let mut size_buf = [0u8; 8];
        let got = read_full(&mut self.reader, &mut size_buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < size_buf.len() {
            return Err(ProtocolError::IncompleteMessage {
                expected: size_buf.len(),
                received: got,
            });
        }

        let size = u64::from_le_bytes(size_buf);
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if size < HEADER_SIZE as u64 {
            return Err(ProtocolError::EmptyMessage);
        }

        let size = size as usize;
        self.buffer.clear();
        self.buffer.resize(size, 0);
        self.buffer[..8].copy_from_slice(&size_buf);
        let body = read_full(&mut self.reader, &mut self.buffer[8..])?;
        if body < size - 8 {
            return Err(ProtocolError::IncompleteMessage {
                expected: size,
                received: 8 + body,
            });
        }
        Ok(Some(&self.buffer[..size]))
    }

    /// Reads and decodes one message. `Ok(None)` means clean end of stream.
    pub fn read_message(&mut self) -> ProtocolResult<Option<Message>> {
        match self.read_frame()? {
            Some(frame) => Message::decode(frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Writes framed messages to a byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encodes `message` and writes the whole frame. The message is only
    /// borrowed.
    pub fn write_message(&mut self, message: &Message) -> ProtocolResult<()> {
        let frame = message.encode()?;
        self.write_frame(&frame)
    }

    /// Writes a frame produced by [`Message::encode`]. Lets a caller encode
    /// once and write to many peers.
    pub fn write_frame(&mut self, frame: &[u8]) -> ProtocolResult<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()?;
        Ok(())
    }
}
