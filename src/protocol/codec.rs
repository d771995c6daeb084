//! Line Codec for Tokio
//!
//! Frames are byte sequences terminated by CRLF. A frame longer than the
//! configured buffer size is a protocol error that closes the connection.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Tokio codec for CRLF-delimited text frames.
#[derive(Debug)]
pub struct LineCodec {
    max_length: usize,
    /// Scan resume point, so repeated decodes stay linear.
    scanned: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.scanned..].iter().position(|&b| b == b'\n');
        match newline {
            Some(offset) => {
                let end = self.scanned + offset;
                if end > self.max_length {
                    return Err(Error::OversizedFrame);
                }
                let mut line = src.split_to(end + 1);
                self.scanned = 0;
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let line = String::from_utf8(line.to_vec()).map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame is not valid UTF-8",
                    ))
                })?;
                Ok(Some(line))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(Error::OversizedFrame);
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
