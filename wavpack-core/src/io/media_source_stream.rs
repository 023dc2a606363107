// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::io::{Read, Seek};

use log::debug;

use crate::errors::{end_of_stream_error, Result};
use crate::io::MediaSource;

/// A positioned stream over a [`MediaSource`].
///
/// This is the reader handed to the block layer, and it offers exactly the operations that
/// layer is made of: bounded reads for the header-scan window, exact reads for block
/// payloads, skips over payloads that are not wanted, the three seek forms used by length
/// discovery and error recovery, and a single-byte push-back for probing. Seekability and
/// length come from the underlying source.
pub struct MediaSourceStream {
    inner: Box<dyn MediaSource>,
    /// Bytes pushed back onto the stream, consumed newest-first before the source is read.
    pushed_back: Vec<u8>,
    /// Absolute position of the next byte to be read.
    pos: u64,
    /// Whether the source reported itself seekable at creation.
    is_seekable: bool,
}

impl MediaSourceStream {
    pub fn new(inner: Box<dyn MediaSource>) -> Self {
        let is_seekable = inner.is_seekable();
        MediaSourceStream { inner, pushed_back: Vec::new(), pos: 0, is_seekable }
    }

    /// True when the underlying source supports positioning.
    pub fn is_seekable(&self) -> bool {
        self.is_seekable
    }

    /// Length of the underlying source in bytes, when known.
    pub fn byte_len(&self) -> Option<u64> {
        self.inner.byte_len()
    }

    /// Absolute position of the next byte to be read.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Pushes a single byte back onto the stream; the next read returns it first.
    pub fn push_back_byte(&mut self, byte: u8) {
        self.pushed_back.push(byte);
        self.pos -= 1;
    }

    /// Seeks to an absolute position. Pushed-back bytes are discarded.
    pub fn seek_abs(&mut self, pos: u64) -> Result<u64> {
        self.pushed_back.clear();
        self.pos = self.inner.seek(io::SeekFrom::Start(pos))?;
        Ok(self.pos)
    }

    /// Seeks relative to the current position.
    pub fn seek_rel(&mut self, delta: i64) -> Result<u64> {
        // The source does not know about pushed-back bytes, so fold them into the delta.
        let delta = delta - self.pushed_back.len() as i64;
        self.pushed_back.clear();
        self.pos = self.inner.seek(io::SeekFrom::Current(delta))?;
        Ok(self.pos)
    }

    /// Seeks relative to the end of the source.
    pub fn seek_from_end(&mut self, delta: i64) -> Result<u64> {
        self.pushed_back.clear();
        self.pos = self.inner.seek(io::SeekFrom::End(delta))?;
        Ok(self.pos)
    }

    /// Reads as many bytes as the source will give, returning the count. A short count means
    /// the stream ended inside the request.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            if let Some(byte) = self.pushed_back.pop() {
                buf[filled] = byte;
                filled += 1;
                continue;
            }

            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    debug!("retrying interrupted read");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.pos += filled as u64;
        Ok(filled)
    }

    /// Fills the buffer completely or fails with end-of-stream.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.read_some(buf)? < buf.len() {
            return end_of_stream_error();
        }

        Ok(())
    }

    /// Advances past `count` bytes, seeking over them when the source allows it.
    pub fn skip(&mut self, mut count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        if self.is_seekable && self.pushed_back.is_empty() {
            self.pos = self.inner.seek(io::SeekFrom::Current(count as i64))?;
            return Ok(());
        }

        let mut scratch = [0u8; 1024];

        while count > 0 {
            let chunk = count.min(scratch.len() as u64) as usize;
            self.read_exact(&mut scratch[..chunk])?;
            count -= chunk as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MediaSourceStream;
    use std::io::Cursor;

    #[test]
    fn verify_push_back() {
        let data: Vec<u8> = (0..16).collect();
        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data)));

        let mut buf = [0u8; 4];
        mss.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(mss.pos(), 4);

        mss.push_back_byte(3);
        mss.push_back_byte(2);
        assert_eq!(mss.pos(), 2);

        mss.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4, 5]);
    }

    #[test]
    fn verify_seek_and_skip() {
        let data: Vec<u8> = (0..64).collect();
        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(data)));
        let mut byte = [0u8; 1];

        mss.seek_abs(10).unwrap();
        mss.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 10);

        mss.skip(5).unwrap();
        mss.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 16);

        mss.seek_rel(-2).unwrap();
        mss.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 15);

        mss.seek_from_end(-1).unwrap();
        mss.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 63);
        assert!(mss.read_exact(&mut byte).is_err());
    }

    #[test]
    fn verify_short_read_at_end() {
        let mut mss = MediaSourceStream::new(Box::new(Cursor::new(vec![7u8, 8, 9])));

        let mut buf = [0u8; 8];
        assert_eq!(mss.read_some(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[7, 8, 9]);
        assert_eq!(mss.read_some(&mut buf).unwrap(), 0);
    }
}
