// Symphonia
// Copyright (c) 2019-2022 The Project Symphonia Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io` module implements the byte- and bit-level input/output the codec is built on.
//!
//! Decoding consumes a [`MediaSource`]: the capability set (sequential reads, optional
//! seeking, optional length) that the container's reader callbacks boil down to.
//! [`MediaSourceStream`] turns one into a positioned stream offering exactly the operations
//! block discovery and block loading are made of. Metadata payloads, which are sequences of
//! little-endian 16-bit words by construction, parse through [`WordReader`]. Bit-level
//! access to the compressed streams lives in [`bit`], and descriptor-driven serialization of
//! packed on-disk structures in [`packed`].

use std::io;

pub mod bit;
pub mod packed;

mod media_source_stream;
mod word_reader;

pub use media_source_stream::MediaSourceStream;
pub use word_reader::WordReader;

/// The capability set required of anything the decoder reads from. Despite the
/// [`std::io::Seek`] bound, seeking is an optional capability queried at runtime; sources
/// that cannot seek simply confine the decoder to its forward-only paths.
pub trait MediaSource: io::Read + io::Seek + Send {
    /// True when absolute positioning actually works on this source.
    fn is_seekable(&self) -> bool;

    /// Total length in bytes, when the source knows it.
    fn byte_len(&self) -> Option<u64>;
}

impl MediaSource for std::fs::File {
    fn is_seekable(&self) -> bool {
        // Regular files seek; FIFOs and devices that arrive dressed as files do not.
        self.metadata().map(|meta| meta.is_file()).unwrap_or(false)
    }

    fn byte_len(&self) -> Option<u64> {
        self.metadata().ok().map(|meta| meta.len())
    }
}

impl<T: AsRef<[u8]> + Send> MediaSource for io::Cursor<T> {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.get_ref().as_ref().len() as u64)
    }
}

/// Adapts a plain [`std::io::Read`] (a pipe, a socket) into an unseekable [`MediaSource`]
/// suitable for feeding the decoder in streaming mode.
pub struct ReadOnlySource<R> {
    inner: R,
}

impl<R: io::Read + Send> ReadOnlySource<R> {
    pub fn new(inner: R) -> Self {
        ReadOnlySource { inner }
    }
}

impl<R: io::Read> io::Read for ReadOnlySource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: io::Read> io::Seek for ReadOnlySource<R> {
    fn seek(&mut self, _: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "source does not support seeking"))
    }
}

impl<R: io::Read + Send> MediaSource for ReadOnlySource<R> {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
