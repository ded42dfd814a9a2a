// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # FRAMING PRIMITIVES
//!
//! The handful of byte-level operations every [FQ] frame is built from: exact
//! reads, big-endian integers, and the length-prefixed "short" form used for
//! routing keys, credentials, and other small blobs.
//!
//! Two extension traits are provided, [WireRead] over [Read] and [WireWrite]
//! over [Write], so that the codecs can compose these operations on any byte
//! stream. None of these operations ever performs a partial read or write: a
//! field is either transferred whole or the operation fails.
//!
//! [FQ]:    crate
//! [Read]:  std::io::Read
//! [Write]: std::io::Write

use crate::{Error, Rk, MAX_RK_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};

/// ## WIRE READER
///
/// Extends any [Read] implementor with the [FQ] framing primitives.
///
/// [FQ]:   crate
/// [Read]: std::io::Read
pub trait WireRead: Read {
  /// ### READ COMPLETE
  ///
  /// Reads exactly enough bytes to fill the buffer or fails; end-of-stream
  /// partway through is an error.
  fn read_complete(&mut self, buf: &mut [u8]) -> Result<(), Error> {
    self.read_exact(buf).map_err(Error::from)
  }

  /// ### READ COMPLETE, TOLERATING END-OF-STREAM
  ///
  /// Like [read complete], except that a clean end-of-stream before the
  /// first byte yields `false` rather than an error. End-of-stream after
  /// the first byte remains an error, as the frame it began is now
  /// unrecoverable.
  ///
  /// [read complete]: WireRead::read_complete
  fn read_complete_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, Error> {
    if buf.is_empty() {
      return Ok(true);
    }
    let first = loop {
      match self.read(&mut buf[..1]) {
        Ok(n) => break n,
        Err(error) if error.kind() == ErrorKind::Interrupted => continue,
        Err(error) => return Err(Error::Io(error)),
      }
    };
    if first == 0 {
      return Ok(false);
    }
    self.read_complete(&mut buf[1..])?;
    Ok(true)
  }

  /// ### READ 16-BIT PREFIX, TOLERATING END-OF-STREAM
  ///
  /// Reads a big-endian `u16`, yielding [None] on a clean end-of-stream
  /// before the first byte. Used by the frame readers to distinguish a
  /// closed connection from a truncated frame.
  fn read_u16_or_eof(&mut self) -> Result<Option<u16>, Error> {
    let mut word = [0u8; 2];
    if !self.read_complete_or_eof(&mut word)? {
      return Ok(None);
    }
    Ok(Some(u16::from_be_bytes(word)))
  }

  /// ### READ SHORT FORM
  ///
  /// Reads a big-endian `u16` length followed by exactly that many bytes.
  fn read_short(&mut self) -> Result<Vec<u8>, Error> {
    let len = self.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    self.read_complete(&mut bytes)?;
    Ok(bytes)
  }

  /// ### READ ROUTING KEY
  ///
  /// Reads a [Routing Key] in short form, rejecting lengths the key type
  /// cannot represent.
  ///
  /// [Routing Key]: Rk
  fn read_rk(&mut self) -> Result<Rk, Error> {
    let len = self.read_u16::<BigEndian>()? as usize;
    self.read_rk_body(len)
  }

  /// ### READ ROUTING KEY BODY
  ///
  /// Reads the remainder of a [Routing Key] whose length prefix has already
  /// been consumed.
  ///
  /// [Routing Key]: Rk
  fn read_rk_body(&mut self, len: usize) -> Result<Rk, Error> {
    if len > MAX_RK_LEN {
      return Err(Error::RkTooLong(len));
    }
    let mut bytes = vec![0u8; len];
    self.read_complete(&mut bytes)?;
    Ok(Rk::from_bytes(&bytes))
  }
}

impl<R: Read + ?Sized> WireRead for R {}

/// ## WIRE WRITER
///
/// Extends any [Write] implementor with the [FQ] framing primitives.
///
/// [FQ]:    crate
/// [Write]: std::io::Write
pub trait WireWrite: Write {
  /// ### WRITE SHORT FORM
  ///
  /// Writes a big-endian `u16` length followed by the bytes themselves.
  /// The caller guarantees the length fits the prefix; every short-form
  /// field in the protocol is bounded well below it.
  fn write_short(&mut self, bytes: &[u8]) -> Result<(), Error> {
    self.write_u16::<BigEndian>(bytes.len() as u16)?;
    self.write_all(bytes)?;
    Ok(())
  }

  /// ### WRITE ROUTING KEY
  ///
  /// Writes a [Routing Key] in short form. An empty key writes a bare zero
  /// length, which readers take to mean the field is absent.
  ///
  /// [Routing Key]: Rk
  fn write_rk(&mut self, rk: &Rk) -> Result<(), Error> {
    self.write_short(rk.as_bytes())
  }
}

impl<W: Write + ?Sized> WireWrite for W {}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn short_form_roundtrip() {
    let mut buf: Vec<u8> = vec![];
    buf.write_short(b"maryland").unwrap();
    assert_eq!(&buf[..2], &[0x00, 0x08]);
    let mut cursor = Cursor::new(buf);
    assert_eq!(cursor.read_short().unwrap(), b"maryland");
  }

  #[test]
  fn short_form_empty() {
    let mut buf: Vec<u8> = vec![];
    buf.write_short(b"").unwrap();
    assert_eq!(buf, vec![0x00, 0x00]);
    let mut cursor = Cursor::new(buf);
    assert!(cursor.read_short().unwrap().is_empty());
  }

  #[test]
  fn read_complete_rejects_truncation() {
    let mut cursor = Cursor::new(vec![1u8, 2, 3]);
    let mut buf = [0u8; 4];
    assert!(matches!(cursor.read_complete(&mut buf), Err(Error::Io(_))));
  }

  #[test]
  fn eof_before_a_frame_is_clean() {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    assert_eq!(cursor.read_u16_or_eof().unwrap(), None);
  }

  #[test]
  fn eof_inside_a_frame_is_not() {
    let mut cursor = Cursor::new(vec![0xAAu8]);
    assert!(cursor.read_u16_or_eof().is_err());
  }

  #[test]
  fn rk_read_rejects_oversize() {
    let mut buf: Vec<u8> = vec![];
    buf.write_short(&[7u8; 200]).unwrap();
    let mut cursor = Cursor::new(buf);
    assert!(matches!(cursor.read_rk(), Err(Error::RkTooLong(200))));
  }

  #[test]
  fn rk_roundtrip() {
    let mut buf: Vec<u8> = vec![];
    buf.write_rk(&Rk::new("sender.one")).unwrap();
    let mut cursor = Cursor::new(buf);
    assert_eq!(cursor.read_rk().unwrap(), Rk::new("sender.one"));
  }
}
