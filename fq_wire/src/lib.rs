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

//! # FQ WIRE FORMAT
//!
//! The binary vocabulary spoken between an [FQ] message-fanout broker and its
//! clients, without reference to any particular connection or scheduling
//! strategy. Everything in this crate operates on [Read] and [Write]
//! implementors; sockets, threads, and session management belong to the
//! `fq_client` crate.
//!
//! ---------------------------------------------------------------------------
//!
//! An FQ session speaks over two TCP connections, each of which opens with a
//! 32-bit [Mode Word] and then diverges:
//!
//! - The **command channel** ([Command Mode]) carries the authentication
//!   sequence and a stream of opcode-tagged instruction frames, defined in
//!   the [Command Codec].
//! - The **data channel** ([Data Mode] or [Peer Mode]) carries a stream of
//!   [Message] frames, defined in the [Message Codec].
//!
//! All multi-byte integers on the wire are big-endian. The single exception
//! is the 16-byte [Message ID], which both broker and client treat as an
//! opaque blob and which is therefore copied byte-exact in native order.
//!
//! ---------------------------------------------------------------------------
//!
//! To use this crate:
//!
//! - Build [Message]s addressed with [Routing Key]s and carrying arbitrary
//!   payload bytes.
//! - Encode and decode message frames with the [Message Codec].
//! - Encode and decode command-channel frames with the [Command Codec].
//! - Use the [Framing Primitives] when a field must be read or written
//!   piecemeal.
//!
//! [FQ]:                 crate
//! [Read]:               std::io::Read
//! [Write]:              std::io::Write
//! [Mode Word]:          CMD_MODE
//! [Command Mode]:       CMD_MODE
//! [Data Mode]:          DATA_MODE
//! [Peer Mode]:          PEER_MODE
//! [Message]:            Message
//! [Message ID]:         MsgId
//! [Routing Key]:        Rk
//! [Message Codec]:      msg
//! [Command Codec]:      cmd
//! [Framing Primitives]: buf

pub mod buf;
pub mod cmd;
pub mod msg;

use std::fmt;
use thiserror::Error as ThisError;

/// ## MAXIMUM ROUTING KEY LENGTH
///
/// The longest [Routing Key] the wire format can carry: 127 bytes.
///
/// [Routing Key]: Rk
pub const MAX_RK_LEN: usize = 127;

/// ## MAXIMUM HOP COUNT
///
/// The fixed number of hop slots carried by every [Message]: 32.
///
/// [Message]: Message
pub const MAX_HOPS: usize = 32;

/// ## COMMAND MODE WORD
///
/// Written as the first 4 bytes of a command connection.
pub const CMD_MODE: u32 = 0xCC50_CAFE;

/// ## DATA MODE WORD
///
/// Written as the first 4 bytes of a data connection belonging to an
/// ordinary client.
pub const DATA_MODE: u32 = 0xCC50_FACE;

/// ## PEER MODE WORD
///
/// Written as the first 4 bytes of a data connection belonging to a peer
/// broker. Message frames on such a connection carry the full hop and
/// arrival metadata.
pub const PEER_MODE: u32 = 0xCC50_FEED;

/// ## OLD PEER MODE WORD
///
/// A historical alias for [PEER_MODE] which brokers still accept. Clients
/// never select it; it is retained so that test fixtures may speak it.
pub const OLD_PEER_MODE: u32 = 0xCC50_FADE;

/// ## WIRE ERROR
///
/// Represents a failure to encode or decode wire-format data.
///
/// A short read of an in-progress frame is always an error; a clean
/// end-of-stream before a frame has begun is not, and the frame readers
/// report it as [None] instead.
#[derive(Debug, ThisError)]
pub enum Error {
  /// ### I/O FAILURE
  ///
  /// The underlying reader or writer failed, including by reaching
  /// end-of-stream partway through a frame.
  #[error("i/o failure: {0}")]
  Io(#[from] std::io::Error),

  /// ### UNEXPECTED OPCODE
  ///
  /// A command frame arrived tagged with a 16-bit value that names no known
  /// operation, or names one that is invalid in the current exchange.
  #[error("unexpected opcode 0x{0:04X}")]
  BadOpcode(u16),

  /// ### OVERSIZED ROUTING KEY
  ///
  /// A length prefix promised a routing key longer than [MAX_RK_LEN] bytes.
  #[error("routing key of {0} bytes exceeds the wire limit")]
  RkTooLong(usize),

  /// ### OVERSIZED SESSION KEY
  ///
  /// The broker issued a session key longer than [MAX_RK_LEN] bytes, which
  /// no conforming broker does.
  #[error("session key of {0} bytes exceeds the wire limit")]
  KeyTooLong(usize),

  /// ### OVERSIZED HOP COUNT
  ///
  /// A peer-mode message frame promised more than [MAX_HOPS] hops.
  #[error("hop count {0} exceeds the wire limit")]
  TooManyHops(u16),

  /// ### OVERSIZED PAYLOAD
  ///
  /// A payload was presented for encoding whose length cannot be expressed
  /// in the frame's 32-bit length field.
  #[error("payload of {0} bytes exceeds the frame limit")]
  PayloadTooLarge(u64),

  /// ### AUTHENTICATION REFUSED
  ///
  /// The broker answered the authentication sequence with an error frame.
  /// The broker's stated reason is carried verbatim.
  #[error("authentication refused: {0}")]
  AuthRefused(String),
}

/// ## ROUTING KEY
///
/// A short identifier used for the exchange, route, and sender fields of a
/// [Message]: up to [MAX_RK_LEN] bytes behind a length prefix. Construction
/// from longer input silently truncates to the first [MAX_RK_LEN] bytes.
/// Once constructed, a routing key never changes.
///
/// [Message]: Message
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rk {
  bytes: Vec<u8>,
}

impl Rk {
  /// ### NEW ROUTING KEY
  ///
  /// Builds a routing key from a string, keeping at most the first
  /// [MAX_RK_LEN] bytes.
  pub fn new(name: &str) -> Self {
    Self::from_bytes(name.as_bytes())
  }

  /// ### ROUTING KEY FROM BYTES
  ///
  /// Builds a routing key from raw bytes, keeping at most the first
  /// [MAX_RK_LEN] bytes.
  pub fn from_bytes(bytes: &[u8]) -> Self {
    let keep = bytes.len().min(MAX_RK_LEN);
    Rk { bytes: bytes[..keep].to_vec() }
  }

  /// ### LENGTH
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  /// ### EMPTINESS
  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  /// ### RAW BYTES
  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }
}

impl fmt::Display for Rk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", String::from_utf8_lossy(&self.bytes))
  }
}

/// ## MESSAGE ID
///
/// A 16-byte blob identifying a [Message]. The client fills the low 8 bytes
/// of newly published messages at random, and the broker overwrites the full
/// value on receipt; neither side interprets the contents.
///
/// The blob may be viewed as four 32-bit words or two 64-bit words, both in
/// native byte order. Clients sharing identifiers across architectures must
/// agree on a convention out-of-band.
///
/// [Message]: Message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgId {
  bytes: [u8; 16],
}

impl MsgId {
  /// ### RANDOM MESSAGE ID
  ///
  /// Fills the low 8 bytes from the OS-seeded generator and zeroes the rest,
  /// leaving room for the broker's own stamp.
  pub fn random() -> Self {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&rand::random::<u64>().to_ne_bytes());
    MsgId { bytes }
  }

  /// ### MESSAGE ID FROM BYTES
  pub fn from_bytes(bytes: [u8; 16]) -> Self {
    MsgId { bytes }
  }

  /// ### RAW BYTES
  pub fn as_bytes(&self) -> &[u8; 16] {
    &self.bytes
  }

  /// ### 32-BIT WORD VIEW
  ///
  /// The blob as four native-order 32-bit words.
  pub fn words(&self) -> [u32; 4] {
    [
      u32::from_ne_bytes(self.bytes[0..4].try_into().unwrap()),
      u32::from_ne_bytes(self.bytes[4..8].try_into().unwrap()),
      u32::from_ne_bytes(self.bytes[8..12].try_into().unwrap()),
      u32::from_ne_bytes(self.bytes[12..16].try_into().unwrap()),
    ]
  }

  /// ### 64-BIT WORD VIEW
  ///
  /// The blob as two native-order 64-bit words.
  pub fn halves(&self) -> [u64; 2] {
    [
      u64::from_ne_bytes(self.bytes[0..8].try_into().unwrap()),
      u64::from_ne_bytes(self.bytes[8..16].try_into().unwrap()),
    ]
  }
}

/// ## MESSAGE
///
/// A unit of data published to or consumed from the broker, addressed by an
/// exchange and a route, and carrying an arbitrary payload of up to
/// 2³² − 1 bytes.
///
/// A message is treated as immutable once built by a publisher and once
/// received by a consumer. The hop list, the broker-stamped [Message ID],
/// and the arrival timestamp travel on the wire only between peer brokers;
/// ordinary clients receive the identifier but stamp arrival locally.
///
/// [Message ID]: MsgId
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
  /// ### HOPS
  ///
  /// The identifiers of the brokers this message has passed through, one
  /// 32-bit slot each; only the first [nhops] slots are meaningful.
  ///
  /// [nhops]: Message::nhops
  pub hops: [u32; MAX_HOPS],

  /// ### HOP COUNT
  pub nhops: u16,

  /// ### ROUTE
  ///
  /// The routing key the publisher addressed the message with.
  pub route: Rk,

  /// ### SENDER
  ///
  /// The identity of the publishing client, empty when unknown.
  pub sender: Rk,

  /// ### EXCHANGE
  ///
  /// The broker-side routing namespace the message belongs to.
  pub exchange: Rk,

  /// ### SENDER MESSAGE ID
  pub sender_msgid: MsgId,

  /// ### PAYLOAD
  pub payload: Vec<u8>,

  /// ### ARRIVAL TIME
  ///
  /// Nanoseconds since the epoch, stamped at ingest.
  pub arrival_time: u64,
}

impl Message {
  /// ### NEW MESSAGE
  ///
  /// Builds a message ready for publication: the given exchange, route, and
  /// payload, a randomized [Message ID], and no hop or arrival metadata.
  ///
  /// [Message ID]: MsgId
  pub fn new(exchange: Rk, route: Rk, payload: Vec<u8>) -> Self {
    Message {
      hops: [0; MAX_HOPS],
      nhops: 0,
      route,
      sender: Rk::default(),
      exchange,
      sender_msgid: MsgId::random(),
      payload,
      arrival_time: 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rk_roundtrips_short_names() {
    let rk = Rk::new("test.prefix");
    assert_eq!(rk.len(), 11);
    assert_eq!(rk.to_string(), "test.prefix");
  }

  #[test]
  fn rk_truncates_long_names() {
    let long: String = "x".repeat(300);
    let rk = Rk::new(&long);
    assert_eq!(rk.len(), MAX_RK_LEN);
    assert_eq!(rk.to_string(), &long[..MAX_RK_LEN]);
  }

  #[test]
  fn rk_empty_by_default() {
    assert!(Rk::default().is_empty());
    assert_eq!(Rk::default().to_string(), "");
  }

  #[test]
  fn msgid_word_views_agree() {
    let mut bytes = [0u8; 16];
    for (i, b) in bytes.iter_mut().enumerate() {
      *b = i as u8;
    }
    let id = MsgId::from_bytes(bytes);
    let words = id.words();
    let halves = id.halves();
    assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), words[0]);
    assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), halves[1]);
    assert_eq!(id.as_bytes(), &bytes);
  }

  #[test]
  fn msgid_random_leaves_high_bytes_zero() {
    let id = MsgId::random();
    assert_eq!(&id.as_bytes()[8..], &[0u8; 8]);
  }

  #[test]
  fn new_message_randomizes_id() {
    let a = Message::new(Rk::new("ex"), Rk::new("r"), vec![1, 2, 3]);
    let b = Message::new(Rk::new("ex"), Rk::new("r"), vec![1, 2, 3]);
    assert_ne!(a.sender_msgid, b.sender_msgid);
    assert_eq!(a.nhops, 0);
    assert_eq!(a.arrival_time, 0);
  }

  #[test]
  fn mode_words() {
    assert_eq!(CMD_MODE, 0xCC50CAFE);
    assert_eq!(DATA_MODE, 0xCC50FACE);
    assert_eq!(PEER_MODE, 0xCC50FEED);
    assert_eq!(OLD_PEER_MODE, 0xCC50FADE);
  }
}
