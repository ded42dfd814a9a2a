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

//! # MESSAGE CODEC
//!
//! Encodes and decodes [Message] frames as they travel on the data channel.
//!
//! The frame has two layouts selected by the connection's mode word. A peer
//! connection carries the full relay metadata; an ordinary client connection
//! omits it:
//!
//! | Field          | Peer | Client | Encoding                         |
//! |----------------|------|--------|----------------------------------|
//! | hop count      | yes  | no     | `u16`                            |
//! | hops           | yes  | no     | hop count × `u32`                |
//! | sender msgid   | yes  | yes    | 16 bytes, opaque                 |
//! | arrival time   | yes  | no     | `u64`                            |
//! | exchange       | yes  | yes    | short form                       |
//! | sender         | yes  | yes    | short form, zero length = absent |
//! | route          | yes  | yes    | short form                       |
//! | payload length | yes  | yes    | `u32`                            |
//! | payload        | yes  | yes    | payload length bytes             |
//!
//! A client-mode reader therefore leaves [arrival time] untouched; stamping
//! it at ingest is the receiving engine's business.
//!
//! [Message]:      crate::Message
//! [arrival time]: crate::Message::arrival_time

use crate::buf::{WireRead, WireWrite};
use crate::{Error, Message, MsgId, Rk, MAX_HOPS};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// ## WRITE MESSAGE FRAME
///
/// Encodes a [Message] onto the writer using the peer or client layout.
///
/// [Message]: crate::Message
pub fn write_msg<W: Write + ?Sized>(w: &mut W, msg: &Message, peer: bool) -> Result<(), Error> {
  if msg.payload.len() as u64 > u32::MAX as u64 {
    return Err(Error::PayloadTooLarge(msg.payload.len() as u64));
  }
  if peer {
    let nhops = msg.nhops.min(MAX_HOPS as u16);
    w.write_u16::<BigEndian>(nhops)?;
    for hop in &msg.hops[..nhops as usize] {
      w.write_u32::<BigEndian>(*hop)?;
    }
  }
  w.write_all(msg.sender_msgid.as_bytes())?;
  if peer {
    w.write_u64::<BigEndian>(msg.arrival_time)?;
  }
  w.write_rk(&msg.exchange)?;
  w.write_rk(&msg.sender)?;
  w.write_rk(&msg.route)?;
  w.write_u32::<BigEndian>(msg.payload.len() as u32)?;
  w.write_all(&msg.payload)?;
  Ok(())
}

/// ## READ MESSAGE FRAME
///
/// Decodes one [Message] frame from the reader, or yields [None] when the
/// stream ended cleanly before the frame began, which is how a broker hangs
/// up the data channel. Any truncation after the first byte is an error.
///
/// [Message]: crate::Message
pub fn read_msg<R: Read + ?Sized>(r: &mut R, peer: bool) -> Result<Option<Message>, Error> {
  let mut msg = Message {
    hops: [0; MAX_HOPS],
    nhops: 0,
    route: Rk::default(),
    sender: Rk::default(),
    exchange: Rk::default(),
    sender_msgid: MsgId::default(),
    payload: vec![],
    arrival_time: 0,
  };
  if peer {
    let nhops = match r.read_u16_or_eof()? {
      None => return Ok(None),
      Some(nhops) => nhops,
    };
    if nhops as usize > MAX_HOPS {
      return Err(Error::TooManyHops(nhops));
    }
    msg.nhops = nhops;
    for hop in &mut msg.hops[..nhops as usize] {
      *hop = r.read_u32::<BigEndian>()?;
    }
    let mut id = [0u8; 16];
    r.read_complete(&mut id)?;
    msg.sender_msgid = MsgId::from_bytes(id);
    msg.arrival_time = r.read_u64::<BigEndian>()?;
  } else {
    let mut id = [0u8; 16];
    if !r.read_complete_or_eof(&mut id)? {
      return Ok(None);
    }
    msg.sender_msgid = MsgId::from_bytes(id);
  }
  msg.exchange = r.read_rk()?;
  msg.sender = r.read_rk()?;
  msg.route = r.read_rk()?;
  let payload_len = r.read_u32::<BigEndian>()? as usize;
  let mut payload = vec![0u8; payload_len];
  r.read_complete(&mut payload)?;
  msg.payload = payload;
  Ok(Some(msg))
}
