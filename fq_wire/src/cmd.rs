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

//! # COMMAND CODEC
//!
//! Encodes and decodes the opcode-tagged instruction frames carried on the
//! command channel: the authentication sequence, heartbeats, and the
//! bind/unbind/status request and reply pairs.
//!
//! ---------------------------------------------------------------------------
//!
//! Every command frame opens with a 16-bit [Opcode]:
//!
//! | Opcode            | Direction | Payload                                  |
//! |-------------------|-----------|------------------------------------------|
//! | `HBREQ 0x4848`    | C → S     | `u16` heartbeat interval, milliseconds   |
//! | `HB 0xBEA7`       | both      | none                                     |
//! | `BINDREQ 0xB170`  | C → S     | `u16` flags, short exchange, short program |
//! | `BIND 0xB171`     | S → C     | `u32` route id                           |
//! | `UNBINDREQ 0x071B`| C → S     | `u32` route id, short exchange           |
//! | `UNBIND 0x171B`   | S → C     | `u32` success                            |
//! | `STATUSREQ 0xC7A7`| C → S     | none                                     |
//! | `STATUS 0x57A7`   | S → C     | repeated short key + `u32`, zero-length terminated |
//! | `ERROR 0xEEEE`    | S → C     | short text                               |
//!
//! The authentication sequence (`AUTH 0xAAAA`, plain method `0x0000`) is a
//! one-time exchange performed before any of the above; see [write auth] and
//! [read auth reply].
//!
//! [Opcode]:          Opcode
//! [write auth]:      write_auth
//! [read auth reply]: read_auth_reply

use crate::buf::{WireRead, WireWrite};
use crate::{Error, Rk, MAX_RK_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{Read, Write};

/// ## COMMAND OPCODE
///
/// The 16-bit tag opening every command-channel frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
  /// ### PLAIN AUTHENTICATION METHOD
  ///
  /// Sent immediately after [AUTH], selecting the only method defined.
  ///
  /// [AUTH]: Opcode::Auth
  AuthPlain = 0x0000,

  /// ### UNBIND REQUEST
  UnbindReq = 0x071B,

  /// ### UNBIND REPLY
  Unbind = 0x171B,

  /// ### HEARTBEAT REQUEST
  ///
  /// Asks the broker to exchange heartbeats at the given interval.
  HbReq = 0x4848,

  /// ### STATUS REPLY
  Status = 0x57A7,

  /// ### AUTHENTICATION REPLY
  ///
  /// Followed by the session key in short form.
  AuthResp = 0xAA00,

  /// ### AUTHENTICATION OPEN
  Auth = 0xAAAA,

  /// ### BIND REQUEST
  BindReq = 0xB170,

  /// ### BIND REPLY
  Bind = 0xB171,

  /// ### HEARTBEAT
  ///
  /// A bare liveness tick, mirrored by each side once the exchange begins.
  Hb = 0xBEA7,

  /// ### STATUS REQUEST
  StatusReq = 0xC7A7,

  /// ### SERVER ERROR
  ///
  /// Fatal at this layer; carries the broker's stated reason.
  Error = 0xEEEE,
}

/// ## BIND FLAG: PEER
pub const FLAG_PEER: u16 = 0x0001;

/// ## BIND FLAG: TRANSIENT
pub const FLAG_TRANS: u16 = 0x0100;

/// ## BIND FLAG: PERMANENT
pub const FLAG_PERM: u16 = 0x0110;

/// ## REFUSED ROUTE SENTINEL
///
/// The route id a [BIND reply] carries when the broker refused the bind.
///
/// [BIND reply]: Reply::Bind
pub const ROUTE_REFUSED: u32 = 0xFFFF_FFFF;

/// ## BIND REQUEST
///
/// Asks the broker to attach a routing program to an exchange. The broker's
/// answer lands in [out route id]: the new route's handle, or
/// [ROUTE_REFUSED] when the bind was denied.
///
/// The program travels as opaque bytes; the client does not parse it.
///
/// [out route id]: BindReq::out_route_id
#[derive(Clone, Debug, PartialEq)]
pub struct BindReq {
  pub exchange: Rk,
  pub flags: u16,
  pub program: String,
  pub out_route_id: u32,
}

impl BindReq {
  pub fn new(exchange: Rk, flags: u16, program: &str) -> Self {
    BindReq {
      exchange,
      flags,
      program: program.to_string(),
      out_route_id: 0,
    }
  }
}

/// ## UNBIND REQUEST
///
/// Asks the broker to drop a previously bound route. The broker's answer
/// lands in [out success].
///
/// [out success]: UnbindReq::out_success
#[derive(Clone, Debug, PartialEq)]
pub struct UnbindReq {
  pub exchange: Rk,
  pub route_id: u32,
  pub out_success: u32,
}

impl UnbindReq {
  pub fn new(exchange: Rk, route_id: u32) -> Self {
    UnbindReq {
      exchange,
      route_id,
      out_success: 0,
    }
  }
}

/// ## COMMAND REPLY
///
/// A decoded server-to-client command frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
  /// ### HEARTBEAT TICK
  Heartbeat,

  /// ### BIND REPLY
  ///
  /// The assigned route id, or [ROUTE_REFUSED].
  Bind(u32),

  /// ### UNBIND REPLY
  Unbind(u32),

  /// ### STATUS REPLY
  ///
  /// The broker's counters, one named 32-bit value each.
  Status(Vec<(Rk, u32)>),

  /// ### SERVER ERROR
  Error(String),
}

/// ## WRITE HEARTBEAT REQUEST
pub fn write_hb_req<W: Write + ?Sized>(w: &mut W, interval_ms: u16) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::HbReq.into())?;
  w.write_u16::<BigEndian>(interval_ms)?;
  Ok(())
}

/// ## WRITE HEARTBEAT
pub fn write_hb<W: Write + ?Sized>(w: &mut W) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::Hb.into())?;
  Ok(())
}

/// ## WRITE BIND REQUEST
///
/// The program must fit the short form; the session layer enforces this
/// before the request is accepted.
pub fn write_bind_req<W: Write + ?Sized>(w: &mut W, req: &BindReq) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::BindReq.into())?;
  w.write_u16::<BigEndian>(req.flags)?;
  w.write_rk(&req.exchange)?;
  w.write_short(req.program.as_bytes())?;
  Ok(())
}

/// ## WRITE UNBIND REQUEST
pub fn write_unbind_req<W: Write + ?Sized>(w: &mut W, req: &UnbindReq) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::UnbindReq.into())?;
  w.write_u32::<BigEndian>(req.route_id)?;
  w.write_rk(&req.exchange)?;
  Ok(())
}

/// ## WRITE STATUS REQUEST
pub fn write_status_req<W: Write + ?Sized>(w: &mut W) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::StatusReq.into())?;
  Ok(())
}

/// ## WRITE AUTHENTICATION SEQUENCE
///
/// Opens with [AUTH] and the plain method word, then three short-form blobs:
/// the user, the queue name joined to the queue type by a single zero byte,
/// and the password.
///
/// [AUTH]: Opcode::Auth
pub fn write_auth<W: Write + ?Sized>(
  w: &mut W,
  user: &[u8],
  queue: &[u8],
  queue_type: &[u8],
  password: &[u8],
) -> Result<(), Error> {
  w.write_u16::<BigEndian>(Opcode::Auth.into())?;
  w.write_u16::<BigEndian>(Opcode::AuthPlain.into())?;
  w.write_short(user)?;
  let mut blob = Vec::with_capacity(queue.len() + 1 + queue_type.len());
  blob.extend_from_slice(queue);
  blob.push(0x00);
  blob.extend_from_slice(queue_type);
  w.write_short(&blob)?;
  w.write_short(password)?;
  Ok(())
}

/// ## READ AUTHENTICATION REPLY
///
/// Yields the session key on success. An [ERROR] frame becomes
/// [AuthRefused]; an oversized key or any other opcode is a protocol
/// violation.
///
/// [ERROR]:       Opcode::Error
/// [AuthRefused]: Error::AuthRefused
pub fn read_auth_reply<R: Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, Error> {
  let word = r.read_u16::<BigEndian>()?;
  match Opcode::try_from(word) {
    Ok(Opcode::AuthResp) => {
      let len = r.read_u16::<BigEndian>()? as usize;
      if len > MAX_RK_LEN {
        return Err(Error::KeyTooLong(len));
      }
      let mut key = vec![0u8; len];
      r.read_complete(&mut key)?;
      Ok(key)
    }
    Ok(Opcode::Error) => {
      let text = r.read_short()?;
      Err(Error::AuthRefused(String::from_utf8_lossy(&text).into_owned()))
    }
    _ => Err(Error::BadOpcode(word)),
  }
}

/// ## READ COMMAND REPLY
///
/// Decodes one server-to-client frame, or yields [None] when the stream
/// ended cleanly before a frame began. Client-to-server opcodes arriving
/// here are a protocol violation.
pub fn read_reply<R: Read + ?Sized>(r: &mut R) -> Result<Option<Reply>, Error> {
  let word = match r.read_u16_or_eof()? {
    None => return Ok(None),
    Some(word) => word,
  };
  match Opcode::try_from(word) {
    Ok(Opcode::Hb) => Ok(Some(Reply::Heartbeat)),
    Ok(Opcode::Bind) => Ok(Some(Reply::Bind(r.read_u32::<BigEndian>()?))),
    Ok(Opcode::Unbind) => Ok(Some(Reply::Unbind(r.read_u32::<BigEndian>()?))),
    Ok(Opcode::Status) => {
      let mut fields: Vec<(Rk, u32)> = vec![];
      loop {
        let len = r.read_u16::<BigEndian>()? as usize;
        if len == 0 {
          break;
        }
        let key = r.read_rk_body(len)?;
        let value = r.read_u32::<BigEndian>()?;
        fields.push((key, value));
      }
      Ok(Some(Reply::Status(fields)))
    }
    Ok(Opcode::Error) => {
      let text = r.read_short()?;
      Ok(Some(Reply::Error(String::from_utf8_lossy(&text).into_owned())))
    }
    _ => Err(Error::BadOpcode(word)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[test]
  fn bind_request_byte_layout() {
    let req = BindReq::new(Rk::new("ex"), FLAG_TRANS, "prg");
    let mut buf: Vec<u8> = vec![];
    write_bind_req(&mut buf, &req).unwrap();
    assert_eq!(
      buf,
      vec![
        0xB1, 0x70, // BINDREQ
        0x01, 0x00, // flags
        0x00, 0x02, b'e', b'x', // exchange
        0x00, 0x03, b'p', b'r', b'g', // program
      ]
    );
  }

  #[test]
  fn unbind_request_byte_layout() {
    let req = UnbindReq::new(Rk::new("ex"), 7);
    let mut buf: Vec<u8> = vec![];
    write_unbind_req(&mut buf, &req).unwrap();
    assert_eq!(
      buf,
      vec![0x07, 0x1B, 0x00, 0x00, 0x00, 0x07, 0x00, 0x02, b'e', b'x']
    );
  }

  #[test]
  fn heartbeat_request_byte_layout() {
    let mut buf: Vec<u8> = vec![];
    write_hb_req(&mut buf, 1000).unwrap();
    assert_eq!(buf, vec![0x48, 0x48, 0x03, 0xE8]);
  }

  #[test]
  fn auth_sequence_byte_layout() {
    let mut buf: Vec<u8> = vec![];
    write_auth(&mut buf, b"u", b"q", b"mem", b"p").unwrap();
    assert_eq!(
      buf,
      vec![
        0xAA, 0xAA, // AUTH
        0x00, 0x00, // plain
        0x00, 0x01, b'u', // user
        0x00, 0x05, b'q', 0x00, b'm', b'e', b'm', // queue \0 type
        0x00, 0x01, b'p', // password
      ]
    );
  }

  #[test]
  fn auth_reply_success() {
    let mut buf: Vec<u8> = vec![0xAA, 0x00, 0x00, 0x04];
    buf.extend_from_slice(b"KKKK");
    let key = read_auth_reply(&mut Cursor::new(buf)).unwrap();
    assert_eq!(key, b"KKKK");
  }

  #[test]
  fn auth_reply_refusal() {
    let mut buf: Vec<u8> = vec![0xEE, 0xEE, 0x00, 0x03];
    buf.extend_from_slice(b"bad");
    match read_auth_reply(&mut Cursor::new(buf)) {
      Err(Error::AuthRefused(text)) => assert_eq!(text, "bad"),
      other => panic!("unexpected result: {other:?}"),
    }
  }

  #[test]
  fn auth_reply_oversized_key() {
    let mut buf: Vec<u8> = vec![0xAA, 0x00, 0x00, 0x80];
    buf.extend_from_slice(&[0u8; 0x80]);
    assert!(matches!(
      read_auth_reply(&mut Cursor::new(buf)),
      Err(Error::KeyTooLong(128))
    ));
  }

  #[test]
  fn auth_reply_unknown_opcode() {
    let buf: Vec<u8> = vec![0x12, 0x34];
    assert!(matches!(
      read_auth_reply(&mut Cursor::new(buf)),
      Err(Error::BadOpcode(0x1234))
    ));
  }

  #[test]
  fn reply_heartbeat() {
    let buf: Vec<u8> = vec![0xBE, 0xA7];
    assert_eq!(read_reply(&mut Cursor::new(buf)).unwrap(), Some(Reply::Heartbeat));
  }

  #[test]
  fn reply_bind_refused() {
    let buf: Vec<u8> = vec![0xB1, 0x71, 0xFF, 0xFF, 0xFF, 0xFF];
    assert_eq!(
      read_reply(&mut Cursor::new(buf)).unwrap(),
      Some(Reply::Bind(ROUTE_REFUSED))
    );
  }

  #[test]
  fn reply_status_terminated_by_empty_key() {
    let mut buf: Vec<u8> = vec![0x57, 0xA7];
    buf.write_short(b"no_exchange").unwrap();
    buf.extend_from_slice(&5u32.to_be_bytes());
    buf.write_short(b"routed").unwrap();
    buf.extend_from_slice(&90u32.to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x00]);
    let reply = read_reply(&mut Cursor::new(buf)).unwrap();
    assert_eq!(
      reply,
      Some(Reply::Status(vec![
        (Rk::new("no_exchange"), 5),
        (Rk::new("routed"), 90),
      ]))
    );
  }

  #[test]
  fn reply_closed_stream_is_none() {
    assert_eq!(read_reply(&mut Cursor::new(Vec::<u8>::new())).unwrap(), None);
  }

  #[test]
  fn reply_client_opcode_is_a_violation() {
    let buf: Vec<u8> = vec![0xB1, 0x70];
    assert!(matches!(
      read_reply(&mut Cursor::new(buf)),
      Err(Error::BadOpcode(0xB170))
    ));
  }
}
