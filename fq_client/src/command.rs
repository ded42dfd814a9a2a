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

//! # COMMAND ENGINE
//!
//! The state machine that owns the command connection. One serve cycle
//! dials the broker, authenticates, and then interleaves three streams of
//! work until something fatal happens: instructions arriving from the
//! public API, reply frames arriving from the broker, and heartbeat ticks.
//!
//! Replies carry no transaction identifiers. The protocol instead promises
//! that replies arrive in the order their requests were sent, so every
//! request expecting one is queued *before* its bytes are written, and each
//! arriving reply must pair with the oldest queued request. A reply that
//! does not pair is a protocol violation and ends the session.

use crate::client::{Client, Creds};
use crate::hooks::Instr;
use crate::{Error, SessionState, CONNECT_TIMEOUT};
use byteorder::{BigEndian, WriteBytesExt};
use fq_wire::cmd::{self, Reply};
use fq_wire::CMD_MODE;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Frames and ticks bound for the serve loop.
const EVENTS_DEPTH: usize = 10;

// How long the serve loop waits on protocol events before polling the
// instruction queue again.
const INSTR_POLL: Duration = Duration::from_millis(10);

// Breather between serve cycles that ended in an error, so an unreachable
// broker is not redialed in a hot loop.
const REDIAL_PAUSE: Duration = Duration::from_millis(50);

/// ## PROTOCOL EVENT
///
/// What the serve loop selects over: a decoded frame from the reader
/// thread, a tick from the heartbeat ticker, or notice that the reader is
/// done.
enum Event {
  Frame(Reply),
  Tick,
  Closed(Option<fq_wire::Error>),
}

/// ## COMMAND WORKER
///
/// The long-lived loop owning the command connection: connect, serve,
/// report the disconnect, and go again, until the stop flag is raised.
/// Every cycle that ends, however it ends, also kicks the data connection
/// so that the pair is re-established together.
pub(crate) fn command_worker(client: Arc<Client>, signal: SyncSender<bool>) {
  loop {
    if client.stop.load(Acquire) {
      break;
    }
    let result = command_serve(&client, &signal);
    if let Err(error) = &result {
      if !client.stop.load(Acquire) {
        client.fail(error);
      }
    }

    // TEARDOWN
    //
    // The cycle is over. Whatever it achieved is now stale: the session
    // key no longer names a live session, so the data engine must not act
    // on it, and both sockets are kicked so that any thread still blocked
    // on them unwinds.
    client.data_ready.store(false, Release);
    client.state.store(SessionState::Disconnected, Relaxed);
    client.kick_command();
    client.kick_data();
    if client.stop.load(Acquire) {
      break;
    }
    client.run_disconnect_hook();
    if result.is_err() {
      thread::sleep(REDIAL_PAUSE);
    }
  }
  client.state.store(SessionState::Disconnected, Relaxed);
  tracing::debug!("command worker stopped");
}

/// ## SERVE CYCLE
///
/// One pass of the command state machine, from dialing to the first fatal
/// condition. Success means the stop flag ended an otherwise healthy
/// session.
fn command_serve(client: &Arc<Client>, signal: &SyncSender<bool>) -> Result<(), Error> {
  let creds = client.creds_snapshot()?;

  // CONNECT
  //
  // The broker is dialed with a bounded timeout, and the mode word is the
  // first thing on the wire; nothing else may precede it.
  client.state.store(SessionState::Connecting, Relaxed);
  let mut stream = dial(&creds.host, creds.port)?;
  stream.write_u32::<BigEndian>(CMD_MODE)?;
  client.set_command_sock(stream.try_clone()?);
  tracing::debug!(host = %creds.host, port = creds.port, "command channel connected");

  // AUTHENTICATE
  //
  // The authentication sequence either produces the session key or ends
  // the cycle. Either way the auth hook hears about it; in synchronous
  // mode that means a fully built instruction on the back-channel.
  client.state.store(SessionState::Authenticating, Relaxed);
  let key = match authenticate(&mut stream, &creds) {
    Ok(key) => key,
    Err(error) => {
      client.state.store(SessionState::Closing, Relaxed);
      let reported = match &error {
        Error::Auth(text) => text.clone(),
        other => other.to_string(),
      };
      client.deliver_hreq(Instr::Auth { error: Some(Error::Auth(reported)) });
      return Err(error);
    }
  };
  tracing::debug!(key_len = key.len(), queue = %creds.queue, "session authenticated");
  client.set_session_key(key);
  client.data_ready.store(true, Release);
  client.state.store(SessionState::Ready, Relaxed);
  client.deliver_hreq(Instr::Auth { error: None });

  // SIGNAL THE DATA ENGINE
  //
  // Exactly one signal is raised per successful session. If the previous
  // session's signal is still buffered, the data engine has yet to wake;
  // when it does, it will read the key this session just stored.
  if signal.try_send(true).is_err() {
    tracing::debug!("data-ready signal already pending");
  }

  // OPEN THE HEARTBEAT EXCHANGE
  //
  // The broker is asked for heartbeats at the interval in force, and the
  // liveness clock starts now. Mirrored HBs only begin once the broker
  // has sent one of its own.
  let interval_ms = client.hb_interval_ms.load(Relaxed).clamp(1, 1000) as u16;
  let mut buf: Vec<u8> = vec![];
  cmd::write_hb_req(&mut buf, interval_ms)?;
  stream.write_all(&buf)?;

  // START THE READER AND TICKER
  //
  // The reader owns a clone of the stream and feeds decoded frames into
  // the event channel, hanging up when the connection dies. The ticker
  // sleeps on its quit channel, which doubles as its teardown: dropping
  // the sender ends it.
  let (events_tx, events_rx) = sync_channel::<Event>(EVENTS_DEPTH);
  let reader_stream = stream.try_clone()?;
  let reader_tx = events_tx.clone();
  thread::Builder::new()
    .name("command-reader".to_string())
    .spawn(move || reader_loop(reader_stream, reader_tx))?;
  let (quit_tx, quit_rx) = oneshot::channel::<()>();
  let ticker_client = client.clone();
  thread::Builder::new()
    .name("heartbeat-ticker".to_string())
    .spawn(move || ticker_loop(ticker_client, events_tx, quit_rx))?;

  let result = serve_ready(client, &mut stream, &events_rx);
  client.state.store(SessionState::Closing, Relaxed);
  drop(quit_tx);
  let _ = stream.shutdown(Shutdown::Both);
  result
}

/// ## READY LOOP
///
/// Interleaves instructions, frames, and ticks until a fatal condition or
/// the stop flag.
fn serve_ready(
  client: &Arc<Client>,
  stream: &mut TcpStream,
  events: &Receiver<Event>,
) -> Result<(), Error> {
  let cmdq = match client.cmdq.get() {
    Some(cmdq) => cmdq.clone(),
    None => return Err(Error::Usage("credentials not supplied")),
  };
  let mut pending: VecDeque<Instr> = VecDeque::new();
  let mut hb_last = Instant::now();
  let mut hb_needed = false;
  loop {
    if client.stop.load(Acquire) {
      return Ok(());
    }

    // INSTRUCTIONS
    //
    // Drained without blocking, and sent in arrival order.
    while let Some(instr) = cmdq.try_pop() {
      send_instr(stream, &mut pending, instr)?;
    }

    // EVENTS
    //
    // A short wait keeps the instruction queue polled even when the
    // broker is quiet.
    match events.recv_timeout(INSTR_POLL) {
      Ok(Event::Frame(reply)) => {
        handle_reply(client, &mut pending, reply, &mut hb_last, &mut hb_needed)?
      }
      Ok(Event::Tick) => {
        if hb_needed {
          let mut buf: Vec<u8> = vec![];
          cmd::write_hb(&mut buf)?;
          stream.write_all(&buf)?;
        }
        let max_age = Duration::from_millis(client.hb_max_age_ms.load(Relaxed));
        if hb_last.elapsed() > max_age {
          return Err(Error::HeartbeatTimeout);
        }
      }
      Ok(Event::Closed(Some(error))) => return Err(error.into()),
      Ok(Event::Closed(None)) => {
        return Err(Error::Io(io::Error::new(
          ErrorKind::UnexpectedEof,
          "broker closed the command connection",
        )))
      }
      Err(RecvTimeoutError::Timeout) => {}
      Err(RecvTimeoutError::Disconnected) => return Ok(()),
    }
  }
}

/// ## SEND INSTRUCTION
///
/// Serializes one instruction and writes it whole. An instruction that
/// expects a reply is queued for pairing *before* its bytes leave, so the
/// reader side can never observe a reply that outruns its request.
fn send_instr<W: Write>(
  stream: &mut W,
  pending: &mut VecDeque<Instr>,
  instr: Instr,
) -> Result<(), Error> {
  let mut buf: Vec<u8> = vec![];
  match instr {
    Instr::HeartBeat { interval } => {
      let interval_ms = interval.as_millis().clamp(1, 1000) as u16;
      cmd::write_hb_req(&mut buf, interval_ms)?;
      stream.write_all(&buf)?;
    }
    Instr::Auth { .. } => {
      // Auth results only travel inward; nothing to send.
    }
    instr @ (Instr::Bind(_) | Instr::Unbind(_) | Instr::Status { .. }) => {
      match &instr {
        Instr::Bind(req) => cmd::write_bind_req(&mut buf, req)?,
        Instr::Unbind(req) => cmd::write_unbind_req(&mut buf, req)?,
        Instr::Status { .. } => cmd::write_status_req(&mut buf)?,
        _ => unreachable!(),
      }
      pending.push_back(instr);
      stream.write_all(&buf)?;
    }
  }
  Ok(())
}

/// ## HANDLE REPLY
///
/// Heartbeats feed the liveness clock and never touch the pending queue.
/// Everything else must pair with the oldest outstanding request, whose
/// completed form is then delivered to the hook layer.
fn handle_reply(
  client: &Arc<Client>,
  pending: &mut VecDeque<Instr>,
  reply: Reply,
  hb_last: &mut Instant,
  hb_needed: &mut bool,
) -> Result<(), Error> {
  match reply {
    Reply::Heartbeat => {
      *hb_last = Instant::now();
      *hb_needed = true;
      Ok(())
    }
    Reply::Error(text) => Err(Error::Server(text)),
    reply => {
      let head = match pending.pop_front() {
        Some(head) => head,
        None => return Err(Error::Protocol("reply with no request".to_string())),
      };
      match (head, reply) {
        (Instr::Bind(mut req), Reply::Bind(route_id)) => {
          req.out_route_id = route_id;
          client.deliver_hreq(Instr::Bind(req));
          Ok(())
        }
        (Instr::Unbind(mut req), Reply::Unbind(success)) => {
          req.out_success = success;
          client.deliver_hreq(Instr::Unbind(req));
          Ok(())
        }
        (Instr::Status { callback, .. }, Reply::Status(fields)) => {
          client.deliver_hreq(Instr::Status { callback, fields });
          Ok(())
        }
        (head, _) => Err(Error::Protocol(format!("exp {}", head.expects()))),
      }
    }
  }
}

/// ## READER
///
/// Decodes frames until the connection dies, then reports how it died and
/// hangs up the event channel by exiting.
fn reader_loop(mut stream: TcpStream, events: SyncSender<Event>) {
  loop {
    match cmd::read_reply(&mut stream) {
      Ok(Some(reply)) => {
        if events.send(Event::Frame(reply)).is_err() {
          return;
        }
      }
      Ok(None) => {
        let _ = events.send(Event::Closed(None));
        return;
      }
      Err(error) => {
        let _ = events.send(Event::Closed(Some(error)));
        return;
      }
    }
  }
}

/// ## TICKER
///
/// Emits a tick every heartbeat interval, re-reading the interval each lap
/// so tuning changes take effect without a restart. Ends when the quit
/// sender fires or is dropped.
fn ticker_loop(client: Arc<Client>, events: SyncSender<Event>, quit: oneshot::Receiver<()>) {
  loop {
    let interval = Duration::from_millis(client.hb_interval_ms.load(Relaxed).max(1));
    match quit.recv_timeout(interval) {
      Err(oneshot::RecvTimeoutError::Timeout) => {
        if events.send(Event::Tick).is_err() {
          return;
        }
      }
      _ => return,
    }
  }
}

/// ## AUTHENTICATE
///
/// Runs the one-time authentication exchange. A refusal and an unknown
/// opcode are both authentication failures; only transport trouble remains
/// an I/O error.
fn authenticate(stream: &mut TcpStream, creds: &Creds) -> Result<Vec<u8>, Error> {
  let mut buf: Vec<u8> = vec![];
  cmd::write_auth(
    &mut buf,
    creds.user.as_bytes(),
    creds.queue.as_bytes(),
    creds.queue_type.as_bytes(),
    creds.pass.as_bytes(),
  )?;
  stream.write_all(&buf)?;
  match cmd::read_auth_reply(stream) {
    Ok(key) => Ok(key),
    Err(fq_wire::Error::AuthRefused(text)) => Err(Error::Auth(text)),
    Err(fq_wire::Error::BadOpcode(word)) => {
      Err(Error::Auth(format!("unexpected opcode 0x{word:04X}")))
    }
    Err(error) => Err(error.into()),
  }
}

/// ## DIAL
///
/// Resolves the broker and connects with the session's bounded timeout.
pub(crate) fn dial(host: &str, port: u16) -> Result<TcpStream, Error> {
  let addr = (host, port)
    .to_socket_addrs()?
    .next()
    .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "unresolvable broker address"))?;
  let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
  stream.set_nodelay(true)?;
  Ok(stream)
}
