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

//! # DATA ENGINE
//!
//! The state machine that owns the data connection. It sits idle until the
//! command engine has authenticated and raised the data-ready signal, then
//! joins a fresh connection to the session by echoing the session key,
//! streams published messages out through a sender thread, and reads
//! inbound messages on its own thread until the connection dies.
//!
//! A data connection cannot outlive its session, and a session cannot be
//! rebuilt piecemeal: when the data side fails it kicks the command socket,
//! the command worker reconnects and re-authenticates, and a fresh
//! data-ready signal brings this engine back. Failed cycles are spaced by
//! a randomized exponential backoff.

use crate::client::Client;
use crate::hooks::{shielded, BackMessage};
use crate::Error;
use byteorder::{BigEndian, WriteBytesExt};
use fq_wire::buf::WireWrite;
use fq_wire::{msg, DATA_MODE, PEER_MODE};
use rand::Rng;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Backoff schedule, nanoseconds: first failure lands at ~16 ms, each
// further failure grows the wait by 1/16, the jitter is a uniform ±4 ms,
// and the whole thing caps at one second.
const BACKOFF_START_NS: u64 = 16_384_000;
const BACKOFF_CAP_NS: u64 = 1_000_000_000;
const BACKOFF_JITTER_NS: i64 = 4_096_000;

// How often the idle engine and the sender wake to check the stop flag.
const IDLE_POLL: Duration = Duration::from_millis(250);
const SEND_POLL: Duration = Duration::from_millis(100);

/// ## DATA WORKER
///
/// The long-lived loop owning the data connection: await the data-ready
/// signal, serve, and back off before the next attempt, until the stop
/// flag is raised. A cycle the broker ended cleanly resets the backoff.
pub(crate) fn data_worker(client: Arc<Client>, signal: Receiver<bool>) {
  let mut backoff: u64 = 0;
  loop {
    if client.stop.load(Acquire) {
      break;
    }

    // AWAIT THE SESSION
    //
    // The command engine raises the signal once per authenticated
    // session. The timed wait exists only so the stop flag is noticed.
    match signal.recv_timeout(IDLE_POLL) {
      Ok(_) => {}
      Err(RecvTimeoutError::Timeout) => continue,
      Err(RecvTimeoutError::Disconnected) => break,
    }
    if client.stop.load(Acquire) {
      break;
    }

    match data_serve(&client) {
      Ok(()) => {
        backoff = 0;
      }
      Err(error) => {
        if client.stop.load(Acquire) {
          break;
        }
        client.fail(&error);
        backoff = next_backoff(backoff);
        thread::sleep(jittered(backoff));
      }
    }

    // RETURN TO THE SUPERVISOR
    //
    // However the cycle ended, this session's data channel is gone; the
    // command side is kicked so the pair reconnects together and raises a
    // fresh signal.
    client.data_ready.store(false, Release);
    if !client.stop.load(Acquire) {
      client.kick_command();
    }
  }
  tracing::debug!("data worker stopped");
}

/// ## SERVE CYCLE
///
/// One pass of the data state machine: dial, join the session, pump
/// messages both ways until either direction dies.
fn data_serve(client: &Arc<Client>) -> Result<(), Error> {
  // JOIN THE SESSION
  //
  // The session key must exist before the data channel means anything;
  // arriving here without one is a sequencing failure.
  let key = client.session_key_snapshot();
  if key.is_empty() {
    return Err(Error::Protocol("no session key".to_string()));
  }
  let creds = client.creds_snapshot()?;
  let mut stream = crate::command::dial(&creds.host, creds.port)?;
  let mode = if client.peer_mode { PEER_MODE } else { DATA_MODE };
  stream.write_u32::<BigEndian>(mode)?;
  stream.write_short(&key)?;
  client.set_data_sock(stream.try_clone()?);
  tracing::debug!(host = %creds.host, port = creds.port, peer = client.peer_mode, "data channel joined");

  // START THE SENDER
  //
  // The sender drains the publish queue on its own thread; the done flag
  // and the timed pop let this cycle reap it on the way out.
  let done = Arc::new(AtomicBool::new(false));
  let sender_done = done.clone();
  let sender_stream = stream.try_clone()?;
  let sender_client = client.clone();
  let sender = thread::Builder::new()
    .name("data-sender".to_string())
    .spawn(move || sender_loop(sender_client, sender_stream, sender_done))?;

  // RECEIVE INLINE
  //
  // The receiving side runs right here; when it returns, the cycle is
  // over and the sender is shut down with it.
  let result = receive_loop(client, &mut stream);
  done.store(true, Release);
  let _ = stream.shutdown(Shutdown::Both);
  let _ = sender.join();
  client.kick_data();
  result
}

/// ## SENDER
///
/// Drains the publish queue and writes message frames. A write failure
/// ends the cycle; the message being written is lost, which is within the
/// delivery promise of a transient queue.
fn sender_loop(client: Arc<Client>, mut stream: TcpStream, done: Arc<AtomicBool>) {
  let q = match client.q.get() {
    Some(q) => q.clone(),
    None => return,
  };
  loop {
    if done.load(Acquire) || client.stop.load(Acquire) {
      return;
    }
    let message = match q.pop_timeout(SEND_POLL) {
      Some(message) => message,
      None => continue,
    };
    let mut buf: Vec<u8> = Vec::with_capacity(message.payload.len() + 64);
    if let Err(error) = msg::write_msg(&mut buf, &message, client.peer_mode) {
      tracing::warn!(error = %error, "dropping unencodable message");
      continue;
    }
    if stream.write_all(&buf).is_err() {
      return;
    }
  }
}

/// ## RECEIVER
///
/// Reads inbound message frames until the stream dies. Each message is
/// stamped with its arrival time, offered to the message hook, and queued
/// for [Receive] unless the hook consumed it.
///
/// [Receive]: crate::client::Client::receive
fn receive_loop(client: &Arc<Client>, stream: &mut TcpStream) -> Result<(), Error> {
  loop {
    if client.stop.load(Acquire) {
      return Ok(());
    }
    let mut message = match msg::read_msg(stream, client.peer_mode)? {
      Some(message) => message,
      // The broker hung up between frames; a clean end to the cycle.
      None => return Ok(()),
    };
    if !client.peer_mode {
      message.arrival_time = now_ns();
    }
    let hooks = client.hooks_snapshot();
    if let Some(hook) = &hooks.message {
      let consumed = shielded(|| hook(client, &message)).unwrap_or(false);
      if consumed {
        continue;
      }
    }
    if let Some(backq) = client.backq.get() {
      backq.push(BackMessage::Msg(message));
    }
  }
}

fn now_ns() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_nanos() as u64)
    .unwrap_or(0)
}

/// ## BACKOFF GROWTH
///
/// Zero means no failures yet; the first failure starts the schedule and
/// each later one grows it by a sixteenth, up to the cap.
fn next_backoff(current: u64) -> u64 {
  if current == 0 {
    return BACKOFF_START_NS;
  }
  (current + (current >> 4)).min(BACKOFF_CAP_NS)
}

/// ## BACKOFF JITTER
///
/// A uniform offset keeps reconnecting clients from marching in step. The
/// jittered sum is clamped into `[0, cap]` rather than being allowed to
/// wrap.
fn jittered(backoff: u64) -> Duration {
  let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_NS..=BACKOFF_JITTER_NS);
  let ns = (backoff as i64).saturating_add(jitter).clamp(0, BACKOFF_CAP_NS as i64);
  Duration::from_nanos(ns as u64)
}
