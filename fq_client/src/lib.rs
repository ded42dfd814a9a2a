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

//! # FQ CLIENT
//!
//! A session-protocol client for the [FQ] message-fanout broker: one logical
//! session to one broker, materialized as two TCP connections sharing an
//! authenticated identity.
//!
//! ---------------------------------------------------------------------------
//!
//! The session runs on a pair of long-lived worker threads owned by the
//! [Client]:
//!
//! - The **command worker** drives the command connection through the
//!   [Session State]s: dial, authenticate, then serve the instruction stream
//!   while exchanging heartbeats and correlating request/reply pairs in the
//!   order they were sent.
//! - The **data worker** waits for the command worker to produce a session
//!   key, joins the data connection to the session by echoing that key, and
//!   then streams published messages out and received messages in, backing
//!   off with jitter between failed cycles.
//!
//! The application never touches either connection directly. It publishes
//! with [Publish], consumes with [Receive], issues bind/unbind/status
//! instructions that complete through [Hooks], and tears everything down
//! with [Destroy].
//!
//! ---------------------------------------------------------------------------
//!
//! To use this crate:
//!
//! - Create a [Client] with [New Client], or [New Peer] for a data channel
//!   in peer layout.
//! - Supply [Credentials], then [Connect].
//! - Register [Hooks] to observe authentication, binds, unbinds,
//!   disconnects, and errors.
//! - Exchange [Message]s with [Publish] and [Receive].
//!
//! [FQ]:            crate
//! [Client]:        client::Client
//! [New Client]:    client::Client::new
//! [New Peer]:      client::Client::new_peer
//! [Credentials]:   client::Client::creds
//! [Connect]:       client::Client::connect
//! [Destroy]:       client::Client::destroy
//! [Publish]:       client::Client::publish
//! [Receive]:       client::Client::receive
//! [Hooks]:         hooks::Hooks
//! [Message]:       fq_wire::Message
//! [Session State]: SessionState

pub mod client;
pub mod hooks;

pub(crate) mod command;
pub(crate) mod data;
pub(crate) mod queue;

pub use client::Client;
pub use fq_wire::cmd::{BindReq, UnbindReq, FLAG_PEER, FLAG_PERM, FLAG_TRANS, ROUTE_REFUSED};
pub use fq_wire::{Message, MsgId, Rk};
pub use hooks::Hooks;

use bytemuck::NoUninit;
use std::time::Duration;
use thiserror::Error as ThisError;

/// ## DEFAULT QUEUE BOUND
///
/// The depth of the publish queue and of the back-channel unless changed
/// with [Set Backlog] before credentials are supplied.
///
/// [Set Backlog]: client::Client::set_backlog
pub const DEFAULT_BACKLOG: usize = 10_000;

/// ## DEFAULT HEARTBEAT INTERVAL
///
/// Also the ceiling: intervals are clamped to at most one second.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// ## CONNECT TIMEOUT
///
/// Applied to the TCP dial of both connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// ## INSTRUCTION QUEUE DEPTH
///
/// The bound on instructions waiting for the command worker.
pub const CMDQ_DEPTH: usize = 1000;

/// ## SESSION STATE
///
/// Where the command connection currently stands. The command worker moves
/// through these states once per serve cycle and back to [DISCONNECTED]
/// when the cycle ends, however it ends.
///
/// [DISCONNECTED]: SessionState::Disconnected
#[derive(Clone, Copy, Debug, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum SessionState {
  /// ### DISCONNECTED
  ///
  /// No command connection exists; the worker is between cycles or has not
  /// started.
  Disconnected,

  /// ### CONNECTING
  ///
  /// The TCP dial and mode word are in flight.
  Connecting,

  /// ### AUTHENTICATING
  ///
  /// The authentication sequence has been sent and the session key is
  /// awaited.
  Authenticating,

  /// ### READY
  ///
  /// Instructions flow, replies are correlated, and heartbeats are
  /// exchanged.
  Ready,

  /// ### CLOSING
  ///
  /// A fatal condition was observed and the connection pair is being torn
  /// down.
  Closing,
}

impl Default for SessionState {
  fn default() -> Self {
    SessionState::Disconnected
  }
}

/// ## CLIENT ERROR
///
/// Represents the failure modes of the session. I/O and protocol errors are
/// fatal to the current connection pair and feed the reconnect loop; usage
/// errors are returned synchronously to the caller and touch nothing.
#[derive(Debug, ThisError)]
pub enum Error {
  /// ### I/O FAILURE
  ///
  /// A socket operation failed. Always fatal to the current connection.
  #[error("i/o failure: {0}")]
  Io(#[from] std::io::Error),

  /// ### WIRE FAILURE
  ///
  /// A frame could not be encoded or decoded. Always fatal to the current
  /// connection.
  #[error(transparent)]
  Wire(#[from] fq_wire::Error),

  /// ### PROTOCOL VIOLATION
  ///
  /// The broker sent something the session rules forbid, most commonly a
  /// reply that does not pair with the oldest outstanding request.
  #[error("protocol violation ({0})")]
  Protocol(String),

  /// ### SERVER ERROR
  ///
  /// The broker reported an error of its own mid-session. Fatal at this
  /// layer.
  #[error("server error: {0}")]
  Server(String),

  /// ### AUTHENTICATION FAILURE
  ///
  /// The broker refused the credentials, or answered the authentication
  /// sequence with an unknown opcode. Surfaced to the auth hook and fatal
  /// to the current connection.
  #[error("authentication failed: {0}")]
  Auth(String),

  /// ### HEARTBEAT TIMEOUT
  ///
  /// No heartbeat arrived within the allowed age.
  #[error("dead: missing heartbeat")]
  HeartbeatTimeout,

  /// ### USAGE ERROR
  ///
  /// The caller asked for something the session lifecycle forbids.
  #[error("usage: {0}")]
  Usage(&'static str),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn protocol_violation_text() {
    let err = Error::Protocol("exp stats".to_string());
    assert_eq!(err.to_string(), "protocol violation (exp stats)");
  }

  #[test]
  fn heartbeat_timeout_text() {
    assert_eq!(Error::HeartbeatTimeout.to_string(), "dead: missing heartbeat");
  }

  #[test]
  fn default_session_state() {
    assert_eq!(SessionState::default(), SessionState::Disconnected);
  }
}
