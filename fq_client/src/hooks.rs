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

//! # HOOKS
//!
//! The application-visible callback set, and the instruction variants that
//! carry both outgoing requests and completed replies.
//!
//! Hooks are delivered in one of two modes, chosen by the [sync] flag:
//!
//! - **Asynchronous** (the default): hooks run directly on the protocol
//!   threads, as the events occur.
//! - **Synchronous**: authentication, bind, unbind, and status events are
//!   packaged onto the back-channel alongside received messages, and
//!   [Receive] dispatches them on the consuming thread before returning the
//!   next real message.
//!
//! Every hook receives the session handle, so a hook may issue further
//! instructions; hooks must therefore be re-entrant with respect to the
//! public API. A panicking hook is caught and logged rather than being
//! allowed to unwind into the engines.
//!
//! [sync]:    Hooks::sync
//! [Receive]: crate::client::Client::receive

use crate::client::Client;
use crate::Error;
use fq_wire::cmd::{BindReq, UnbindReq};
use fq_wire::{Message, Rk};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// ## USERDATA
///
/// The opaque application value attached to a session with
/// [Set Userdata], handed back to the status callback.
///
/// [Set Userdata]: crate::client::Client::set_userdata
pub type Userdata = Arc<dyn Any + Send + Sync>;

/// ## STATUS CALLBACK
///
/// Invoked once per counter in a status reply: the field name, its value,
/// and the session's userdata.
pub type StatusFn = Arc<dyn Fn(&Rk, u32, Option<Userdata>) + Send + Sync>;

/// ## AUTH HOOK
///
/// Fires once per connection cycle when authentication settles: [None] on
/// success, the failure otherwise.
pub type AuthHook = Arc<dyn Fn(&Arc<Client>, Option<&Error>) + Send + Sync>;

/// ## BIND HOOK
///
/// Fires when a bind request completes, with the broker's answer filled
/// into the request.
pub type BindHook = Arc<dyn Fn(&Arc<Client>, &BindReq) + Send + Sync>;

/// ## UNBIND HOOK
pub type UnbindHook = Arc<dyn Fn(&Arc<Client>, &UnbindReq) + Send + Sync>;

/// ## MESSAGE HOOK
///
/// Offered every received message on the data thread. Returning `true`
/// consumes the message; returning `false` passes it on to [Receive].
///
/// [Receive]: crate::client::Client::receive
pub type MessageHook = Arc<dyn Fn(&Arc<Client>, &Message) -> bool + Send + Sync>;

/// ## SESSION HOOK
///
/// A bare notification carrying only the session handle; used for cleanup
/// and disconnect.
pub type SessionHook = Arc<dyn Fn(&Arc<Client>) + Send + Sync>;

/// ## ERROR LOG HOOK
///
/// Receives the text of every fatal error as it is recorded.
pub type ErrorLogHook = Arc<dyn Fn(&Arc<Client>, &str) + Send + Sync>;

/// ## HOOK SET
///
/// All hooks are optional; an absent [message hook] means every received
/// message is queued for [Receive].
///
/// [message hook]: Hooks::message
/// [Receive]:      crate::client::Client::receive
#[derive(Clone, Default)]
pub struct Hooks {
  pub auth: Option<AuthHook>,
  pub bind: Option<BindHook>,
  pub unbind: Option<UnbindHook>,
  pub message: Option<MessageHook>,
  pub cleanup: Option<SessionHook>,
  pub disconnect: Option<SessionHook>,
  pub error_log: Option<ErrorLogHook>,

  /// ### SYNCHRONOUS DELIVERY
  ///
  /// When set, auth/bind/unbind/status events ride the back-channel and are
  /// dispatched by [Receive] instead of running on the protocol threads.
  ///
  /// [Receive]: crate::client::Client::receive
  pub sync: bool,
}

/// ## INSTRUCTION
///
/// The tagged variant travelling the instruction queue, the pending-reply
/// queue, and (in synchronous mode) the back-channel. An instruction that
/// expects a reply is completed in place, so the same value describes the
/// request on the way out and the result on the way back.
pub(crate) enum Instr {
  HeartBeat { interval: Duration },
  Bind(BindReq),
  Unbind(UnbindReq),
  Status { callback: Option<StatusFn>, fields: Vec<(Rk, u32)> },
  Auth { error: Option<Error> },
}

impl Instr {
  /// The name the engine logs when a reply fails to pair with this
  /// instruction.
  pub(crate) fn expects(&self) -> &'static str {
    match self {
      Instr::Bind(_) => "bind",
      Instr::Unbind(_) => "unbind",
      Instr::Status { .. } => "stats",
      Instr::HeartBeat { .. } => "hbreq",
      Instr::Auth { .. } => "auth",
    }
  }
}

/// ## BACK-CHANNEL ENTRY
///
/// What [Receive] drains: real messages, interleaved with hook events when
/// synchronous delivery is selected.
///
/// [Receive]: crate::client::Client::receive
pub(crate) enum BackMessage {
  Msg(Message),
  Hook(Instr),
}

/// ## HOOK SHIELD
///
/// Runs user hook code without letting a panic unwind into the engines.
pub(crate) fn shielded<R>(f: impl FnOnce() -> R) -> Option<R> {
  match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
    Ok(value) => Some(value),
    Err(_) => {
      tracing::error!("hook panicked; suppressed");
      None
    }
  }
}
