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

//! # SESSION SUPERVISOR
//!
//! The [Client]: owner of the credentials, the queues, the shared session
//! state, and the two worker threads that drive the connection pair. All of
//! the public API lives here.

use crate::command;
use crate::data;
use crate::hooks::{shielded, BackMessage, Hooks, Instr, StatusFn, Userdata};
use crate::queue::BoundedQueue;
use crate::{Error, SessionState, CMDQ_DEPTH, DEFAULT_BACKLOG, DEFAULT_HEARTBEAT};
use atomic::Atomic;
use fq_wire::cmd::{BindReq, UnbindReq};
use fq_wire::Message;
use std::any::Any;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// ## CREDENTIALS
///
/// The connection target and identity supplied once per session.
#[derive(Clone, Debug)]
pub(crate) struct Creds {
  pub(crate) host: String,
  pub(crate) port: u16,
  pub(crate) user: String,
  pub(crate) pass: String,
  pub(crate) queue: String,
  pub(crate) queue_type: String,
}

/// ## CLIENT
///
/// One logical session to one broker. Created idle; supplied with
/// [Credentials]; set running with [Connect], after which the command and
/// data workers connect, authenticate, serve, and reconnect until [Destroy].
///
/// The client is always handled through an [Arc], which is what the worker
/// threads and the hook layer share.
///
/// [Credentials]: Client::creds
/// [Connect]:     Client::connect
/// [Destroy]:     Client::destroy
pub struct Client {
  pub(crate) peer_mode: bool,
  pub(crate) creds: Mutex<Option<Creds>>,

  // Queues, allocated when credentials are supplied.
  pub(crate) cmdq: std::sync::OnceLock<Arc<BoundedQueue<Instr>>>,
  pub(crate) q: std::sync::OnceLock<Arc<BoundedQueue<Message>>>,
  pub(crate) backq: std::sync::OnceLock<Arc<BoundedQueue<BackMessage>>>,
  pub(crate) qmaxlen: AtomicUsize,

  pub(crate) non_blocking: AtomicBool,
  pub(crate) hooks: RwLock<Hooks>,
  pub(crate) userdata: Mutex<Option<Userdata>>,

  // Lifecycle, written by the protocol threads and read everywhere.
  pub(crate) state: Atomic<SessionState>,
  pub(crate) connected: AtomicBool,
  pub(crate) data_ready: AtomicBool,
  pub(crate) stop: AtomicBool,

  // Heartbeat tuning, milliseconds.
  pub(crate) hb_interval_ms: AtomicU64,
  pub(crate) hb_max_age_ms: AtomicU64,
  pub(crate) hb_max_age_set: AtomicBool,

  pub(crate) session_key: Mutex<Vec<u8>>,
  pub(crate) last_error: Mutex<Option<String>>,

  // Clones of the live sockets, kept so that either engine or the
  // application can kick the other side's connection out of a blocking
  // read or write.
  pub(crate) cmd_sock: Mutex<Option<TcpStream>>,
  pub(crate) data_sock: Mutex<Option<TcpStream>>,
}

/// ## LIFECYCLE
impl Client {
  /// ### NEW CLIENT
  ///
  /// Creates an idle client whose data channel will speak the ordinary
  /// client layout.
  pub fn new() -> Arc<Self> {
    Self::with_mode(false)
  }

  /// ### NEW PEER
  ///
  /// Creates an idle client whose data channel will speak the peer layout,
  /// carrying hop and arrival metadata with every message.
  pub fn new_peer() -> Arc<Self> {
    Self::with_mode(true)
  }

  fn with_mode(peer_mode: bool) -> Arc<Self> {
    Arc::new(Client {
      peer_mode,
      creds: Mutex::new(None),
      cmdq: std::sync::OnceLock::new(),
      q: std::sync::OnceLock::new(),
      backq: std::sync::OnceLock::new(),
      qmaxlen: AtomicUsize::new(DEFAULT_BACKLOG),
      non_blocking: AtomicBool::new(false),
      hooks: RwLock::new(Hooks::default()),
      userdata: Mutex::new(None),
      state: Atomic::new(SessionState::Disconnected),
      connected: AtomicBool::new(false),
      data_ready: AtomicBool::new(false),
      stop: AtomicBool::new(false),
      hb_interval_ms: AtomicU64::new(DEFAULT_HEARTBEAT.as_millis() as u64),
      hb_max_age_ms: AtomicU64::new(3 * DEFAULT_HEARTBEAT.as_millis() as u64),
      hb_max_age_set: AtomicBool::new(false),
      session_key: Mutex::new(vec![]),
      last_error: Mutex::new(None),
      cmd_sock: Mutex::new(None),
      data_sock: Mutex::new(None),
    })
  }

  /// ### SUPPLY CREDENTIALS
  ///
  /// Records the broker address and identity, and allocates the session's
  /// queues at the backlog in force. The sender parses as
  /// `user[/queue[/queue_type]]`; a missing queue name becomes
  /// `"q-"` followed by a fresh UUID, and a missing queue type becomes
  /// `"mem"`.
  ///
  /// May be called once per client.
  pub fn creds(&self, host: &str, port: u16, sender: &str, pass: &str) -> Result<(), Error> {
    let mut slot = self.creds.lock().unwrap();
    if slot.is_some() {
      return Err(Error::Usage("credentials already supplied"));
    }
    let (user, queue, queue_type) = parse_sender(sender);
    *slot = Some(Creds {
      host: host.to_string(),
      port,
      user,
      pass: pass.to_string(),
      queue,
      queue_type,
    });
    let qmaxlen = self.qmaxlen.load(Relaxed);
    let _ = self.cmdq.set(Arc::new(BoundedQueue::new(CMDQ_DEPTH)));
    let _ = self.q.set(Arc::new(BoundedQueue::new(qmaxlen)));
    let _ = self.backq.set(Arc::new(BoundedQueue::new(qmaxlen)));
    Ok(())
  }

  /// ### CONNECT
  ///
  /// Spawns the command and data workers, which from here on connect,
  /// serve, and reconnect on their own until [Destroy].
  ///
  /// Credentials must have been supplied, and a client connects only once.
  ///
  /// [Destroy]: Client::destroy
  pub fn connect(self: &Arc<Self>) -> Result<(), Error> {
    if self.creds.lock().unwrap().is_none() {
      return Err(Error::Usage("credentials not supplied"));
    }
    if self.connected.swap(true, SeqCst) {
      return Err(Error::Usage("connect called twice"));
    }
    let (signal_tx, signal_rx) = sync_channel::<bool>(1);
    let command_client = self.clone();
    thread::Builder::new()
      .name("command-worker".to_string())
      .spawn(move || command::command_worker(command_client, signal_tx))?;
    let data_client = self.clone();
    thread::Builder::new()
      .name("data-worker".to_string())
      .spawn(move || data::data_worker(data_client, signal_rx))?;
    Ok(())
  }

  /// ### DESTROY
  ///
  /// Requests shutdown: raises the stop flag, kicks both sockets so that
  /// blocked reads and writes unwind, and fires the cleanup hook. The
  /// workers exit after their next iteration; shutdown is best-effort, not
  /// preemptive.
  pub fn destroy(self: &Arc<Self>) {
    self.stop.store(true, SeqCst);
    self.kick_command();
    self.kick_data();
    let hooks = self.hooks_snapshot();
    if let Some(hook) = &hooks.cleanup {
      shielded(|| hook(self));
    }
  }
}

/// ## TUNING
impl Client {
  /// ### SET HEARTBEAT
  ///
  /// Sets the heartbeat interval, clamped to at most one second; the
  /// clamped value, in whole milliseconds, is what goes on the wire. When
  /// the session is live the request is re-issued to the broker at once.
  ///
  /// Unless [Set Heartbeat Max Age] has been used, the allowed silence is
  /// kept at three times the interval.
  ///
  /// [Set Heartbeat Max Age]: Client::set_heartbeat_max_age
  pub fn set_heartbeat(&self, interval: Duration) {
    let clamped = interval.min(DEFAULT_HEARTBEAT);
    self.hb_interval_ms.store(clamped.as_millis() as u64, Relaxed);
    if !self.hb_max_age_set.load(Relaxed) {
      self.hb_max_age_ms.store(3 * clamped.as_millis() as u64, Relaxed);
    }
    if self.data_ready.load(Acquire) {
      if let Some(cmdq) = self.cmdq.get() {
        cmdq.push(Instr::HeartBeat { interval: clamped });
      }
    }
  }

  /// ### SET HEARTBEAT MAX AGE
  ///
  /// Overrides the allowed heartbeat silence. Once set, later interval
  /// changes no longer touch it.
  pub fn set_heartbeat_max_age(&self, max_age: Duration) {
    self.hb_max_age_set.store(true, Relaxed);
    self.hb_max_age_ms.store(max_age.as_millis() as u64, Relaxed);
  }

  /// ### SET BACKLOG
  ///
  /// Sets the bound of the publish queue and the back-channel. The queues
  /// are allocated when credentials are supplied, so this must come first.
  pub fn set_backlog(&self, qmaxlen: usize) -> Result<(), Error> {
    if self.creds.lock().unwrap().is_some() {
      return Err(Error::Usage("backlog must be set before credentials"));
    }
    self.qmaxlen.store(qmaxlen, Relaxed);
    Ok(())
  }

  /// ### SET NON-BLOCKING
  ///
  /// Selects the non-blocking publish path: a full publish queue makes
  /// [Publish] return `false` instead of waiting.
  ///
  /// [Publish]: Client::publish
  pub fn set_non_blocking(&self, non_blocking: bool) {
    self.non_blocking.store(non_blocking, Relaxed);
  }

  /// ### SET HOOKS
  pub fn set_hooks(&self, hooks: Hooks) {
    *self.hooks.write().unwrap() = hooks;
  }

  /// ### SET USERDATA
  pub fn set_userdata(&self, userdata: Arc<dyn Any + Send + Sync>) {
    *self.userdata.lock().unwrap() = Some(userdata);
  }

  /// ### USERDATA
  pub fn userdata(&self) -> Option<Userdata> {
    self.userdata.lock().unwrap().clone()
  }
}

/// ## INSTRUCTIONS
///
/// The four command-channel operations. All of them merely enqueue an
/// instruction for the command worker and return; none waits for the
/// broker. Before credentials are supplied there is no instruction queue,
/// and the call is silently dropped, as the session may still be
/// configuring.
impl Client {
  /// ### BIND
  ///
  /// Asks the broker to attach the request's routing program to its
  /// exchange. The completed request, carrying the assigned route id or the
  /// refusal sentinel, is delivered through the bind hook.
  pub fn bind(&self, req: BindReq) -> Result<(), Error> {
    if req.program.len() > u16::MAX as usize {
      return Err(Error::Usage("routing program exceeds the wire limit"));
    }
    if let Some(cmdq) = self.cmdq.get() {
      cmdq.push(Instr::Bind(req));
    }
    Ok(())
  }

  /// ### UNBIND
  ///
  /// Asks the broker to drop a bound route. The completed request is
  /// delivered through the unbind hook.
  pub fn unbind(&self, req: UnbindReq) {
    if let Some(cmdq) = self.cmdq.get() {
      cmdq.push(Instr::Unbind(req));
    }
  }

  /// ### STATUS
  ///
  /// Asks the broker for its counters. The callback runs once per returned
  /// field, with the session's userdata.
  pub fn status(&self, callback: Option<StatusFn>) {
    if let Some(cmdq) = self.cmdq.get() {
      cmdq.push(Instr::Status { callback, fields: vec![] });
    }
  }

  /// ### HEARTBEAT
  ///
  /// Re-issues the heartbeat request at the interval in force.
  pub fn heartbeat(&self) {
    if let Some(cmdq) = self.cmdq.get() {
      let interval = Duration::from_millis(self.hb_interval_ms.load(Relaxed));
      cmdq.push(Instr::HeartBeat { interval });
    }
  }
}

/// ## MESSAGE EXCHANGE
impl Client {
  /// ### PUBLISH
  ///
  /// Hands a message to the data sender. In the default blocking mode this
  /// waits for room on the publish queue and returns `true`; in
  /// non-blocking mode a full queue returns `false` immediately. Before
  /// credentials are supplied there is no queue and the message is
  /// refused.
  pub fn publish(&self, msg: Message) -> bool {
    let q = match self.q.get() {
      Some(q) => q,
      None => return false,
    };
    if self.non_blocking.load(Relaxed) {
      q.try_push(msg)
    } else {
      q.push(msg);
      true
    }
  }

  /// ### RECEIVE
  ///
  /// Takes the next received message off the back-channel. Hook events
  /// queued by synchronous delivery are dispatched here, before the next
  /// real message is returned; they never surface to the caller.
  ///
  /// With `block` unset this never waits: no message means [None]. With
  /// `block` set it waits for a real message, returning [None] only once
  /// the session has been destroyed and the back-channel drained.
  pub fn receive(self: &Arc<Self>, block: bool) -> Option<Message> {
    let backq = self.backq.get()?;
    loop {
      let entry = if block {
        loop {
          match backq.pop_timeout(Duration::from_millis(100)) {
            Some(entry) => break entry,
            None => {
              if self.stop.load(Acquire) {
                return None;
              }
            }
          }
        }
      } else {
        match backq.try_pop() {
          Some(entry) => entry,
          None => return None,
        }
      };
      match entry {
        BackMessage::Msg(msg) => return Some(msg),
        BackMessage::Hook(instr) => {
          let hooks = self.hooks_snapshot();
          self.dispatch_hreq(&hooks, instr);
        }
      }
    }
  }

  /// ### DATA BACKLOG
  ///
  /// The number of messages waiting on the publish queue.
  pub fn data_backlog(&self) -> usize {
    self.q.get().map(|q| q.len()).unwrap_or(0)
  }
}

/// ## OBSERVATION
impl Client {
  /// ### SESSION STATE
  pub fn state(&self) -> SessionState {
    self.state.load(Relaxed)
  }

  /// ### CONNECTED
  ///
  /// Whether [Connect] has been called.
  ///
  /// [Connect]: Client::connect
  pub fn connected(&self) -> bool {
    self.connected.load(Relaxed)
  }

  /// ### DATA READY
  ///
  /// Whether the current command connection has authenticated and produced
  /// a session key.
  pub fn data_ready(&self) -> bool {
    self.data_ready.load(Acquire)
  }

  /// ### LAST ERROR
  ///
  /// The text of the most recent fatal error, if any.
  pub fn last_error(&self) -> Option<String> {
    self.last_error.lock().unwrap().clone()
  }
}

/// ## ENGINE PLUMBING
///
/// Shared by the command and data engines; none of this is public API.
impl Client {
  pub(crate) fn creds_snapshot(&self) -> Result<Creds, Error> {
    self
      .creds
      .lock()
      .unwrap()
      .clone()
      .ok_or(Error::Usage("credentials not supplied"))
  }

  pub(crate) fn hooks_snapshot(&self) -> Hooks {
    self.hooks.read().unwrap().clone()
  }

  pub(crate) fn session_key_snapshot(&self) -> Vec<u8> {
    self.session_key.lock().unwrap().clone()
  }

  pub(crate) fn set_session_key(&self, key: Vec<u8>) {
    *self.session_key.lock().unwrap() = key;
  }

  /// Records a fatal error and reports it through the error-log hook.
  pub(crate) fn fail(self: &Arc<Self>, error: &Error) {
    let text = error.to_string();
    tracing::warn!(error = %text, "session error");
    *self.last_error.lock().unwrap() = Some(text.clone());
    let hooks = self.hooks_snapshot();
    if let Some(hook) = &hooks.error_log {
      shielded(|| hook(self, &text));
    }
  }

  /// Delivers a completed instruction: directly in asynchronous mode,
  /// through the back-channel in synchronous mode.
  pub(crate) fn deliver_hreq(self: &Arc<Self>, instr: Instr) {
    let hooks = self.hooks_snapshot();
    if hooks.sync {
      if let Some(backq) = self.backq.get() {
        backq.push(BackMessage::Hook(instr));
      }
      return;
    }
    self.dispatch_hreq(&hooks, instr);
  }

  pub(crate) fn dispatch_hreq(self: &Arc<Self>, hooks: &Hooks, instr: Instr) {
    match instr {
      Instr::Auth { error } => {
        if let Some(hook) = &hooks.auth {
          shielded(|| hook(self, error.as_ref()));
        }
      }
      Instr::Bind(req) => {
        if let Some(hook) = &hooks.bind {
          shielded(|| hook(self, &req));
        }
      }
      Instr::Unbind(req) => {
        if let Some(hook) = &hooks.unbind {
          shielded(|| hook(self, &req));
        }
      }
      Instr::Status { callback, fields } => {
        if let Some(callback) = callback {
          let userdata = self.userdata();
          for (field, value) in &fields {
            shielded(|| callback(field, *value, userdata.clone()));
          }
        }
      }
      Instr::HeartBeat { .. } => {}
    }
  }

  pub(crate) fn run_disconnect_hook(self: &Arc<Self>) {
    let hooks = self.hooks_snapshot();
    if let Some(hook) = &hooks.disconnect {
      shielded(|| hook(self));
    }
  }

  pub(crate) fn set_command_sock(&self, sock: TcpStream) {
    *self.cmd_sock.lock().unwrap() = Some(sock);
  }

  pub(crate) fn set_data_sock(&self, sock: TcpStream) {
    *self.data_sock.lock().unwrap() = Some(sock);
  }

  /// Shuts the command socket down, unblocking the command engine.
  pub(crate) fn kick_command(&self) {
    if let Some(sock) = self.cmd_sock.lock().unwrap().take() {
      let _ = sock.shutdown(Shutdown::Both);
    }
  }

  /// Shuts the data socket down, unblocking the data engine.
  pub(crate) fn kick_data(&self) {
    if let Some(sock) = self.data_sock.lock().unwrap().take() {
      let _ = sock.shutdown(Shutdown::Both);
    }
  }
}

/// ## SENDER PARSING
///
/// `user[/queue[/queue_type]]`, with empty segments treated as missing.
pub(crate) fn parse_sender(sender: &str) -> (String, String, String) {
  let mut parts = sender.splitn(3, '/');
  let user = parts.next().unwrap_or("").to_string();
  let queue = match parts.next() {
    Some(queue) if !queue.is_empty() => queue.to_string(),
    _ => format!("q-{}", Uuid::new_v4()),
  };
  let queue_type = match parts.next() {
    Some(queue_type) if !queue_type.is_empty() => queue_type.to_string(),
    _ => "mem".to_string(),
  };
  (user, queue, queue_type)
}
