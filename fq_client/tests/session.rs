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

//! Session scenarios against a scripted broker on a loopback listener. Each
//! test stands up a listener, walks one connection pair through a fixed byte
//! exchange, and asserts on what the client surfaces.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fq_client::{BindReq, Client, Hooks, Message, Rk, FLAG_TRANS, ROUTE_REFUSED};
use fq_wire::buf::{WireRead, WireWrite};
use fq_wire::{msg, CMD_MODE, DATA_MODE};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const KEY: &[u8] = b"KKKK";

/// Accepts the command connection and walks it through the mode word, the
/// plain authentication sequence, and the opening heartbeat request.
fn accept_command(listener: &TcpListener) -> TcpStream {
  let (mut stream, _) = listener.accept().unwrap();
  assert_eq!(stream.read_u32::<BigEndian>().unwrap(), CMD_MODE);
  assert_eq!(stream.read_u16::<BigEndian>().unwrap(), 0xAAAA);
  assert_eq!(stream.read_u16::<BigEndian>().unwrap(), 0x0000);
  let _user = stream.read_short().unwrap();
  let queue_blob = stream.read_short().unwrap();
  assert!(queue_blob.contains(&0x00), "queue blob must embed a zero byte");
  let _pass = stream.read_short().unwrap();
  stream.write_u16::<BigEndian>(0xAA00).unwrap();
  stream.write_short(KEY).unwrap();
  assert_eq!(stream.read_u16::<BigEndian>().unwrap(), 0x4848);
  let _interval_ms = stream.read_u16::<BigEndian>().unwrap();
  stream
}

/// Accepts the data connection and checks the session key echo.
fn accept_data(listener: &TcpListener) -> TcpStream {
  let (mut stream, _) = listener.accept().unwrap();
  assert_eq!(stream.read_u32::<BigEndian>().unwrap(), DATA_MODE);
  assert_eq!(stream.read_short().unwrap(), KEY);
  stream
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  false
}

fn connected_client(port: u16) -> Arc<Client> {
  let client = Client::new();
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();
  client
}

#[test]
fn happy_auth_produces_a_joined_session() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let _cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    thread::sleep(Duration::from_millis(300));
  });

  let client = connected_client(port);
  assert!(wait_until(Duration::from_secs(2), || client.data_ready()));
  broker.join().unwrap();
  client.destroy();
}

#[test]
fn bind_reply_completes_through_the_hook() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let mut cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    assert_eq!(cmd.read_u16::<BigEndian>().unwrap(), 0xB170);
    assert_eq!(cmd.read_u16::<BigEndian>().unwrap(), 0x0100);
    assert_eq!(cmd.read_short().unwrap(), b"ex");
    assert_eq!(cmd.read_short().unwrap(), b"prg");
    cmd.write_u16::<BigEndian>(0xB171).unwrap();
    cmd.write_u32::<BigEndian>(7).unwrap();
    thread::sleep(Duration::from_millis(300));
  });

  let client = Client::new();
  let (tx, rx) = mpsc::channel::<u32>();
  client.set_hooks(Hooks {
    bind: Some(Arc::new(move |_, req| {
      let _ = tx.send(req.out_route_id);
    })),
    ..Hooks::default()
  });
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();
  client.bind(BindReq::new(Rk::new("ex"), FLAG_TRANS, "prg")).unwrap();

  assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
  broker.join().unwrap();
  client.destroy();
}

#[test]
fn refused_bind_reports_the_sentinel() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let mut cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    assert_eq!(cmd.read_u16::<BigEndian>().unwrap(), 0xB170);
    let _flags = cmd.read_u16::<BigEndian>().unwrap();
    let _exchange = cmd.read_short().unwrap();
    let _program = cmd.read_short().unwrap();
    cmd.write_u16::<BigEndian>(0xB171).unwrap();
    cmd.write_u32::<BigEndian>(ROUTE_REFUSED).unwrap();
    thread::sleep(Duration::from_millis(300));
  });

  let client = Client::new();
  let (tx, rx) = mpsc::channel::<u32>();
  client.set_hooks(Hooks {
    bind: Some(Arc::new(move |_, req| {
      let _ = tx.send(req.out_route_id);
    })),
    ..Hooks::default()
  });
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();
  client.bind(BindReq::new(Rk::new("ex"), FLAG_TRANS, "prg")).unwrap();

  assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), ROUTE_REFUSED);
  broker.join().unwrap();
  client.destroy();
}

#[test]
fn missing_heartbeats_kill_the_session() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let mut cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    // One heartbeat, then silence.
    cmd.write_u16::<BigEndian>(0xBEA7).unwrap();
    thread::sleep(Duration::from_secs(1));
  });

  let client = Client::new();
  client.set_heartbeat(Duration::from_millis(100));
  client.set_heartbeat_max_age(Duration::from_millis(300));
  let (tx, rx) = mpsc::channel::<String>();
  client.set_hooks(Hooks {
    error_log: Some(Arc::new(move |_, text| {
      let _ = tx.send(text.to_string());
    })),
    ..Hooks::default()
  });
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();

  let started = Instant::now();
  loop {
    let text = rx
      .recv_timeout(Duration::from_secs(2))
      .expect("session never reported the heartbeat death");
    if text == "dead: missing heartbeat" {
      break;
    }
  }
  assert!(started.elapsed() < Duration::from_millis(700));
  client.destroy();
  broker.join().unwrap();
}

#[test]
fn mismatched_reply_is_fatal() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let mut cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    assert_eq!(cmd.read_u16::<BigEndian>().unwrap(), 0xC7A7);
    // Answer the status request with a bind reply.
    cmd.write_u16::<BigEndian>(0xB171).unwrap();
    cmd.write_u32::<BigEndian>(7).unwrap();
    thread::sleep(Duration::from_millis(300));
  });

  let client = Client::new();
  let (tx, rx) = mpsc::channel::<String>();
  client.set_hooks(Hooks {
    error_log: Some(Arc::new(move |_, text| {
      let _ = tx.send(text.to_string());
    })),
    ..Hooks::default()
  });
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();
  client.status(None);

  loop {
    let text = rx
      .recv_timeout(Duration::from_secs(2))
      .expect("session never reported the violation");
    if text == "protocol violation (exp stats)" {
      break;
    }
  }
  client.destroy();
  broker.join().unwrap();
}

#[test]
fn messages_flow_both_ways() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let _cmd = accept_command(&listener);
    let mut data = accept_data(&listener);
    // Deliver one message to the client.
    let mut inbound = Message::new(Rk::new("maryland"), Rk::new("test.route"), b"inbound".to_vec());
    inbound.sender = Rk::new("broker");
    msg::write_msg(&mut data, &inbound, false).unwrap();
    // Then read the one the client publishes.
    let outbound = msg::read_msg(&mut data, false).unwrap().unwrap();
    assert_eq!(outbound.payload, b"outbound");
    assert_eq!(outbound.exchange, Rk::new("maryland"));
    thread::sleep(Duration::from_millis(200));
  });

  let client = connected_client(port);
  assert!(wait_until(Duration::from_secs(2), || client.data_ready()));

  let mut received = None;
  assert!(wait_until(Duration::from_secs(2), || {
    received = client.receive(false);
    received.is_some()
  }));
  let received = received.unwrap();
  assert_eq!(received.payload, b"inbound");
  assert_eq!(received.route, Rk::new("test.route"));
  assert!(received.arrival_time > 0);

  assert!(client.publish(Message::new(Rk::new("maryland"), Rk::new("test.route"), b"outbound".to_vec())));
  broker.join().unwrap();
  client.destroy();
}

#[test]
fn sync_hooks_dispatch_on_the_receiving_thread() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let _cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    thread::sleep(Duration::from_millis(300));
  });

  let client = Client::new();
  let authed = Arc::new(AtomicBool::new(false));
  let authed_hook = authed.clone();
  client.set_hooks(Hooks {
    sync: true,
    auth: Some(Arc::new(move |_, error| {
      assert!(error.is_none());
      authed_hook.store(true, Ordering::SeqCst);
    })),
    ..Hooks::default()
  });
  client.creds("127.0.0.1", port, "user/q/mem", "pass").unwrap();
  client.connect().unwrap();
  assert!(wait_until(Duration::from_secs(2), || client.data_ready()));

  // The auth event must not have run on a protocol thread; it surfaces
  // only when the receiving thread drains the back-channel.
  assert!(wait_until(Duration::from_secs(2), || {
    let _ = client.receive(false);
    authed.load(Ordering::SeqCst)
  }));
  broker.join().unwrap();
  client.destroy();
}

#[test]
fn status_fields_reach_the_callback() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  let broker = thread::spawn(move || {
    let mut cmd = accept_command(&listener);
    let _data = accept_data(&listener);
    assert_eq!(cmd.read_u16::<BigEndian>().unwrap(), 0xC7A7);
    cmd.write_u16::<BigEndian>(0x57A7).unwrap();
    cmd.write_short(b"no_exchange").unwrap();
    cmd.write_u32::<BigEndian>(5).unwrap();
    cmd.write_short(b"routed").unwrap();
    cmd.write_u32::<BigEndian>(90).unwrap();
    cmd.write_u16::<BigEndian>(0).unwrap();
    thread::sleep(Duration::from_millis(300));
  });

  let client = connected_client(port);
  let (tx, rx) = mpsc::channel::<(String, u32)>();
  client.status(Some(Arc::new(move |field, value, _userdata| {
    let _ = tx.send((field.to_string(), value));
  })));

  assert_eq!(
    rx.recv_timeout(Duration::from_secs(2)).unwrap(),
    ("no_exchange".to_string(), 5)
  );
  assert_eq!(
    rx.recv_timeout(Duration::from_secs(2)).unwrap(),
    ("routed".to_string(), 90)
  );
  broker.join().unwrap();
  client.destroy();
}
