use fq_client::{BindReq, Client, Hooks, Message, Rk, FLAG_TRANS, ROUTE_REFUSED};
use std::env;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fq_client=debug")),
    )
    .init();

  let host = env::var("FQ_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
  let port: u16 = env::var("FQ_PORT")
    .ok()
    .and_then(|port| port.parse().ok())
    .unwrap_or(8765);
  let user = env::var("FQ_USER").unwrap_or_else(|_| "guest".to_string());
  let pass = env::var("FQ_PASS").unwrap_or_else(|_| "guest".to_string());

  //CLIENT
  let client: Arc<Client> = Client::new();
  client.set_heartbeat(Duration::from_millis(500));
  client.set_hooks(Hooks {
    auth: Some(Arc::new(|_, error| match error {
      None => tracing::info!("authenticated"),
      Some(error) => tracing::error!(%error, "authentication failed"),
    })),
    bind: Some(Arc::new(|_, req| {
      if req.out_route_id == ROUTE_REFUSED {
        tracing::error!(exchange = %req.exchange, "bind refused");
      } else {
        tracing::info!(exchange = %req.exchange, route_id = req.out_route_id, "bound");
      }
    })),
    disconnect: Some(Arc::new(|_| tracing::warn!("disconnected"))),
    error_log: Some(Arc::new(|_, text| tracing::error!(error = text, "session error"))),
    ..Hooks::default()
  });
  client.creds(&host, port, &user, &pass).unwrap();
  client.connect().unwrap();
  //BIND TEST
  client
    .bind(BindReq::new(Rk::new("maryland"), FLAG_TRANS, "prefix:\"test.\""))
    .unwrap();
  //TX
  let tx_client: Arc<Client> = client.clone();
  let tx_thread: JoinHandle<()> = thread::spawn(move || {
    for sequence in 0u64.. {
      let payload = format!("test message {sequence}");
      let msg = Message::new(Rk::new("maryland"), Rk::new("test.rust"), payload.into_bytes());
      if !tx_client.publish(msg) {
        tracing::warn!(sequence, "publish refused");
      }
      thread::sleep(Duration::from_secs(1));
    }
  });
  //RX
  while let Some(msg) = client.receive(true) {
    tracing::info!(
      route = %msg.route,
      sender = %msg.sender,
      bytes = msg.payload.len(),
      payload = %String::from_utf8_lossy(&msg.payload),
      "received"
    );
  }
  tx_thread.join().unwrap();
}
