//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use crossbar::{Channel, ChannelOptions, Connection, IncomingRequest, Responder};

/// Opt-in log output: run tests with `RUST_LOG=crossbar=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Options with the default sweep cadence.
pub fn options(process_name: &str) -> ChannelOptions {
    init_tracing();
    ChannelOptions::new(process_name)
}

/// Options with a short, deterministic sweep for timeout tests.
pub fn fast_sweep(process_name: &str, interval: Duration) -> ChannelOptions {
    init_tracing();
    ChannelOptions {
        timeout_check_interval: interval,
        timeout_fuzz: Duration::ZERO,
        rng_seed: Some(7),
        ..ChannelOptions::new(process_name)
    }
}

/// A channel with an `echo` endpoint, listening on loopback.
pub async fn echo_server() -> (Channel, String) {
    let server = Channel::new(options("echo-server"));
    register_echo(&server);
    let host_port = server.listen(0, "127.0.0.1").await.expect("listen");
    (server, host_port)
}

pub fn register_echo(channel: &Channel) {
    channel
        .register("echo", |req: IncomingRequest, responder: Responder| async move {
            if let Err(err) = responder.send_ok(req.arg2, req.arg3).await {
                tracing::debug!(error = %err, "echo reply failed");
            }
        })
        .expect("register echo");
}

/// An endpoint that never answers; the call is left to the timeout sweep.
pub fn register_void(channel: &Channel) {
    channel
        .register("void", |_req: IncomingRequest, responder: Responder| async move {
            drop(responder);
        })
        .expect("register void");
}

/// Deterministic byte sequence for payload round-trips.
pub fn patterned(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

/// Wait for every connection's operation tables to drain.
pub async fn wait_drained(conns: &[Connection]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if conns.iter().all(|conn| conn.pending() == (0, 0)) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let counts: Vec<_> = conns.iter().map(Connection::pending).collect();
            panic!("pending ops did not drain: {counts:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
