//! End-to-end call scenarios over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbar::{
    CallOutcome, Channel, ChannelError, ChannelOptions, Direction, IncomingRequest,
    RequestHandler, RequestOptions, Responder,
};

use common::{echo_server, options, patterned, register_echo, wait_drained};

const GUARD: Duration = Duration::from_secs(5);

#[tokio::test]
async fn simple_call_round_trips() {
    let (server, host_port) = echo_server().await;
    let client = Channel::new(options("client"));

    let call = client
        .request(RequestOptions::new(host_port.as_str()))
        .await
        .expect("request");
    let outcome = tokio::time::timeout(GUARD, call.send("echo", "k", "v"))
        .await
        .expect("call hung");

    let response = outcome.into_response().expect("response");
    assert!(response.ok);
    assert_eq!(response.arg2, Bytes::from_static(b"k"));
    assert_eq!(response.arg3, Bytes::from_static(b"v"));

    // Both sides drain back to zero pending operations.
    wait_drained(&client.connections()).await;
    wait_drained(&server.connections()).await;

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn echo_preserves_binary_args() {
    let (server, host_port) = echo_server().await;
    let client = Channel::new(options("client"));

    let header = patterned(513, 3);
    let body = patterned(2048, 5);
    let outcome = client
        .request(RequestOptions::new(host_port.as_str()))
        .await
        .expect("request")
        .send("echo", header.clone(), body.clone())
        .await;

    let response = outcome.into_response().expect("response");
    assert!(response.ok);
    assert_eq!(response.arg2, header);
    assert_eq!(response.arg3, body);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn no_handler_replies_not_ok() {
    let server = Channel::new(options("bare-server"));
    let host_port = server.listen(0, "127.0.0.1").await.unwrap();
    let client = Channel::new(options("client"));

    let outcome = client
        .request(RequestOptions::new(host_port.as_str()))
        .await
        .expect("request")
        .send("anything", "", "")
        .await;

    let response = outcome.into_response().expect("response");
    assert!(!response.ok);
    assert_eq!(response.arg3, Bytes::from_static(b"no handler defined"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_endpoint_replies_not_ok() {
    let (server, host_port) = echo_server().await;
    let client = Channel::new(options("client"));

    let outcome = client
        .request(RequestOptions::new(host_port.as_str()))
        .await
        .expect("request")
        .send("missing", "", "")
        .await;

    let response = outcome.into_response().expect("response");
    assert!(!response.ok);
    assert_eq!(response.arg3, Bytes::from_static(b"no such endpoint: missing"));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn register_refuses_custom_handler_channels() {
    struct Refuser;

    #[async_trait::async_trait]
    impl RequestHandler for Refuser {
        async fn handle_request(&self, _request: IncomingRequest, responder: Responder) {
            let _ = responder.send_not_ok("", "refused").await;
        }
    }

    let channel = Channel::new(ChannelOptions {
        handler: Some(Arc::new(Refuser)),
        ..ChannelOptions::new("custom")
    });
    assert!(matches!(
        channel.register("echo", |_req: IncomingRequest, responder: Responder| async move {
            let _ = responder.send_ok("", "").await;
        }),
        Err(ChannelError::InvalidHandlerForRegistration)
    ));
}

#[tokio::test]
async fn reverse_call_reuses_inbound_connection() {
    let (a, a_host_port) = echo_server().await;
    let b = Channel::new(options("b"));
    register_echo(&b);
    let b_host_port = b.listen(0, "127.0.0.1").await.unwrap();

    // B dials A; A learns B's advertised address from the init exchange.
    let outcome = b
        .request(RequestOptions::new(a_host_port.as_str()))
        .await
        .expect("request")
        .send("echo", "from-b", "")
        .await;
    assert!(outcome.into_response().expect("response").ok);

    let conns = a.connections_to(&b_host_port);
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].direction(), Direction::Inbound);

    // A calls B back over the registered inbound connection, no new dial.
    let outcome = a
        .request(RequestOptions::new(b_host_port.as_str()))
        .await
        .expect("reverse request")
        .send("echo", "from-a", "")
        .await;
    let response = outcome.into_response().expect("reverse response");
    assert!(response.ok);
    assert_eq!(response.arg2, Bytes::from_static(b"from-a"));
    assert_eq!(a.connections_to(&b_host_port).len(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn listen_rejects_wildcard_and_double_bind() {
    let channel = Channel::new(options("listener"));
    assert!(matches!(
        channel.listen(0, "0.0.0.0").await,
        Err(ChannelError::InvalidListenHost { .. })
    ));
    assert!(matches!(
        channel.listen(0, "").await,
        Err(ChannelError::InvalidListenHost { .. })
    ));

    channel.listen(0, "127.0.0.1").await.unwrap();
    assert!(matches!(
        channel.listen(0, "127.0.0.1").await,
        Err(ChannelError::AlreadyListening)
    ));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn request_rejects_bad_peer_addresses() {
    let client = Channel::new(options("client"));
    for bad in ["", "nocolon", "0.0.0.0:4040", "127.0.0.1:0"] {
        assert!(
            matches!(
                client.request(RequestOptions::new(bad)).await,
                Err(ChannelError::InvalidPeer { .. })
            ),
            "accepted {bad:?}"
        );
    }
}

#[tokio::test]
async fn request_to_own_address_is_refused() {
    let channel = Channel::new(options("self"));
    let host_port = channel.listen(0, "127.0.0.1").await.unwrap();
    assert!(matches!(
        channel.request(RequestOptions::new(host_port.as_str())).await,
        Err(ChannelError::SelfPeer { .. })
    ));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_becomes_peer_error() {
    let server = Channel::new(options("panicky"));
    server
        .register("boom", |_req: IncomingRequest, _responder: Responder| async move {
            panic!("handler exploded");
        })
        .unwrap();
    let host_port = server.listen(0, "127.0.0.1").await.unwrap();

    let client = Channel::new(options("client"));
    let outcome = client
        .request(RequestOptions::new(host_port.as_str()))
        .await
        .expect("request")
        .send("boom", "", "")
        .await;

    match outcome {
        CallOutcome::Error(ChannelError::Peer { code, .. }) => {
            assert_eq!(code, crossbar::ErrorCode::Unexpected);
        }
        other => panic!("expected peer error, got {other:?}"),
    }

    // The connection survives a handler failure.
    wait_drained(&server.connections()).await;
    client.close().await.unwrap();
    server.close().await.unwrap();
}
