//! End-to-end stream lifecycle tests.

use std::{sync::Arc, time::Duration};

use agent_hub_core::echo::EchoInvoker;
use agent_hub_session::SessionManagerConfig;
use agent_hub_transport::{
    ChannelClient, ClientFrame, FrameError, ServerFrame, StreamProtocol, StreamState,
    stream::{MSG_CLOSED, MSG_INITIALIZED, MSG_MUST_INITIALIZE, MSG_UNKNOWN},
};

mod common;

use common::{eventually, test_hub, test_hub_with};

// ============================================================================
// Frame sequencing
// ============================================================================

#[tokio::test]
async fn test_initialize_message_close_scenario() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));

    let reply = protocol.handle(ClientFrame::initialize("u1")).await;
    assert!(!reply.is_error());
    assert_eq!(reply.content(), MSG_INITIALIZED);
    assert!(hub.manager.store().get("u1").unwrap().history.is_empty());

    let reply = protocol.handle(ClientFrame::user_message("hello")).await;
    assert_eq!(reply.content(), "echo: hello");
    assert_eq!(reply.metadata()["session_key"], "u1");

    let reply = protocol.handle(ClientFrame::Close).await;
    assert_eq!(reply, ServerFrame::response(MSG_CLOSED));

    let reply = protocol.handle(ClientFrame::user_message("again")).await;
    assert!(reply.is_error());
    assert_eq!(reply.content(), MSG_MUST_INITIALIZE);

    assert_eq!(hub.manager.session_count(), 0);
    assert_eq!(hub.cleanup.calls(), 1);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_history_grows_in_completion_order() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;

    for i in 0..5 {
        let reply = protocol.handle(ClientFrame::user_message(format!("m{i}"))).await;
        assert!(!reply.is_error());
    }

    let history = hub.manager.store().get("u1").unwrap().history;
    let expected: Vec<String> = (0..5).map(|i| format!("echo: m{i}")).collect();
    assert_eq!(history, expected);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_empty_session_key_creates_nothing() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));

    let reply = protocol.handle(ClientFrame::initialize("")).await;
    assert!(reply.is_error());
    assert_eq!(reply.content(), "invalid user id");
    assert_eq!(reply.kind(), Some("validation"));
    assert_eq!(protocol.state(), &StreamState::Uninitialized);
    assert_eq!(hub.manager.session_count(), 0);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_message_before_initialize_is_rejected() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));

    for frame in [ClientFrame::user_message("hi"), ClientFrame::Close] {
        let reply = protocol.handle(frame).await;
        assert_eq!(reply.content(), MSG_MUST_INITIALIZE);
        assert_eq!(protocol.state(), &StreamState::Uninitialized);
    }
    assert_eq!(hub.manager.session_count(), 0);

    // Stream is still usable.
    let reply = protocol.handle(ClientFrame::initialize("u1")).await;
    assert_eq!(reply.content(), MSG_INITIALIZED);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_blank_message_leaves_state() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;

    let reply = protocol.handle(ClientFrame::user_message("   ")).await;
    assert_eq!(reply.kind(), Some("validation"));
    assert!(protocol.lease().is_some());
    assert!(hub.manager.store().get("u1").unwrap().history.is_empty());
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_frames() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));

    let reply = protocol.handle_raw(ClientFrame::parse("{oops")).await;
    assert_eq!(reply.kind(), Some("validation"));

    let reply = protocol.handle_raw(Err(FrameError::NotUtf8)).await;
    assert!(reply.is_error());

    let reply = protocol
        .handle_raw(ClientFrame::parse(r#"{"type":"RESIZE"}"#))
        .await;
    assert_eq!(reply.content(), MSG_UNKNOWN);
    assert_eq!(protocol.state(), &StreamState::Uninitialized);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_user_is_upstream_error() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));

    let reply = protocol.handle(ClientFrame::initialize("stranger")).await;
    assert_eq!(reply.kind(), Some("upstream"));
    assert_eq!(protocol.state(), &StreamState::Uninitialized);
    assert_eq!(hub.manager.session_count(), 0);
    hub.manager.shutdown().await;
}

// ============================================================================
// Close and implicit close
// ============================================================================

#[tokio::test]
async fn test_double_close_is_harmless() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;

    assert_eq!(protocol.handle(ClientFrame::Close).await.content(), MSG_CLOSED);
    let second = protocol.handle(ClientFrame::Close).await;
    assert_eq!(second.content(), MSG_MUST_INITIALIZE);

    protocol.finish().await;
    assert_eq!(hub.cleanup.calls(), 1);
    hub.manager.shutdown().await;
    assert_eq!(hub.cleanup.calls(), 1);
}

#[tokio::test]
async fn test_channel_stream_ends_after_close() {
    let hub = test_hub();
    let (mut client, task) = ChannelClient::connect(Arc::clone(&hub.manager));

    let reply = client.request(ClientFrame::initialize("u1")).await.unwrap();
    assert_eq!(reply.content(), MSG_INITIALIZED);
    let reply = client.request(ClientFrame::user_message("hi")).await.unwrap();
    assert_eq!(reply.content(), "echo: hi");
    let reply = client.request(ClientFrame::Close).await.unwrap();
    assert_eq!(reply.content(), MSG_CLOSED);

    task.await.unwrap();
    assert!(client.recv().await.is_none());
    assert_eq!(hub.cleanup.calls(), 1);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_dropped_client_closes_session_once() {
    let hub = test_hub();
    let (mut client, task) = ChannelClient::connect(Arc::clone(&hub.manager));
    client.request(ClientFrame::initialize("u1")).await.unwrap();
    assert_eq!(hub.manager.session_count(), 1);

    drop(client);
    task.await.unwrap();

    assert_eq!(hub.manager.session_count(), 0);
    assert_eq!(hub.cleanup.calls(), 1);
    hub.manager.shutdown().await;
    assert_eq!(hub.cleanup.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_stream_task_closes_session() {
    let hub = test_hub();
    let (mut client, task) = ChannelClient::connect(Arc::clone(&hub.manager));
    client.request(ClientFrame::initialize("u1")).await.unwrap();

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let manager = Arc::clone(&hub.manager);
    assert!(eventually(|| manager.session_count() == 0).await);
    let cleanup = Arc::clone(&hub.cleanup);
    assert!(eventually(|| cleanup.calls() == 1).await);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_superseded_stream_cannot_touch_new_session() {
    let hub = test_hub();
    let mut first = StreamProtocol::new(Arc::clone(&hub.manager));
    let mut second = StreamProtocol::new(Arc::clone(&hub.manager));

    first.handle(ClientFrame::initialize("u1")).await;
    second.handle(ClientFrame::initialize("u1")).await;
    // Displaced agent released on replace.
    assert_eq!(hub.cleanup.calls(), 1);

    let reply = first.handle(ClientFrame::user_message("stale")).await;
    assert_eq!(reply.kind(), Some("not_found"));

    first.handle(ClientFrame::Close).await;
    first.finish().await;
    assert_eq!(hub.manager.session_count(), 1);

    let reply = second.handle(ClientFrame::user_message("fresh")).await;
    assert_eq!(reply.content(), "echo: fresh");
    assert_eq!(
        hub.manager.store().get("u1").unwrap().history,
        vec!["echo: fresh"]
    );

    second.finish().await;
    assert_eq!(hub.cleanup.calls(), 2);
    hub.manager.shutdown().await;
}

// ============================================================================
// Concurrency and reaping
// ============================================================================

#[tokio::test]
async fn test_concurrent_streams_share_one_run_loop() {
    let hub = test_hub_with(
        SessionManagerConfig::default(),
        EchoInvoker::with_latency(Duration::from_millis(5)),
    );

    let tasks: Vec<_> = ["u1", "u2"]
        .into_iter()
        .map(|user| {
            let manager = Arc::clone(&hub.manager);
            tokio::spawn(async move {
                let (mut client, task) = ChannelClient::connect(manager);
                client.request(ClientFrame::initialize(user)).await.unwrap();
                for i in 0..5 {
                    let reply = client
                        .request(ClientFrame::user_message(format!("{user}-{i}")))
                        .await
                        .unwrap();
                    assert_eq!(reply.content(), format!("echo: {user}-{i}"));
                }
                client.request(ClientFrame::Close).await.unwrap();
                task.await.unwrap();
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(hub.manager.session_count(), 0);
    assert_eq!(hub.cleanup.calls(), 2);
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_messages_on_one_session_are_not_lost() {
    let hub = test_hub_with(
        SessionManagerConfig::default(),
        EchoInvoker::with_latency(Duration::from_millis(5)),
    );
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;
    let lease = protocol.lease().cloned().unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&hub.manager);
            let lease = lease.clone();
            tokio::spawn(async move {
                manager
                    .send_message(&lease, &format!("m{i}"), Default::default())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut history = hub.manager.store().get("u1").unwrap().history;
    assert_eq!(history.len(), 8);
    history.sort();
    history.dedup();
    assert_eq!(history.len(), 8);

    protocol.finish().await;
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_reaped_session_surfaces_not_found() {
    let config = SessionManagerConfig {
        cleanup_interval: Duration::from_millis(30),
        ..SessionManagerConfig::default()
    };
    let hub = test_hub_with(config, EchoInvoker::new());
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;

    let manager = Arc::clone(&hub.manager);
    assert!(eventually(|| manager.session_count() == 0).await);

    let reply = protocol.handle(ClientFrame::user_message("hello?")).await;
    assert_eq!(reply.kind(), Some("not_found"));
    assert!(protocol.lease().is_some());

    let reply = protocol.handle(ClientFrame::initialize("u1")).await;
    assert_eq!(reply.content(), MSG_INITIALIZED);

    protocol.finish().await;
    hub.manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_streams() {
    let hub = test_hub();
    let mut protocol = StreamProtocol::new(Arc::clone(&hub.manager));
    protocol.handle(ClientFrame::initialize("u1")).await;

    hub.manager.shutdown().await;
    assert_eq!(hub.cleanup.calls(), 1);

    let reply = protocol.handle(ClientFrame::user_message("hi")).await;
    assert!(reply.is_error());

    let mut late = StreamProtocol::new(Arc::clone(&hub.manager));
    let reply = late.handle(ClientFrame::initialize("u2")).await;
    assert_eq!(reply.kind(), Some("shutdown"));

    protocol.finish().await;
    assert_eq!(hub.cleanup.calls(), 1);
}
