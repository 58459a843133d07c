//! Scenario 4 of spec.md §8: a second control channel authenticating with a key that already has
//! one registered gets dropped rather than displacing the first (spec.md §3).

mod common;

#[tokio::test]
async fn second_auth_with_same_key_is_rejected() {
    let server = common::start_server(common::SHARED_SECRET).await;

    let mut first = common::RawControlChannel::connect(server.control_addr, "ZC-dup").await.unwrap();
    common::wait_until_registered(&server.registry, "ZC-dup").await;

    let mut second = common::RawControlChannel::connect(server.control_addr, "ZC-dup").await.unwrap();

    // The rejected connection is simply dropped, no frame is written back.
    assert!(second.try_recv().await.is_none());

    // The original control channel is untouched and the registry still points at it.
    let handle = server.registry.get("ZC-dup").expect("first control channel must stay registered");
    assert!(handle.to_control.send(rproxy_proto::Frame::heartbeat(0)).await.is_ok());
    assert!(first.try_recv().await.is_some());
}

#[tokio::test]
async fn client_key_missing_required_prefix_is_rejected() {
    let server = common::start_server(common::SHARED_SECRET).await;

    let mut control = common::RawControlChannel::connect(server.control_addr, "not-a-valid-key").await.unwrap();
    assert!(control.try_recv().await.is_none());
    assert!(!server.registry.contains("not-a-valid-key"));
}
