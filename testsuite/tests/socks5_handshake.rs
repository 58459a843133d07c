//! Scenarios 1 and 3 of spec.md §8: a SOCKS5 user that never gets past the front door.

mod common;

#[tokio::test]
async fn no_acceptable_auth_method_is_rejected() {
    let server = common::start_server(common::SHARED_SECRET).await;

    let reply = common::socks5_handshake_rejected_for_bad_method(server.socks_addr).await;

    assert_eq!(reply, [0x05, 0xFF]);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = common::start_server(common::SHARED_SECRET).await;

    // A control channel must exist for this client key, otherwise the SOCKS5 layer would reject
    // on the missing-registry-entry path instead of the password path.
    let control = common::RawControlChannel::connect(server.control_addr, "ZC-handshake").await.unwrap();
    common::wait_until_registered(&server.registry, "ZC-handshake").await;

    let target = common::spawn_echo_server().await;
    let err = common::socks5_connect(server.socks_addr, "ZC-handshake", "not-the-password", target)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    drop(control);
}
