//! Connect, double-connect, shutdown, and send-side limits.

use std::time::Duration;

use od4_protocol::MAX_UDP_PAYLOAD;
use od4_session::{Session, SessionError};

use crate::harness::{connected_session, test_port};

#[tokio::test]
async fn test_connect_starts_receive_loop() {
    let session = connected_session(130, test_port(20)).await.unwrap();
    assert!(session.is_connected());
    assert!(session.is_running());
    assert_eq!(session.local_addr().unwrap().port(), test_port(20));
}

#[tokio::test]
async fn test_double_connect_fails() {
    let mut session = connected_session(131, test_port(21)).await.unwrap();
    let result = session.connect().await;
    assert!(matches!(result, Err(SessionError::AlreadyConnected)));
    assert!(session.is_running());
}

#[tokio::test]
async fn test_shutdown_stops_receive_loop() {
    let mut session = connected_session(132, test_port(22)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), session.shutdown())
        .await
        .unwrap();
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_run_returns_when_stopped() {
    let session = std::sync::Arc::new(connected_session(133, test_port(23)).await.unwrap());

    let runner = {
        let session = std::sync::Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_oversized_send_rejected() {
    let session = connected_session(134, test_port(24)).await.unwrap();
    let payload = vec![0u8; MAX_UDP_PAYLOAD];
    let result = session.send(1, &payload).await;
    assert!(matches!(result, Err(SessionError::PayloadTooLarge { .. })));
}

#[tokio::test]
async fn test_send_before_connect_fails() {
    let session = Session::with_port(135, test_port(25)).unwrap();
    assert!(matches!(
        session.send(1, b"early").await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(session.publisher(), Err(SessionError::NotConnected)));
}
