//! Send/receive across sessions on the same group.

use std::time::Duration;

use od4_protocol::{FrameHeader, HEADER_MAGIC_BYTE0, HEADER_SIZE};
use prost::Message;
use tokio::sync::mpsc;

use crate::harness::{
    assert_quiet, connected_session, raw_listener, recv_datagram, recv_within, test_port,
    TestMessage,
};

#[tokio::test]
async fn test_send_produces_framed_datagram() {
    let port = test_port(1);
    let listener = raw_listener(253, port).await.unwrap();
    let session = connected_session(253, port).await.unwrap();

    let msg = TestMessage::new("Hello Python World!");
    session.send(30005, &msg.encode_to_vec()).await.unwrap();

    let datagram = recv_datagram(&listener).await.unwrap();
    assert_eq!(datagram[0], HEADER_MAGIC_BYTE0);

    let header = FrameHeader::parse(&datagram).unwrap().unwrap();
    assert_eq!(header.frame_len(), datagram.len());

    let env = od4_protocol::decode(&datagram[HEADER_SIZE..]).unwrap();
    assert_eq!(env.data_type, 30005);
    assert_eq!(env.sent, env.sample_time_stamp);
    let decoded: TestMessage = env.payload().unwrap();
    assert_eq!(decoded.attribute11, "Hello Python World!");
}

#[tokio::test]
async fn test_registered_callback_receives_message() {
    let port = test_port(2);
    let receiver = connected_session(120, port).await.unwrap();
    let sender = connected_session(120, port).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.register_message_callback(30005, move |msg: TestMessage, ts| {
        let _ = tx.send((msg, ts));
    });

    sender
        .send_message(30005, &TestMessage::new("over the wire"))
        .await
        .unwrap();

    let (msg, ts) = recv_within(&mut rx).await.unwrap();
    assert_eq!(msg.attribute11, "over the wire");
    let [sent, received, sample] = ts;
    assert_eq!(sent, sample);
    assert!(received >= sent);

    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_unregistered_type_is_ignored() {
    let port = test_port(3);
    let receiver = connected_session(121, port).await.unwrap();
    let sender = connected_session(121, port).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.register_message_callback(30005, move |msg: TestMessage, _| {
        let _ = tx.send(msg);
    });

    sender
        .send_message(99999, &TestMessage::new("nobody listens"))
        .await
        .unwrap();
    assert_quiet(&mut rx, Duration::from_millis(300)).await;

    // The loop is still alive and dispatching.
    sender
        .send_message(30005, &TestMessage::new("still here"))
        .await
        .unwrap();
    let msg = recv_within(&mut rx).await.unwrap();
    assert_eq!(msg.attribute11, "still here");
    assert!(receiver.is_running());
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_loop() {
    let port = test_port(4);
    let receiver = connected_session(122, port).await.unwrap();
    let sender = connected_session(122, port).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.register_message_callback(10, move |msg: TestMessage, _| {
        let _ = tx.send(msg);
    });

    // Field 11 claiming 100 bytes that never follow.
    sender.send(10, &[0x5A, 0x64]).await.unwrap();
    sender
        .send_message(10, &TestMessage::new("after bad one"))
        .await
        .unwrap();

    let msg = recv_within(&mut rx).await.unwrap();
    assert_eq!(msg.attribute11, "after bad one");
}

#[tokio::test]
async fn test_reply_from_inside_callback() {
    let port = test_port(5);
    let responder = connected_session(123, port).await.unwrap();
    let requester = connected_session(123, port).await.unwrap();

    let publisher = responder.publisher().unwrap().clone();
    responder.register_message_callback(1, move |msg: TestMessage, _| {
        let reply = TestMessage::new(&format!("re: {}", msg.attribute11));
        publisher.try_send(2, &reply.encode_to_vec()).unwrap();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    requester.register_message_callback(2, move |msg: TestMessage, _| {
        let _ = tx.send(msg);
    });

    requester
        .send_message(1, &TestMessage::new("ping"))
        .await
        .unwrap();

    let reply = recv_within(&mut rx).await.unwrap();
    assert_eq!(reply.attribute11, "re: ping");
}

#[tokio::test]
async fn test_catch_all_sees_sender_stamp() {
    let port = test_port(6);
    let receiver = connected_session(124, port).await.unwrap();
    let sender = connected_session(124, port).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.on_envelope(move |env| {
        let _ = tx.send(env);
    });

    sender
        .publisher()
        .unwrap()
        .send_with(777, b"raw bytes", None, 42)
        .await
        .unwrap();

    let env = recv_within(&mut rx).await.unwrap();
    assert_eq!(env.data_type, 777);
    assert_eq!(env.sender_stamp, 42);
    assert_eq!(env.serialized_data, b"raw bytes");
    assert!(env.received.is_some());
}

#[tokio::test]
async fn test_extra_argument_reaches_handler() {
    let port = test_port(7);
    let receiver = connected_session(125, port).await.unwrap();
    let sender = connected_session(125, port).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.register_message_callback_with(
        5,
        |msg: TestMessage, _ts, (tx, label): (mpsc::UnboundedSender<String>, &'static str)| {
            let _ = tx.send(format!("{label}:{}", msg.attribute11));
        },
        (tx, "front-camera"),
    );

    sender
        .send_message(5, &TestMessage::new("frame"))
        .await
        .unwrap();

    assert_eq!(recv_within(&mut rx).await.unwrap(), "front-camera:frame");
}

#[tokio::test]
async fn test_own_messages_not_delivered_back() {
    let port = test_port(8);
    let sender = connected_session(126, port).await.unwrap();
    let peer = connected_session(126, port).await.unwrap();

    let (own_tx, mut own_rx) = mpsc::unbounded_channel();
    sender.register_message_callback(30005, move |msg: TestMessage, _| {
        let _ = own_tx.send(msg);
    });
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    peer.register_message_callback(30005, move |msg: TestMessage, _| {
        let _ = peer_tx.send(msg);
    });

    sender
        .send_message(30005, &TestMessage::new("mine"))
        .await
        .unwrap();

    let msg = recv_within(&mut peer_rx).await.unwrap();
    assert_eq!(msg.attribute11, "mine");
    assert_quiet(&mut own_rx, Duration::from_millis(300)).await;
    assert!(sender.is_running());
}
