//! End-to-end sender/receiver tests over a shared local directory.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use handle_ipc::config::{ReceiverConfig, SenderConfig};
use handle_ipc::{
    DirectoryStore, LocalStore, ReceivedMessage, Receiver, RemoteStore, Sender, SenderEvent,
    ServiceConnection,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

fn store(dir: &tempfile::TempDir) -> Arc<dyn DirectoryStore> {
    Arc::new(LocalStore::open_in(dir.path()).unwrap())
}

fn loopback() -> ReceiverConfig {
    ReceiverConfig {
        local_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ..ReceiverConfig::default()
    }
}

async fn next(messages: &mut broadcast::Receiver<ReceivedMessage>) -> ReceivedMessage {
    tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("message within timeout")
        .expect("receiver alive")
}

#[derive(Debug, Clone, PartialEq, Hash, Serialize, Deserialize)]
struct Job {
    id: u32,
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encoded_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::new("jobs", store(&dir), loopback()).await.unwrap();
    let mut messages = receiver.subscribe();

    let sender = Sender::new("jobs", store(&dir), SenderConfig::default()).unwrap();
    let job = Job { id: 7, name: "resize".to_string() };
    sender.send(&job).await.unwrap();

    let message = next(&mut messages).await;
    assert_eq!(message.handle, "jobs");
    assert_eq!(message.decode::<Job>().unwrap(), job);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_raw_bytes_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::new("raw", store(&dir), loopback()).await.unwrap();
    let mut messages = receiver.subscribe();

    let sender = Sender::new("raw", store(&dir), SenderConfig::default()).unwrap();
    sender.send_raw(vec![0u8, 1, 2, 255]).await.unwrap();

    assert_eq!(next(&mut messages).await.raw(), Some(&[0u8, 1, 2, 255][..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_receiver_of_a_handle_gets_the_message() {
    let dir = tempfile::tempdir().unwrap();
    let first = Receiver::new("fanout", store(&dir), loopback()).await.unwrap();
    let second = Receiver::new("fanout", store(&dir), loopback()).await.unwrap();
    assert_ne!(first.endpoint(), second.endpoint());
    let mut first_messages = first.subscribe();
    let mut second_messages = second.subscribe();

    let sender = Sender::new("fanout", store(&dir), SenderConfig::default()).unwrap();
    let mut events = sender.subscribe();
    sender.send("ping").await.unwrap();

    assert_eq!(next(&mut first_messages).await.decode::<String>().unwrap(), "ping");
    assert_eq!(next(&mut second_messages).await.decode::<String>().unwrap(), "ping");

    assert_eq!(events.recv().await.unwrap(), SenderEvent::BeforeSend);
    let mut expected = vec![first.endpoint(), second.endpoint()];
    expected.sort();
    assert_eq!(
        events.recv().await.unwrap(),
        SenderEvent::AfterSend { endpoints: expected }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handles_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let a = Receiver::new("A", store(&dir), loopback()).await.unwrap();
    let b = Receiver::new("B", store(&dir), loopback()).await.unwrap();
    let mut a_messages = a.subscribe();
    let mut b_messages = b.subscribe();

    let sender = Sender::new("A", store(&dir), SenderConfig::default()).unwrap();
    sender.send("for A").await.unwrap();

    assert_eq!(next(&mut a_messages).await.decode::<String>().unwrap(), "for A");
    let nothing = tokio::time::timeout(Duration::from_millis(300), b_messages.recv()).await;
    assert!(nothing.is_err(), "B must not see messages for A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_is_reused_for_successive_messages() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::new("stream", store(&dir), loopback()).await.unwrap();
    let mut messages = receiver.subscribe();

    let sender = Sender::new("stream", store(&dir), SenderConfig::default()).unwrap();
    for i in 0..20u32 {
        sender.send(&i).await.unwrap();
    }
    for i in 0..20u32 {
        assert_eq!(next(&mut messages).await.decode::<u32>().unwrap(), i);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_vanished_receiver_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let alive = Receiver::new("crowd", store(&dir), loopback()).await.unwrap();
    let gone = Receiver::new("crowd", store(&dir), loopback()).await.unwrap();
    let mut messages = alive.subscribe();
    let gone_endpoint = gone.endpoint();
    drop(gone);
    // let the listener close before the next lookup prunes it
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sender = Sender::new("crowd", store(&dir), SenderConfig::default()).unwrap();
    let mut events = sender.subscribe();
    sender.send("still here").await.unwrap();

    assert_eq!(next(&mut messages).await.decode::<String>().unwrap(), "still here");
    assert_eq!(events.recv().await.unwrap(), SenderEvent::BeforeSend);
    match events.recv().await.unwrap() {
        SenderEvent::AfterSend { endpoints } => {
            assert!(endpoints.contains(&alive.endpoint()));
            assert!(!endpoints.contains(&gone_endpoint));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

static SERIALIZATIONS: AtomicUsize = AtomicUsize::new(0);

/// Counts how often it is serialized
#[derive(Debug)]
struct Counted(u64);

impl Hash for Counted {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Serialize for Counted {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SERIALIZATIONS.fetch_add(1, Ordering::SeqCst);
        serializer.serialize_u64(self.0)
    }
}

#[tokio::test]
async fn test_buffered_sender_skips_reserialization() {
    let dir = tempfile::tempdir().unwrap();

    let buffered = Sender::new(
        "buffered",
        store(&dir),
        SenderConfig { buffered: true, ..SenderConfig::default() },
    )
    .unwrap();
    buffered.send(&Counted(1)).await.unwrap();
    buffered.send(&Counted(1)).await.unwrap();
    assert_eq!(SERIALIZATIONS.load(Ordering::SeqCst), 1);
    buffered.send(&Counted(2)).await.unwrap();
    assert_eq!(SERIALIZATIONS.load(Ordering::SeqCst), 2);

    let unbuffered = Sender::new("buffered", store(&dir), SenderConfig::default()).unwrap();
    unbuffered.send(&Counted(2)).await.unwrap();
    unbuffered.send(&Counted(2)).await.unwrap();
    assert_eq!(SERIALIZATIONS.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_buffered_raw_after_equal_encoded_stays_raw() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::new("kinds", store(&dir), loopback()).await.unwrap();
    let mut messages = receiver.subscribe();

    let sender = Sender::new(
        "kinds",
        store(&dir),
        SenderConfig { buffered: true, ..SenderConfig::default() },
    )
    .unwrap();
    sender.send(&vec![1u8, 2, 3]).await.unwrap();
    sender.send_raw(vec![1u8, 2, 3]).await.unwrap();

    let encoded = next(&mut messages).await;
    assert_eq!(encoded.raw(), None);
    assert_eq!(encoded.decode::<Vec<u8>>().unwrap(), vec![1u8, 2, 3]);
    assert_eq!(next(&mut messages).await.raw(), Some(&[1u8, 2, 3][..]));
}

#[tokio::test]
async fn test_unreachable_directory_reports_send_failed() {
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let connection = ServiceConnection::new(closed).with_timeout(Duration::from_secs(1));
    let store: Arc<dyn DirectoryStore> = Arc::new(RemoteStore::new(connection));

    let sender = Sender::new("orphan", store, SenderConfig::default()).unwrap();
    let mut events = sender.subscribe();

    sender.send("lost").await.unwrap();
    assert_eq!(events.recv().await.unwrap(), SenderEvent::BeforeSend);
    assert!(matches!(
        events.recv().await.unwrap(),
        SenderEvent::SendFailed { .. }
    ));
    assert!(!sender.is_disposed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsubscribed_receiver_holds_connections_until_subscribed() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = Receiver::new("late", store(&dir), loopback()).await.unwrap();

    let sender = Sender::new("late", store(&dir), SenderConfig::default()).unwrap();
    sender.send("early").await.unwrap();

    // the connection waits in the backlog; the envelope is read once somebody listens
    let mut messages = receiver.subscribe();
    assert_eq!(next(&mut messages).await.decode::<String>().unwrap(), "early");
}
