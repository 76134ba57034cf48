use std::time::Duration;

use manifold::{
    Broadcaster, BroadcasterTask, ConfigError, Endpoint, Receiver, RecvError, SendError, broadcaster, receiver,
    records,
};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_SIZE: usize = 4096;

/// Engine bound to an ephemeral localhost port, autoflush disabled so tests
/// control buffer boundaries themselves.
async fn engine(buffer_count: usize, max_clients: usize) -> (Broadcaster, BroadcasterTask, Endpoint) {
    let (tx, task) = broadcaster(Endpoint::Tcp("127.0.0.1:0".into()))
        .buffer_count(buffer_count)
        .buffer_size(BUFFER_SIZE)
        .max_clients(max_clients)
        .autoflush(Duration::ZERO)
        .build()
        .await
        .unwrap();
    let addr = tx.local_addr().unwrap();
    (tx, task, Endpoint::Tcp(addr.to_string()))
}

async fn wait_for_clients(tx: &Broadcaster, expected: u32) {
    timeout(TIMEOUT, async {
        while tx.client_count() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Receives one buffer and splits it back into records.
async fn recv_records(rx: &mut Receiver) -> Vec<Vec<u8>> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let len = timeout(TIMEOUT, rx.recv(&mut buf)).await.unwrap().unwrap();
    records(&buf[..len]).map(|record| record.unwrap().to_vec()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_every_consumer() {
    let (mut tx, _task, endpoint) = engine(4, 4).await;

    let mut rx1 = receiver(endpoint.clone()).connect().await.unwrap();
    let mut rx2 = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 2).await;

    let sent: Vec<Vec<u8>> = vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()];
    for record in &sent {
        tx.send(record).await.unwrap();
    }
    tx.flush().await.unwrap();

    // Both consumers get the identical record sequence in one buffer
    assert_eq!(recv_records(&mut rx1).await, sent);
    assert_eq!(recv_records(&mut rx2).await, sent);
    assert_eq!(tx.finished_buffers(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consecutive_buffers_arrive_in_order() {
    let (mut tx, _task, endpoint) = engine(4, 2).await;

    let mut rx = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    for n in 0..5u32 {
        tx.send(format!("batch-{n}").as_bytes()).await.unwrap();
        tx.flush().await.unwrap();
    }

    for n in 0..5u32 {
        assert_eq!(recv_records(&mut rx).await, vec![format!("batch-{n}").into_bytes()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_only_sees_later_buffers() {
    let (mut tx, _task, endpoint) = engine(4, 4).await;

    let mut rx1 = receiver(endpoint.clone()).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    tx.send(b"first").await.unwrap();
    tx.flush().await.unwrap();
    assert_eq!(recv_records(&mut rx1).await, vec![b"first".to_vec()]);

    // rx1 has the first buffer, so it is flushed and consumed; a consumer
    // connecting now must never see it
    let mut rx2 = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 2).await;

    tx.send(b"second").await.unwrap();
    tx.flush().await.unwrap();

    assert_eq!(recv_records(&mut rx1).await, vec![b"second".to_vec()]);
    assert_eq!(recv_records(&mut rx2).await, vec![b"second".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_does_not_stall_others() {
    let (mut tx, _task, endpoint) = engine(2, 4).await;

    let mut rx1 = receiver(endpoint.clone()).connect().await.unwrap();
    let rx2 = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 2).await;

    // rx2 vanishes without reading a byte
    drop(rx2);
    wait_for_clients(&tx, 1).await;

    // With a ring of two, the producer would wedge if the departed
    // consumer still counted toward any buffer's target
    for n in 0..4u32 {
        tx.send(format!("solo-{n}").as_bytes()).await.unwrap();
        tx.flush().await.unwrap();
        assert_eq!(recv_records(&mut rx1).await, vec![format!("solo-{n}").into_bytes()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_payloads_survive_the_ring() {
    use rand::{Rng, RngCore, SeedableRng, rngs::StdRng};

    let (mut tx, _task, endpoint) = engine(3, 2).await;
    let mut rx = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    let mut rng = StdRng::seed_from_u64(0x4d414e49);
    for _ in 0..20 {
        let mut sent = Vec::new();
        for _ in 0..rng.random_range(1..=5) {
            let mut record = vec![0u8; rng.random_range(1..=512)];
            rng.fill_bytes(&mut record);
            tx.send(&record).await.unwrap();
            sent.push(record);
        }
        tx.flush().await.unwrap();
        assert_eq!(recv_records(&mut rx).await, sent);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumers_beyond_capacity_are_refused() {
    let (tx, _task, endpoint) = engine(4, 1).await;

    let _rx1 = receiver(endpoint.clone()).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    // The TCP handshake succeeds, then the engine drops the connection
    let mut rx2 = receiver(endpoint).connect().await.unwrap();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let err = timeout(TIMEOUT, rx2.recv(&mut buf)).await.unwrap().unwrap_err();
    assert!(matches!(err, RecvError::Closed | RecvError::Io(_)));
    assert_eq!(tx.client_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_without_consumers_discards() {
    let (mut tx, _task, _endpoint) = engine(2, 2).await;

    // No consumer is connected: data is accepted and dropped at flush
    // time, and the producer never blocks on it
    for _ in 0..8 {
        tx.send(b"into the void").await.unwrap();
        tx.flush().await.unwrap();
    }
    assert_eq!(tx.finished_buffers(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_record_is_rejected() {
    let (mut tx, _task, _endpoint) = engine(2, 2).await;

    let record = vec![0u8; BUFFER_SIZE];
    let err = tx.send(&record).await.unwrap_err();
    assert!(matches!(err, SendError::TooLarge { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autoflush_delivers_sparse_traffic() {
    let (mut tx, task, endpoint) = broadcaster(Endpoint::Tcp("127.0.0.1:0".into()))
        .buffer_size(BUFFER_SIZE)
        .autoflush(Duration::from_millis(50))
        .build()
        .await
        .map(|(tx, task)| {
            let addr = tx.local_addr().unwrap();
            (tx, task, Endpoint::Tcp(addr.to_string()))
        })
        .unwrap();
    task.set_accept_timeout(Duration::from_millis(10));

    let mut rx = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    // No explicit flush: the background task pushes the buffer out
    tx.send(b"eventually").await.unwrap();
    assert_eq!(recv_records(&mut rx).await, vec![b"eventually".to_vec()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_prompt_and_terminal() {
    let (mut tx, task, endpoint) = engine(2, 2).await;

    let mut rx = receiver(endpoint).connect().await.unwrap();
    wait_for_clients(&tx, 1).await;

    let handle = task.stop();
    timeout(TIMEOUT, handle).await.unwrap().unwrap();

    // Consumers are cut off rather than left on a dead stream
    let mut buf = vec![0u8; BUFFER_SIZE];
    let err = timeout(TIMEOUT, rx.recv(&mut buf)).await.unwrap().unwrap_err();
    assert!(matches!(err, RecvError::Closed | RecvError::Incomplete | RecvError::Io(_)));

    // And the handle reports closed
    let err = tx.send(b"too late").await.unwrap_err();
    assert!(matches!(err, SendError::Closed));
    assert!(tx.is_closed());
}

#[tokio::test]
async fn configuration_violations_fail_at_build() {
    let endpoint = Endpoint::Tcp("127.0.0.1:0".into());

    let err = broadcaster(endpoint.clone()).buffer_count(0).build().await.unwrap_err();
    assert!(matches!(err, ConfigError::ZeroBufferCount));

    let err = broadcaster(endpoint.clone()).buffer_size(4).build().await.unwrap_err();
    assert!(matches!(err, ConfigError::BufferTooSmall));

    let err = broadcaster(endpoint.clone()).max_clients(0).build().await.unwrap_err();
    assert!(matches!(err, ConfigError::ZeroMaxClients));

    let err = broadcaster(Endpoint::Tcp("256.0.0.1:1".into())).build().await.unwrap_err();
    assert!(matches!(err, ConfigError::Bind { .. }));
}
