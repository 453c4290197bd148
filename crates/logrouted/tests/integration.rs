//! End-to-end scenarios: real shared-memory regions, real control sockets,
//! real UDP, all inside one process (producer threads and daemon threads
//! share the test pid, which also exercises the same-pid reconnect path).

use logrouted::parser::encode_registration;
use logrouted::{
    session_factory, DltId, LogEntry, LogLevel, NvConfig, Router, SessionServer, StaticConfig,
};
use ringflip::{ShmFile, ShmWriter, WriterFactory, MAX_PAYLOAD_BYTES};
use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RING_LEN: u32 = 2 * (MAX_PAYLOAD_BYTES as u32 + 14);
const ECU: DltId = DltId(*b"ECU1");
const APP: DltId = DltId(*b"MYAP");
const CTX: DltId = DltId(*b"CTX1");

struct TestDaemon {
    dir: tempfile::TempDir,
    router: Arc<Router>,
    server: SessionServer,
    listener: UdpSocket,
}

fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let dst_port = listener.local_addr().unwrap().port();

    let config: StaticConfig = serde_json::from_value(serde_json::json!({
        "ecu_id": "ECU1",
        "quotas_kbps": { "MYAP": 1e12 },
        "channels": [{
            "name": "CH00",
            "src_addr": "127.0.0.1",
            "dst_addr": "127.0.0.1",
            "dst_port": dst_port,
            "default": true
        }]
    }))
    .unwrap();

    let router = Router::from_config(&config).unwrap();
    let nv_config = Arc::new(NvConfig::new(config.nonverbose_messages.clone()));
    let server = SessionServer::start(
        dir.path(),
        session_factory(Arc::clone(&router), nv_config, dir.path()),
    )
    .unwrap();

    TestDaemon {
        dir,
        router,
        server,
        listener,
    }
}

struct TestProducer {
    writer: Arc<ShmWriter>,
    shm_file: ShmFile,
    type_id: u16,
}

fn create_producer(dir: &Path) -> TestProducer {
    let factory = WriterFactory::new(dir);
    let (writer, shm_file) = factory.create(RING_LEN, false, "MYAP").unwrap();
    let writer = Arc::new(writer);
    let type_id = writer
        .try_register_type(&encode_registration(
            ECU,
            APP,
            logrouted::LOG_ENTRY_TYPE_NAME,
        ))
        .unwrap();
    TestProducer {
        writer,
        shm_file,
        type_id,
    }
}

fn write_entry(producer: &TestProducer, timestamp_ns: u64, body: &[u8]) {
    let entry = LogEntry::encode(APP, CTX, LogLevel::Info, 1, body);
    producer
        .writer
        .write_record(timestamp_ns, producer.type_id, entry.len(), |p| {
            p.copy_from_slice(&entry);
        })
        .unwrap();
}

/// Spawns a thread serving the producer's control channel; returns the stop
/// flag and join handle.
fn serve_producer(
    daemon: &TestDaemon,
    producer: &TestProducer,
) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
    let client = ringflip_ipc::MessageClient::connect(
        daemon.dir.path(),
        "MYAP",
        Arc::clone(&producer.writer),
        &producer.shm_file,
    )
    .unwrap();
    let stop = client.stop_handle();
    let handle = std::thread::spawn(move || client.serve());
    (stop, handle)
}

/// Splits a datagram of batched verbose DLT messages into
/// `(timestamp, payload)` pairs.
fn split_dlt(datagram: &[u8]) -> Vec<(u32, Vec<u8>)> {
    const HEADER: usize = 22;
    let mut messages = Vec::new();
    let mut pos = 0;
    while pos + HEADER <= datagram.len() {
        let len = u16::from_be_bytes([datagram[pos + 2], datagram[pos + 3]]) as usize;
        assert!(len >= HEADER && pos + len <= datagram.len(), "framing broken");
        let tmsp = u32::from_be_bytes([
            datagram[pos + 8],
            datagram[pos + 9],
            datagram[pos + 10],
            datagram[pos + 11],
        ]);
        messages.push((tmsp, datagram[pos + HEADER..pos + len].to_vec()));
        pos += len;
    }
    messages
}

/// Collects wire messages until `count` arrived or the deadline passed,
/// flushing the channels while polling.
fn collect_messages(daemon: &TestDaemon, count: usize) -> Vec<(u32, Vec<u8>)> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut messages = Vec::new();
    let mut buf = [0u8; 4096];

    while messages.len() < count && Instant::now() < deadline {
        daemon.router.flush_all();
        if let Ok(n) = daemon.listener.recv(&mut buf) {
            messages.extend(split_dlt(&buf[..n]));
        }
    }
    messages
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// S1: three records flow end to end, in order, bytes intact.
#[test]
fn records_flow_end_to_end() {
    let daemon = start_daemon();
    let producer = create_producer(daemon.dir.path());

    let bodies: Vec<Vec<u8>> = [100usize, 200, 300]
        .iter()
        .map(|&n| (0..n).map(|i| i as u8).collect())
        .collect();
    for (i, body) in bodies.iter().enumerate() {
        // Strictly increasing capture timestamps, far apart in DLT units.
        write_entry(&producer, (i as u64 + 1) * 1_000_000, body);
    }

    let (stop, handle) = serve_producer(&daemon, &producer);

    let messages = collect_messages(&daemon, 3);
    assert_eq!(messages.len(), 3);
    for (i, (tmsp, payload)) in messages.iter().enumerate() {
        assert_eq!(payload, &bodies[i], "payload bytes must arrive exactly");
        assert_eq!(*tmsp, (i as u32 + 1) * 10, "capture timestamp in 0.1ms units");
    }
    let timestamps: Vec<u32> = messages.iter().map(|(t, _)| *t).collect();
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted, "timestamps non-decreasing");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// S2: a producer writes ten records and goes away; the post-mortem drain
/// delivers all of them before the session is destroyed.
#[test]
fn post_mortem_drain_delivers_everything() {
    let daemon = start_daemon();
    let producer = create_producer(daemon.dir.path());

    // Connect, but never answer acquire requests: nothing is drained the
    // normal way.
    let client = ringflip_ipc::MessageClient::connect(
        daemon.dir.path(),
        "MYAP",
        Arc::clone(&producer.writer),
        &producer.shm_file,
    )
    .unwrap();
    wait_for("session", || daemon.server.session_count() == 1);

    for i in 0..10u64 {
        write_entry(&producer, (i + 1) * 100_000, &[i as u8; 32]);
    }

    // The producer stops for good; the sticky detach flag is all the
    // daemon needs to drain the active half post-mortem.
    producer.writer.detach();
    drop(client);

    let messages = collect_messages(&daemon, 10);
    assert_eq!(messages.len(), 10, "all ten records drain post-mortem");
    for (i, (_, payload)) in messages.iter().enumerate() {
        assert_eq!(payload, &vec![i as u8; 32]);
    }

    wait_for("session cleanup", || daemon.server.session_count() == 0);
}

/// S3: a second connect with the same pid finishes the old session first;
/// the new producer's records then flow normally.
#[test]
fn reconnect_same_pid_replaces_session() {
    let daemon = start_daemon();

    // The first producer connects and then goes silent: a stale ghost
    // session holding the pid.
    let first = create_producer(daemon.dir.path());
    let first_client = ringflip_ipc::MessageClient::connect(
        daemon.dir.path(),
        "MYAP",
        Arc::clone(&first.writer),
        &first.shm_file,
    )
    .unwrap();
    wait_for("first session", || daemon.server.session_count() == 1);

    // Same process, same app id: the daemon sees the same pid and the same
    // identifier, force-finishes the ghost and admits the new producer.
    let second = create_producer(daemon.dir.path());
    let (stop_second, second_handle) = serve_producer(&daemon, &second);

    wait_for("replacement session", || {
        daemon.server.session_count() == 1
            && daemon
                .server
                .with_session(std::process::id(), |_| ())
                .is_some()
    });

    write_entry(&second, 42 * 100_000, b"from the second producer");
    let messages = collect_messages(&daemon, 1);
    assert!(
        messages
            .iter()
            .any(|(_, payload)| payload == b"from the second producer"),
        "the replacement producer's records reach the wire"
    );

    drop(first_client);
    stop_second.store(true, Ordering::Relaxed);
    second_handle.join().unwrap();
}

/// Scheduler visibility: sessions appear in the map while connected and the
/// quota configured for the application is applied.
#[test]
fn session_reports_configured_quota() {
    let daemon = start_daemon();
    let producer = create_producer(daemon.dir.path());
    let (stop, handle) = serve_producer(&daemon, &producer);

    wait_for("session", || daemon.server.session_count() == 1);
    let name = daemon
        .server
        .with_session(std::process::id(), |s| s.name().to_string())
        .unwrap();
    assert_eq!(name, "MYAP");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}
