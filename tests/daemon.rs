// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! Conversation tests against a scripted peer speaking the daemon side of
//! the protocol over an in-process duplex stream.

use depot_daemon::daemon::{wire, Proto};
use depot_daemon::model::{CaMethod, DerivedPath, DrvOutput};
use depot_daemon::store::{DaemonStore, PathToCopy, Store};
use depot_daemon::{
    BuildMode, ClientSettings, DaemonError, Error, Logger, PathInfo, Result, StderrActivityType,
    StderrField, StderrResult, StderrStartActivity, TrustedFlag, Verbosity,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_stream::StreamExt;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
        .unwrap_or_default()
}

/// One regular file containing "DaemonStore::add_to_store()", as dumped by
/// the reference archiver.
const NAR_REGULAR: &[u8] = &[
    0x0d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x6e, 0x69, 0x78, 0x2d, 0x61, 0x72, 0x63,
    0x68, 0x69, 0x76, 0x65, 0x2d, 0x31, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x74, 0x79, 0x70, 0x65, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x72, 0x65, 0x67, 0x75, 0x6c, 0x61, 0x72, 0x00, 0x08, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x63, 0x6f, 0x6e, 0x74, 0x65, 0x6e, 0x74, 0x73, 0x1b, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x44, 0x61, 0x65, 0x6d, 0x6f, 0x6e, 0x53, 0x74, 0x6f,
    0x72, 0x65, 0x3a, 0x3a, 0x61, 0x64, 0x64, 0x5f, 0x74, 0x6f, 0x5f, 0x73, 0x74, 0x6f, 0x72,
    0x65, 0x28, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const STORE_PATH: &str = "/depot/store/ffffffffffffffffffffffffffffffff-hello-1.0";

/// Logger that records everything for later assertions.
#[derive(Debug, Default)]
struct RecordingLogger {
    lines: Mutex<Vec<String>>,
    started: Mutex<Vec<u64>>,
    stopped: Mutex<Vec<u64>>,
    results: Mutex<Vec<u64>>,
}

impl RecordingLogger {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, _level: Verbosity, msg: &str) {
        self.lines.lock().unwrap().push(msg.to_string());
    }
    fn start_activity(&self, act: &StderrStartActivity) {
        self.started.lock().unwrap().push(act.act_id);
    }
    fn stop_activity(&self, act_id: u64) {
        self.stopped.lock().unwrap().push(act_id);
    }
    fn result(&self, result: &StderrResult) {
        self.results.lock().unwrap().push(result.act_id);
    }
}

/// A connection factory that hands out the given streams in order and fails
/// once they run out.
fn stream_factory(
    ends: Vec<DuplexStream>,
) -> impl Fn() -> Pin<Box<dyn Future<Output = Result<DuplexStream>> + Send>> + Send + Sync + 'static
{
    let ends = Mutex::new(ends.into_iter());
    move || {
        let next = ends.lock().unwrap().next();
        Box::pin(async move {
            next.ok_or_else(|| Error::Protocol("test factory exhausted".into()))
        })
    }
}

/// Speaks the daemon's side of the handshake, including the initial
/// SetOptions, and returns the settings the client sent.
async fn serve_handshake(conn: &mut DuplexStream, proto: Proto) -> Result<ClientSettings> {
    assert_eq!(wire::WORKER_MAGIC_1, wire::read_u64(conn).await?);
    wire::write_u64(conn, wire::WORKER_MAGIC_2).await?;
    wire::write_proto(conn, proto).await?;
    let client = wire::read_proto(conn).await?;
    assert_eq!(Proto(1, 37), client);
    wire::read_u64(conn).await?; // obsolete cpu affinity
    wire::read_u64(conn).await?; // obsolete reserve space
    if proto.since(33) {
        wire::write_string(conn, "2.18.1").await?;
    }
    if proto.since(35) {
        wire::write_trusted_flag(conn, Some(TrustedFlag::Trusted)).await?;
    }
    wire::write_frame(conn, &wire::Frame::Last, proto).await?;

    assert_eq!(wire::Op::SetOptions, wire::read_op(conn).await?);
    let settings = wire::read_client_settings(conn).await?;
    wire::write_frame(conn, &wire::Frame::Last, proto).await?;
    Ok(settings)
}

async fn serve_string_list(conn: &mut DuplexStream) -> Result<Vec<String>> {
    wire::read_strings(conn).collect::<Result<Vec<_>>>().await
}

/// Reads one framed upload (length-prefixed chunks until a zero frame).
async fn read_framed(conn: &mut DuplexStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let len = wire::read_u64(conn).await?;
        if len == 0 {
            return Ok(data);
        }
        let start = data.len();
        data.resize(start + len as usize, 0);
        conn.read_exact(&mut data[start..]).await?;
    }
}

fn sample_path_info() -> PathInfo {
    PathInfo {
        deriver: None,
        references: vec![],
        nar_hash: "sha256-3c126cf4c0fec8c85cf9791ccdaf670877f9f9fa".into(),
        nar_size: NAR_REGULAR.len() as u64,
        ultimate: false,
        signatures: vec![],
        ca: None,
        registration_time: chrono::DateTime::from_timestamp(1700495600, 0).unwrap(),
    }
}

async fn connect(
    ends: Vec<DuplexStream>,
    logger: Arc<dyn Logger>,
) -> Result<DaemonStore<DuplexStream>> {
    DaemonStore::builder()
        .logger(logger)
        .connect_with(stream_factory(ends))
        .await
}

// S1: an empty QueryValidPaths round-trips to an empty set.
#[tokio::test]
async fn test_empty_query_valid_paths() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::QueryValidPaths, wire::read_op(&mut conn).await?);
        assert_eq!(Vec::<String>::new(), serve_string_list(&mut conn).await?);
        assert_eq!(true, wire::read_bool(&mut conn).await?); // substitute flag
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_strings(&mut conn, Vec::<String>::new()).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    let paths = store.query_valid_paths(&[], true).await.unwrap();
    assert_eq!(Vec::<String>::new(), paths);

    drop(store);
    server.await.unwrap().unwrap();
}

// S2: SetOptions lands on the daemon, and a subsequent IsValidPath for an
// unknown path answers false.
#[tokio::test]
async fn test_set_options_then_is_valid_path() {
    init_logging();
    let proto = Proto(1, 27);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let initial = serve_handshake(&mut conn, proto).await?;
        assert_eq!(false, initial.keep_failed);

        assert_eq!(wire::Op::SetOptions, wire::read_op(&mut conn).await?);
        let updated = wire::read_client_settings(&mut conn).await?;
        assert_eq!(true, updated.keep_failed);
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;

        assert_eq!(wire::Op::IsValidPath, wire::read_op(&mut conn).await?);
        assert_eq!(STORE_PATH, wire::read_string(&mut conn).await?);
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_bool(&mut conn, false).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    store
        .set_options(&ClientSettings {
            keep_failed: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(false, store.is_valid_path(STORE_PATH).await.unwrap());

    drop(store);
    server.await.unwrap().unwrap();
}

// S3: a framed AddToStore upload with an activity interleaved. The daemon
// sees the opcode, the CA method, the references and the repair flag, then
// the payload as frames, while the client forwards the activity.
#[tokio::test]
async fn test_add_ca_to_store_framed() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;

        assert_eq!(wire::Op::AddToStore, wire::read_op(&mut conn).await?);
        assert_eq!("hello.txt", wire::read_string(&mut conn).await?);
        assert_eq!("text:sha256", wire::read_string(&mut conn).await?);
        assert_eq!(Vec::<String>::new(), serve_string_list(&mut conn).await?);
        assert_eq!(false, wire::read_bool(&mut conn).await?);

        // Interleave an activity with the upload.
        wire::write_frame(
            &mut conn,
            &wire::Frame::StartActivity(StderrStartActivity {
                act_id: 7,
                level: Verbosity::Info,
                kind: StderrActivityType::CopyPath,
                s: "copying".into(),
                fields: vec![StderrField::String("hello.txt".into())],
                parent_id: 0,
            }),
            proto,
        )
        .await?;

        let payload = read_framed(&mut conn).await?;
        assert_eq!(b"hello world\n", &payload[..]);

        wire::write_frame(&mut conn, &wire::Frame::StopActivity { act_id: 7 }, proto).await?;
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;

        wire::write_string(&mut conn, STORE_PATH).await?;
        wire::write_pathinfo(&mut conn, &sample_path_info()).await?;
        Ok::<_, Error>(())
    });

    let logger = Arc::new(RecordingLogger::default());
    let store = connect(vec![client_end], logger.clone())
        .await
        .expect("connect failed");
    let (path, info) = store
        .add_ca_to_store(
            "hello.txt",
            CaMethod::Text,
            &[],
            false,
            &b"hello world\n"[..],
        )
        .await
        .unwrap();
    assert_eq!(STORE_PATH, path);
    assert_eq!(sample_path_info(), info);
    assert_eq!(vec![7], logger.started.lock().unwrap().clone());
    assert_eq!(vec![7], logger.stopped.lock().unwrap().clone());

    drop(store);
    server.await.unwrap().unwrap();
}

// S4: three log lines, then an error frame. The lines reach the logger, the
// caller sees the remote error, the connection is poisoned, and the next
// operation opens a fresh connection.
#[tokio::test]
async fn test_error_frame_poisons_connection() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end1, mut conn1) = tokio::io::duplex(64 * 1024);
    let (client_end2, mut conn2) = tokio::io::duplex(64 * 1024);

    let server1 = tokio::spawn(async move {
        serve_handshake(&mut conn1, proto).await?;
        assert_eq!(wire::Op::BuildPaths, wire::read_op(&mut conn1).await?);
        serve_string_list(&mut conn1).await?;
        wire::read_u64(&mut conn1).await?; // build mode
        for n in 1..=3 {
            wire::write_frame(&mut conn1, &wire::Frame::Next(format!("log line {}", n)), proto)
                .await?;
        }
        wire::write_frame(
            &mut conn1,
            &wire::Frame::Error(DaemonError {
                level: Verbosity::Error,
                msg: "build of '/depot/store/aaaa-hello.drv' failed".into(),
                traces: vec![],
            }),
            proto,
        )
        .await?;
        Ok::<_, Error>(())
    });
    let server2 = tokio::spawn(async move {
        serve_handshake(&mut conn2, proto).await?;
        assert_eq!(wire::Op::IsValidPath, wire::read_op(&mut conn2).await?);
        wire::read_string(&mut conn2).await?;
        wire::write_frame(&mut conn2, &wire::Frame::Last, proto).await?;
        wire::write_bool(&mut conn2, true).await?;
        Ok::<_, Error>(())
    });

    let logger = Arc::new(RecordingLogger::default());
    let store = connect(vec![client_end1, client_end2], logger.clone())
        .await
        .expect("connect failed");

    let target = DerivedPath::built("/depot/store/aaaa-hello.drv", ["out"]);
    match store.build_paths(&[target], BuildMode::Normal).await {
        Err(Error::Remote(err)) => assert!(err.msg.contains("failed"), "{}", err.msg),
        other => panic!("expected remote error, got {:?}", other),
    }
    assert_eq!(
        vec!["log line 1", "log line 2", "log line 3"],
        logger.lines()
    );

    // The poisoned connection is gone; this runs on a fresh one.
    assert_eq!(true, store.is_valid_path(STORE_PATH).await.unwrap());

    drop(store);
    server1.await.unwrap().unwrap();
    server2.await.unwrap().unwrap();
}

// S5: a pool of one serialises two concurrent callers onto a single
// connection; the factory only ever runs once.
#[tokio::test]
async fn test_pool_of_one_serialises_callers() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        for _ in 0..2 {
            assert_eq!(wire::Op::IsValidPath, wire::read_op(&mut conn).await?);
            wire::read_string(&mut conn).await?;
            wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
            wire::write_bool(&mut conn, true).await?;
        }
        Ok::<_, Error>(())
    });

    // A single client stream: a second factory call would fail the test.
    let store = Arc::new(
        connect(vec![client_end], Arc::new(RecordingLogger::default()))
            .await
            .expect("connect failed"),
    );

    let a = tokio::spawn({
        let store = store.clone();
        async move { store.is_valid_path(STORE_PATH).await }
    });
    let b = tokio::spawn({
        let store = store.clone();
        async move { store.is_valid_path(STORE_PATH).await }
    });
    assert_eq!(true, a.await.unwrap().unwrap());
    assert_eq!(true, b.await.unwrap().unwrap());

    drop(store);
    server.await.unwrap().unwrap();
}

// S6: QueryRealisation against a minor-26 daemon answers None with a
// warning, and never writes the opcode.
#[tokio::test]
async fn test_query_realisation_old_daemon() {
    init_logging();
    let proto = Proto(1, 26);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        // Nothing else may arrive; the client hangs up without an opcode.
        match wire::read_u64(&mut conn).await {
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok::<_, Error>(()),
            Ok(op) => panic!("unexpected opcode on the wire: {:#x}", op),
            Err(err) => Err(err.into()),
        }
    });

    let logger = Arc::new(RecordingLogger::default());
    let store = connect(vec![client_end], logger.clone())
        .await
        .expect("connect failed");
    let id: DrvOutput = "sha256:abcd!out".parse().unwrap();
    assert_eq!(None, store.query_realisation(&id).await.unwrap());
    assert!(
        logger.lines().iter().any(|l| l.contains("too old")),
        "missing warning: {:?}",
        logger.lines()
    );

    drop(store);
    server.await.unwrap().unwrap();
}

// An unsupported operation leaves the connection usable: the gate fires
// before the opcode is written.
#[tokio::test]
async fn test_unsupported_op_does_not_poison() {
    init_logging();
    let proto = Proto(1, 31);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::IsValidPath, wire::read_op(&mut conn).await?);
        wire::read_string(&mut conn).await?;
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_bool(&mut conn, true).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    match store
        .add_build_log("/depot/store/aaaa-hello.drv", b"log\n")
        .await
    {
        Err(Error::Unsupported(_)) => {}
        other => panic!("expected Unsupported, got {:?}", other),
    }
    assert_eq!(true, store.is_valid_path(STORE_PATH).await.unwrap());

    drop(store);
    server.await.unwrap().unwrap();
}

// NarFromPath: the archive bytes follow the frame loop raw, and end exactly
// at the archive's closing token.
#[tokio::test]
async fn test_nar_from_path_streams_archive() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::NarFromPath, wire::read_op(&mut conn).await?);
        assert_eq!(STORE_PATH, wire::read_string(&mut conn).await?);
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        tokio::io::AsyncWriteExt::write_all(&mut conn, NAR_REGULAR).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    let mut sink = std::io::Cursor::new(Vec::new());
    store.nar_from_path(STORE_PATH, &mut sink).await.unwrap();
    assert_eq!(NAR_REGULAR, &sink.into_inner()[..]);

    drop(store);
    server.await.unwrap().unwrap();
}

// Below minor 23 there is no framed sink: the daemon pulls the archive
// through Read frames, and a short answer means end-of-input.
#[tokio::test]
async fn test_add_to_store_nar_via_read_frames() {
    init_logging();
    let proto = Proto(1, 22);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::AddToStoreNar, wire::read_op(&mut conn).await?);
        assert_eq!(STORE_PATH, wire::read_string(&mut conn).await?);
        wire::read_string(&mut conn).await?; // deriver
        wire::read_string(&mut conn).await?; // nar hash
        serve_string_list(&mut conn).await?; // references
        wire::read_u64(&mut conn).await?; // registration time
        wire::read_u64(&mut conn).await?; // nar size
        wire::read_u64(&mut conn).await?; // ultimate
        serve_string_list(&mut conn).await?; // signatures
        wire::read_string(&mut conn).await?; // ca
        wire::read_u64(&mut conn).await?; // repair
        wire::read_u64(&mut conn).await?; // dont_check_sigs

        let mut received = Vec::new();
        loop {
            wire::write_frame(&mut conn, &wire::Frame::Read(8), proto).await?;
            let chunk = wire::read_bytes(&mut conn).await?;
            let done = chunk.len() < 8;
            received.extend_from_slice(&chunk);
            if done {
                break;
            }
        }
        assert_eq!(b"hello world!", &received[..]);
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    store
        .add_to_store_nar(
            STORE_PATH,
            &sample_path_info(),
            false,
            true,
            &b"hello world!"[..],
        )
        .await
        .unwrap();

    drop(store);
    server.await.unwrap().unwrap();
}

// From minor 32, a batch upload travels as one framed stream of
// (path, metadata, archive) entries.
#[tokio::test]
async fn test_add_multiple_to_store_framed() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::AddMultipleToStore, wire::read_op(&mut conn).await?);
        assert_eq!(false, wire::read_bool(&mut conn).await?); // repair
        assert_eq!(false, wire::read_bool(&mut conn).await?); // dont_check_sigs

        let stream = read_framed(&mut conn).await?;
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;

        // Decode the collected batch: count, then path + metadata + archive.
        let mut cursor = &stream[..];
        assert_eq!(1, wire::read_u64(&mut cursor).await?);
        assert_eq!(STORE_PATH, wire::read_string(&mut cursor).await?);
        assert_eq!(sample_path_info(), wire::read_pathinfo(&mut cursor).await?);
        let mut nar = std::io::Cursor::new(Vec::new());
        wire::copy_nar(&mut cursor, &mut nar).await?;
        assert_eq!(NAR_REGULAR, &nar.into_inner()[..]);
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    store
        .add_multiple_to_store(
            vec![PathToCopy {
                path: STORE_PATH.to_string(),
                info: sample_path_info(),
                nar: NAR_REGULAR,
            }],
            false,
            true,
        )
        .await
        .unwrap();

    drop(store);
    server.await.unwrap().unwrap();
}

// Below minor 32 the batch is emulated with one AddToStoreNar per path.
#[tokio::test]
async fn test_add_multiple_to_store_falls_back() {
    init_logging();
    let proto = Proto(1, 31);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;
        assert_eq!(wire::Op::AddToStoreNar, wire::read_op(&mut conn).await?);
        assert_eq!(STORE_PATH, wire::read_string(&mut conn).await?);
        wire::read_string(&mut conn).await?; // deriver
        wire::read_string(&mut conn).await?; // nar hash
        serve_string_list(&mut conn).await?;
        wire::read_u64(&mut conn).await?;
        wire::read_u64(&mut conn).await?;
        wire::read_u64(&mut conn).await?;
        serve_string_list(&mut conn).await?;
        wire::read_string(&mut conn).await?;
        wire::read_u64(&mut conn).await?;
        wire::read_u64(&mut conn).await?;

        // Minor 31 still frames single-path uploads (23+).
        let payload = read_framed(&mut conn).await?;
        assert_eq!(NAR_REGULAR, &payload[..]);
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");
    store
        .add_multiple_to_store(
            vec![PathToCopy {
                path: STORE_PATH.to_string(),
                info: sample_path_info(),
                nar: NAR_REGULAR,
            }],
            false,
            true,
        )
        .await
        .unwrap();

    drop(store);
    server.await.unwrap().unwrap();
}

// Garbage collection: options go out with their three obsolete zeros, the
// results come back, and the path-info cache forgets everything it knew.
#[tokio::test]
async fn test_collect_garbage_invalidates_cache() {
    init_logging();
    let proto = Proto(1, 35);
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        serve_handshake(&mut conn, proto).await?;

        // First query: a path-info miss, cached by the client.
        assert_eq!(wire::Op::QueryPathInfo, wire::read_op(&mut conn).await?);
        wire::read_string(&mut conn).await?;
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_bool(&mut conn, true).await?;
        wire::write_pathinfo(&mut conn, &sample_path_info()).await?;

        assert_eq!(wire::Op::CollectGarbage, wire::read_op(&mut conn).await?);
        assert_eq!(2, wire::read_u64(&mut conn).await?); // DeleteDead
        serve_string_list(&mut conn).await?;
        wire::read_u64(&mut conn).await?; // ignore_liveness
        wire::read_u64(&mut conn).await?; // max_freed
        for _ in 0..3 {
            assert_eq!(0, wire::read_u64(&mut conn).await?);
        }
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_strings(&mut conn, [STORE_PATH]).await?;
        wire::write_u64(&mut conn, 1768960).await?; // bytes freed
        wire::write_u64(&mut conn, 0).await?; // obsolete

        // The cache was cleared, so this query hits the wire again.
        assert_eq!(wire::Op::QueryPathInfo, wire::read_op(&mut conn).await?);
        wire::read_string(&mut conn).await?;
        wire::write_frame(&mut conn, &wire::Frame::Last, proto).await?;
        wire::write_bool(&mut conn, false).await?;
        Ok::<_, Error>(())
    });

    let store = connect(vec![client_end], Arc::new(RecordingLogger::default()))
        .await
        .expect("connect failed");

    assert!(store.query_path_info(STORE_PATH).await.unwrap().is_some());
    // Served from the cache; the wire sees nothing.
    assert!(store.query_path_info(STORE_PATH).await.unwrap().is_some());

    let results = store
        .collect_garbage(&depot_daemon::model::GcOptions::default())
        .await
        .unwrap();
    assert_eq!(vec![STORE_PATH.to_string()], results.paths);
    assert_eq!(1768960, results.bytes_freed);

    assert!(store.query_path_info(STORE_PATH).await.unwrap().is_none());

    drop(store);
    server.await.unwrap().unwrap();
}

// A handshake failure latches the pool: the first caller sees the real
// error, everyone after that fails fast.
#[tokio::test]
async fn test_failed_connect_latches() {
    init_logging();
    let (client_end, mut conn) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        wire::read_u64(&mut conn).await?; // client magic
        wire::write_u64(&mut conn, 0xbad).await?; // wrong magic back
        Ok::<_, Error>(())
    });

    match connect(vec![client_end], Arc::new(RecordingLogger::default())).await {
        Err(Error::Field("magic2", _)) => {}
        other => panic!("expected handshake failure, got {:?}", other.map(|_| ())),
    }
    server.await.unwrap().unwrap();
}
