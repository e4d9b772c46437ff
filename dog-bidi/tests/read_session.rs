//! Read sessions against a scripted server

mod support;

use std::time::Duration;

use bytes::Bytes;
use dog_bidi::{
    BidiConfig, BidiError, Checksum, ChecksummedData, ErrorKind, ObjectName, ObjectResource,
    RangeData, RangeError, ReadObjectSpec, ReadRangeRequest, ReadRequest, ReadResponse,
    ReadSessionMultiplexer, RedirectInfo, ResumeHandle, StatusCode, TransportError,
};
use support::{test_config, within, Connection, FakeServer, FakeTransport};

type ReadFake = FakeTransport<ReadRequest, ReadResponse>;
type ReadConn = Connection<ReadRequest, ReadResponse>;

fn object() -> ObjectName {
    ObjectName::new("bucket", "videos/clip.mp4")
}

fn metadata(generation: i64) -> ObjectResource {
    ObjectResource {
        bucket: "bucket".into(),
        name: "videos/clip.mp4".into(),
        generation,
        size: 16,
        crc32c: None,
        finalized: true,
    }
}

fn frame(read_id: u64, offset: u64, data: &'static [u8], end: bool) -> RangeData {
    RangeData {
        read_id,
        offset,
        data: ChecksummedData::new(Bytes::from_static(data), Some(Checksum::of(data).value())),
        range_end: end,
    }
}

fn corrupt(read_id: u64, offset: u64, data: &'static [u8]) -> RangeData {
    let mut frame = frame(read_id, offset, data, true);
    frame.data.crc32c = Some(Checksum::of(data).value() ^ 1);
    frame
}

fn frames(ranges: Vec<RangeData>) -> ReadResponse {
    ReadResponse {
        ranges,
        ..ReadResponse::default()
    }
}

/// Receive range requests until `count` have arrived
async fn recv_ranges(conn: &mut ReadConn, count: usize) -> Vec<ReadRangeRequest> {
    let mut ranges = Vec::new();
    while ranges.len() < count {
        ranges.extend(conn.recv().await.ranges);
    }
    ranges
}

async fn open_session(
    spec: ReadObjectSpec,
    config: BidiConfig,
) -> (ReadSessionMultiplexer, FakeServer<ReadRequest, ReadResponse>, ReadConn) {
    let (transport, mut server) = ReadFake::new();
    let (session, conn) = tokio::join!(
        within(ReadSessionMultiplexer::open(transport, spec, config)),
        async {
            let mut conn = server.accept().await;
            let open = conn.recv().await;
            assert!(open.open.is_some());
            assert!(open.ranges.is_empty());
            conn.respond(ReadResponse {
                metadata: Some(metadata(3)),
                read_handle: Some(ResumeHandle::new(Bytes::from_static(b"R0"))),
                ranges: Vec::new(),
            });
            conn
        }
    );
    (session.unwrap(), server, conn)
}

async fn open_default() -> (ReadSessionMultiplexer, FakeServer<ReadRequest, ReadResponse>, ReadConn) {
    open_session(ReadObjectSpec::new(object()), test_config()).await
}

#[tokio::test]
async fn test_open_reports_metadata() {
    let (session, _server, conn) = open_default().await;

    assert_eq!(conn.params.request_params(), "bucket=bucket");
    assert_eq!(session.metadata().generation, 3);
    assert_eq!(session.metadata().size, 16);
    assert_eq!(session.stream_count(), 1);
}

#[tokio::test]
async fn test_open_fails_with_stream_error() {
    let (transport, mut server) = ReadFake::new();
    let (session, _) = tokio::join!(
        within(ReadSessionMultiplexer::open(
            transport,
            ReadObjectSpec::new(object()),
            test_config()
        )),
        async {
            let mut conn = server.accept().await;
            conn.recv().await;
            conn.fail(TransportError::new(StatusCode::NotFound, "no such object"));
        }
    );

    let err = session.err().unwrap();
    assert_eq!(err.status_code(), Some(StatusCode::NotFound));
}

#[tokio::test]
async fn test_open_rejects_other_generation() {
    let (transport, mut server) = ReadFake::new();
    let spec = ReadObjectSpec::new(object()).with_generation(7);
    let (session, _) = tokio::join!(
        within(ReadSessionMultiplexer::open(transport, spec, test_config())),
        async {
            let mut conn = server.accept().await;
            let open = conn.recv().await;
            assert_eq!(open.open.unwrap().generation, Some(7));
            conn.respond(ReadResponse {
                metadata: Some(metadata(8)),
                ..ReadResponse::default()
            });
        }
    );

    assert!(session.err().unwrap().is_data_loss());
}

#[tokio::test]
async fn test_interleaved_frames_are_demultiplexed() {
    let (session, _server, mut conn) = open_default().await;

    let a = session.read_range(0, 4);
    let b = session.read_range(4, 4);
    let (a_id, b_id) = (a.read_id(), b.read_id());
    assert_ne!(a_id, b_id);

    let ranges = recv_ranges(&mut conn, 2).await;
    assert_eq!(
        ranges,
        vec![
            ReadRangeRequest { read_id: a_id, offset: 0, length: 4 },
            ReadRangeRequest { read_id: b_id, offset: 4, length: 4 },
        ]
    );

    conn.respond(frames(vec![frame(b_id, 4, b"efgh", true), frame(a_id, 0, b"ab", false)]));
    conn.respond(frames(vec![frame(a_id, 2, b"cd", true)]));

    assert_eq!(within(b).await.unwrap().as_ref(), b"efgh");
    assert_eq!(within(a).await.unwrap().as_ref(), b"abcd");
    assert_eq!(session.stream_count(), 1);
}

#[tokio::test]
async fn test_range_error_fails_only_that_read() {
    let (session, mut server, mut conn) = open_default().await;

    let a = session.read_range(0, 4);
    let b = session.read_range(4, 4);
    let (a_id, b_id) = (a.read_id(), b.read_id());
    recv_ranges(&mut conn, 2).await;

    conn.fail(TransportError::range_errors(
        StatusCode::OutOfRange,
        "range rejected",
        vec![RangeError {
            read_id: a_id,
            code: StatusCode::OutOfRange,
            message: "offset past end of object".into(),
        }],
    ));

    let err = within(a).await.unwrap_err();
    assert!(matches!(err, BidiError::RangeFailed { read_id, .. } if read_id == a_id));

    let mut reopened = server.accept().await;
    let open = reopened.recv().await;
    assert_eq!(open.open.as_ref().unwrap().generation, Some(3));
    assert_eq!(
        open.ranges,
        vec![ReadRangeRequest { read_id: b_id, offset: 4, length: 4 }]
    );

    reopened.respond(frames(vec![frame(b_id, 4, b"efgh", true)]));
    assert_eq!(within(b).await.unwrap().as_ref(), b"efgh");
}

#[tokio::test]
async fn test_checksum_mismatch_rerequests_missing_bytes() {
    let (session, _server, mut conn) = open_default().await;

    let read = session.read_range(0, 8);
    let read_id = read.read_id();
    recv_ranges(&mut conn, 1).await;

    conn.respond(frames(vec![frame(read_id, 0, b"abcd", false), corrupt(read_id, 4, b"efgh")]));

    let retry = recv_ranges(&mut conn, 1).await;
    assert_ne!(retry[0].read_id, read_id);
    assert_eq!(retry[0].offset, 4);
    assert_eq!(retry[0].length, 4);

    conn.respond(frames(vec![frame(retry[0].read_id, 4, b"efgh", true)]));
    assert_eq!(within(read).await.unwrap().as_ref(), b"abcdefgh");
}

#[tokio::test]
async fn test_checksum_retries_are_bounded() {
    let config = test_config().with_read_attempts(2);
    let (session, _server, mut conn) = open_session(ReadObjectSpec::new(object()), config).await;

    let read = session.read_range(0, 4);
    let first = recv_ranges(&mut conn, 1).await[0].read_id;
    conn.respond(frames(vec![corrupt(first, 0, b"abcd")]));

    let second = recv_ranges(&mut conn, 1).await[0].read_id;
    conn.respond(frames(vec![corrupt(second, 0, b"abcd")]));

    let err = within(read).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Checksum);
    assert!(matches!(err, BidiError::RetryExhausted { .. }));
}

#[tokio::test]
async fn test_stream_failure_fails_every_read() {
    let (session, _server, mut conn) = open_default().await;

    let a = session.read_range(0, 4);
    let b = session.read_range(4, 4);
    recv_ranges(&mut conn, 2).await;

    conn.fail(TransportError::new(StatusCode::PermissionDenied, "revoked"));

    for read in [a, b] {
        let err = within(read).await.unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::PermissionDenied));
    }

    let late = within(session.read_range(8, 4)).await.unwrap_err();
    assert_eq!(late.status_code(), Some(StatusCode::PermissionDenied));
}

#[tokio::test]
async fn test_redirect_resumes_read_at_received_offset() {
    let (session, mut server, mut conn) = open_default().await;

    let read = session.read_range(0, 8);
    let read_id = read.read_id();
    recv_ranges(&mut conn, 1).await;
    conn.respond(frames(vec![frame(read_id, 0, b"abcd", false)]));

    let handle = ResumeHandle::new(Bytes::from_static(b"R1"));
    conn.fail(TransportError::redirect(
        RedirectInfo::new()
            .with_routing_token("T")
            .with_handle(handle.clone()),
    ));

    let mut moved = server.accept().await;
    assert_eq!(moved.params.routing_token.as_deref(), Some("T"));
    let open = moved.recv().await;
    let spec = open.open.unwrap();
    assert_eq!(spec.routing_token.as_deref(), Some("T"));
    assert_eq!(spec.handle, Some(handle));
    assert_eq!(
        open.ranges,
        vec![ReadRangeRequest { read_id, offset: 4, length: 4 }]
    );

    moved.respond(frames(vec![frame(read_id, 4, b"efgh", true)]));
    assert_eq!(within(read).await.unwrap().as_ref(), b"abcdefgh");
}

#[tokio::test]
async fn test_streaming_read_uses_its_own_stream() {
    let (session, mut server, mut conn) = open_default().await;

    let mut stream = session.read_range_stream(0, 0);
    let stream_id = stream.read_id();

    let mut child = server.accept().await;
    assert_eq!(session.stream_count(), 2);
    let open = child.recv().await;
    assert_eq!(open.open.unwrap().generation, Some(3));
    assert_eq!(
        open.ranges,
        vec![ReadRangeRequest { read_id: stream_id, offset: 0, length: 0 }]
    );

    child.respond(frames(vec![frame(stream_id, 0, b"abcd", false)]));
    assert_eq!(within(stream.next_chunk()).await.unwrap().unwrap().as_ref(), b"abcd");

    // The main stream keeps serving buffered reads meanwhile
    let read = session.read_range(8, 2);
    let ranges = recv_ranges(&mut conn, 1).await;
    conn.respond(frames(vec![frame(ranges[0].read_id, 8, b"ij", true)]));
    assert_eq!(within(read).await.unwrap().as_ref(), b"ij");

    child.respond(frames(vec![frame(stream_id, 4, b"efgh", true)]));
    assert_eq!(within(stream.next_chunk()).await.unwrap().unwrap().as_ref(), b"efgh");
    assert!(within(stream.next_chunk()).await.is_none());

    within(async {
        while session.stream_count() > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_close_fails_outstanding_and_later_reads() {
    let (session, _server, mut conn) = open_default().await;

    let pending = session.read_range(0, 4);
    recv_ranges(&mut conn, 1).await;

    session.close();
    assert!(session.is_closed());

    assert!(within(pending).await.unwrap_err().is_closed());
    assert!(within(session.read_range(0, 4)).await.unwrap_err().is_closed());

    let mut stream = session.read_range_stream(0, 4);
    assert!(matches!(within(stream.next_chunk()).await, Some(Err(BidiError::Closed))));
}
