//! Streaming tests: open handshake, credit pacing, cancellation and
//! terminal events, run over a pair of in-memory connections.

use std::time::Duration;

use callwire::protocol::{Command, FrameBuffer, FrameEncoder, Inbound, ServerInbound, StreamHandle};
use callwire::{
    Argument, CallFailure, Connection, ConnectionBuilder, RemoteStream, ServiceDefinition,
    ServiceError, StreamEvent, StreamSink, StreamState,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const TICKER: Uuid = Uuid::from_u128(0x71C4);

/// Method 1 counts from 0 to n-1, method 2 fails after one item.
fn ticker() -> ServiceDefinition {
    ServiceDefinition::new(TICKER)
        .stream_method(1, |(count,): (u32,), sink: StreamSink, _ctx| async move {
            for i in 0..count {
                sink.send(&i)
                    .await
                    .map_err(|e| ServiceError::new("send", e.to_string()))?;
            }
            Ok::<_, ServiceError>(())
        })
        .stream_method(2, |(): (), sink: StreamSink, _ctx| async move {
            sink.send(&0u32)
                .await
                .map_err(|e| ServiceError::new("send", e.to_string()))?;
            Err(ServiceError::new("exhausted", "no more items"))
        })
}

fn pair(server: ConnectionBuilder) -> (Connection, Connection) {
    let (a, b) = duplex(256 * 1024);
    let server = server.start(a).unwrap();
    let client = Connection::builder().start(b).unwrap();
    (server, client)
}

async fn counting(client: &Connection, count: u32) -> RemoteStream<u32> {
    client
        .bind(TICKER)
        .call_stream(1, vec![Argument::value(&count).unwrap()])
        .await
        .unwrap()
}

async fn expect_item(stream: &mut RemoteStream<u32>, expected: u32) {
    match stream.next_event().await {
        Some(StreamEvent::Data(item)) => assert_eq!(item, expected),
        other => panic!("expected item {}, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_credit_paces_producer() {
    let (_server, client) = pair(Connection::builder().service(ticker()));
    let mut stream = counting(&client, 5).await;
    assert_eq!(stream.state(), StreamState::AwaitingOpen);

    stream.open().await.unwrap();
    assert_eq!(stream.state(), StreamState::Open);

    stream.request(2).await.unwrap();
    expect_item(&mut stream, 0).await;
    expect_item(&mut stream, 1).await;

    // Credit exhausted: nothing more arrives
    assert!(timeout(Duration::from_millis(100), stream.next_event())
        .await
        .is_err());

    stream.request(3).await.unwrap();
    for i in 2..5 {
        expect_item(&mut stream, i).await;
    }
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Closed)));
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(stream.next_event().await.is_none());
    assert_eq!(client.open_streams(), 0);
}

#[tokio::test]
async fn test_zero_credit_is_noop() {
    let (_server, client) = pair(Connection::builder().service(ticker()));
    let mut stream = counting(&client, 1).await;
    stream.open().await.unwrap();

    stream.request(0).await.unwrap();
    assert!(timeout(Duration::from_millis(100), stream.next_event())
        .await
        .is_err());

    stream.request(1).await.unwrap();
    expect_item(&mut stream, 0).await;
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Closed)));
}

#[tokio::test]
async fn test_request_before_open_is_rejected() {
    let (_server, client) = pair(Connection::builder().service(ticker()));
    let mut stream = counting(&client, 1).await;

    assert!(stream.request(1).await.is_err());
    assert!(stream.next_event().await.is_none());
    assert_eq!(stream.state(), StreamState::AwaitingOpen);
}

#[tokio::test]
async fn test_negative_credit_cancels_producer() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = ServiceDefinition::new(TICKER).stream_method(
        1,
        move |(): (), sink: StreamSink, _ctx| {
            let tx = tx.clone();
            async move {
                let mut i = 0u32;
                while sink.send(&i).await.is_ok() {
                    i += 1;
                }
                sink.closed().await;
                tx.send(sink.is_closed()).unwrap();
                Ok::<_, ServiceError>(())
            }
        },
    );
    let (_server, client) = pair(Connection::builder().service(service));

    let mut stream: RemoteStream<u32> = client.bind(TICKER).call_stream(1, vec![]).await.unwrap();
    stream.open().await.unwrap();
    stream.request(1).await.unwrap();
    expect_item(&mut stream, 0).await;

    stream.request(-1).await.unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(stream.next_event().await.is_none());
    assert!(rx.recv().await.unwrap());

    // A second close is a no-op
    stream.close().await.unwrap();
}

#[tokio::test]
async fn test_producer_failure_is_terminal() {
    let (_server, client) = pair(Connection::builder().service(ticker()));
    let mut stream: RemoteStream<u32> = client.bind(TICKER).call_stream(2, vec![]).await.unwrap();
    stream.open().await.unwrap();
    stream.request(10).await.unwrap();

    expect_item(&mut stream, 0).await;
    match stream.next_event().await {
        Some(StreamEvent::Failed(failure)) => {
            let err: ServiceError = failure.remote().unwrap();
            assert_eq!(err.kind, "exhausted");
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(stream.next_event().await.is_none());
}

#[tokio::test]
async fn test_unopened_stream_times_out() {
    let (_server, client) = pair(
        Connection::builder()
            .service(ticker())
            .stream_open_timeout(Duration::from_millis(50)),
    );
    let mut stream = counting(&client, 3).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    stream.open().await.unwrap();

    match stream.next_event().await {
        Some(StreamEvent::Failed(failure)) => {
            let err: ServiceError = failure.remote().unwrap();
            assert_eq!(err.kind, "stream_not_opened");
        }
        other => panic!("expected open timeout, got {:?}", other),
    }
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_stream_method_without_args_rejects_extra() {
    let (_server, client) = pair(Connection::builder().service(ticker()));
    let result = client
        .bind(TICKER)
        .call_stream::<u32>(2, vec![Argument::value(&1).unwrap()])
        .await;
    assert!(result.is_err());
    assert_eq!(client.open_streams(), 0);
}

#[tokio::test]
async fn test_connection_loss_fails_stream() {
    let service = ServiceDefinition::new(TICKER).stream_method(
        1,
        |(): (), sink: StreamSink, _ctx| async move {
            sink.closed().await;
            Ok::<_, ServiceError>(())
        },
    );
    let (server, client) = pair(Connection::builder().service(service));

    let mut stream: RemoteStream<u32> = client.bind(TICKER).call_stream(1, vec![]).await.unwrap();
    stream.open().await.unwrap();
    stream.request(1).await.unwrap();

    server.close();
    server.closed().await;

    assert!(matches!(
        stream.next_event().await,
        Some(StreamEvent::Failed(CallFailure::ConnectionLost))
    ));
    assert!(stream.next_event().await.is_none());
}

/// Read frames from a raw peer until end-of-stream.
async fn frames_until_eof(peer: &mut DuplexStream, buffer: &mut FrameBuffer) -> Vec<Inbound> {
    let mut frames = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = peer.read(&mut buf).await.unwrap();
        if n == 0 {
            return frames;
        }
        frames.extend(buffer.push(&buf[..n]).unwrap().iter().map(Inbound::decode));
    }
}

#[tokio::test]
async fn test_negative_credit_sends_exactly_one_close() {
    let (a, mut peer) = duplex(64 * 1024);
    let client = Connection::builder().start(a).unwrap();
    let binding = client.bind(TICKER);
    let mut buffer = FrameBuffer::new();

    let handshake = async {
        let mut buf = vec![0u8; 4096];
        let key = loop {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0);
            if let Some(frame) = buffer.push(&buf[..n]).unwrap().first() {
                match Inbound::decode(frame) {
                    Inbound::Server(ServerInbound::Call { key, .. }) => break key,
                    other => panic!("expected call, got {:?}", other),
                }
            }
        };
        let reply = FrameEncoder::new(Command::SuccessResponse, key)
            .payload(&StreamHandle::from(key))
            .unwrap()
            .finish()
            .unwrap();
        peer.write_all(&reply).await.unwrap();
    };
    let (stream, ()) = tokio::join!(binding.call_stream::<u32>(1, vec![]), handshake);
    let mut stream = stream.unwrap();

    stream.open().await.unwrap();
    stream.request(-1).await.unwrap();
    stream.close().await.unwrap();
    drop(stream);

    client.close();
    client.closed().await;

    let frames = frames_until_eof(&mut peer, &mut buffer).await;
    let closes = frames
        .iter()
        .filter(|f| matches!(f, Inbound::Server(ServerInbound::StreamClose { .. })))
        .count();
    let credits = frames
        .iter()
        .filter(|f| matches!(f, Inbound::Server(ServerInbound::StreamBackPressure { .. })))
        .count();
    assert_eq!(closes, 1);
    assert_eq!(credits, 0);
    assert!(matches!(
        frames.first(),
        Some(Inbound::Server(ServerInbound::StreamOpen { .. }))
    ));
}
