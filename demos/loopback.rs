//! Loopback - both roles of callwire over one in-memory pipe.
//!
//! This example demonstrates:
//! - Exporting a service with a unary and a streaming method
//! - Calling it with a ready argument and a deferred one
//! - Opening a stream and pacing it with credit
//!
//! ```sh
//! cargo run --example loopback
//! ```

use std::time::Duration;

use callwire::{
    Argument, AsyncArgument, Connection, RemoteStream, ServiceDefinition, ServiceError,
    StreamEvent, StreamSink,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const GENERATOR: Uuid = Uuid::from_u128(0x6E4E_2A70_12);

/// Chunk structure sent in the stream.
#[derive(Serialize, Deserialize, Debug)]
struct Chunk {
    index: u32,
    data: String,
}

fn generator() -> ServiceDefinition {
    ServiceDefinition::new(GENERATOR)
        // Method 1: join a prefix with a name
        .method(1, |(prefix, name): (String, String), _ctx| async move {
            Ok::<_, ServiceError>(format!("{prefix}, {name}"))
        })
        // Method 2: stream `count` chunks
        .stream_method(2, |(count,): (u32,), sink: StreamSink, _ctx| async move {
            for index in 0..count {
                sink.send(&Chunk {
                    index,
                    data: format!("Chunk {}", index),
                })
                .await
                .map_err(|e| ServiceError::new("send", e.to_string()))?;
            }
            Ok::<_, ServiceError>(())
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = Connection::builder().service(generator()).start(a)?;
    let client = Connection::builder()
        .default_call_timeout(Duration::from_secs(5))
        .start(b)?;
    let binding = client.bind(GENERATOR);

    // The name is not known yet; it follows the call in its own frame
    let (name, completer) = AsyncArgument::pending();
    let greeting = binding
        .call::<String>(1, vec![Argument::value(&"Hello")?, name.into()])
        .await?;
    completer.complete(&"loopback");
    println!("{}", greeting.result().await?);

    let mut stream: RemoteStream<Chunk> = binding
        .call_stream(2, vec![Argument::value(&6u32)?])
        .await?;
    stream.open().await?;
    stream.request(3).await?;

    let mut received = 0;
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Data(chunk) => {
                println!("{:?}", chunk);
                received += 1;
                if received % 3 == 0 {
                    stream.request(3).await?;
                }
            }
            StreamEvent::Closed => println!("stream closed after {} chunks", received),
            StreamEvent::Failed(failure) => println!("stream failed: {}", failure),
        }
    }

    client.close();
    server.closed().await;
    Ok(())
}
