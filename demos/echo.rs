//! Echo over a multiplexed TCP connection.
//!
//! This example demonstrates:
//! - Running a server session on an accepted TCP connection
//! - Echoing every inbound stream back to its opener
//! - Opening several concurrent streams from a client session
//! - Measuring RTT with `ping()` and closing gracefully
//!
//! # Running
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo
//! ```

use std::time::Duration;

use muxwire::{Config, Session, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn echo(stream: Stream) -> std::io::Result<()> {
    let id = stream.id();
    let (mut rd, mut wr) = tokio::io::split(stream);
    let n = tokio::io::copy(&mut rd, &mut wr).await?;
    wr.shutdown().await?;
    tracing::info!("Echoed {} bytes on stream {}", n, id);
    Ok(())
}

async fn serve(listener: TcpListener) -> muxwire::Result<()> {
    let (tcp, peer) = listener.accept().await?;
    tracing::info!("Accepted connection from {}", peer);

    let session = Session::server(tcp, Config::default());
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                tokio::spawn(async move {
                    if let Err(e) = echo(stream).await {
                        tracing::warn!("Echo failed: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::info!("Server session ended: {}", e);
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(serve(listener));

    let tcp = TcpStream::connect(addr).await?;
    let config = Config::default().with_keepalive(Duration::from_secs(15));
    let session = Session::client(tcp, config);

    let mut tasks = Vec::new();
    for message in ["alpha", "bravo", "charlie"] {
        let mut stream = session.open_stream()?;
        tasks.push(tokio::spawn(async move {
            stream.write_all(message.as_bytes()).await?;
            stream.shutdown().await?;

            let mut reply = String::new();
            stream.read_to_string(&mut reply).await?;
            Ok::<_, std::io::Error>((stream.id(), reply))
        }));
    }

    for task in tasks {
        let (id, reply) = task.await??;
        println!("stream {}: {}", id, reply);
    }

    let rtt = session.ping().await?;
    println!("rtt: {:?}", rtt);

    session.close()?;
    session.wait_for_shutdown().await?;
    server.await??;
    Ok(())
}
