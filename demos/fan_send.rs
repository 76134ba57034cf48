use std::time::Duration;

use clap::Parser;
use manifold::{Endpoint, broadcaster};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let Args { addr, interval } = Args::parse();

    // Bind the broadcast engine and spawn its accept loop
    let (mut tx, _task) = broadcaster(Endpoint::Tcp(addr)).build().await.unwrap();

    // Emit one record per tick; flush so sparse traffic goes out right away
    let mut interval = tokio::time::interval(Duration::from_secs_f32(interval));
    for counter in 0..=u32::MAX {
        interval.tick().await;

        let record = format!("[{counter:4?}] Hello, World!");
        tx.send(record.as_bytes()).await.unwrap();
        tx.flush().await.unwrap();

        println!(
            "sent #{counter} to {} consumer(s), {} buffers flushed",
            tx.client_count(),
            tx.finished_buffers()
        );
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:7600")]
    addr: String,
    #[arg(short, long, default_value = "1.0")]
    interval: f32,
}
