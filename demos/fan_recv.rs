use clap::Parser;
use manifold::{Endpoint, receiver, records};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let Args { addr } = Args::parse();

    // Connect to the broadcast engine
    let mut rx = receiver(Endpoint::Tcp(addr)).connect().await.unwrap();

    // Each received message is one flushed buffer; split it into records
    let mut buf = vec![0u8; 100_000];
    loop {
        match rx.recv(&mut buf).await {
            Ok(len) => {
                for record in records(&buf[..len]) {
                    println!("{}", String::from_utf8_lossy(record.unwrap()));
                }
            }
            Err(err) => {
                eprintln!("receive error: {err}");
                break;
            }
        }
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:7600")]
    addr: String,
}
