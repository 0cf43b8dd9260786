//! Dials a server, spawns a handful of sender threads each pushing a
//! few messages, then disconnects.

use clap::Parser;
use rdma_proxy::{Client, Config};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
struct Args {
    /// Server address to dial.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long, default_value_t = 7471)]
    port: u16,

    /// Optional TOML config path; defaults are used for anything it omits.
    #[arg(long)]
    config: Option<String>,

    /// Log file path.
    #[arg(long, default_value = "rdma-echo-client.log")]
    log: String,
}

const SENDER_THREADS: usize = 3;
const MESSAGES_PER_THREAD: usize = 10;

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::default(),
    };
    let log = flux::logging::root_logger(&args.log, true).expect("failed to open log file");

    let client = Client::new(log.clone());
    let proxy = client
        .connect(&args.host, args.port, &config)
        .expect("failed to connect");

    let mut handles = Vec::new();
    for i in 0..SENDER_THREADS {
        let proxy = Arc::clone(&proxy);
        let log = log.clone();
        handles.push(std::thread::spawn(move || {
            for j in 0..MESSAGES_PER_THREAD {
                let message = format!("thread {} : {}", i, j);
                if let Err(e) = proxy.send_message(message.as_bytes()) {
                    slog::error!(log, "send failed"; "error" => %e);
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }

    std::thread::sleep(Duration::from_millis(100));
    proxy.disconnect().expect("failed to disconnect");
}
