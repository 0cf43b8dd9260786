//! Binds, listens, and accepts connections one at a time, printing every
//! received message until the peer disconnects, then loops back to
//! accept the next connection.

use clap::Parser;
use rdma_proxy::{Config, Server};

#[derive(Parser)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 7471)]
    port: u16,

    /// Optional TOML config path; defaults are used for anything it omits.
    #[arg(long)]
    config: Option<String>,

    /// Log file path.
    #[arg(long, default_value = "rdma-echo-server.log")]
    log: String,
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::default(),
    };
    let log = flux::logging::root_logger(&args.log, true).expect("failed to open log file");

    let mut server = Server::new(log.clone()).expect("failed to create server");
    server
        .bind_and_listen(args.port, &config)
        .expect("failed to bind/listen");

    loop {
        slog::info!(log, "waiting for a connection"; "port" => args.port);
        let proxy = match server.accept(&config) {
            Ok(proxy) => proxy,
            Err(e) => {
                slog::error!(log, "accept failed"; "error" => %e);
                continue;
            }
        };

        while let Some(message) = proxy.recv_message() {
            println!("{}", String::from_utf8_lossy(&message));
        }
        slog::info!(log, "peer disconnected");
    }
}
