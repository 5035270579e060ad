use anyhow::{Context, Result};
use mill_socket::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Prints every network event at Info or above.
struct StdoutLogger;

impl Logger for StdoutLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if level >= LogLevel::Info {
            println!("[{:?}] {}", level, message);
        }
    }
}

fn main() -> Result<()> {
    let logger: Arc<dyn Logger> = Arc::new(StdoutLogger);

    let pool = Arc::new(
        SocketPool::new(
            PoolConfig::builder()
                .workers(4)
                .selection(WorkerSelection::LeastLoaded)
                .logger(Arc::clone(&logger))
                .build(),
        )
        .context("failed to start socket pool")?,
    );

    let callbacks = ServerCallbacks::new()
        .on_connection(|client, state, error| match error {
            Some(e) => println!("[INFO] {} {} from {:?}: {}", client.id(), state, client.remote_address(), e),
            None => println!("[INFO] {} {} from {:?}", client.id(), state, client.remote_address()),
        })
        .on_data(|client, data| {
            let message = String::from_utf8_lossy(&data);
            println!(
                "[INFO] Received {} bytes from {}: {}",
                data.len(),
                client.id(),
                message.trim_end()
            );
            // echo the received data back to the sender.
            if let IoStatus::Failed(e) = client.send(&data) {
                println!("[WARN] echo to {} failed: {}", client.id(), e);
            }
        });

    let config = ServerConfig::builder()
        .address("127.0.0.1:8080".parse()?)
        .max_connections(1000)
        .idle_timeout(Duration::from_secs(60))
        .logger(logger)
        .build();

    let server = ServerSocket::bind(config, callbacks).context("failed to bind")?;
    server.start(&pool)?;

    println!("Echo server listening on 127.0.0.1:8080");
    println!("Try: nc 127.0.0.1 8080");

    loop {
        std::thread::sleep(Duration::from_secs(10));
        let stats = server.stats();
        println!(
            "[INFO] active={} accepted={} rejected={} disconnected={}",
            stats.active, stats.accepted, stats.rejected, stats.disconnected
        );
    }
}
