//! Runnable entry point: parses CLI configuration, connects to the backing Redis
//! instance, and serves WebSocket connections until the process is killed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;

use fabric_common::logging::{self, error, info};
use fabric_server::config::ServerArgs;
use fabric_server::{BucketManager, ChannelBroker};

#[tokio::main]
async fn main() {
    let log = logging::init("fabric-server");
    let config = Arc::new(ServerArgs::parse().into_config());

    let client = match redis::Client::open(config.storage.url.as_str()) {
        Ok(client) => client,
        Err(err) => {
            error!(log, "invalid storage url"; "error" => %err);
            std::process::exit(1);
        }
    };

    let conn = match ConnectionManager::new(client).await {
        Ok(conn) => conn,
        Err(err) => {
            error!(log, "failed to connect to backing store"; "error" => %err);
            std::process::exit(1);
        }
    };

    let bucket_manager = Arc::new(BucketManager::new(conn, log.clone()));
    if let Err(err) = bucket_manager.initialize().await {
        error!(log, "failed to hydrate tenant metadata"; "error" => %err);
        std::process::exit(1);
    }

    let broker = Arc::new(ChannelBroker::new(log.clone()));

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(log, "failed to bind listener"; "port" => config.port, "error" => %err);
            std::process::exit(1);
        }
    };

    info!(log, "listening"; "port" => config.port);

    let next_connection_id = Arc::new(AtomicU64::new(1));

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(log, "failed to accept connection"; "error" => %err);
                continue;
            }
        };

        let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
        let config = config.clone();
        let bucket_manager = bucket_manager.clone();
        let broker = broker.clone();
        let log = log.clone();

        tokio::spawn(async move {
            fabric_server::connection::accept_and_run(stream, peer_addr, config, bucket_manager, broker, connection_id, log).await;
        });
    }
}
