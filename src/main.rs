mod broker;
mod config;
mod connection;
mod messages;
mod pool;
mod redis_broker;
mod registry;
mod room;
mod routes;
mod server;
mod store;
mod validate;

use std::sync::Arc;

use log::{error, info};

use broker::{MemoryBroker, MemoryTransport, MessageBroker};
use config::Config;
use redis_broker::RedisBroker;
use server::Server;
use store::{MemoryStore, RoomStore};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn RoomStore> = Arc::new(MemoryStore::new());
    let broker: Arc<dyn MessageBroker> = match &config.redis {
        Some(redis) => match RedisBroker::connect(redis.connection_info()).await {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                error!("Failed to connect to redis at {}:{}: {e}", redis.host, redis.port);
                std::process::exit(1);
            }
        },
        None => {
            info!("REDIS_ADDR not set, relaying within this process only");
            let transport = MemoryTransport::new(config.broker_capacity);
            Arc::new(MemoryBroker::connect(transport))
        }
    };
    let server = Server::new(
        store,
        broker,
        config.max_workers,
        config.connection_settings(),
    );

    if let Err(e) = server.start().await {
        error!("Failed to subscribe to room traffic: {e}");
        std::process::exit(1);
    }

    let routes = routes::routes(server.clone(), config.room_ttl);
    let addr = ([0, 0, 0, 0], config.http_port);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Signal received, stopping server...");
    };

    match config.tls.as_ref().filter(|tls| tls.preflight()) {
        Some(tls) => {
            info!("Starting secure server (HTTPS/WSS) on port {}...", config.http_port);
            let (_, serving) = warp::serve(routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .bind_with_graceful_shutdown(addr, shutdown);
            serving.await;
        }
        None => {
            if config.tls.is_some() {
                error!("Failed to load TLS config, falling back to HTTP/WS");
            }
            info!("Server starting on port {}...", config.http_port);
            let (_, serving) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown);
            serving.await;
        }
    }

    server.shutdown(config.shutdown_timeout).await;
    info!("Server stopped");
}
