use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use room_relay::{Config, Server};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let listener = match TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.bind);
            return Err(e);
        }
    };
    info!(
        "Relay listening on {} with rooms {}",
        listener.local_addr()?,
        config.rooms.join(", ")
    );

    let server = Server::new(config);
    tokio::select! {
        () = server.serve(listener) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }
    Ok(())
}
