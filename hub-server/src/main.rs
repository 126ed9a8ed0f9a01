//! hub-server — WebSocket collaboration hub.
//!
//! Accepts editor connections on `ws://host:port/hub/<session-id>`,
//! authenticates them against the shared JWT secret, and hands frames to
//! the per-session actors in `collab-hub`. Document text is loaded from
//! and saved to the companion file server over HTTP.

mod gateway;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use collab_hub::config::HubConfig;
use collab_hub::hub::Hub;
use collab_hub::ot::LinearEngineFactory;
use gateway::{Gateway, JwtVerifier};

const LOAD_REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Parser, Debug)]
#[command(name = "hub-server", about = "Real-time collaboration hub")]
struct Args {
    /// Port to serve on
    #[arg(long, env = "HUB_SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Interface to serve on; use 0.0.0.0 to make it public
    #[arg(long, env = "HUB_SERVER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Base URL of the file server, trailing slash included
    #[arg(long, default_value = "http://localhost:8081/")]
    base_url: String,

    /// JWT secret shared with the file server
    #[arg(long, env = "HUB_JWT_SECRET", default_value = "pomato (potato and tomato mix lol)")]
    secret: String,

    /// Save after every Nth accepted operation
    #[arg(long, default_value_t = 5)]
    save_every: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = HubConfig {
        base_url: args.base_url,
        save_every: args.save_every,
        bind_addr: format!("{}:{}", args.host, args.port),
        ..HubConfig::default()
    };
    let store = Arc::new(config.file_store());
    let hub = Arc::new(Hub::new(config.clone(), store, Arc::new(LinearEngineFactory)));
    let gateway = Arc::new(Gateway::new(hub.clone(), Arc::new(JwtVerifier::new(&args.secret))));

    tokio::spawn(report_load(hub));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    gateway.run(listener).await
}

async fn report_load(hub: Arc<Hub>) {
    let mut tick = tokio::time::interval(LOAD_REPORT_INTERVAL);
    tick.tick().await;
    loop {
        tick.tick().await;
        info!("load: {} active sessions", hub.session_count());
    }
}
