//! Tessera client: joins one board on a collaboration server and logs what
//! happens on it until interrupted.
//!
//! ```text
//! tessera-client --url ws://localhost:8080 --board b1 --token $TOKEN --demo
//! ```
//!
//! Logging goes through `env_logger`; the default filter is `info` and
//! `RUST_LOG` overrides it.

use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use tessera_collab::{PresenceRecord, PresenceUpdate, SyncClient, SyncConfig, SyncError};
use tessera_core::{Shape, ShapeKind, TileLayer};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tessera-client", about = "Join a Tessera board and follow its changes")]
struct Cli {
    /// WebSocket endpoint of the collaboration server.
    #[arg(long, env = "TESSERA_SERVER_URL", default_value = "ws://localhost:8080")]
    url: String,

    #[arg(long, env = "TESSERA_ROOM", default_value = "default")]
    room: String,

    #[arg(long, env = "TESSERA_BOARD")]
    board: String,

    #[arg(long, env = "TESSERA_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "TESSERA_USER_ID")]
    user_id: Option<Uuid>,

    #[arg(long, default_value = "anonymous")]
    name: String,

    #[arg(long, default_value_t = 60)]
    heartbeat_secs: u64,

    /// Paint a small grass patch and drop a shape once the board is open.
    #[arg(long)]
    demo: bool,
}

fn paint_demo(client: &SyncClient) -> Result<(), SyncError> {
    for y in 0..3 {
        for x in 0..3 {
            client.paint_tile(x, y, "grass", TileLayer::Terrain)?;
        }
    }
    client.add_shape(Shape::new("demo-marker", ShapeKind::Ellipse, 48.0, 48.0, 16.0, 16.0))?;
    client.update_user_presence(PresenceUpdate {
        tool: Some("brush".to_string()),
        ..PresenceUpdate::cursor(48.0, 48.0)
    });
    info!("demo content written to board");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = SyncConfig::new(&cli.url)
        .with_room(&cli.room)
        .with_heartbeat_interval(Duration::from_secs(cli.heartbeat_secs.max(1)));
    let user = PresenceRecord::new(cli.user_id.unwrap_or_else(Uuid::new_v4), &cli.name);
    info!("joining {} as {} ({})", cli.url, user.name, user.id);
    let client = SyncClient::new(config, user);

    client.on_connection_state_change(|state| match &state.error {
        Some(error) => info!("connection {} ({})", state.status, error),
        None => info!("connection {}", state.status),
    });
    client.on_error(|notice| {
        warn!(
            "{} [{}]",
            notice.message,
            notice.code.as_deref().unwrap_or("UNKNOWN")
        )
    });
    client.on_canvas_change(|event| {
        info!(
            "[{}] {} changed, {} entries",
            event.board_id,
            event.contents.collection().name(),
            event.contents.len()
        )
    });

    let outcome = client.switch_to_board(&cli.board)?;
    if outcome.created {
        info!("opened board {}", outcome.board_id);
    }
    client.connect(cli.token.as_deref());

    if cli.demo {
        paint_demo(&client)?;
    }

    tokio::signal::ctrl_c().await?;

    let metrics = client.connection_metrics();
    info!(
        "shutting down: {} frames sent, {} received, {} updates still queued, {} peers",
        metrics.frames_sent, metrics.frames_received, metrics.queued_updates, metrics.peers
    );
    client.disconnect();
    client.shutdown().await;
    Ok(())
}
