//! Marketplace service entrypoint.
//!
//! One binary, two roles:
//! - `infermesh router --config router.json` serves the routing broker.
//! - `infermesh node --config node.json` serves a worker node.
//!
//! Both load `.env` first, read a JSON config file (`--config` or the
//! `CONFIG` env var), and shut down gracefully on SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use infermesh::config::{NodeConfig, RouterConfig, load_config};
use infermesh::envelope::REPLAY_WINDOW_MS;
use infermesh::node::{NodeState, spawn_heartbeat_loop, spawn_nonce_cleanup};
use infermesh::retention::spawn_retention_loop;
use infermesh::router::{RouterState, spawn_announce_loop};
use infermesh::sig_down::SigDown;
use infermesh::telemetry::init_tracing;
use infermesh::{node, router};

#[derive(Parser, Debug)]
#[command(name = "infermesh")]
#[command(about = "Federated inference marketplace router and node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the routing broker.
    Router(ServeArgs),
    /// Serve a worker node.
    Node(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Router(args) => run_router(args).await,
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_router(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config: RouterConfig = load_config(&args.config)?;
    let addr = SocketAddr::new(config.host, config.port);
    let state = RouterState::new(config).await?;
    tracing::info!(router_id = %state.router_id(), "router identity loaded");

    let sig_down = SigDown::try_new()?;
    spawn_retention_loop(Arc::clone(&state), sig_down.cancellation_token());
    spawn_announce_loop(Arc::clone(&state), sig_down.cancellation_token());

    let app = router::handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        );

    serve(app, addr, sig_down).await
}

async fn run_node(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config: NodeConfig = load_config(&args.config)?;
    let addr = SocketAddr::new(config.host, config.port);
    let state = NodeState::new(config).await?;
    tracing::info!(node_id = %state.node_id, key_id = %state.keys.npub(), "node identity loaded");

    let sig_down = SigDown::try_new()?;
    spawn_heartbeat_loop(Arc::clone(&state), sig_down.cancellation_token());
    spawn_nonce_cleanup(
        Arc::clone(&state.nonces),
        REPLAY_WINDOW_MS,
        sig_down.cancellation_token(),
    );

    let app = node::handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        );

    serve(app, addr, sig_down).await
}

async fn serve(
    app: axum::Router,
    addr: SocketAddr,
    sig_down: SigDown,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let token = sig_down.cancellation_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
