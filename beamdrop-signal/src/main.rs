use beamdrop_signal::{AppState, serve};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beamdrop-signal", about = "Room-code and websocket relay signaling server")]
struct SignalArgs {
    /// Socket address to listen on for HTTP and websocket signaling.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(SignalArgs::parse()).await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: SignalArgs) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(&args.bind_address)
        .await
        .map_err(|err| format!("failed to bind {}: {err}", args.bind_address))?;
    info!("signaling server starting on {}", args.bind_address);
    serve(listener, AppState::new())
        .await
        .map_err(|err| format!("signaling server exited: {err}"))
}
