//! `antigravity-gateway` binary entrypoint.
//!
//! `antigravity-gateway [serve]` starts the server using configuration
//! from environment variables. Unknown subcommands exit with status 1.

use antigravity_gateway::{serve, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::default();

    // Respect `RUST_LOG` if set; otherwise default to info, or debug when
    // the DEBUG flag is on.
    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => serve(config).await,
        Some(other) => {
            eprintln!("unknown subcommand: {}", other);
            eprintln!("usage: antigravity-gateway [serve]");
            std::process::exit(1);
        }
    }
}
