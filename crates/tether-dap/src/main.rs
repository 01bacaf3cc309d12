use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tether_config::TetherConfig;
use tether_dap::{AdapterContext, DapServer};

/// Tether Debug Adapter Protocol server.
///
/// Serves a single session over stdio unless `--listen` is given.
#[derive(Debug, Parser)]
#[command(name = "tether-dap", version, about)]
struct Cli {
    /// Accept DAP connections on this TCP address instead of using stdio.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Directory holding `*.map.json` position maps.
    #[arg(long, value_name = "DIR")]
    maps: Option<PathBuf>,

    /// Native debugger executable.
    #[arg(long, value_name = "PATH")]
    debugger: Option<PathBuf>,

    /// Path to a TOML config file.
    ///
    /// If unset, `TETHER_CONFIG` is used as a fallback. When neither are provided
    /// the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config);
    if let Some(maps) = cli.maps {
        config.maps.dir = Some(maps);
    }
    if let Some(debugger) = cli.debugger {
        config.debugger.path = debugger;
    }
    if cli.listen.is_some() {
        config.server.listen = cli.listen;
    }

    tether_config::init_tracing(&config.logging);

    let ctx = AdapterContext::from_config(&config).context("failed to load position maps")?;

    match config.server.listen {
        Some(addr) => {
            let server = Arc::new(
                DapServer::bind(addr.as_str(), ctx)
                    .await
                    .with_context(|| format!("failed to listen on {addr}"))?,
            );
            eprintln!("listening on {}", server.local_addr());
            let serve = tokio::spawn({
                let server = server.clone();
                async move { server.serve().await }
            });
            tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
            server.shutdown().await;
            serve.await.context("DAP accept loop panicked")??;
            Ok(())
        }
        None => tether_dap::wire_server::run_stdio(ctx).await,
    }
}

fn load_config(cli_path: Option<PathBuf>) -> TetherConfig {
    let path = cli_path.or_else(|| std::env::var_os("TETHER_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return TetherConfig::default();
    };

    match TetherConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "tether-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            TetherConfig::default()
        }
    }
}
