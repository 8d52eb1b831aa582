//! Remote rendering bridge server — entry point.
//!
//! ```text
//! prism-server                      Listen on the default port (31050)
//! prism-server -p 4000 -l null     Override port and backend library
//! prism-server -v                  Verbose device status output
//! prism-server --gen-config        Write the default config TOML to stdout
//! ```

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use prism_core::{BackendRegistry, Server};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "prism-server", about = "Remote rendering bridge server")]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend library to instantiate devices from.
    #[arg(short, long)]
    library: Option<String>,

    /// Forward low-severity device status (info/debug/perf) to the log.
    #[arg(short, long)]
    verbose: bool,

    /// Path to configuration TOML file.
    #[arg(long, default_value = "prism-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        match toml::to_string_pretty(&ServerConfig::default()) {
            Ok(text) => {
                println!("{text}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("failed to serialize defaults: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let config = ServerConfig::load(&cli.config).with_overrides(cli.port, cli.library);

    // Init tracing: RUST_LOG wins, then config; -v forces debug.
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("prism-server v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {}", config.network.port);
    info!("library: {}", config.device.library);

    let registry = BackendRegistry::with_defaults();
    let Some(backend) = registry.get(&config.device.library) else {
        error!("unknown backend library '{}'", config.device.library);
        return ExitCode::FAILURE;
    };

    let server = match Server::bind(config.network.port, backend, cli.verbose).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind port {}: {e}", config.network.port);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server exited with error: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received — shutting down");
        }
    }

    ExitCode::SUCCESS
}
