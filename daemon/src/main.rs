/// Inspector bridge - Main entry point
/// Serves modern-protocol clients over websocket and bridges them to legacy debuggees
use clap::Parser;
use inspector_bridge_daemon::{BridgeServer, DaemonConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "inspector-bridge",
    about = "Bridge modern inspector clients to legacy V8 debug ports",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Websocket bind address
    #[arg(long, value_name = "HOST", help = "Websocket bind address (default: 127.0.0.1)")]
    host: Option<String>,

    /// Websocket port
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "Websocket server port (default: 8080)"
    )]
    port: Option<u16>,

    /// Default debuggee host
    #[arg(long, value_name = "HOST", help = "Debuggee host when the client names none")]
    debug_host: Option<String>,

    /// Default debuggee port
    #[arg(
        short = 'd',
        long,
        value_name = "PORT",
        help = "Debuggee port when the client names none (default: 5858)"
    )]
    debug_port: Option<u16>,

    /// Persist live edits
    #[arg(long, help = "Write live-edited scripts back to disk")]
    save_live_edit: bool,

    /// Backtrace depth
    #[arg(long, value_name = "FRAMES", help = "Frames fetched when the debuggee pauses")]
    stack_trace_limit: Option<u32>,

    /// Resume once attached
    #[arg(long, help = "Resume a paused debuggee once the bridge is attached")]
    resume_on_attach: bool,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(&path.to_string_lossy())?,
        None => DaemonConfig::default(),
    };

    // Setup logging
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| config.logging.level.clone())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("Starting inspector bridge v{}", inspector_bridge_daemon::VERSION);
    match &args.config {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.debug_host {
        config.debuggee.host = host;
    }
    if let Some(port) = args.debug_port {
        config.debuggee.port = port;
    }
    if let Some(limit) = args.stack_trace_limit {
        config.bridge.stack_trace_limit = limit;
    }
    if args.save_live_edit {
        config.bridge.save_live_edit = true;
    }
    if args.resume_on_attach {
        config.bridge.resume_on_attach = true;
    }

    // Validate configuration
    config.validate()?;

    info!(
        "Server configuration: websocket {}, default debuggee {}",
        config.server.bind_addr(),
        config.debuggee.address()
    );
    if config.bridge.save_live_edit {
        info!("Live edits: written back to disk");
    }

    let server = std::sync::Arc::new(BridgeServer::new(config)?);

    // Setup signal handling for graceful shutdown
    let shutdown = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for CTRL+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL+C signal");
            },
            () = terminate => {
                info!("Received SIGTERM signal");
            },
        }
    };

    // Run server in background
    let server_handle = tokio::spawn({
        let server = std::sync::Arc::clone(&server);
        async move { server.run().await }
    });

    // Wait for signal
    tokio::select! {
        () = shutdown => {
            info!("Shutting down bridge...");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("Server error: {}", e),
                _ => info!("Server terminated unexpectedly"),
            }
        }
    }

    server.shutdown().await;
    info!("Inspector bridge stopped");
    Ok(())
}
