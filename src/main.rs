//! Remote agent - sandboxed files, commands and terminals over HTTP.
//!
//! Usage:
//!   remote-agent serve --token <TOKEN> [--root DIR] [--port 8080]
//!   remote-agent exec [--root DIR] [--timeout-ms N] -- <command...>

use clap::{Parser, Subcommand};
use remote_agent::config::{default_shell, ServeArgs, DEFAULT_COMMAND_TIMEOUT_MS};
use remote_agent::exec::{CommandRunner, StreamKind};
use remote_agent::http_server;
use remote_agent::sandbox::PathSandbox;
use remote_agent::{AgentConfig, AppState};
use std::io::Write;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-agent", version)]
#[command(about = "Remote development agent with HTTP and terminal API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),

    /// Run one command in the working directory, streaming its output
    Exec {
        /// Working directory
        #[arg(long, env = "AGENT_ROOT", default_value = ".")]
        root: PathBuf,

        /// Timeout in milliseconds
        #[arg(long, default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
        timeout_ms: u64,

        /// Shell used to run the command
        #[arg(long, env = "AGENT_SHELL")]
        shell: Option<String>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = match args.command {
        Commands::Serve(_) => "info",
        Commands::Exec { .. } => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    std::panic::set_hook(Box::new(|panic| {
        error!(%panic, "panic");
    }));

    let code = match args.command {
        Commands::Serve(serve) => serve_agent(serve).await,
        Commands::Exec {
            root,
            timeout_ms,
            shell,
            command,
        } => {
            let shell = shell.unwrap_or_else(default_shell);
            run_once(root, timeout_ms, shell, command.join(" ")).await
        }
    };
    // Blocked pty reader threads would otherwise keep the runtime alive.
    exit(code);
}

async fn serve_agent(args: ServeArgs) -> i32 {
    let state = match AgentConfig::try_from(args).and_then(AppState::new) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    match http_server::run_server(state, shutdown_signal()).await {
        Ok(()) => {
            info!("agent stopped");
            0
        }
        Err(e) => {
            error!(error = %e, "server failed");
            1
        }
    }
}

async fn run_once(root: PathBuf, timeout_ms: u64, shell: String, command: String) -> i32 {
    let sandbox = match PathSandbox::new(&root) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let runner = CommandRunner::new(sandbox, shell, Duration::from_millis(timeout_ms));
    let result = runner
        .run_streaming(&command, None, None, |chunk| match chunk.stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(chunk.data.as_bytes());
                let _ = out.flush();
            }
            StreamKind::Stderr => eprint!("{}", chunk.data),
        })
        .await;

    match result {
        Ok(output) => {
            if let Some(e) = &output.error {
                eprintln!("Error: {}", e);
            }
            output
                .exit_code
                .or(output.signal.map(|signal| 128 + signal))
                .unwrap_or(1)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
