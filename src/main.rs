use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use p2p_secure_chat::app::{App, Output};
use p2p_secure_chat::{ConnectionManager, NodeConfig, SessionConfig, SessionManager};

/// Encrypted peer-to-peer terminal chat
#[derive(Parser)]
#[command(name = "p2p-secure-chat")]
#[command(version)]
#[command(about = "Encrypted peer-to-peer chat with live session rotation")]
struct Cli {
    /// Peer id shown to others (default: random Peer_XXXX)
    #[arg(short, long)]
    id: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Address to bind and advertise
    #[arg(long)]
    host: Option<String>,
}

fn render(outputs: impl IntoIterator<Item = Output>) {
    let mut stdout = std::io::stdout().lock();
    for output in outputs {
        let _ = match output {
            Output::Line(line) => writeln!(stdout, "{}", line),
            Output::ClearScreen => write!(stdout, "\x1B[2J\x1B[1;1H"),
        };
    }
    let _ = stdout.flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let session_config = SessionConfig::load().context("invalid session configuration")?;
    let node = NodeConfig::new(cli.id, cli.host, cli.port);
    let sessions = Arc::new(SessionManager::new(session_config));

    let (event_sender, mut events) = mpsc::unbounded_channel();
    // RSA key generation is CPU bound
    let network = tokio::task::spawn_blocking(move || ConnectionManager::new(node, sessions, event_sender))
        .await
        .context("key generation task failed")?
        .context("failed to start network")?;
    network.listen().await.context("failed to start listener")?;

    let mut app = App::new(network);
    render(app.banner());

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = input.next_line() => {
                match line.context("failed to read input")? {
                    Some(line) => render(app.handle_input(&line).await),
                    None => {
                        // stdin closed
                        render(app.handle_input("exit").await);
                    }
                }
                if app.should_quit() {
                    break;
                }
            }
            Some(event) = events.recv() => {
                render(app.handle_network_event(event));
            }
        }
    }

    Ok(())
}
