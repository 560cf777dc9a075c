pub mod commands;

pub use commands::{Command, HELP_TEXT};

use crate::network::{ConnectionManager, ConnectionString, NetworkEvent, SessionSummary};

/// Something for the terminal to show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Line(String),
    ClearScreen,
}

impl Output {
    fn line(text: impl Into<String>) -> Self {
        Output::Line(text.into())
    }
}

/// Main application logic coordinator
pub struct App {
    network: ConnectionManager,
    should_quit: bool,
}

impl App {
    pub fn new(network: ConnectionManager) -> Self {
        Self {
            network,
            should_quit: false,
        }
    }

    pub fn network(&self) -> &ConnectionManager {
        &self.network
    }

    /// Check if the application should quit
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// Lines shown once the listener is up
    pub fn banner(&self) -> Vec<Output> {
        let mut lines = vec![Output::line(format!("Peer id: {}", self.network.peer_id()))];
        if let Some(conn) = self.network.connection_string() {
            lines.push(Output::line(format!("Connection string: {}", conn)));
        }
        lines.push(Output::line("Type 'help' for commands."));
        lines
    }

    /// Handle one line typed by the user
    pub async fn handle_input(&mut self, line: &str) -> Vec<Output> {
        match Command::parse(line) {
            Command::Empty => Vec::new(),
            Command::Help => HELP_TEXT.iter().map(|line| Output::line(*line)).collect(),
            Command::Clear => vec![Output::ClearScreen],
            Command::Sessions => self.list_sessions().await,
            Command::Connect(target) => self.connect(&target).await,
            Command::Exit => {
                self.network.shutdown().await;
                self.should_quit = true;
                vec![Output::line("Disconnected from all peers. Bye.")]
            }
            Command::Chat(text) => self.send_chat(&text).await,
        }
    }

    async fn connect(&self, target: &str) -> Vec<Output> {
        let target = match ConnectionString::parse(target) {
            Ok(target) => target,
            Err(e) => return vec![Output::line(format!("{}. Usage: c <host:port:secret>", e))],
        };
        // success and failure are both reported through network events
        let _ = self.network.connect(&target).await;
        Vec::new()
    }

    async fn send_chat(&self, text: &str) -> Vec<Output> {
        if self.network.peer_count().await == 0 {
            return vec![Output::line("No peers connected. Use 'c <host:port:secret>' first.")];
        }

        let report = self.network.broadcast(text.as_bytes(), None).await;
        let mut lines = vec![Output::line(format!("[you] {}", text))];
        if !report.removed.is_empty() {
            lines.push(Output::line(format!(
                "Message not delivered to {} peer(s); they were disconnected.",
                report.removed.len()
            )));
        }
        lines
    }

    async fn list_sessions(&self) -> Vec<Output> {
        let rows = self.network.sessions_overview().await;
        if rows.is_empty() {
            return vec![Output::line("No active sessions.")];
        }
        rows.iter().map(|row| Output::line(format_session(row))).collect()
    }

    /// Turn a network event into a status line, if it deserves one
    pub fn handle_network_event(&self, event: NetworkEvent) -> Option<Output> {
        let text = match event {
            NetworkEvent::ListenerStarted(addr) => format!("Listening on {}", addr),
            NetworkEvent::ListenerFailed(error) => format!("Listener failed: {}", error),
            NetworkEvent::PeerConnected { peer_id, addr, .. } => {
                format!("Connected to {} ({})", peer_id, addr)
            }
            NetworkEvent::MessageReceived { peer_id, content, .. } => {
                format!("[{}] {}", peer_id, content)
            }
            NetworkEvent::SessionRotated { .. } => return None,
            NetworkEvent::PeerDisconnected { peer_id, reason, .. } => {
                format!("{} disconnected ({})", peer_id, reason)
            }
            NetworkEvent::ConnectionFailed { target, error } => {
                format!("Connection to {} failed: {}", target, error)
            }
        };
        Some(Output::Line(text))
    }
}

fn format_session(row: &SessionSummary) -> String {
    let prefix: String = row.session_id.chars().take(8).collect();
    let created = row
        .created_at
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let state = if row.valid { "valid" } else { "invalid" };

    format!(
        "{} ({}) session {}... created {} ops {} [{}]",
        row.peer_id, row.addr, prefix, created, row.operation_count, state
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionId;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_session_row_format() {
        let row = SessionSummary {
            conn: ConnectionId::new(),
            peer_id: "alice".into(),
            addr: "10.0.0.2:5000".parse().unwrap(),
            session_id: "abcdefghijklmnop".into(),
            created_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 13, 4, 5).unwrap()),
            operation_count: 7,
            valid: true,
        };
        assert_eq!(
            format_session(&row),
            "alice (10.0.0.2:5000) session abcdefgh... created 13:04:05 ops 7 [valid]"
        );
    }
}
