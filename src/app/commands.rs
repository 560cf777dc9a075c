/// One line of user input, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `c <host:port:secret>` / `connect <host:port:secret>`
    Connect(String),
    Sessions,
    Help,
    Clear,
    Exit,
    /// Anything that is not a command is chat text for every peer
    Chat(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "c" | "connect" => Command::Connect(rest.to_string()),
            "sessions" if rest.is_empty() => Command::Sessions,
            "h" | "help" if rest.is_empty() => Command::Help,
            "clear" | "cls" if rest.is_empty() => Command::Clear,
            "exit" | "quit" if rest.is_empty() => Command::Exit,
            _ => Command::Chat(line.to_string()),
        }
    }
}

pub const HELP_TEXT: &[&str] = &[
    "Commands:",
    "  c, connect <host:port:secret>  connect to a peer",
    "  sessions                       list peers and their sessions",
    "  h, help                        show this help",
    "  clear, cls                     clear the screen",
    "  exit, quit                     disconnect everyone and leave",
    "Anything else is sent to every connected peer.",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("c 127.0.0.1:5000:abc"),
            Command::Connect("127.0.0.1:5000:abc".into())
        );
        assert_eq!(
            Command::parse("  connect   host:1:s  "),
            Command::Connect("host:1:s".into())
        );
        assert_eq!(Command::parse("sessions"), Command::Sessions);
        assert_eq!(Command::parse("HELP"), Command::Help);
        assert_eq!(Command::parse("h"), Command::Help);
        assert_eq!(Command::parse("cls"), Command::Clear);
        assert_eq!(Command::parse("quit"), Command::Exit);
        assert_eq!(Command::parse("exit"), Command::Exit);
        assert_eq!(Command::parse("   "), Command::Empty);
    }

    #[test]
    fn test_everything_else_is_chat() {
        assert_eq!(Command::parse("hello there"), Command::Chat("hello there".into()));
        assert_eq!(Command::parse("help me please"), Command::Chat("help me please".into()));
        assert_eq!(Command::parse("exit now"), Command::Chat("exit now".into()));
    }

    #[test]
    fn test_connect_without_target_is_still_connect() {
        assert_eq!(Command::parse("c"), Command::Connect(String::new()));
    }
}
