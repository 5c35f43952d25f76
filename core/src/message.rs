//! IRC line parsing
//!
//! Splits one framed line into prefix (user/host), command-or-numeric,
//! positional parameters and trailing text. Only the command subset the
//! engine consumes is recognized; anything else is surfaced as
//! [`LineKind::Unknown`] and skipped by the dispatcher.

/// Privilege glyphs a server may prefix to a nickname in NAMES listings.
pub const PRIVILEGE_GLYPHS: &str = "+%@&!*~.";

/// Recognized server commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nick,
    Quit,
    Join,
    Part,
    Topic,
    Invite,
    Kick,
    Mode,
    Privmsg,
    Notice,
    Ping,
}

impl Command {
    /// Look up a command token. Matching is case-sensitive; servers
    /// send these uppercase.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "NICK" => Some(Command::Nick),
            "QUIT" => Some(Command::Quit),
            "JOIN" => Some(Command::Join),
            "PART" => Some(Command::Part),
            "TOPIC" => Some(Command::Topic),
            "INVITE" => Some(Command::Invite),
            "KICK" => Some(Command::Kick),
            "MODE" => Some(Command::Mode),
            "PRIVMSG" => Some(Command::Privmsg),
            "NOTICE" => Some(Command::Notice),
            "PING" => Some(Command::Ping),
            _ => None,
        }
    }
}

/// What the command token turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// The token parsed entirely as an integer.
    Numeric(u16),
    /// A recognized command.
    Command(Command),
    /// Anything else; ignored by the dispatcher.
    Unknown,
}

/// One parsed IRC line.
#[derive(Debug, Clone)]
pub struct ParsedLine {
    /// Nickname part of a `user!host` prefix; empty if the line had no prefix.
    pub user: String,
    /// Host part of the prefix; "No hostname" when the prefix had no `!`.
    pub host: String,
    /// Command classification.
    pub kind: LineKind,
    /// Positional parameters, in order.
    pub params: Vec<String>,
    /// Trailing text (after `" :"`), trimmed; empty if absent.
    pub trailing: String,
}

impl ParsedLine {
    /// Parse one framed line. Parsing never fails; malformed lines
    /// simply produce fields the dispatcher will reject.
    pub fn parse(line: &str) -> Self {
        let (leading, trailing) = match line.find(" :") {
            Some(pos) => (&line[..pos], line[pos + 2..].trim().to_string()),
            None => (line, String::new()),
        };

        let mut tokens: Vec<&str> = leading.split(' ').collect();
        let mut user = String::new();
        let mut host = String::new();

        if let Some(first) = tokens.first() {
            if first.starts_with(':') {
                match first.find('!') {
                    Some(bang) => {
                        user = first[1..bang].to_string();
                        host = first[bang + 1..].to_string();
                    }
                    None => {
                        user = first[1..].to_string();
                        host = "No hostname".to_string();
                    }
                }
                tokens.remove(0);
            }
        }

        let kind = if tokens.is_empty() {
            LineKind::Unknown
        } else {
            let command = tokens.remove(0);
            match command.parse::<u16>() {
                Ok(numeric) => LineKind::Numeric(numeric),
                Err(_) => Command::from_token(command)
                    .map(LineKind::Command)
                    .unwrap_or(LineKind::Unknown),
            }
        };

        let params: Vec<String> = tokens
            .into_iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();

        ParsedLine {
            user,
            host,
            kind,
            params,
            trailing,
        }
    }

    /// Whether the line carried a `user!host`-style prefix.
    pub fn has_prefix(&self) -> bool {
        !self.user.is_empty() && !self.host.is_empty()
    }

    /// All parameters after the first, joined back into one string.
    /// This is the mode string of a channel MODE change.
    pub fn params_after_first(&self) -> String {
        if self.params.len() < 2 {
            return String::new();
        }
        self.params[1..].join(" ")
    }
}

/// Split a NAMES token into its privilege mode and bare nickname.
pub fn split_privilege(token: &str) -> (String, &str) {
    let mode = token
        .chars()
        .next()
        .filter(|c| PRIVILEGE_GLYPHS.contains(*c))
        .map(|c| c.to_string())
        .unwrap_or_default();
    let nick = token.trim_matches(|c| PRIVILEGE_GLYPHS.contains(c));
    (mode, nick)
}

/// Extract the free text of a numeric reply: everything in the raw line
/// after the first parameter token, trimmed. Falls back to "No message".
pub fn numeric_text(raw: &str, first_param: Option<&str>) -> String {
    if let Some(param) = first_param {
        if let Some(pos) = raw.find(param) {
            let text = raw[pos + param.len()..].trim();
            if !text.is_empty() {
                return text.to_string();
            }
        }
    }
    "No message".to_string()
}
