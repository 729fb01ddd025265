//! Operator console: turns stdin lines into hub actions

use serde_json::json;

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `<device_id> <command text>`
    Send { device_id: String, body: Vec<u8> },
    /// `* <command text>`
    Broadcast { body: Vec<u8> },
    /// `list`
    List,
}

/// Parse one line; blank or incomplete lines yield None
pub fn parse_line(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    if line == "list" {
        return Some(ConsoleCommand::List);
    }

    let (target, text) = line.split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let body = command_body(text);
    Some(match target {
        "*" => ConsoleCommand::Broadcast { body },
        device_id => ConsoleCommand::Send {
            device_id: device_id.to_string(),
            body,
        },
    })
}

/// Wrap command text as an agent command message
pub fn command_body(text: &str) -> Vec<u8> {
    json!({ "commands": text }).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn body_of(cmd: &ConsoleCommand) -> Value {
        match cmd {
            ConsoleCommand::Send { body, .. } | ConsoleCommand::Broadcast { body } => {
                serde_json::from_slice(body).unwrap()
            }
            ConsoleCommand::List => Value::Null,
        }
    }

    #[test]
    fn test_send_to_device() {
        let cmd = parse_line("dev-1 echo '{\"a\": 1}'").unwrap();
        assert!(matches!(&cmd, ConsoleCommand::Send { device_id, .. } if device_id == "dev-1"));
        assert_eq!(body_of(&cmd), json!({"commands": "echo '{\"a\": 1}'"}));
    }

    #[test]
    fn test_broadcast() {
        let cmd = parse_line("*   uptime  ").unwrap();
        assert!(matches!(cmd, ConsoleCommand::Broadcast { .. }));
        assert_eq!(body_of(&cmd), json!({"commands": "uptime"}));
    }

    #[test]
    fn test_incomplete_lines_ignored() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("dev-1"), None);
        assert_eq!(parse_line("dev-1   "), None);
        assert_eq!(parse_line("list"), Some(ConsoleCommand::List));
    }
}
