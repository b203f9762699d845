//! Line oriented console for the room observer

use protoo_room_core::model::{Consumers, Peers, RoomInfo};
use protoo_room_core::{ConnectionState, Notify, NotifyType};

/// A line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `/name <display name>`
    Name(String),
    /// `/chat <text>` or any line not starting with `/`
    Chat(String),
    /// `/ice`
    RestartIce,
    /// `/peers`
    Peers,
    /// `/help`
    Help,
    /// `/quit`
    Quit,
}

/// Parse one input line; `Err` carries the message to show
pub fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Chat(line.to_string())));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    let input = match name {
        "name" if rest.is_empty() => return Err("usage: /name <display name>".to_string()),
        "name" => Input::Name(rest.to_string()),
        "chat" if rest.is_empty() => return Err("usage: /chat <text>".to_string()),
        "chat" => Input::Chat(rest.to_string()),
        "ice" => Input::RestartIce,
        "peers" => Input::Peers,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(input))
}

pub const HELP: &str = "\
Commands:
  /name <display name>  - Rename yourself
  /chat <text>          - Send a chat message (plain lines work too)
  /ice                  - Restart ICE
  /peers                - List peers and their streams
  /quit                 - Leave the room";

pub fn notify_line(notify: &Notify) -> String {
    let icon = match notify.kind {
        NotifyType::Info => "ℹ️ ",
        NotifyType::Error => "❌",
        NotifyType::Message => "💬",
    };
    match &notify.title {
        Some(title) => format!("{icon} {title}: {}", notify.text),
        None => format!("{icon} {}", notify.text),
    }
}

pub fn state_line(info: &RoomInfo) -> String {
    let icon = match info.state {
        ConnectionState::New => "⏸️ ",
        ConnectionState::Connecting => "🔄",
        ConnectionState::Connected => "✅",
        ConnectionState::Closed => "🔚",
    };
    format!("{icon} Room {} is {}", info.room_id, info.state)
}

pub fn peers_lines(peers: &Peers, consumers: &Consumers, active_speaker: Option<&str>) -> Vec<String> {
    if peers.is_empty() {
        return vec!["👥 Nobody else is here".to_string()];
    }
    let mut lines = vec![format!("👥 {} peer(s)", peers.len())];
    for peer in peers.values() {
        let speaking = if active_speaker == Some(peer.id.as_str()) {
            " 🔊"
        } else {
            ""
        };
        lines.push(format!(
            "   {} ({}, {}){speaking}",
            peer.display_name, peer.id, peer.device.name
        ));
        for consumer_id in &peer.consumers {
            let Some(consumer) = consumers.get(consumer_id) else {
                continue;
            };
            let paused = if consumer.is_paused() { " [paused]" } else { "" };
            lines.push(format!("      {} {}{paused}", consumer.kind, consumer.id));
        }
    }
    lines
}
