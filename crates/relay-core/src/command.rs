//! Bot command recognition.

pub const START_COMMAND: &str = "/start";

/// Fixed reply to the start command.
pub const GREETING: &str = "Chat with AI started. How can I help you?";

/// Commands the relay reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
}

/// The command token of a message: everything before the first `@`.
///
/// Telegram may send `/cmd@botname ...` in group chats.
pub fn command_token(text: &str) -> &str {
    text.split_once('@').map_or(text, |(head, _)| head)
}

/// Recognize a command by exact match on the command token.
pub fn parse_command(text: &str) -> Option<Command> {
    match command_token(text) {
        START_COMMAND => Some(Command::Start),
        _ => None,
    }
}
