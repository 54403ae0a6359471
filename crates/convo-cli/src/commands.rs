// Line-oriented command parsing for the terminal front end.

use convo_core::message::MessageId;
use convo_core::protocol::UserCommand;
use thiserror::Error;

pub const HELP: &str = "\
commands:
  <text>                 send a message
  /open <user-id>        open the conversation with a user
  /edit <msg-id> <text>  replace one of your messages
  /delete <msg-id>       delete a message
  /clear                 delete the whole conversation (asks first)
  /refresh               reload history
  /list                  list conversations
  /unread                count unread messages
  /help                  show this help
  /quit                  exit";

/// What one line of input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Forward these to the event loop, in order.
    Commands(Vec<UserCommand>),
    /// Clearing needs a yes/no answer before anything is sent.
    ConfirmClear,
    ListConversations,
    UnreadCount,
    Help,
    Nothing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command /{0} (try /help)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

pub fn parse_line(line: &str) -> Result<Input, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(Input::Nothing);
    }

    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Ok(Input::Commands(vec![
            UserCommand::Input(line.to_string()),
            UserCommand::Send,
        ]));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let input = match name {
        "open" => {
            if args.is_empty() || args.contains(char::is_whitespace) {
                return Err(ParseError::Usage("/open <user-id>"));
            }
            Input::Commands(vec![UserCommand::Open(args.to_string())])
        }
        "edit" => {
            let Some((id, content)) = args.split_once(char::is_whitespace) else {
                return Err(ParseError::Usage("/edit <msg-id> <text>"));
            };
            Input::Commands(vec![UserCommand::Edit {
                message_id: MessageId::new(id),
                content: content.trim().to_string(),
            }])
        }
        "delete" => {
            if args.is_empty() || args.contains(char::is_whitespace) {
                return Err(ParseError::Usage("/delete <msg-id>"));
            }
            Input::Commands(vec![UserCommand::Delete(MessageId::new(args))])
        }
        "clear" => Input::ConfirmClear,
        "refresh" => Input::Commands(vec![UserCommand::Refresh]),
        "list" => Input::ListConversations,
        "unread" => Input::UnreadCount,
        "help" => Input::Help,
        "quit" | "exit" => Input::Commands(vec![UserCommand::Quit]),
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(input)
}

/// Whether a confirmation answer means yes.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
