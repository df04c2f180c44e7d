//! Line commands read from stdin while the agent runs

use clientdesk_core::{CallId, ConversationId};
use std::path::PathBuf;
use std::str::FromStr;

pub const HELP: &str = "\
Commands:
  accept                 answer the ringing call
  reject                 decline the ringing call
  end <call-id>          hang up an accepted call
  open <conversation-id> switch to a conversation
  send <text>            send a message to the open conversation
  attach <path> [text]   send a file, optionally with text
  edit <id> <text>       change one of your messages
  delete <id>            delete one of your messages
  messages               print the open conversation
  refresh                re-fetch the open conversation
  help                   show this list
  quit                   exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Accept,
    Reject,
    End(CallId),
    Open(ConversationId),
    Send(String),
    Attach { path: PathBuf, text: Option<String> },
    Edit(u64, String),
    Delete(u64),
    Messages,
    Refresh,
    Help,
    Quit,
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (input, ""),
    }
}

fn parse_id(raw: &str, what: &str) -> Result<u64, String> {
    raw.parse()
        .map_err(|_| format!("{} must be a number, got {:?}", what, raw))
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (word, rest) = split_word(line);
        match word.to_ascii_lowercase().as_str() {
            "accept" => Ok(Command::Accept),
            "reject" => Ok(Command::Reject),
            "end" => Ok(Command::End(CallId(parse_id(rest, "call id")?))),
            "open" => Ok(Command::Open(ConversationId(parse_id(rest, "conversation id")?))),
            "send" if rest.is_empty() => Err("usage: send <text>".into()),
            "send" => Ok(Command::Send(rest.to_string())),
            "attach" => {
                let (path, text) = split_word(rest);
                if path.is_empty() {
                    return Err("usage: attach <path> [text]".into());
                }
                Ok(Command::Attach {
                    path: PathBuf::from(path),
                    text: (!text.is_empty()).then(|| text.to_string()),
                })
            }
            "edit" => {
                let (id, text) = split_word(rest);
                if text.is_empty() {
                    return Err("usage: edit <id> <text>".into());
                }
                Ok(Command::Edit(parse_id(id, "message id")?, text.to_string()))
            }
            "delete" => Ok(Command::Delete(parse_id(rest, "message id")?)),
            "messages" | "ls" => Ok(Command::Messages),
            "refresh" => Ok(Command::Refresh),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err(String::new()),
            other => Err(format!("unknown command {:?}, try `help`", other)),
        }
    }
}
