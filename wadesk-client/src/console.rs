//! Line commands typed into the interactive `watch` console.

use std::{fmt::Write as _, path::PathBuf};

use thiserror::Error;
use tracing::info;
use wadesk_core::{Attachment, FormRequirements, SentMessage};

use crate::{api::MessageBackend, error::ClientError, form::MessageForm, sync::Synchronizer};

const SEND_USAGE: &str =
    "send <phone> <template|-> <display name> [date=YYYY-MM-DD] [time=HH:MM] [file=PATH]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Refresh,
    RequestQr,
    ExpireQr,
    AuthStatus,
    AuthReset,
    Dismiss(u64),
    Login(String),
    Send(SendRequest),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command {0:?}; type help")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Fields of a message typed on one line. `template: None` picks the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub to: String,
    pub template: Option<String>,
    pub name: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub attachment: Option<PathBuf>,
}

impl SendRequest {
    /// Copies the request into the form. The attachment is read by the caller.
    pub fn fill(&self, form: &mut MessageForm, attachment: Option<Attachment>) {
        form.set_recipient(self.to.clone());
        form.set_display_name(self.name.clone());
        if let Some(id) = &self.template {
            form.select_template(id.clone());
        }
        if self.date.is_some() || self.time.is_some() {
            form.set_schedule(
                self.date.clone().unwrap_or_default(),
                self.time.clone().unwrap_or_default(),
            );
        }
        form.set_attachment(attachment);
    }
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "r" | "refresh" => ConsoleCommand::Refresh,
        "q" | "qr" => ConsoleCommand::RequestQr,
        "x" | "expire" => ConsoleCommand::ExpireQr,
        "a" | "auth" => ConsoleCommand::AuthStatus,
        "reset" => ConsoleCommand::AuthReset,
        "h" | "help" | "?" => ConsoleCommand::Help,
        "dismiss" | "d" => {
            let id = words
                .next()
                .and_then(|id| id.trim_start_matches('#').parse().ok())
                .ok_or(ParseError::Usage("dismiss <id>"))?;
            ConsoleCommand::Dismiss(id)
        }
        "login" => {
            let token = words.next().ok_or(ParseError::Usage("login <token>"))?;
            ConsoleCommand::Login(token.to_owned())
        }
        "send" => ConsoleCommand::Send(parse_send(words)?),
        other => return Err(ParseError::Unknown(other.to_owned())),
    };
    Ok(Some(command))
}

fn parse_send<'a>(mut words: impl Iterator<Item = &'a str>) -> Result<SendRequest, ParseError> {
    let usage = ParseError::Usage(SEND_USAGE);
    let to = words.next().ok_or_else(|| usage.clone())?;
    let template = words.next().ok_or_else(|| usage.clone())?;

    let mut request = SendRequest {
        to: to.to_owned(),
        template: (template != "-").then(|| template.to_owned()),
        ..SendRequest::default()
    };
    let mut name = Vec::new();
    for word in words {
        if let Some(date) = word.strip_prefix("date=") {
            request.date = Some(date.to_owned());
        } else if let Some(time) = word.strip_prefix("time=") {
            request.time = Some(time.to_owned());
        } else if let Some(path) = word.strip_prefix("file=") {
            request.attachment = Some(PathBuf::from(path));
        } else {
            name.push(word);
        }
    }
    if name.is_empty() {
        return Err(usage);
    }
    request.name = name.join(" ");
    Ok(request)
}

pub fn help(requirements: FormRequirements) -> String {
    let mut out = String::from(
        "r refresh | q new QR | x expire QR | a auth status | reset clear stored session\n\
         dismiss <id> | login <token> | help\n",
    );
    let _ = writeln!(out, "{SEND_USAGE}");
    if requirements.require_schedule {
        let _ = writeln!(out, "  date= and time= are required");
    }
    if requirements.require_attachment {
        let _ = writeln!(out, "  file= is required and must be an image");
    }
    out
}

/// Submits the form while the synchronizer reports a usable connection and
/// records the result in its sent log.
pub async fn submit_and_record(
    form: &mut MessageForm,
    backend: &dyn MessageBackend,
    sync: &Synchronizer,
) -> Result<SentMessage, ClientError> {
    let connected = sync.view().can_send();
    let sent = form.submit(backend, connected).await?;
    info!(recipient = %sent.recipient, "recording sent message");
    sync.record_sent(sent.clone());
    Ok(sent)
}
