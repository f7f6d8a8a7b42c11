//! Interactive session: stdin lines become conference operations.

use std::io::{BufRead, Write};

use tracing::{info, warn};

use meshconf_engine::{Conference, ConferenceBuilder, accept_any};
use meshconf_protocol::{Endpoint, Invite};

use crate::config::Settings;
use crate::error::{CliError, CliResult};

pub const HELP: &str = "\
/status            print the conference as JSON
/name <name>       change display name
/invite <endpoint> invite a participant
/leave             leave the conference
/hangup            drop every link, keeping peers for /reenter
/reenter           reconnect to every peer
/quit              exit
anything else is sent as text";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Name(String),
    Invite(String),
    Leave,
    Hangup,
    Reenter,
    Help,
    Quit,
    Say(String),
}

impl Command {
    /// Parses a line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Say(line.to_string())));
        };
        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        let command = match (name, argument) {
            ("status", "") => Self::Status,
            ("leave", "") => Self::Leave,
            ("hangup", "") => Self::Hangup,
            ("reenter", "") => Self::Reenter,
            ("help", "") => Self::Help,
            ("quit" | "exit", "") => Self::Quit,
            ("name", "") => return Err("usage: /name <name>".to_string()),
            ("name", argument) => Self::Name(argument.to_string()),
            ("invite", "") => return Err("usage: /invite <endpoint>".to_string()),
            ("invite", argument) => Self::Invite(argument.to_string()),
            _ => return Err(format!("unknown command /{name}, try /help")),
        };
        Ok(Some(command))
    }
}

/// Whether the session goes on after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Builds the conference with callbacks that print to stdout.
pub fn build_conference(settings: &Settings) -> CliResult<Conference> {
    let builder = ConferenceBuilder::new(settings.context.clone())
        .on_text(|from, text| println!("[{from:016x}] {text}"));
    let builder = if settings.reject_invites {
        builder.on_invite(|invite: &Invite| {
            println!("* declined invite from {}", invite.name);
            false
        })
    } else {
        builder.on_invite(|invite: &Invite| {
            println!("* joining {} at {}", invite.name, invite.listen_endpoint);
            accept_any(invite)
        })
    };
    Ok(builder.build()?)
}

/// Runs one command against the conference.
pub fn execute(conference: &Conference, command: Command, out: &mut impl Write) -> CliResult<Flow> {
    match command {
        Command::Status => {
            let snapshot = conference.snapshot()?;
            let json = serde_json::to_string_pretty(&snapshot)
                .map_err(|e| CliError::config(e.to_string()))?;
            writeln!(out, "{json}")?;
        }
        Command::Name(name) => {
            conference.set_display_name(&name)?;
            writeln!(out, "* you are now {name}")?;
        }
        Command::Invite(text) => {
            let endpoint: Endpoint = text.parse()?;
            let id = conference.invite(&endpoint)?;
            writeln!(out, "* {id:016x} joined")?;
        }
        Command::Leave => {
            conference.leave_conference()?;
            writeln!(out, "* left the conference")?;
        }
        Command::Hangup => {
            conference.hangup()?;
            writeln!(out, "* hung up, /reenter to come back")?;
        }
        Command::Reenter => {
            conference.reenter()?;
            writeln!(out, "* back in the conference")?;
        }
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(Flow::Quit),
        Command::Say(text) => {
            if conference.send_text(&text)? == 0 {
                writeln!(out, "* nobody to talk to, /invite someone")?;
            }
        }
    }
    Ok(Flow::Continue)
}

/// Starts the conference, sends the startup invitations and reads commands
/// from `input` until it ends or `/quit`.
pub fn run(settings: &Settings, input: impl BufRead, mut out: impl Write) -> CliResult<()> {
    let conference = build_conference(settings)?;
    conference.init()?;
    writeln!(
        out,
        "* {} listening on {}, /help for commands",
        settings.context.display_name,
        conference.listen_endpoint()?
    )?;

    for endpoint in &settings.invites {
        match conference.invite(endpoint) {
            Ok(id) => info!(%endpoint, participant = %format_args!("{id:016x}"), "Invited"),
            Err(e) => warn!(%endpoint, error = %e, "Invite failed"),
        }
    }

    for line in input.lines() {
        let command = match Command::parse(&line?) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                writeln!(out, "* {usage}")?;
                continue;
            }
        };
        match execute(&conference, command, &mut out) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(CliError::Engine(e)) => writeln!(out, "* {}: {e}", e.description())?,
            Err(CliError::Endpoint(e)) => writeln!(out, "* {e}")?,
            Err(e) => return Err(e),
        }
    }

    conference.shutdown();
    Ok(())
}
