//! Command table and request parsing.
//!
//! The table is plain data: verb, arity and the minimum peer state the
//! command needs. Dispatch lives in the engine, which matches on [`Verb`].

use crate::error::{Error, Result};
use std::borrow::Cow;

/// Protocol verbs understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `ping <id> <cookie>`
    Ping,
    /// `pong <cookie>`
    Pong,
    /// `client <name>`
    Client,
    /// `version <version>`
    Version,
    /// `profile_name [name]`
    ProfileName,
    /// `profile_text [text]`
    ProfileText,
    /// `profile_avatar [rgb bytes]`
    ProfileAvatar,
    /// `profile_avatar_alpha [alpha bytes]`
    ProfileAvatarAlpha,
    /// `add_me`
    AddMe,
    /// `status <presence>`
    Status,
    /// `message [text]`
    Message,
    /// `filename <cookie> <size> <block size> <name>`
    Filename,
    /// `filedata <cookie> <offset> <md5> <data>`
    Filedata,
    /// `filedata_error <cookie> <offset>`
    FiledataError,
    /// `filedata_ok <cookie> <offset>`
    FiledataOk,
    /// `file_stop_sending <cookie>`
    FileStopSending,
    /// `file_stop_receiving <cookie>`
    FileStopReceiving,
    /// `remove_me`
    RemoveMe,
    /// `not_implemented [verb]`
    NotImplemented,
    /// Anything not in the table.
    Unknown,
}

impl Verb {
    /// Wire name of the verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Ping => "ping",
            Verb::Pong => "pong",
            Verb::Client => "client",
            Verb::Version => "version",
            Verb::ProfileName => "profile_name",
            Verb::ProfileText => "profile_text",
            Verb::ProfileAvatar => "profile_avatar",
            Verb::ProfileAvatarAlpha => "profile_avatar_alpha",
            Verb::AddMe => "add_me",
            Verb::Status => "status",
            Verb::Message => "message",
            Verb::Filename => "filename",
            Verb::Filedata => "filedata",
            Verb::FiledataError => "filedata_error",
            Verb::FiledataOk => "filedata_ok",
            Verb::FileStopSending => "file_stop_sending",
            Verb::FileStopReceiving => "file_stop_receiving",
            Verb::RemoveMe => "remove_me",
            Verb::NotImplemented => "not_implemented",
            Verb::Unknown => "",
        }
    }
}

/// How the text after the verb is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly N arguments; the last one keeps any remaining spaces.
    Fixed(usize),
    /// The rest of the line as one argument, possibly empty.
    Rest,
}

/// Minimum protocol phase a command is valid in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    /// Valid as soon as a connection is accepted.
    Greeting,
    /// Valid while the cookie handshake runs.
    Handshake,
    /// Valid once the cookie handshake succeeded.
    Authenticated,
    /// Valid once the buddy is accepted.
    Accepted,
}

/// One entry of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Verb.
    pub verb: Verb,
    /// Argument layout.
    pub arity: Arity,
    /// Minimum phase.
    pub validity: Validity,
}

const fn cmd(verb: Verb, arity: Arity, validity: Validity) -> CommandSpec {
    CommandSpec { verb, arity, validity }
}

/// The command table. Order and values are part of the wire contract.
pub static COMMAND_TABLE: &[CommandSpec] = &[
    cmd(Verb::Ping, Arity::Fixed(2), Validity::Greeting),
    cmd(Verb::Pong, Arity::Fixed(1), Validity::Handshake),
    cmd(Verb::Client, Arity::Fixed(1), Validity::Authenticated),
    cmd(Verb::Version, Arity::Fixed(1), Validity::Authenticated),
    cmd(Verb::ProfileName, Arity::Rest, Validity::Authenticated),
    cmd(Verb::ProfileText, Arity::Rest, Validity::Authenticated),
    cmd(Verb::ProfileAvatar, Arity::Rest, Validity::Authenticated),
    cmd(Verb::ProfileAvatarAlpha, Arity::Rest, Validity::Authenticated),
    cmd(Verb::AddMe, Arity::Fixed(0), Validity::Authenticated),
    cmd(Verb::Status, Arity::Fixed(1), Validity::Authenticated),
    cmd(Verb::Message, Arity::Rest, Validity::Accepted),
    cmd(Verb::Filename, Arity::Fixed(4), Validity::Accepted),
    cmd(Verb::Filedata, Arity::Fixed(2), Validity::Accepted),
    cmd(Verb::FiledataError, Arity::Fixed(2), Validity::Accepted),
    cmd(Verb::FiledataOk, Arity::Fixed(2), Validity::Accepted),
    cmd(Verb::FileStopSending, Arity::Fixed(1), Validity::Accepted),
    cmd(Verb::FileStopReceiving, Arity::Fixed(1), Validity::Accepted),
    cmd(Verb::RemoveMe, Arity::Fixed(0), Validity::Accepted),
    cmd(Verb::NotImplemented, Arity::Rest, Validity::Authenticated),
];

/// Sentinel entry for verbs not in the table.
pub static UNKNOWN_COMMAND: CommandSpec = cmd(Verb::Unknown, Arity::Fixed(0), Validity::Greeting);

/// Find the table entry for a raw verb.
pub fn lookup(name: &[u8]) -> &'static CommandSpec {
    COMMAND_TABLE
        .iter()
        .find(|spec| spec.verb.as_str().as_bytes() == name)
        .unwrap_or(&UNKNOWN_COMMAND)
}

/// A parsed protocol line.
#[derive(Debug, Clone)]
pub struct Request {
    /// Table entry the verb resolved to.
    pub spec: &'static CommandSpec,
    /// Verb as received (meaningful for [`Verb::Unknown`]).
    pub name: Vec<u8>,
    /// Arguments, split according to the entry's arity.
    pub args: Vec<Vec<u8>>,
}

impl Request {
    /// Parse a decoded line.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let (name, rest) = match line.iter().position(|&b| b == b' ') {
            Some(pos) => (&line[..pos], Some(&line[pos + 1..])),
            None => (line, None),
        };
        if name.is_empty() {
            return Err(Error::Protocol("empty command".into()));
        }

        let spec = lookup(name);
        let args = match spec.arity {
            Arity::Fixed(0) => Vec::new(),
            Arity::Fixed(n) => {
                let rest = rest.ok_or_else(|| {
                    Error::Protocol(format!("{} expects {} arguments", spec.verb.as_str(), n))
                })?;
                let args: Vec<Vec<u8>> = rest.splitn(n, |&b| b == b' ').map(<[u8]>::to_vec).collect();
                if args.len() < n {
                    return Err(Error::Protocol(format!(
                        "{} expects {} arguments, got {}",
                        spec.verb.as_str(),
                        n,
                        args.len()
                    )));
                }
                args
            }
            Arity::Rest => vec![rest.unwrap_or_default().to_vec()],
        };

        Ok(Self {
            spec,
            name: name.to_vec(),
            args,
        })
    }

    /// Resolved verb.
    pub fn verb(&self) -> Verb {
        self.spec.verb
    }

    /// Raw argument `index`, empty if absent.
    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Argument `index` as strict UTF-8.
    pub fn arg_str(&self, index: usize) -> Result<&str> {
        std::str::from_utf8(self.arg(index))
            .map_err(|_| Error::Protocol(format!("{} argument {} is not utf-8", self.verb().as_str(), index)))
    }

    /// Argument `index` as text, replacing invalid UTF-8.
    pub fn text(&self, index: usize) -> Cow<'_, str> {
        String::from_utf8_lossy(self.arg(index))
    }

    /// Argument `index` as an unsigned number.
    pub fn arg_u64(&self, index: usize) -> Result<u64> {
        self.arg_str(index)?
            .parse()
            .map_err(|_| Error::Protocol(format!("{} argument {} is not a number", self.verb().as_str(), index)))
    }

    /// Verb as received, for logging and `not_implemented` replies.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Build an unescaped line from a verb and its arguments.
pub fn format_line(verb: Verb, args: &[&[u8]]) -> Vec<u8> {
    let name = verb.as_str().as_bytes();
    let len = name.len() + args.iter().map(|a| a.len() + 1).sum::<usize>();
    let mut line = Vec::with_capacity(len);
    line.extend_from_slice(name);
    for arg in args {
        line.push(b' ');
        line.extend_from_slice(arg);
    }
    line
}
