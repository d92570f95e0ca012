// bw-protocol: BotWave control-plane frame codec.
//
// The wire format is line-oriented UTF-8 text:
//
// ```text
// COMMAND [arg1 arg2 …] [key1=value1 key2=value2 …]
// ```
//
// Positional args and key/value pairs may interleave after the command
// token.  Values are shell-quoted (double quotes, backslash escaping) when
// they contain whitespace, quotes, or `=`.  Unknown keys survive a
// parse/encode round-trip verbatim.

use std::collections::BTreeMap;

/// Protocol version carried in `VER` frames.  Two versions are compatible
/// iff their MAJOR fields match.
pub const PROTOCOL_VERSION: &str = "1.4.0";

/// The frozen command alphabet.  Names are the wire tokens.
pub mod commands {
    // Handshake
    pub const REGISTER: &str = "REGISTER";
    pub const AUTH: &str = "AUTH";
    pub const VER: &str = "VER";
    pub const REGISTER_OK: &str = "REGISTER_OK";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";

    // Control
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const KICK: &str = "KICK";
    pub const OK: &str = "OK";
    pub const ERROR: &str = "ERROR";
    pub const END: &str = "END";

    // Broadcast
    pub const START: &str = "START";
    pub const STOP: &str = "STOP";
    pub const STREAM_TOKEN: &str = "STREAM_TOKEN";

    // Files
    pub const UPLOAD_TOKEN: &str = "UPLOAD_TOKEN";
    pub const DOWNLOAD_TOKEN: &str = "DOWNLOAD_TOKEN";
    pub const DOWNLOAD_URL: &str = "DOWNLOAD_URL";
    pub const LIST_FILES: &str = "LIST_FILES";
    pub const REMOVE_FILE: &str = "REMOVE_FILE";
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("trailing escape character")]
    TrailingEscape,
    #[error("invalid command token: {0:?}")]
    InvalidCommand(String),
    #[error("positional argument would not round-trip: {0:?}")]
    AmbiguousArg(String),
    #[error("kwarg key is not a bare identifier: {0:?}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One decoded control-plane frame.
///
/// Kwargs are held in a sorted map so that encoding is deterministic; the
/// wire order of inbound kwargs carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub command: String,
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Frame {
            command: command.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Insert a key/value attribute.  Non-string values go through
    /// `ToString`, matching how numbers travel on the wire.
    pub fn kw(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.kwargs.insert(key.into(), value.to_string());
        self
    }

    /// Attribute lookup.
    pub fn kwarg(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).map(String::as_str)
    }

    /// Parse one wire line into a frame.
    ///
    /// Tokenization is shell-style: double quotes group, backslash escapes
    /// the next character.  After the command token, any token whose prefix
    /// up to the first `=` is a bare identifier becomes a kwarg; everything
    /// else is positional.
    pub fn parse(line: &str) -> Result<Frame, FrameError> {
        let tokens = tokenize(line)?;
        let mut iter = tokens.into_iter();
        let command = iter.next().ok_or(FrameError::Empty)?;
        if command.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut frame = Frame::new(command);
        for token in iter {
            match token.split_once('=') {
                Some((key, value)) if is_bare_identifier(key) => {
                    frame.kwargs.insert(key.to_owned(), value.to_owned());
                }
                _ => frame.args.push(token),
            }
        }
        Ok(frame)
    }

    /// Encode the frame to its wire line.
    ///
    /// Never emits a line that would not parse back to an equal frame:
    /// positional args containing `=` and non-identifier kwarg keys are
    /// rejected here instead of silently misparsing on the far side.
    pub fn encode(&self) -> Result<String, FrameError> {
        if self.command.is_empty()
            || self
                .command
                .chars()
                .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '=')
        {
            return Err(FrameError::InvalidCommand(self.command.clone()));
        }

        let mut line = self.command.clone();
        for arg in &self.args {
            if arg.contains('=') {
                return Err(FrameError::AmbiguousArg(arg.clone()));
            }
            line.push(' ');
            line.push_str(&quote(arg));
        }
        for (key, value) in &self.kwargs {
            if !is_bare_identifier(key) {
                return Err(FrameError::InvalidKey(key.clone()));
            }
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&quote(value));
        }
        Ok(line)
    }
}

/// Shorthand for the ubiquitous `OK message=…` / `ERROR message=…` replies.
pub fn reply(command: &str, message: impl Into<String>) -> Frame {
    Frame::new(command).kw("message", message.into())
}

/// Split an operator console line with the same tokenizer the codec uses,
/// so handler scripts and the interactive prompt parse identically.
pub fn split_line(line: &str) -> Result<Vec<String>, FrameError> {
    tokenize(line)
}

// ---------------------------------------------------------------------------
// File-list payload
// ---------------------------------------------------------------------------

/// One entry of the JSON array carried by `OK files=<json>` replies to
/// `LIST_FILES`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// RFC 3339 local mtime, informational only.
    pub modified: String,
}

pub fn encode_file_list(files: &[FileInfo]) -> Result<String, serde_json::Error> {
    serde_json::to_string(files)
}

pub fn parse_file_list(json: &str) -> Result<Vec<FileInfo>, serde_json::Error> {
    serde_json::from_str(json)
}

// ---------------------------------------------------------------------------
// Version compatibility
// ---------------------------------------------------------------------------

/// Two `MAJOR.MINOR.PATCH` strings are compatible iff their MAJOR fields
/// match.  Unparsable versions are never compatible.
pub fn versions_compatible(a: &str, b: &str) -> bool {
    match (major_of(a), major_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn major_of(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Tokenizer / quoting
// ---------------------------------------------------------------------------

fn tokenize(line: &str) -> Result<Vec<String>, FrameError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().ok_or(FrameError::TrailingEscape)?;
                current.push(escaped);
                in_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err(FrameError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn quote(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '=');
    if !needs_quoting {
        return value.to_owned();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn is_bare_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
