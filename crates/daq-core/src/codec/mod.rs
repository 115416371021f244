//! Command/reply codecs.
//!
//! Every vendor reply is classified exactly once, here, into a [`CommandReply`].
//! Drivers match on the classification instead of re-inspecting reply text, and
//! [`CommandReply::into_result`] maps it onto [`DaqError`].
//!
//! The numeric helpers follow the forgiving behaviour of C `atof`/`atoi`: leading
//! whitespace is skipped, the longest numeric prefix is used and a string without one
//! reads as zero. Controllers pad and suffix numbers inconsistently between firmware
//! versions, so strict parsing would reject replies the hardware considers valid.

pub mod asi;
pub mod skyra;

pub use asi::{AsiCommand, AsiDialect, AxisProtocol};
pub use skyra::SkyraDialect;

use crate::error::{DaqError, Result};

/// Classification of one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Command accepted
    Ack,
    /// Command rejected
    Nak,
    /// Reply matched no known grammar
    Unknown,
}

/// One parsed reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub status: ReplyStatus,
    /// Local error code for a rejected command, if the device gave one
    pub error_code: Option<i32>,
    /// Reply text following the acknowledge marker, or the whole reply if there is none
    pub payload: String,
    /// Reply text with the terminator stripped
    pub raw: String,
}

impl CommandReply {
    pub fn is_ack(&self) -> bool {
        self.status == ReplyStatus::Ack
    }

    pub fn is_nak(&self) -> bool {
        self.status == ReplyStatus::Nak
    }

    /// Whitespace separated payload tokens.
    pub fn tokens(&self) -> Vec<&str> {
        self.payload.split_whitespace().collect()
    }

    /// Map the classification onto the error taxonomy.
    pub fn into_result(self) -> Result<String> {
        match (self.status, self.error_code) {
            (ReplyStatus::Ack, _) => Ok(self.payload),
            (ReplyStatus::Nak, Some(code)) => Err(DaqError::Device { code }),
            (ReplyStatus::Nak, None) => Err(DaqError::UnsupportedCommand(self.raw)),
            (ReplyStatus::Unknown, _) => Err(DaqError::Protocol(self.raw)),
        }
    }

    /// Like [`CommandReply::into_result`] but discards the payload.
    pub fn check(&self) -> Result<()> {
        self.clone().into_result().map(|_| ())
    }
}

/// Framing and reply grammar of one controller family.
pub trait Dialect: Send + Sync {
    /// Appended to every outgoing command
    fn send_terminator(&self) -> &'static str;

    /// Marks the end of a reply
    fn receive_terminator(&self) -> &'static str;

    /// Decorate a command before sending (address prefixes and the like).
    fn frame(&self, command: &str) -> String;

    /// Classify a reply.
    fn parse(&self, reply: &str) -> CommandReply;
}

/// Remove trailing CR, LF and ETX characters.
pub fn strip_line_end(reply: &str) -> &str {
    reply.trim_end_matches(['\r', '\n', '\x03'])
}

/// Length of the longest prefix of `s` that reads as a decimal number.
fn numeric_prefix_len(s: &str, allow_fraction: bool) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }
    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - int_start;

    if allow_fraction && i < bytes.len() && bytes[i] == b'.' {
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        digits += j - i - 1;
        if digits > 0 {
            i = j;
        }
    }
    if digits == 0 {
        return 0;
    }

    if allow_fraction && i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+') | Some(b'-')) {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    i
}

/// `atof`-style float parsing: malformed input reads as `0.0`.
pub fn lenient_f64(text: &str) -> f64 {
    let s = text.trim_start();
    let len = numeric_prefix_len(s, true);
    s[..len].parse().unwrap_or(0.0)
}

/// `atoi`-style integer parsing: malformed input reads as `0`.
pub fn lenient_i64(text: &str) -> i64 {
    let s = text.trim_start();
    let len = numeric_prefix_len(s, false);
    s[..len].parse().unwrap_or(0)
}

/// Numeric fields after the header token, e.g. `":A 1234 -56"` gives `[1234.0, -56.0]`.
pub fn numeric_fields(text: &str) -> Vec<f64> {
    strip_line_end(text)
        .split_whitespace()
        .skip(1)
        .map(lenient_f64)
        .collect()
}

/// First number in `text`, skipping any non-numeric lead-in.
///
/// A `-` directly in front of the first digit is kept, so `":A -12"` reads as `-12`.
pub fn number_after_prefix(text: &str) -> Result<f64> {
    let start = text
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit())
        .map(|(i, _)| i)
        .ok_or_else(|| DaqError::Protocol(text.to_string()))?;
    let start = if start > 0 && text.as_bytes()[start - 1] == b'-' {
        start - 1
    } else {
        start
    };
    Ok(lenient_f64(&text[start..]))
}
