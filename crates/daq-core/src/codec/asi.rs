//! ASI MS-2000 / LX-4000 dialect.
//!
//! Protocol Overview:
//! - Format: ASCII verb followed by `AXIS=value` pairs or bare axis letters
//! - Command terminator: CR (`\r`)
//! - Reply terminator: CR+LF, legacy LX-4000 controllers append ETX (`\r\n\x03`)
//! - Accept: `:A` at offset 0 or 1, followed by payload tokens
//! - Reject: `:N<code>` where code is a signed integer
//! - Legacy controllers need a card-address prefix (`2H` for XY, `1H` for Z)
//!
//! # Example
//!
//! ```rust
//! use daq_core::codec::{AsiCommand, AsiDialect, AxisProtocol, Dialect};
//!
//! let dialect = AsiDialect::new(AxisProtocol::Modern, Some("2H"));
//! let cmd = AsiCommand::new("M").fixed("X", 1.5).fixed("Y", -2.0).build();
//! assert_eq!(dialect.frame(&cmd), "M X=1.500000 Y=-2.000000");
//!
//! let reply = dialect.parse(":A X=1.23 Y=4.56\r\n");
//! assert_eq!(reply.tokens(), vec!["X=1.23", "Y=4.56"]);
//! ```

use super::{lenient_i64, strip_line_end, CommandReply, Dialect, ReplyStatus};
use crate::error::ASI_ERR_OFFSET;
use std::fmt::Write;

/// Framing variant spoken by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxisProtocol {
    /// MS-2000 and later
    #[default]
    Modern,
    /// LX-4000 with card-address prefix
    LegacyLx4000,
}

impl AxisProtocol {
    pub fn label(self) -> &'static str {
        match self {
            AxisProtocol::Modern => "modern",
            AxisProtocol::LegacyLx4000 => "lx-4000",
        }
    }
}

/// ASI framing, parameterised by protocol and the card's legacy prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsiDialect {
    protocol: AxisProtocol,
    legacy_prefix: Option<&'static str>,
}

impl AsiDialect {
    pub fn new(protocol: AxisProtocol, legacy_prefix: Option<&'static str>) -> Self {
        Self {
            protocol,
            legacy_prefix,
        }
    }

    pub fn protocol(&self) -> AxisProtocol {
        self.protocol
    }

    pub fn legacy_prefix(&self) -> Option<&'static str> {
        self.legacy_prefix
    }

    pub fn with_protocol(self, protocol: AxisProtocol) -> Self {
        Self { protocol, ..self }
    }
}

/// Position of an `:A`/`:N` marker at offset 0 or 1.
fn marker_offset(text: &str, marker: &str) -> Option<usize> {
    [0usize, 1]
        .into_iter()
        .find(|&at| text.get(at..at + marker.len()) == Some(marker))
}

impl Dialect for AsiDialect {
    fn send_terminator(&self) -> &'static str {
        "\r"
    }

    fn receive_terminator(&self) -> &'static str {
        match self.protocol {
            AxisProtocol::Modern => "\r\n",
            AxisProtocol::LegacyLx4000 => "\r\n\x03",
        }
    }

    fn frame(&self, command: &str) -> String {
        match (self.protocol, self.legacy_prefix) {
            (AxisProtocol::LegacyLx4000, Some(prefix)) => format!("{prefix}{command}"),
            _ => command.to_string(),
        }
    }

    fn parse(&self, reply: &str) -> CommandReply {
        let text = strip_line_end(reply);

        if let Some(at) = marker_offset(text, ":A") {
            return CommandReply {
                status: ReplyStatus::Ack,
                error_code: None,
                payload: text[at + 2..].trim().to_string(),
                raw: text.to_string(),
            };
        }

        if let Some(at) = marker_offset(text, ":N") {
            let code = lenient_i64(&text[at + 2..])
                .checked_add(i64::from(ASI_ERR_OFFSET))
                .and_then(|code| i32::try_from(code).ok());
            // A code outside the local range is not a reply this dialect understands
            if let Some(code) = code {
                return CommandReply {
                    status: ReplyStatus::Nak,
                    error_code: Some(code),
                    payload: text[at + 2..].trim().to_string(),
                    raw: text.to_string(),
                };
            }
        }

        CommandReply {
            status: ReplyStatus::Unknown,
            error_code: None,
            payload: text.to_string(),
            raw: text.to_string(),
        }
    }
}

/// Builder for ASI command lines.
#[derive(Debug, Clone)]
pub struct AsiCommand {
    line: String,
}

impl AsiCommand {
    pub fn new(verb: &str) -> Self {
        Self {
            line: verb.to_string(),
        }
    }

    /// `AXIS=value` with six decimals.
    pub fn fixed(mut self, axis: &str, value: f64) -> Self {
        let _ = write!(self.line, " {axis}={value:.6}");
        self
    }

    /// `AXIS=value` with no decimals.
    pub fn rounded(mut self, axis: &str, value: f64) -> Self {
        let _ = write!(self.line, " {axis}={value:.0}");
        self
    }

    /// `AXIS=value` using the value's own formatting.
    pub fn value(mut self, axis: &str, value: impl std::fmt::Display) -> Self {
        let _ = write!(self.line, " {axis}={value}");
        self
    }

    /// Bare token such as an axis letter, `X?` or `X+`.
    pub fn arg(mut self, token: &str) -> Self {
        self.line.push(' ');
        self.line.push_str(token);
        self
    }

    pub fn build(self) -> String {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;

    fn modern() -> AsiDialect {
        AsiDialect::new(AxisProtocol::Modern, Some("2H"))
    }

    #[test]
    fn ack_with_payload_tokens() {
        let reply = modern().parse(":A X=1.23 Y=4.56\r\n");
        assert!(reply.is_ack());
        assert_eq!(reply.tokens(), vec!["X=1.23", "Y=4.56"]);
        assert_eq!(reply.raw, ":A X=1.23 Y=4.56");
    }

    #[test]
    fn ack_marker_at_offset_one() {
        let reply = modern().parse(" :A 100 200\r\n");
        assert!(reply.is_ack());
        assert_eq!(reply.tokens(), vec!["100", "200"]);
    }

    #[test]
    fn nak_code_is_offset_into_local_space() {
        let reply = modern().parse(":N-21\r\n");
        assert_eq!(reply.status, ReplyStatus::Nak);
        assert_eq!(reply.error_code, Some(10079));
        assert_eq!(reply.into_result(), Err(DaqError::Device { code: 10079 }));

        let reply = modern().parse(":N-1");
        assert_eq!(reply.error_code, Some(10099));
    }

    #[test]
    fn nak_code_outside_local_range_is_unknown() {
        let dialect = AsiDialect::new(AxisProtocol::Modern, None);
        let reply = dialect.parse(":N2147483647\r\n");
        assert_eq!(reply.status, ReplyStatus::Unknown);
        assert_eq!(reply.error_code, None);
        assert_eq!(
            reply.into_result(),
            Err(DaqError::Protocol(":N2147483647".to_string()))
        );

        let reply = dialect.parse(":N-9223372036854775808");
        assert_eq!(reply.status, ReplyStatus::Unknown);
    }

    #[test]
    fn garbage_is_protocol_error() {
        let reply = modern().parse("garbage\r\n");
        assert_eq!(reply.status, ReplyStatus::Unknown);
        assert_eq!(
            reply.into_result(),
            Err(DaqError::Protocol("garbage".to_string()))
        );
    }

    #[test]
    fn legacy_framing_adds_prefix_and_etx() {
        let legacy = modern().with_protocol(AxisProtocol::LegacyLx4000);
        assert_eq!(legacy.frame("W X Y"), "2HW X Y");
        assert_eq!(legacy.receive_terminator(), "\r\n\x03");
        assert_eq!(modern().frame("W X Y"), "W X Y");

        let no_prefix = AsiDialect::new(AxisProtocol::LegacyLx4000, None);
        assert_eq!(no_prefix.frame("LOCK X?"), "LOCK X?");
    }

    #[test]
    fn etx_is_stripped_before_parsing() {
        let legacy = modern().with_protocol(AxisProtocol::LegacyLx4000);
        let reply = legacy.parse(":A 5\r\n\x03");
        assert_eq!(reply.payload, "5");
    }

    #[test]
    fn command_builder_formats_values() {
        let cmd = AsiCommand::new("M").fixed("X", 100.0).fixed("Y", -0.5).build();
        assert_eq!(cmd, "M X=100.000000 Y=-0.500000");

        let cmd = AsiCommand::new("LD").rounded("Z", 15.0).build();
        assert_eq!(cmd, "LD Z=15");

        let cmd = AsiCommand::new("WT").arg("X?").build();
        assert_eq!(cmd, "WT X?");

        let cmd = AsiCommand::new("UM").value("X", -10000).value("Y", 10000).build();
        assert_eq!(cmd, "UM X=-10000 Y=10000");
    }
}
