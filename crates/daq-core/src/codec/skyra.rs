//! Cobolt / Skyra laser dialect.
//!
//! Protocol Overview:
//! - Format: ASCII, queries end in `?`, setters take a space separated argument
//! - Command terminator: CR (`\r`)
//! - Reply terminator: CR+LF (`\r\n`)
//! - Multi-laser units address one laser by prefixing its single digit slot (`2p?`)
//! - Unknown commands answer `Syntax error: illegal command`; every other reply,
//!   including the bare `OK` of setters, counts as accepted

use super::{strip_line_end, CommandReply, Dialect, ReplyStatus};

/// Reply the controller gives for commands it does not know.
pub const UNSUPPORTED_REPLY: &str = "Syntax error: illegal command";

/// Skyra framing. Stateless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkyraDialect;

impl SkyraDialect {
    /// Address `verb` to one laser slot, e.g. `addressed("2", "p?")` gives `2p?`.
    pub fn addressed(laser_id: &str, verb: &str) -> String {
        format!("{laser_id}{verb}")
    }
}

impl Dialect for SkyraDialect {
    fn send_terminator(&self) -> &'static str {
        "\r"
    }

    fn receive_terminator(&self) -> &'static str {
        "\r\n"
    }

    fn frame(&self, command: &str) -> String {
        command.to_string()
    }

    fn parse(&self, reply: &str) -> CommandReply {
        let text = strip_line_end(reply).trim();
        let status = if text == UNSUPPORTED_REPLY {
            ReplyStatus::Nak
        } else {
            ReplyStatus::Ack
        };
        CommandReply {
            status,
            error_code: None,
            payload: text.to_string(),
            raw: text.to_string(),
        }
    }
}
