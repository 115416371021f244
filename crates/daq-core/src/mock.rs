//! Scripted transport for driver tests.
//!
//! [`ScriptedTransport`] stands in for a serial port at the [`Transport`] level. The test
//! scripts what the device answers to each command and afterwards inspects what the
//! driver sent:
//!
//! - **expectations** are consumed in order; a command matching the front expectation
//!   queues that expectation's reply lines
//! - **rules** answer a command every time it is seen, for as long as the test lives
//! - a **responder** closure computes replies for anything else (echoing stages etc.)
//!
//! A command nothing answers is recorded in [`ScriptedTransport::unexpected`] and the next
//! `receive` fails with a communication error, just as a silent device would time out.
//! The mock never panics; tests assert on the recorded traffic instead.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = Arc::new(ScriptedTransport::new("COM1"));
//! mock.expect("W X Y", ":A 100 200");
//! mock.on("/", "N");
//!
//! let endpoint = SerialEndpoint::new(mock.clone());
//! // ... drive the device ...
//! assert_eq!(mock.sent_commands(), vec!["W X Y", "/"]);
//! assert!(mock.unexpected().is_empty());
//! ```

use crate::error::{DaqError, Result};
use crate::transport::{PortParameter, PortSettings, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

type Responder = Box<dyn FnMut(&str) -> Option<Vec<String>> + Send>;

/// One command written by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub text: String,
    pub terminator: String,
}

#[derive(Debug, Clone)]
struct Expectation {
    command: String,
    replies: Vec<String>,
}

#[derive(Default)]
struct ScriptState {
    expectations: VecDeque<Expectation>,
    rules: Vec<Expectation>,
    responder: Option<Responder>,
    pending: VecDeque<String>,
    sent: Vec<SentCommand>,
    unexpected: Vec<String>,
    parameters: Vec<PortParameter>,
    purges: usize,
    settings: PortSettings,
}

/// In-memory [`Transport`] driven by a script.
pub struct ScriptedTransport {
    name: String,
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Answer the next occurrence of `command` with one reply line.
    pub fn expect(&self, command: &str, reply: &str) -> &Self {
        self.expect_lines(command, &[reply])
    }

    /// Answer the next occurrence of `command` with several reply lines.
    pub fn expect_lines(&self, command: &str, replies: &[&str]) -> &Self {
        self.state.lock().expectations.push_back(Expectation {
            command: command.to_string(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
        });
        self
    }

    /// Accept the next occurrence of `command` without answering.
    pub fn expect_silence(&self, command: &str) -> &Self {
        self.expect_lines(command, &[])
    }

    /// Answer every occurrence of `command` with `reply`.
    ///
    /// A later rule for the same command replaces the earlier one.
    pub fn on(&self, command: &str, reply: &str) -> &Self {
        let mut state = self.state.lock();
        state.rules.retain(|rule| rule.command != command);
        state.rules.push(Expectation {
            command: command.to_string(),
            replies: vec![reply.to_string()],
        });
        self
    }

    /// Compute replies for commands not covered by expectations or rules.
    pub fn with_responder<F>(&self, responder: F) -> &Self
    where
        F: FnMut(&str) -> Option<Vec<String>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
        self
    }

    /// Everything written, with terminators.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.state.lock().sent.clone()
    }

    /// Command texts written, in order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|s| s.text.clone()).collect()
    }

    /// How often `command` was written.
    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|s| s.text == command)
            .count()
    }

    /// Commands that nothing in the script answered.
    pub fn unexpected(&self) -> Vec<String> {
        self.state.lock().unexpected.clone()
    }

    /// Expectations not consumed yet.
    pub fn remaining_expectations(&self) -> Vec<String> {
        self.state
            .lock()
            .expectations
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    pub fn purge_count(&self) -> usize {
        self.state.lock().purges
    }

    /// Parameters set through the transport, in order.
    pub fn parameters(&self) -> Vec<PortParameter> {
        self.state.lock().parameters.clone()
    }

    /// Forget recorded traffic; the script itself is kept.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.unexpected.clear();
        state.parameters.clear();
        state.purges = 0;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, text: &str, terminator: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.sent.push(SentCommand {
            text: text.to_string(),
            terminator: terminator.to_string(),
        });

        let front_matches = state
            .expectations
            .front()
            .is_some_and(|e| e.command == text);
        let replies = if front_matches {
            state.expectations.pop_front().map(|e| e.replies)
        } else if let Some(rule) = state.rules.iter().find(|r| r.command == text) {
            Some(rule.replies.clone())
        } else if let Some(responder) = state.responder.as_mut() {
            responder(text)
        } else {
            None
        };

        match replies {
            Some(lines) => state.pending.extend(lines),
            None => state.unexpected.push(text.to_string()),
        }
        Ok(())
    }

    async fn receive(&self, _terminator: &str) -> Result<String> {
        self.state
            .lock()
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::communication(self.name.clone(), "no reply from scripted device"))
    }

    async fn purge(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.purges += 1;
        state.pending.clear();
        Ok(())
    }

    async fn set_parameter(&self, parameter: PortParameter) -> Result<()> {
        let mut state = self.state.lock();
        state.parameters.push(parameter);
        state.settings.apply(parameter);
        Ok(())
    }

    fn settings(&self) -> PortSettings {
        self.state.lock().settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expectations_are_consumed_in_order() {
        let mock = ScriptedTransport::new("COM1");
        mock.expect("A", "1").expect("A", "2");

        tokio_test::assert_ok!(mock.send("A", "\r").await);
        assert_eq!(tokio_test::assert_ok!(mock.receive("\r\n").await), "1");
        mock.send("A", "\r").await.unwrap();
        assert_eq!(mock.receive("\r\n").await.unwrap(), "2");
        assert!(mock.remaining_expectations().is_empty());
    }

    #[tokio::test]
    async fn rules_repeat_and_responder_falls_back() {
        let mock = ScriptedTransport::new("COM1");
        mock.on("/", "N");
        mock.with_responder(|cmd| Some(vec![format!(":A {cmd}")]));

        for _ in 0..3 {
            mock.send("/", "\r").await.unwrap();
            assert_eq!(mock.receive("\r\n").await.unwrap(), "N");
        }
        mock.send("W X", "\r").await.unwrap();
        assert_eq!(mock.receive("\r\n").await.unwrap(), ":A W X");
        assert_eq!(mock.count("/"), 3);
    }

    #[tokio::test]
    async fn unanswered_command_is_recorded_and_receive_fails() {
        let mock = ScriptedTransport::new("COM1");
        mock.send("HALT", "\r").await.unwrap();

        assert!(mock.receive("\r\n").await.unwrap_err().is_link_failure());
        assert_eq!(mock.unexpected(), vec!["HALT".to_string()]);
    }

    #[tokio::test]
    async fn purge_drops_pending_replies() {
        let mock = ScriptedTransport::new("COM1");
        mock.expect_lines("LK F=97", &["a", "b"]);
        mock.send("LK F=97", "\r").await.unwrap();
        mock.purge().await.unwrap();

        assert!(mock.receive("\r").await.is_err());
        assert_eq!(mock.purge_count(), 1);
    }
}
