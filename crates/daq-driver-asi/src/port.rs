//! Controller access shared by every ASI device.
//!
//! An [`AsiPort`] pairs the shared [`SerialEndpoint`] of a controller with the
//! [`AsiDialect`] this particular card answers in. The dialect starts out modern and is
//! switched to the LX-4000 framing by [`AsiPort::check_device_status`] when only the
//! legacy protocol gets an answer.

use daq_core::codec::{lenient_f64, AsiDialect, AxisProtocol, CommandReply, Dialect};
use daq_core::detect::{self, DetectionPlan, DetectionStatus};
use daq_core::error::{DaqError, Result};
use daq_core::transport::SerialEndpoint;
use parking_lot::Mutex;
use std::time::Duration;

/// Baud rate ASI controllers ship with.
pub const ASI_DEFAULT_BAUD: u32 = 9600;

/// Look for an ASI controller on `endpoint`: a status query at 9600 baud must be answered.
pub async fn detect_controller(endpoint: &SerialEndpoint, answer_timeout: Duration) -> DetectionStatus {
    let plan = DetectionPlan {
        baud_rates: vec![ASI_DEFAULT_BAUD],
        answer_timeout,
        settle: Duration::ZERO,
    };
    detect::detect(endpoint, &plan, |endpoint| async move {
        endpoint.query("/", "\r", "\r\n").await.map(|_| ())
    })
    .await
}

/// One card on an ASI controller.
pub struct AsiPort {
    endpoint: SerialEndpoint,
    dialect: Mutex<AsiDialect>,
}

impl AsiPort {
    /// `legacy_prefix` is the LX-4000 card address (`2H` for XY, `1H` for Z), if the card
    /// has one.
    pub fn new(endpoint: SerialEndpoint, legacy_prefix: Option<&'static str>) -> Self {
        Self {
            endpoint,
            dialect: Mutex::new(AsiDialect::new(AxisProtocol::Modern, legacy_prefix)),
        }
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    pub fn endpoint(&self) -> &SerialEndpoint {
        &self.endpoint
    }

    pub fn protocol(&self) -> AxisProtocol {
        self.dialect.lock().protocol()
    }

    pub fn dialect(&self) -> AsiDialect {
        *self.dialect.lock()
    }

    fn set_protocol(&self, protocol: AxisProtocol) {
        let mut dialect = self.dialect.lock();
        *dialect = dialect.with_protocol(protocol);
    }

    /// Discard whatever is waiting in the receive buffer.
    pub async fn clear_port(&self) -> Result<()> {
        self.endpoint.purge().await
    }

    /// Send `command` and return the reply text without its terminator.
    pub async fn query(&self, command: &str) -> Result<String> {
        let dialect = self.dialect();
        self.endpoint
            .query(
                &dialect.frame(command),
                dialect.send_terminator(),
                dialect.receive_terminator(),
            )
            .await
    }

    /// Send `command` and classify the reply.
    pub async fn query_reply(&self, command: &str) -> Result<CommandReply> {
        let raw = self.query(command).await?;
        Ok(self.dialect().parse(&raw))
    }

    /// Send `command` and require `:A` at the very start of the reply.
    pub async fn query_ack(&self, command: &str) -> Result<()> {
        let reply = self.query_reply(command).await?;
        if reply.raw.starts_with(":A") {
            return Ok(());
        }
        match reply.into_result() {
            // Acknowledged at offset 1 only
            Ok(_) => Err(DaqError::Protocol(command.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Send `command`, read its reply, then collect the CR-terminated lines that follow.
    ///
    /// Used by commands that dump tables after acknowledging. Collection ends at the first
    /// failed read (the device simply stops talking) or after `max_lines` lines.
    pub async fn query_dump(&self, command: &str, max_lines: usize) -> Result<Vec<String>> {
        let dialect = self.dialect();
        let session = self.endpoint.session().await;
        session
            .query(
                &dialect.frame(command),
                dialect.send_terminator(),
                dialect.receive_terminator(),
            )
            .await?;
        let mut lines = Vec::new();
        while lines.len() < max_lines {
            match session.receive("\r").await {
                Ok(line) => lines.push(line),
                Err(e) => {
                    tracing::debug!(port = self.name(), lines = lines.len(), error = %e, "Dump ended");
                    break;
                }
            }
        }
        Ok(lines)
    }

    /// Probe which protocol the card speaks.
    ///
    /// `/` is sent in modern framing first; if that gets no answer and the card has a
    /// legacy prefix, the LX-4000 framing is tried. The working protocol is kept.
    pub async fn check_device_status(&self) -> Result<AxisProtocol> {
        self.set_protocol(AxisProtocol::Modern);
        let modern = self.query("/").await;
        if modern.is_ok() {
            return Ok(AxisProtocol::Modern);
        }

        if self.dialect().legacy_prefix().is_none() {
            return Err(DaqError::ProtocolMismatch(format!(
                "{}: no answer to status query",
                self.name()
            )));
        }

        self.set_protocol(AxisProtocol::LegacyLx4000);
        match self.query("/").await {
            Ok(_) => {
                tracing::info!(port = self.name(), "Controller speaks the LX-4000 protocol");
                Ok(AxisProtocol::LegacyLx4000)
            }
            Err(e) => {
                self.set_protocol(AxisProtocol::Modern);
                Err(DaqError::ProtocolMismatch(format!(
                    "{}: no answer in modern or legacy framing ({e})",
                    self.name()
                )))
            }
        }
    }

    /// Whether the firmware knows `command`.
    ///
    /// Only `:N-1` (unknown command) or a failed exchange count as "no".
    pub async fn has_command(&self, command: &str) -> bool {
        match self.query(command).await {
            Ok(raw) => !raw.starts_with(":N-1"),
            Err(_) => false,
        }
    }

    /// Read one numeric controller setting.
    ///
    /// Firmware answers setting queries either as `:X <value>` or `:A X=<value>`.
    pub async fn query_setting(&self, command: &str) -> Result<f64> {
        let raw = self.query(command).await?;
        parse_setting(&self.dialect(), &raw)
    }
}

/// Decode a setting reply in either `:X <value>` or `:A X=<value>` form.
pub fn parse_setting(dialect: &AsiDialect, raw: &str) -> Result<f64> {
    if let Some(rest) = raw.strip_prefix(":X") {
        return Ok(lenient_f64(rest));
    }

    let reply = dialect.parse(raw);
    let payload = reply.into_result()?;
    let value = payload
        .split_once('=')
        .map_or(payload.as_str(), |(_, v)| v);
    Ok(lenient_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::mock::ScriptedTransport;
    use std::sync::Arc;

    fn port(prefix: Option<&'static str>) -> (Arc<ScriptedTransport>, AsiPort) {
        let mock = Arc::new(ScriptedTransport::new("COM1"));
        let port = AsiPort::new(SerialEndpoint::new(mock.clone()), prefix);
        (mock, port)
    }

    #[tokio::test]
    async fn modern_status_answer_keeps_modern_framing() {
        let (mock, port) = port(Some("2H"));
        mock.expect("/", "N");

        assert_eq!(port.check_device_status().await.unwrap(), AxisProtocol::Modern);
        assert_eq!(mock.sent()[0].terminator, "\r");
    }

    #[tokio::test]
    async fn silent_modern_falls_back_to_legacy_prefix() {
        let (mock, port) = port(Some("2H"));
        mock.expect_silence("/").expect("2H/", "N");

        assert_eq!(
            port.check_device_status().await.unwrap(),
            AxisProtocol::LegacyLx4000
        );
        assert_eq!(mock.sent_commands(), vec!["/", "2H/"]);

        mock.expect("2HW X Y", ":A 1 2");
        assert_eq!(port.query("W X Y").await.unwrap(), ":A 1 2");
    }

    #[tokio::test]
    async fn no_prefix_means_protocol_mismatch() {
        let (mock, port) = port(None);
        mock.expect_silence("/");

        let err = port.check_device_status().await.unwrap_err();
        assert!(matches!(err, DaqError::ProtocolMismatch(_)));
        assert_eq!(mock.sent_commands(), vec!["/"]);
    }

    #[tokio::test]
    async fn ack_must_lead_the_reply() {
        let (mock, port) = port(None);
        mock.expect("H X=0 Y=0", ":A")
            .expect("MC X+ Y+", " :A")
            .expect("UM X=1", ":N-3");

        assert!(port.query_ack("H X=0 Y=0").await.is_ok());
        assert!(matches!(
            port.query_ack("MC X+ Y+").await,
            Err(DaqError::Protocol(_))
        ));
        assert_eq!(
            port.query_ack("UM X=1").await.unwrap_err(),
            DaqError::Device { code: 10097 }
        );
    }

    #[tokio::test]
    async fn feature_probe_reads_only_unknown_command_as_missing() {
        let (mock, port) = port(None);
        mock.expect("WT X?", ":A 10")
            .expect("S X?", ":N-1")
            .expect("B X?", ":X 0.04")
            .expect_silence("E X?");

        assert!(port.has_command("WT X?").await);
        assert!(!port.has_command("S X?").await);
        assert!(port.has_command("B X?").await);
        assert!(!port.has_command("E X?").await);
    }

    #[tokio::test]
    async fn detection_probes_status_at_9600() {
        let mock = Arc::new(ScriptedTransport::new("COM7"));
        mock.expect("/", "N");
        let endpoint = SerialEndpoint::new(mock.clone());

        let status = detect_controller(&endpoint, Duration::from_millis(300)).await;
        assert_eq!(status, DetectionStatus::CanCommunicate { baud_rate: 9600 });
        assert_eq!(mock.sent_commands(), vec!["/"]);
    }

    #[test]
    fn settings_parse_in_both_reply_forms() {
        let dialect = AsiDialect::new(AxisProtocol::Modern, None);
        assert_eq!(parse_setting(&dialect, ":X 12").unwrap(), 12.0);
        assert_eq!(parse_setting(&dialect, ":A X=1.25").unwrap(), 1.25);
        assert_eq!(parse_setting(&dialect, ":A 0.5").unwrap(), 0.5);
        assert_eq!(
            parse_setting(&dialect, ":N-2").unwrap_err(),
            DaqError::Device { code: 10098 }
        );
        assert!(parse_setting(&dialect, "what").is_err());
    }

    #[tokio::test]
    async fn dump_skips_reply_and_stops_at_first_failed_read() {
        let (mock, port) = port(None);
        mock.expect_lines("LK F=97", &[":A", "a", "b"]);

        let lines = port.query_dump("LK F=97", 100).await.unwrap();
        assert_eq!(lines, vec!["a", "b"]);

        mock.expect_lines("LK F=97", &[":A", "a", "b", "c"]);
        assert_eq!(port.query_dump("LK F=97", 2).await.unwrap(), vec!["a", "b"]);
    }
}
