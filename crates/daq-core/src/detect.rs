//! Device detection by baud-rate cycling.
//!
//! [`detect`] forces conservative line settings (no handshake, one stop bit, no
//! inter-character delay, a short answer timeout), then tries each candidate baud rate:
//! set it, purge, run the family-specific probe. The first probe that succeeds wins.
//! The port's original answer timeout is restored on every exit path.

use crate::error::Result;
use crate::transport::{PortParameter, SerialEndpoint};
use std::future::Future;
use std::time::Duration;

/// Outcome of a detection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStatus {
    /// The port name is empty or a placeholder
    Misconfigured,
    /// No baud rate produced a valid answer
    CanNotCommunicate,
    /// The probe succeeded at this baud rate
    CanCommunicate { baud_rate: u32 },
}

/// How to look for one device family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionPlan {
    /// Candidates in the order they are tried
    pub baud_rates: Vec<u32>,
    /// Answer timeout used while probing
    pub answer_timeout: Duration,
    /// Pause after switching baud rate, before the port is purged
    pub settle: Duration,
}

/// Placeholder names a host leaves in an unassigned port property.
const PLACEHOLDER_PORTS: &[&str] = &["", "undefined", "unknown"];

/// Whether `port` names a real port.
pub fn is_configured_port(port: &str) -> bool {
    let trimmed = port.trim();
    !PLACEHOLDER_PORTS
        .iter()
        .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Cycle through `plan.baud_rates` until `probe` succeeds.
pub async fn detect<F, Fut>(endpoint: &SerialEndpoint, plan: &DetectionPlan, mut probe: F) -> DetectionStatus
where
    F: FnMut(SerialEndpoint) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !is_configured_port(endpoint.name()) {
        return DetectionStatus::Misconfigured;
    }

    let saved_timeout = endpoint.settings().answer_timeout;
    let status = async {
        for parameter in [
            PortParameter::Handshaking(false),
            PortParameter::StopBits(1),
            PortParameter::AnswerTimeout(plan.answer_timeout),
            PortParameter::DelayBetweenChars(Duration::ZERO),
        ] {
            endpoint.set_parameter(parameter).await?;
        }

        for &baud_rate in &plan.baud_rates {
            endpoint.set_parameter(PortParameter::BaudRate(baud_rate)).await?;
            if !plan.settle.is_zero() {
                tokio::time::sleep(plan.settle).await;
            }
            endpoint.purge().await?;

            match probe(endpoint.clone()).await {
                Ok(()) => {
                    tracing::info!(port = endpoint.name(), baud_rate, "Device detected");
                    return Ok(DetectionStatus::CanCommunicate { baud_rate });
                }
                Err(e) => {
                    tracing::debug!(port = endpoint.name(), baud_rate, error = %e, "Probe failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        Ok::<_, crate::error::DaqError>(DetectionStatus::CanNotCommunicate)
    }
    .await
    .unwrap_or_else(|e| {
        tracing::warn!(port = endpoint.name(), error = %e, "Detection aborted");
        DetectionStatus::CanNotCommunicate
    });

    if let Err(e) = endpoint
        .set_parameter(PortParameter::AnswerTimeout(saved_timeout))
        .await
    {
        tracing::warn!(port = endpoint.name(), error = %e, "Could not restore answer timeout");
    }
    status
}
