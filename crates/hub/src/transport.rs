//! Sensor link: the line-delimited JSON codec shared by the MQTT and serial
//! transports, plus the serial line reader.
//!
//! The controller hardware speaks one JSON object per line:
//!
//! ```text
//! {"pH": 6.84}
//! {"pump": "basic"}    // or "acidic" / "off"
//! ```
//!
//! Anything else is ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::controller::PumpType;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LinkMessage {
    /// A pH sample from the probe.
    Ph(f64),
    /// Pump state as reported by the controller hardware.
    Pump(PumpReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpReport {
    On(PumpType),
    Off,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "pH")]
    ph: Option<serde_json::Value>,
    pump: Option<String>,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Parse one transport line. Malformed or unknown lines yield `None`.
pub(crate) fn parse_line(line: &str) -> Option<LinkMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawLine = serde_json::from_str(line).ok()?;

    if let Some(v) = raw.ph {
        let value = v.as_f64().filter(|f| f.is_finite())?;
        return Some(LinkMessage::Ph(value));
    }

    let pump = raw.pump?;
    match pump.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LinkMessage::Pump(PumpReport::Off)),
        other => other.parse().ok().map(|p| LinkMessage::Pump(PumpReport::On(p))),
    }
}

/// Extract node_id from "tele/<node_id>/ph".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "ph" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Serial line reader
// ---------------------------------------------------------------------------

/// Open a serial device (already configured for baud rate, e.g. with
/// `stty`) as a byte stream.
pub(crate) async fn open_serial(path: &str) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open serial device: {path}"))
}

/// Read lines from `reader` until EOF, forwarding every parseable message.
/// Returns the number of lines that were dropped as malformed.
pub(crate) async fn forward_lines<R>(reader: R, tx: mpsc::Sender<LinkMessage>) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut dropped = 0;

    while let Some(line) = lines.next_line().await.context("serial read failed")? {
        match parse_line(&line) {
            Some(msg) => {
                if tx.send(msg).await.is_err() {
                    // receiver gone; nothing left to feed
                    break;
                }
            }
            None => {
                if !line.trim().is_empty() {
                    dropped += 1;
                    tracing::debug!(line = %line.trim(), "ignoring malformed link line");
                }
            }
        }
    }

    Ok(dropped)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_line ---------------------------------------------------------

    #[test]
    fn parse_ph_line() {
        assert_eq!(parse_line(r#"{"pH": 6.84}"#), Some(LinkMessage::Ph(6.84)));
    }

    #[test]
    fn parse_ph_integer() {
        assert_eq!(parse_line(r#"{"pH":7}"#), Some(LinkMessage::Ph(7.0)));
    }

    #[test]
    fn parse_ph_with_whitespace_and_crlf() {
        assert_eq!(parse_line("  {\"pH\": 5.5}\r\n"), Some(LinkMessage::Ph(5.5)));
    }

    #[test]
    fn parse_ph_out_of_scale_is_kept() {
        assert_eq!(parse_line(r#"{"pH": 14.3}"#), Some(LinkMessage::Ph(14.3)));
    }

    #[test]
    fn parse_ph_string_is_ignored() {
        assert_eq!(parse_line(r#"{"pH": "6.8"}"#), None);
    }

    #[test]
    fn parse_pump_reports() {
        assert_eq!(
            parse_line(r#"{"pump": "basic"}"#),
            Some(LinkMessage::Pump(PumpReport::On(PumpType::Basic)))
        );
        assert_eq!(
            parse_line(r#"{"pump": "ACIDIC"}"#),
            Some(LinkMessage::Pump(PumpReport::On(PumpType::Acidic)))
        );
        assert_eq!(
            parse_line(r#"{"pump": "off"}"#),
            Some(LinkMessage::Pump(PumpReport::Off))
        );
    }

    #[test]
    fn parse_unknown_pump_is_ignored() {
        assert_eq!(parse_line(r#"{"pump": "flush"}"#), None);
    }

    #[test]
    fn parse_garbage_is_ignored() {
        assert_eq!(parse_line("pH=6.8"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("{}"), None);
        assert_eq!(parse_line(r#"{"temp": 21.5}"#), None);
        assert_eq!(parse_line("[1,2,3]"), None);
    }

    // -- extract_node_id ----------------------------------------------------

    #[test]
    fn extract_node_id_valid_topic() {
        assert_eq!(extract_node_id("tele/probe-a/ph"), Some("probe-a"));
    }

    #[test]
    fn extract_node_id_wrong_suffix() {
        assert_eq!(extract_node_id("tele/probe-a/reading"), None);
    }

    #[test]
    fn extract_node_id_wrong_shape() {
        assert_eq!(extract_node_id("tele/ph"), None);
        assert_eq!(extract_node_id("tele//ph"), None);
        assert_eq!(extract_node_id("tele/a/b/ph"), None);
        assert_eq!(extract_node_id(""), None);
    }

    // -- forward_lines ------------------------------------------------------

    #[tokio::test]
    async fn forward_lines_skips_malformed() {
        let input: &[u8] = b"{\"pH\": 6.9}\nnot json\n\n{\"pump\":\"off\"}\n{\"pH\": 7.1}";
        let (tx, mut rx) = mpsc::channel(8);

        let dropped = forward_lines(input, tx).await.unwrap();
        assert_eq!(dropped, 1);

        assert_eq!(rx.recv().await, Some(LinkMessage::Ph(6.9)));
        assert_eq!(rx.recv().await, Some(LinkMessage::Pump(PumpReport::Off)));
        assert_eq!(rx.recv().await, Some(LinkMessage::Ph(7.1)));
        assert_eq!(rx.recv().await, None);
    }
}
