//! Marlin Response Parser
//!
//! Classifies one line of device output into a typed [`DeviceResponse`].
//! The parser keeps a little state because Marlin splits some errors over
//! two lines (`Error:1` then `: Extruder switched off. MAXTEMP triggered !`).

use fdmlink_core::{Axis, Endstop, EndstopSide, FirmwareVersion, TemperatureReading};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Substrings of `Error:` lines that mean the firmware has shut down
pub const FATAL_ERROR_MARKERS: [&str; 5] = [
    "Extruder switched off",
    "Temperature heated bed switched off",
    "Something is wrong, please turn off the printer.",
    "Thermal Runaway",
    "Printer halted",
];

/// Temperature telemetry from an `M105` answer or an `ok T:` line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReport {
    /// Hotend readings with their extruder index
    pub hotends: Vec<(usize, TemperatureReading)>,
    /// Heated bed reading
    pub bed: Option<TemperatureReading>,
}

impl TemperatureReport {
    /// Whether the report carries no readings at all
    pub fn is_empty(&self) -> bool {
        self.hotends.is_empty() && self.bed.is_none()
    }
}

/// Device response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    /// Acknowledgment, optionally carrying temperatures
    Ack(Option<TemperatureReport>),
    /// Retransmit starting at this sequence number
    Resend(u64),
    /// Fatal firmware fault with the device's message
    Fault(String),
    /// Recoverable error report (checksum mismatch, line number, ...)
    Error(String),
    /// Temperature telemetry
    Temperature(TemperatureReport),
    /// Endstop telemetry
    Endstops(Vec<(Endstop, bool)>),
    /// Boot banner or `M115` report announcing the firmware version
    Banner(FirmwareVersion),
    /// Nothing was read
    Empty,
    /// Anything else (`echo:`, `start`, ...)
    Unrecognized(String),
}

impl fmt::Display for DeviceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack(_) => write!(f, "ok"),
            Self::Resend(n) => write!(f, "resend:{}", n),
            Self::Fault(msg) => write!(f, "fault:{}", msg),
            Self::Error(msg) => write!(f, "error:{}", msg),
            Self::Temperature(_) => write!(f, "temperature"),
            Self::Endstops(states) => write!(f, "endstops:{}", states.len()),
            Self::Banner(version) => write!(f, "firmware:{}", version),
            Self::Empty => write!(f, "empty"),
            Self::Unrecognized(line) => write!(f, "unrecognized:{}", line),
        }
    }
}

/// Marlin response parser
#[derive(Debug, Default)]
pub struct ResponseParser {
    /// First half of a split `Error:<digit>` report
    split_error: Option<String>,
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the parser is holding the first half of a split error
    pub fn awaiting_continuation(&self) -> bool {
        self.split_error.is_some()
    }

    /// Parse one line of device output
    ///
    /// Returns `None` while waiting for the second half of a split error.
    pub fn parse(&mut self, line: &str) -> Option<DeviceResponse> {
        let line = line.trim();

        if let Some(head) = self.split_error.take() {
            return Some(classify_error(&format!("{}{}", head, line)));
        }

        if line.is_empty() {
            return Some(DeviceResponse::Empty);
        }

        if line.starts_with("Error:") {
            if is_split_error_head(line) {
                self.split_error = Some(line.to_string());
                return None;
            }
            return Some(classify_error(line));
        }

        if is_ack(line) {
            let temps = parse_temperatures(line).filter(|t| !t.is_empty());
            return Some(DeviceResponse::Ack(temps));
        }

        if let Some(sequence) = parse_resend(line) {
            return Some(DeviceResponse::Resend(sequence));
        }

        if let Some(version) = FirmwareVersion::from_banner(line) {
            return Some(DeviceResponse::Banner(version));
        }

        if line.starts_with("T:") || line.contains(" T:") || line.starts_with("T0:") {
            if let Some(report) = parse_temperatures(line) {
                return Some(DeviceResponse::Temperature(report));
            }
        }

        if line.contains("_min") || line.contains("_max") {
            let states = parse_endstops(line);
            if !states.is_empty() {
                return Some(DeviceResponse::Endstops(states));
            }
        }

        Some(DeviceResponse::Unrecognized(line.to_string()))
    }
}

/// `Error:` followed by nothing but a single digit
fn is_split_error_head(line: &str) -> bool {
    line.strip_prefix("Error:")
        .is_some_and(|rest| rest.len() == 1 && rest.chars().all(|c| c.is_ascii_digit()))
}

fn classify_error(line: &str) -> DeviceResponse {
    let message = line
        .strip_prefix("Error:")
        .unwrap_or(line)
        .trim()
        .to_string();
    if FATAL_ERROR_MARKERS.iter().any(|marker| line.contains(marker)) {
        DeviceResponse::Fault(message)
    } else {
        DeviceResponse::Error(message)
    }
}

fn is_ack(line: &str) -> bool {
    line == "ok" || line.starts_with("ok ") || line.starts_with("ok:")
}

/// Sequence number from `Resend: 12`, `Resend:N12`, `rs 12` or `rs N12`
fn parse_resend(line: &str) -> Option<u64> {
    let lower = line.to_ascii_lowercase();
    let rest = if let Some(rest) = lower.strip_prefix("resend") {
        rest
    } else if let Some(rest) = lower.strip_prefix("rs") {
        if !rest.starts_with([' ', ':']) && !rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        rest
    } else {
        return None;
    };

    rest.replace(['n', ':'], " ")
        .split_whitespace()
        .last()
        .and_then(|n| n.parse().ok())
}

/// Temperatures from `T:<m> /<t> B:<m> /<t> T0:<m> /<t> ...`
///
/// When per-extruder `T<i>:` readings are present they win over the plain
/// `T:` reading, which otherwise maps to extruder 0.
pub fn parse_temperatures(line: &str) -> Option<TemperatureReport> {
    let mut tokens: Vec<String> = Vec::new();
    for word in line.split_whitespace() {
        match tokens.last_mut() {
            Some(last) if word.starts_with('/') => last.push_str(word),
            _ => tokens.push(word.to_string()),
        }
    }

    let mut plain = None;
    let mut indexed = Vec::new();
    let mut bed = None;

    for token in &tokens {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        let Some(reading) = parse_reading(value) else {
            continue;
        };
        match key {
            "T" => plain = Some(reading),
            "B" => bed = Some(reading),
            _ => {
                if let Some(index) = key.strip_prefix('T').and_then(|i| i.parse::<usize>().ok()) {
                    indexed.push((index, reading));
                }
            }
        }
    }

    let hotends = if indexed.is_empty() {
        plain.map(|r| vec![(0, r)]).unwrap_or_default()
    } else {
        indexed
    };

    if hotends.is_empty() && bed.is_none() {
        return None;
    }
    Some(TemperatureReport { hotends, bed })
}

fn parse_reading(value: &str) -> Option<TemperatureReading> {
    let (measured, target) = match value.split_once('/') {
        Some((m, t)) => (m, t.parse::<f64>().ok()),
        None => (value, None),
    };
    measured
        .parse::<f64>()
        .ok()
        .map(|m| TemperatureReading::new(m, target))
}

/// Endstop states from `x_min: TRIGGERED` or `x_min:H y_max:L`
///
/// A switch counts as triggered when its value contains `H` or
/// `TRIGGERED`.
pub fn parse_endstops(line: &str) -> Vec<(Endstop, bool)> {
    let mut found: Vec<(usize, Endstop, usize)> = Vec::new();
    for (axis_char, axis) in [('x', Axis::X), ('y', Axis::Y), ('z', Axis::Z)] {
        for (suffix, side) in [("_min:", EndstopSide::Min), ("_max:", EndstopSide::Max)] {
            let tag = format!("{}{}", axis_char, suffix);
            if let Some(start) = line.find(&tag) {
                found.push((start, Endstop::new(axis, side), start + tag.len()));
            }
        }
    }
    found.sort_by_key(|(start, _, _)| *start);

    found
        .iter()
        .enumerate()
        .map(|(i, (_, endstop, value_start))| {
            let value_end = found.get(i + 1).map(|(s, _, _)| *s).unwrap_or(line.len());
            let value = line[*value_start..value_end].trim();
            (*endstop, value.contains('H') || value.contains("TRIGGERED"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> DeviceResponse {
        ResponseParser::new().parse(line).unwrap()
    }

    #[test]
    fn test_parse_ok() {
        assert_eq!(parse("ok"), DeviceResponse::Ack(None));
        assert_eq!(parse("ok N12 P15 B3"), DeviceResponse::Ack(None));

        match parse("ok T:210.5 /215.0 B:60.1 /60.0 @:127") {
            DeviceResponse::Ack(Some(report)) => {
                assert_eq!(report.hotends, vec![(0, TemperatureReading::new(210.5, Some(215.0)))]);
                assert_eq!(report.bed, Some(TemperatureReading::new(60.1, Some(60.0))));
            }
            other => panic!("Expected ack with temperatures, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_resend() {
        assert_eq!(parse("Resend: 3"), DeviceResponse::Resend(3));
        assert_eq!(parse("Resend:N17"), DeviceResponse::Resend(17));
        assert_eq!(parse("rs 3"), DeviceResponse::Resend(3));
        assert_eq!(parse("rs N42"), DeviceResponse::Resend(42));
        assert!(matches!(parse("rsomething"), DeviceResponse::Unrecognized(_)));
    }

    #[test]
    fn test_split_error_joined() {
        let mut parser = ResponseParser::new();
        assert_eq!(parser.parse("Error:1"), None);
        assert!(parser.awaiting_continuation());
        assert_eq!(
            parser.parse(": Extruder switched off. MAXTEMP triggered !"),
            Some(DeviceResponse::Fault(
                "1: Extruder switched off. MAXTEMP triggered !".to_string()
            ))
        );
        assert!(!parser.awaiting_continuation());
    }

    #[test]
    fn test_fatal_and_recoverable_errors() {
        assert_eq!(
            parse("Error: Temperature heated bed switched off. MAXTEMP triggered !!"),
            DeviceResponse::Fault(
                "Temperature heated bed switched off. MAXTEMP triggered !!".to_string()
            )
        );
        assert_eq!(
            parse("Error:checksum mismatch, Last Line: 5"),
            DeviceResponse::Error("checksum mismatch, Last Line: 5".to_string())
        );
    }

    #[test]
    fn test_parse_temperatures_per_extruder() {
        let line = "T:200.0 /200.0 B:55.0 /60.0 T0:200.0 /200.0 T1:31.2 /0.0 @:0 B@:0";
        match parse(line) {
            DeviceResponse::Temperature(report) => {
                assert_eq!(report.hotends.len(), 2);
                assert_eq!(report.hotends[1], (1, TemperatureReading::new(31.2, Some(0.0))));
                assert_eq!(report.bed.map(|b| b.measured), Some(55.0));
            }
            other => panic!("Expected temperatures, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_endstops() {
        let x_min = Endstop::new(Axis::X, EndstopSide::Min);
        assert_eq!(parse("x_min: TRIGGERED"), DeviceResponse::Endstops(vec![(x_min, true)]));
        assert_eq!(parse("x_min: open"), DeviceResponse::Endstops(vec![(x_min, false)]));

        let states = parse_endstops("x_min:L y_min:H z_max:L");
        assert_eq!(states.len(), 3);
        assert_eq!(states[1], (Endstop::new(Axis::Y, EndstopSide::Min), true));
        assert!(!states[2].1);
    }

    #[test]
    fn test_parse_banner() {
        assert_eq!(
            parse("v01.02.00"),
            DeviceResponse::Banner(FirmwareVersion::new(1, 2, 0))
        );
        assert!(matches!(parse("echo:SD card ok"), DeviceResponse::Unrecognized(_)));
        assert!(matches!(parse("start"), DeviceResponse::Unrecognized(_)));
        assert_eq!(parse("   "), DeviceResponse::Empty);
    }
}
