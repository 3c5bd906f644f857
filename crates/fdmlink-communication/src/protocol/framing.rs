//! Line preparation and checksum framing
//!
//! Every program line goes out as `N<seq> <payload>*<checksum>\n`. The
//! checksum is the XOR of all bytes of `N<seq> <payload>` and is computed
//! on every transmission, so a line replayed under a new sequence number
//! always carries a fresh checksum.

use std::fmt;

/// Harmless command sent in place of lines that must not reach the device
pub const KEEPALIVE_COMMAND: &str = "M105";

/// Line-number reset placed in front of every program
pub const LINE_NUMBER_RESET: &str = "M110";

/// Display message standing in for a layer boundary comment
const LAYER_MARKER_PREFIX: &str = "M117 LAYER:";

/// XOR checksum of `N<sequence> <payload>`
pub fn checksum(sequence: u64, payload: &str) -> u8 {
    let prefix = format!("N{} ", sequence);
    prefix
        .bytes()
        .chain(payload.bytes())
        .fold(0u8, |acc, byte| acc ^ byte)
}

/// Reduce a raw program line to the payload actually transmitted
///
/// - Text from the first `;` on is dropped and whitespace trimmed.
/// - A bare `;LAYER:<n>` comment becomes `M117 LAYER:<n>`.
/// - Empty lines and the host pause menu commands `M0`/`M1` become
///   [`KEEPALIVE_COMMAND`].
pub fn prepare_line(raw: &str) -> String {
    prepare(raw, true)
}

/// Reduce a caller command to the payload actually transmitted
///
/// Same rules as [`prepare_line`], except that layer comments are not
/// turned into display messages.
pub fn prepare_command(raw: &str) -> String {
    prepare(raw, false)
}

fn prepare(raw: &str, layer_markers: bool) -> String {
    let (code, comment) = match raw.find(';') {
        Some(index) => (&raw[..index], Some(&raw[index + 1..])),
        None => (raw, None),
    };
    let code = code.trim();

    if code.is_empty() {
        if let Some(layer) = comment
            .filter(|_| layer_markers)
            .and_then(parse_layer_comment)
        {
            return format!("{}{}", LAYER_MARKER_PREFIX, layer);
        }
        return KEEPALIVE_COMMAND.to_string();
    }

    if is_pause_menu(code) {
        return KEEPALIVE_COMMAND.to_string();
    }

    code.to_string()
}

/// Layer number carried by a prepared payload, if it is a layer marker
pub fn layer_marker(payload: &str) -> Option<i64> {
    payload
        .strip_prefix(LAYER_MARKER_PREFIX)
        .and_then(|n| n.trim().parse().ok())
}

fn parse_layer_comment(comment: &str) -> Option<i64> {
    comment
        .trim()
        .strip_prefix("LAYER:")
        .and_then(|n| n.trim().parse().ok())
}

fn is_pause_menu(code: &str) -> bool {
    let word = code.split_whitespace().next().unwrap_or("");
    word.eq_ignore_ascii_case("M0") || word.eq_ignore_ascii_case("M1")
}

/// A numbered, checksummed line ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedLine {
    /// Line number the device will track
    pub sequence: u64,
    /// Prepared payload
    pub payload: String,
    /// XOR checksum of `N<sequence> <payload>`
    pub checksum: u8,
}

impl FramedLine {
    /// Frame `payload` under `sequence`
    pub fn new(sequence: u64, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let checksum = checksum(sequence, &payload);
        Self {
            sequence,
            payload,
            checksum,
        }
    }

    /// Bytes written to the port, newline included
    pub fn to_wire(&self) -> String {
        format!("{}\n", self)
    }

    /// Length of [`to_wire`](Self::to_wire) in bytes
    pub fn wire_len(&self) -> usize {
        self.to_wire().len()
    }
}

impl fmt::Display for FramedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{} {}*{}", self.sequence, self.payload, self.checksum)
    }
}
