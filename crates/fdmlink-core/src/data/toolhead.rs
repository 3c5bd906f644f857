//! Optimistic toolhead tracking
//!
//! The host never asks the device where the head is. Instead every
//! transmitted program line is replayed against this model so pause and
//! resume sequences can be computed from the last *issued* position.

use serde::{Deserialize, Serialize};

/// Last issued toolhead position, feed rate and modal state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolheadState {
    /// X position in mm
    pub x: f64,
    /// Y position in mm
    pub y: f64,
    /// Z position in mm
    pub z: f64,
    /// Filament position in mm
    pub e: f64,
    /// Feed rate in mm/min
    pub f: f64,
    /// `G90` (true) or `G91` (false)
    pub absolute_positioning: bool,
    /// `M83` relative extrusion
    pub relative_extrusion: bool,
    /// Active tool selected with `T<n>`
    pub active_tool: usize,
}

impl Default for ToolheadState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            e: 0.0,
            f: 0.0,
            absolute_positioning: true,
            relative_extrusion: false,
            active_tool: 0,
        }
    }
}

impl ToolheadState {
    /// Create a zeroed state in absolute mode
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `E` words are currently interpreted as deltas
    pub fn extrusion_is_relative(&self) -> bool {
        self.relative_extrusion || !self.absolute_positioning
    }

    /// Replay a transmitted line. Comments must already be stripped.
    ///
    /// Returns `true` when the Z height changed.
    pub fn apply(&mut self, line: &str) -> bool {
        let words = parse_words(line);
        let Some(&(letter, value)) = words.first() else {
            return false;
        };
        let previous_z = self.z;

        match (letter, value as i64) {
            ('G', 0) | ('G', 1) => {
                for &(letter, value) in &words[1..] {
                    match letter {
                        'X' => self.x = self.axis_target(self.x, value),
                        'Y' => self.y = self.axis_target(self.y, value),
                        'Z' => self.z = self.axis_target(self.z, value),
                        'E' => {
                            self.e = if self.extrusion_is_relative() {
                                self.e + value
                            } else {
                                value
                            }
                        }
                        'F' => self.f = value,
                        _ => {}
                    }
                }
            }
            ('G', 28) => {
                let axes: Vec<char> = words[1..]
                    .iter()
                    .map(|(l, _)| *l)
                    .filter(|l| matches!(l, 'X' | 'Y' | 'Z'))
                    .collect();
                if axes.is_empty() || axes.contains(&'X') {
                    self.x = 0.0;
                }
                if axes.is_empty() || axes.contains(&'Y') {
                    self.y = 0.0;
                }
                if axes.is_empty() || axes.contains(&'Z') {
                    self.z = 0.0;
                }
            }
            ('G', 90) => self.absolute_positioning = true,
            ('G', 91) => self.absolute_positioning = false,
            ('G', 92) => {
                if words.len() == 1 {
                    self.x = 0.0;
                    self.y = 0.0;
                    self.z = 0.0;
                    self.e = 0.0;
                }
                for &(letter, value) in &words[1..] {
                    match letter {
                        'X' => self.x = value,
                        'Y' => self.y = value,
                        'Z' => self.z = value,
                        'E' => self.e = value,
                        _ => {}
                    }
                }
            }
            ('M', 82) => self.relative_extrusion = false,
            ('M', 83) => self.relative_extrusion = true,
            ('T', tool) if tool >= 0 => self.active_tool = tool as usize,
            _ => {}
        }

        self.z != previous_z
    }

    fn axis_target(&self, current: f64, value: f64) -> f64 {
        if self.absolute_positioning {
            value
        } else {
            current + value
        }
    }
}

/// Split a G-code line into `(letter, value)` words.
///
/// Words without a parsable number are skipped.
pub fn parse_words(line: &str) -> Vec<(char, f64)> {
    let line = line.trim();
    let mut words = Vec::new();
    let mut chars = line.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if !c.is_ascii_alphabetic() {
            continue;
        }
        let value_start = start + c.len_utf8();
        let mut end = value_start;
        while let Some(&(i, next)) = chars.peek() {
            if next.is_ascii_digit() || matches!(next, '.' | '-' | '+') {
                end = i + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if let Ok(value) = line[value_start..end].parse::<f64>() {
            words.push((c.to_ascii_uppercase(), value));
        }
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_words() {
        assert_eq!(
            parse_words("G1 X10.5 Y-2 F1800"),
            vec![('G', 1.0), ('X', 10.5), ('Y', -2.0), ('F', 1800.0)]
        );
        assert_eq!(parse_words("G1 Z+0.5 E-5"), vec![('G', 1.0), ('Z', 0.5), ('E', -5.0)]);
        assert_eq!(parse_words("M105"), vec![('M', 105.0)]);
    }

    #[test]
    fn test_absolute_moves() {
        let mut head = ToolheadState::new();
        head.apply("G1 X10 Y20 Z0.3 E1.5 F1800");
        assert_eq!((head.x, head.y, head.z, head.e, head.f), (10.0, 20.0, 0.3, 1.5, 1800.0));

        let z_changed = head.apply("G0 X12");
        assert!(!z_changed);
        assert_eq!(head.x, 12.0);
        assert!(head.apply("G0 Z0.6"));
    }

    #[test]
    fn test_relative_modes() {
        let mut head = ToolheadState::new();
        head.apply("G1 X10 E5");
        head.apply("M83");
        head.apply("G1 X20 E2");
        assert_eq!(head.e, 7.0);
        assert_eq!(head.x, 20.0);

        head.apply("M82");
        head.apply("G91");
        head.apply("G1 X5");
        assert_eq!(head.x, 25.0);
        assert!(head.extrusion_is_relative());
        head.apply("G90");
        assert!(!head.extrusion_is_relative());
    }

    #[test]
    fn test_g92_and_home() {
        let mut head = ToolheadState::new();
        head.apply("G1 X10 Y10 Z5 E100");
        head.apply("G92 E0");
        assert_eq!(head.e, 0.0);
        assert_eq!(head.x, 10.0);

        head.apply("G28 X0 Y0");
        assert_eq!((head.x, head.y, head.z), (0.0, 0.0, 5.0));
        head.apply("G28");
        assert_eq!(head.z, 0.0);
    }

    #[test]
    fn test_tool_select() {
        let mut head = ToolheadState::new();
        head.apply("T1");
        assert_eq!(head.active_tool, 1);
    }
}
