//! Intel HEX firmware images
//!
//! Records look like `:LLAAAATT<data>CC`. Data records are placed at their
//! absolute address (extended segment and extended linear address records
//! move the base) and the result is flattened into one contiguous buffer,
//! gaps filled with `0xFF` like erased flash.

use fdmlink_core::{FirmwareError, MachineFamily};
use std::path::Path;

/// Largest flattened image accepted, in bytes
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_SEGMENT_ADDRESS: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_LINEAR_ADDRESS: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Flattened firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    start_address: u32,
    family: Option<MachineFamily>,
}

impl FirmwareImage {
    /// Parse Intel HEX text
    pub fn parse_hex(text: &str) -> Result<Self, FirmwareError> {
        let mut base: u32 = 0;
        let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = decode_record(line).map_err(|reason| FirmwareError::InvalidImage {
                reason: format!("line {}: {}", index + 1, reason),
            })?;

            match record.kind {
                RECORD_DATA => chunks.push((base.wrapping_add(record.address as u32), record.data)),
                RECORD_EOF => break,
                RECORD_SEGMENT_ADDRESS => base = record.word()? << 4,
                RECORD_LINEAR_ADDRESS => base = record.word()? << 16,
                RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
                other => {
                    return Err(FirmwareError::InvalidImage {
                        reason: format!("line {}: unknown record type {:02X}", index + 1, other),
                    })
                }
            }
        }

        let start = chunks
            .iter()
            .map(|(address, _)| *address)
            .min()
            .ok_or_else(|| FirmwareError::InvalidImage {
                reason: "no data records".to_string(),
            })?;
        let end = chunks
            .iter()
            .map(|(address, data)| *address as usize + data.len())
            .max()
            .unwrap_or(start as usize);
        let size = end - start as usize;
        if size > MAX_IMAGE_SIZE {
            return Err(FirmwareError::InvalidImage {
                reason: format!("image spans {} bytes", size),
            });
        }

        let mut data = vec![0xFF; size];
        for (address, bytes) in chunks {
            let offset = (address - start) as usize;
            data[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }

        Ok(Self {
            data,
            start_address: start,
            family: None,
        })
    }

    /// Read and parse a `.hex` file; the family comes from the file name
    pub fn load(path: &Path) -> Result<Self, FirmwareError> {
        let text = std::fs::read_to_string(path).map_err(|e| FirmwareError::InvalidImage {
            reason: format!("{}: {}", path.display(), e),
        })?;
        let image = Self::parse_hex(&text)?;
        let family = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(MachineFamily::from_file_name);
        tracing::debug!(
            "Loaded {} ({} bytes, family {:?})",
            path.display(),
            image.len(),
            family
        );
        Ok(image.with_family(family))
    }

    /// Set the declared machine family
    pub fn with_family(mut self, family: Option<MachineFamily>) -> Self {
        self.family = family;
        self
    }

    /// Image bytes starting at [`start_address`](Self::start_address)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Lowest address written
    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Machine family the image was built for, when declared
    pub fn family(&self) -> Option<&MachineFamily> {
        self.family.as_ref()
    }

    /// Refuse an image declared for another family than the device's
    ///
    /// Passes when either side is unknown.
    pub fn check_family(&self, device: Option<&MachineFamily>) -> Result<(), FirmwareError> {
        match (self.family.as_ref(), device) {
            (Some(image), Some(device)) if image != device => Err(FirmwareError::FamilyMismatch {
                image: image.to_string(),
                device: device.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Split the image into programmer pages
    pub fn pages(&self, page_size: usize) -> impl Iterator<Item = &[u8]> {
        self.data.chunks(page_size.max(1))
    }
}

struct Record {
    address: u16,
    kind: u8,
    data: Vec<u8>,
}

impl Record {
    fn word(&self) -> Result<u32, FirmwareError> {
        match self.data.as_slice() {
            [high, low] => Ok(((*high as u32) << 8) | *low as u32),
            _ => Err(FirmwareError::InvalidImage {
                reason: format!("address record with {} data bytes", self.data.len()),
            }),
        }
    }
}

fn decode_record(line: &str) -> Result<Record, String> {
    let digits = line
        .strip_prefix(':')
        .ok_or_else(|| "record does not start with ':'".to_string())?;
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err("odd number of hex digits".to_string());
    }

    let bytes = (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| format!("bad hex digit: {}", e))?;
    if bytes.len() < 5 {
        return Err("record too short".to_string());
    }

    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(format!(
            "length byte says {} data bytes, record has {}",
            count,
            bytes.len() - 5
        ));
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch".to_string());
    }

    Ok(Record {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        kind: bytes[3],
        data: bytes[4..4 + count].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BLINK: &str = ":100000000C9434000C9446000C9446000C9446006A\n\
                         :04001000FFFFFFFFF0\n\
                         :00000001FF\n";

    #[test]
    fn test_parse_data_records() {
        let image = FirmwareImage::parse_hex(BLINK).unwrap();
        assert_eq!(image.start_address(), 0);
        assert_eq!(image.len(), 20);
        assert_eq!(&image.data()[..4], &[0x0C, 0x94, 0x34, 0x00]);
        assert_eq!(image.pages(8).count(), 3);
    }

    #[test]
    fn test_extended_linear_address() {
        let text = ":020000040001F9\n:020000001122CB\n:00000001FF\n";
        let image = FirmwareImage::parse_hex(text).unwrap();
        assert_eq!(image.start_address(), 0x10000);
        assert_eq!(image.data(), &[0x11, 0x22]);
    }

    #[test]
    fn test_gaps_filled_with_erased_bytes() {
        let text = ":0100000001FE\n:0100030002FA\n:00000001FF\n";
        let image = FirmwareImage::parse_hex(text).unwrap();
        assert_eq!(image.data(), &[0x01, 0xFF, 0xFF, 0x02]);
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let text = ":100000000C9434000C9446000C9446000C9446006B\n";
        assert!(matches!(
            FirmwareImage::parse_hex(text),
            Err(FirmwareError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_image() {
        assert!(FirmwareImage::parse_hex(":00000001FF\n").is_err());
        assert!(FirmwareImage::parse_hex("").is_err());
        assert!(FirmwareImage::parse_hex("not a hex file").is_err());
    }

    #[test]
    fn test_load_detects_family_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bcn3dsigmax-firmware-2.0.1.hex");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(BLINK.as_bytes())
            .unwrap();

        let image = FirmwareImage::load(&path).unwrap();
        assert_eq!(image.family(), Some(&MachineFamily::SigmaX));
        assert!(image.check_family(Some(&MachineFamily::SigmaX)).is_ok());
        assert!(matches!(
            image.check_family(Some(&MachineFamily::Sigma)),
            Err(FirmwareError::FamilyMismatch { .. })
        ));
        assert!(image.check_family(None).is_ok());
    }
}
