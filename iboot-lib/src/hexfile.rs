//! Intel-HEX record parsing and writing.
//!
//! Archive record lines are standard Intel-HEX: a `:` prefix, then hex
//! pairs for `[length, offset_hi, offset_lo, type, data..., checksum]`,
//! where the low byte of the sum of all decoded bytes is zero.

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::UpdateError;

/// Shortest legal record line: colon plus five framing bytes as hex pairs.
const MIN_LINE_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum RecordType {
    Data = 0,
    Eof = 1,
    ExtendedSegmentAddress = 2,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// One decoded record line. Type-specific shape requirements (data length,
/// zero offsets) are enforced by the archive decoder, which knows the
/// assembly state they apply to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub offset: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
}

impl HexRecord {
    /// Parse one `:`-prefixed line. `line_no` is only used for error
    /// reporting.
    pub fn parse(line_no: usize, line: &str) -> Result<HexRecord, UpdateError> {
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| UpdateError::syntax(line_no, "record line does not start with ':'"))?;

        if line.len() < MIN_LINE_LEN || line.len() % 2 == 0 {
            return Err(UpdateError::syntax(
                line_no,
                format!("record line has invalid length {}", line.len()),
            ));
        }

        let bytes = hex::decode(body)
            .map_err(|e| UpdateError::syntax(line_no, format!("invalid hex in record: {e}")))?;

        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(UpdateError::syntax(
                line_no,
                format!("record checksum mismatch (byte sum 0x{sum:02X})"),
            ));
        }

        let data_length = bytes[0] as usize;
        if data_length + 5 != bytes.len() {
            return Err(UpdateError::syntax(
                line_no,
                format!(
                    "record length field {} does not match {} decoded bytes",
                    data_length,
                    bytes.len()
                ),
            ));
        }

        let record_type = RecordType::from_primitive(bytes[3]);
        if let RecordType::Unknown(ty) = record_type {
            return Err(UpdateError::UnsupportedRecord(ty));
        }

        Ok(HexRecord {
            offset: u16::from_be_bytes([bytes[1], bytes[2]]),
            record_type,
            data: bytes[4..4 + data_length].to_vec(),
        })
    }
}

/// Append one record line (with trailing newline) to `out`.
pub fn write_record(out: &mut String, offset: u16, record_type: RecordType, data: &[u8]) {
    let ty: u8 = record_type.into();
    let mut sum = (data.len() as u8)
        .wrapping_add(offset.to_be_bytes()[0])
        .wrapping_add(offset.to_be_bytes()[1])
        .wrapping_add(ty);
    out.push(':');
    out.push_str(&format!("{:02X}{:04X}{:02X}", data.len(), offset, ty));
    for &byte in data {
        sum = sum.wrapping_add(byte);
        out.push_str(&format!("{byte:02X}"));
    }
    out.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
}
