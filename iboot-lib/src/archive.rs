//! Vendor archive decoder.
//!
//! A decrypted `.iboot` archive is a newline-delimited text file mixing
//! product header lines (`id=name=version=message`) with Intel-HEX record
//! lines. Each product's records assemble into a 0xFF-filled 128 KiB
//! buffer; the first EOF record truncates the buffer at the highest byte
//! written and freezes it as the product's firmware image.

use std::collections::HashMap;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cipher;
use crate::constants::MAX_BLOB_LENGTH;
use crate::error::UpdateError;
use crate::hexfile::{self, HexRecord, RecordType};

/// A finished firmware image with its SHA-256 digest (hex), frozen at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Bytes,
    sha256: String,
}

impl FirmwareImage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let sha256 = hex::encode(Sha256::digest(&data));
        Self { data, sha256 }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// SHA-256 of the image bytes, lowercase hex.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Re-emit the image as Intel-HEX text, with extended-segment-address
    /// records at 64 KiB boundaries and a final EOF record.
    pub fn to_ihex(&self) -> String {
        let mut out = String::new();
        let mut segment: u16 = 0;
        for (chunk_index, chunk) in self.data.chunks(16).enumerate() {
            let address = chunk_index * 16;
            let chunk_segment = ((address >> 16) << 12) as u16;
            if chunk_segment != segment {
                segment = chunk_segment;
                hexfile::write_record(
                    &mut out,
                    0,
                    RecordType::ExtendedSegmentAddress,
                    &segment.to_be_bytes(),
                );
            }
            hexfile::write_record(&mut out, (address & 0xFFFF) as u16, RecordType::Data, chunk);
        }
        hexfile::write_record(&mut out, 0, RecordType::Eof, &[]);
        out
    }
}

/// One product entry. Metadata comes from the header line; `image` stays
/// empty until the product's EOF record is reached.
#[derive(Debug, Clone)]
pub struct FirmwareProduct {
    pub name: String,
    pub version: String,
    pub message: String,
    image: Option<FirmwareImage>,
}

impl FirmwareProduct {
    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }
}

/// A fully decoded archive: the format version string and every product
/// record, keyed by product code.
#[derive(Debug, Clone)]
pub struct FirmwareArchive {
    pub format_version: String,
    pub products: HashMap<String, FirmwareProduct>,
}

impl FirmwareArchive {
    /// Decode an already-decrypted archive body.
    pub fn parse(plaintext: &[u8]) -> Result<Self, UpdateError> {
        let text = String::from_utf8_lossy(plaintext);
        let mut decoder = Decoder::new();
        for (index, raw_line) in text.split('\n').enumerate() {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            if line.is_empty() {
                continue;
            }
            decoder.line(index + 1, line)?;
        }
        decoder.finish()
    }

    /// Decrypt an archive container and decode its body.
    pub fn decrypt_and_parse(ciphertext: &[u8]) -> Result<Self, UpdateError> {
        Self::parse(&cipher::decrypt_archive(ciphertext)?)
    }

    pub fn product(&self, code: &str) -> Option<&FirmwareProduct> {
        self.products.get(code)
    }
}

/// Assembly buffer for one product blob.
struct BlobBuffer {
    bytes: Vec<u8>,
    extended_segment_address: u16,
    max_address: usize,
}

impl BlobBuffer {
    fn new() -> Self {
        Self {
            bytes: vec![0xFF; MAX_BLOB_LENGTH],
            extended_segment_address: 0,
            max_address: 0,
        }
    }

    fn write(&mut self, line: usize, offset: u16, data: &[u8]) -> Result<(), UpdateError> {
        let address = ((self.extended_segment_address as usize) << 4) + offset as usize;
        if address + data.len() > MAX_BLOB_LENGTH {
            return Err(UpdateError::semantics(
                line,
                format!(
                    "data record at address 0x{address:05X} exceeds the {MAX_BLOB_LENGTH}-byte blob capacity"
                ),
            ));
        }
        self.bytes[address..address + data.len()].copy_from_slice(data);
        self.max_address = self.max_address.max(address + data.len());
        Ok(())
    }

    fn finish(mut self) -> FirmwareImage {
        self.bytes.truncate(self.max_address);
        FirmwareImage::new(self.bytes)
    }
}

struct Decoder {
    format_version: String,
    products: HashMap<String, FirmwareProduct>,
    current_product: Option<String>,
    open_blob: Option<BlobBuffer>,
}

impl Decoder {
    fn new() -> Self {
        Self {
            format_version: "unknown".to_string(),
            products: HashMap::new(),
            current_product: None,
            open_blob: None,
        }
    }

    fn line(&mut self, line_no: usize, line: &str) -> Result<(), UpdateError> {
        if line.starts_with(':') {
            self.record_line(line_no, line)
        } else {
            self.header_line(line_no, line)
        }
    }

    fn header_line(&mut self, line_no: usize, line: &str) -> Result<(), UpdateError> {
        if self.open_blob.is_some() {
            return Err(UpdateError::semantics(
                line_no,
                "metadata line interleaved with record data",
            ));
        }

        let fields: Vec<&str> = line.split('=').collect();
        if let [id, name, version, message] = fields[..] {
            if self.products.contains_key(id) {
                return Err(UpdateError::semantics(
                    line_no,
                    format!("duplicate header for product {id}"),
                ));
            }
            debug!("product {id}: {name} {version}");
            self.products.insert(
                id.to_string(),
                FirmwareProduct {
                    name: name.to_string(),
                    version: version.to_string(),
                    message: message.to_string(),
                    image: None,
                },
            );
            self.current_product = Some(id.to_string());
        } else if self.format_version == "unknown" {
            self.format_version = line.to_string();
        } else {
            debug!("ignoring archive line {line_no}: {line}");
        }
        Ok(())
    }

    fn record_line(&mut self, line_no: usize, line: &str) -> Result<(), UpdateError> {
        let record = HexRecord::parse(line_no, line)?;
        let product_id = self
            .current_product
            .clone()
            .ok_or_else(|| UpdateError::semantics(line_no, "record line before any product header"))?;

        match record.record_type {
            RecordType::Data => {
                if record.data.len() != 16 {
                    return Err(UpdateError::semantics(
                        line_no,
                        format!("data record carries {} bytes, expected 16", record.data.len()),
                    ));
                }
                self.open_blob
                    .get_or_insert_with(BlobBuffer::new)
                    .write(line_no, record.offset, &record.data)?;
            }
            RecordType::Eof => {
                if !record.data.is_empty() || record.offset != 0 {
                    return Err(UpdateError::semantics(
                        line_no,
                        "end-of-file record must have zero length and offset",
                    ));
                }
                // An EOF with nothing written finalizes an empty image.
                let blob = self.open_blob.take().unwrap_or_else(BlobBuffer::new);
                let product = self
                    .products
                    .get_mut(&product_id)
                    .ok_or_else(|| UpdateError::semantics(line_no, "record without product"))?;
                if product.image.is_some() {
                    return Err(UpdateError::semantics(
                        line_no,
                        format!("product {product_id} already has an image"),
                    ));
                }
                let image = blob.finish();
                debug!(
                    "product {product_id}: image of {} bytes, sha256 {}",
                    image.len(),
                    image.sha256()
                );
                product.image = Some(image);
            }
            RecordType::ExtendedSegmentAddress => {
                if record.data.len() != 2 || record.offset != 0 {
                    return Err(UpdateError::semantics(
                        line_no,
                        "extended segment address record must carry two bytes at offset zero",
                    ));
                }
                let blob = self.open_blob.get_or_insert_with(BlobBuffer::new);
                blob.extended_segment_address = u16::from_be_bytes([record.data[0], record.data[1]]);
            }
            RecordType::Unknown(_) => unreachable!("rejected during record parsing"),
        }
        Ok(())
    }

    fn finish(self) -> Result<FirmwareArchive, UpdateError> {
        if self.open_blob.is_some() {
            warn!("archive ended with an unterminated record block; partial image discarded");
        }
        Ok(FirmwareArchive {
            format_version: self.format_version,
            products: self.products,
        })
    }
}
