use std::io;
use thiserror::Error;

/// The primary error type for the `iboot-lib` library.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("archive I/O error: {0}")]
    ArchiveIo(#[from] io::Error),

    #[error("archive decryption failed (wrong key or corrupt container)")]
    ArchiveCipher,

    #[error("archive syntax error at line {line}: {message}")]
    ArchiveSyntax { line: usize, message: String },

    #[error("unsupported record type 0x{0:02X}")]
    UnsupportedRecord(u8),

    #[error("archive semantics error at line {line}: {message}")]
    ArchiveSemantics { line: usize, message: String },

    #[error("malformed transfer packet: {0}")]
    Framing(String),

    #[error("transport error: {0}")]
    TransportIo(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("no response from device after {0} attempts")]
    ProtocolTimeout(u32),

    #[error("device reported a CRC error at sequence {0}")]
    ProtocolCrcError(u16),

    #[error("firmware image is {actual} bytes, expected {expected}")]
    ProtocolSizeMismatch { expected: usize, actual: usize },

    #[error("update cancelled by user")]
    UserDeclined,

    #[error("unsupported node: {0}")]
    UnsupportedNode(String),
}

impl UpdateError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        UpdateError::ArchiveSyntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn semantics(line: usize, message: impl Into<String>) -> Self {
        UpdateError::ArchiveSemantics {
            line,
            message: message.into(),
        }
    }
}
