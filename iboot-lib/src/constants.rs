//! Protocol and archive constants for the PE-series controllers.

use std::time::Duration;

/// Z-Wave manufacturer id shared by the whole controller family.
pub const MANUFACTURER_ID: u16 = 0x0005;

/// Product type common to the receiver and handheld models.
pub const PRODUCT_TYPE: u16 = 0x5045;

/// Product id of the receiver model.
pub const PRODUCT_ID_RECEIVER: u16 = 0x0653;

/// Product id of the handheld model.
pub const PRODUCT_ID_HANDHELD: u16 = 0x0953;

/// Archive product code of the receiver model.
pub const PRODUCT_CODE_RECEIVER: &str = "PE0653";

/// Archive product code of the handheld model.
pub const PRODUCT_CODE_HANDHELD: &str = "PE0953";

/// Manufacturer-Proprietary command code carrying the firmware transfer protocol.
pub const COMMAND_FIRMWARE_TRANSFER: u8 = 42;

/// The Manufacturer-Proprietary command class (0x91).
pub const COMMAND_CLASS_PROPRIETARY: u8 = 0x91;

/// Payload window carried by one DATA packet.
pub const DATA_CHUNK_SIZE: usize = 32;

/// Size of a valid receiver firmware image (116 KiB).
pub const KNOWN_FIRMWARE_SIZE: usize = 116 * 1024;

/// Capacity of the assembly buffer for one product blob (128 KiB flash slot).
pub const MAX_BLOB_LENGTH: usize = 128 * 1024;

/// Consecutive unanswered exchanges tolerated before the transfer is abandoned.
pub const MAX_TIMEOUTS: u32 = 5;

/// How long one send-and-receive exchange may wait for the device reply.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Artificial reply latency of the in-process simulator, mimicking the radio.
pub const SIMULATOR_LATENCY: Duration = Duration::from_millis(5);

/// AES-128-CBC key for vendor `.iboot` archives. The vendor format reuses
/// the key as the IV; this is a compatibility constraint, not a security
/// property, and must not be changed.
pub const ARCHIVE_KEY: &[u8; 16] = b"gbUst8Ce8Cp4bkPw";

/// Map a node's Z-Wave identity to the archive product code, if it is one
/// of the supported controllers.
pub fn product_code(manufacturer_id: u16, product_type: u16, product_id: u16) -> Option<&'static str> {
    if manufacturer_id != MANUFACTURER_ID || product_type != PRODUCT_TYPE {
        return None;
    }
    match product_id {
        PRODUCT_ID_RECEIVER => Some(PRODUCT_CODE_RECEIVER),
        PRODUCT_ID_HANDHELD => Some(PRODUCT_CODE_HANDHELD),
        _ => None,
    }
}
