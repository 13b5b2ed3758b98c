//! The upload engine.
//!
//! The device drives the transfer: after START it requests each 32-byte
//! window by sequence number and the engine answers. The engine never
//! advances on its own; it only resends the current packet on silence and
//! answers the next in-order request, which makes retransmission naturally
//! idempotent.

use tracing::{debug, info, warn};

use crate::archive::FirmwareImage;
use crate::constants::{DATA_CHUNK_SIZE, KNOWN_FIRMWARE_SIZE, MAX_TIMEOUTS};
use crate::crc::verify_image_crc;
use crate::error::UpdateError;
use crate::packet::Packet;
use crate::transport::Transport;

/// How a completed transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The device acknowledged the transfer with a DONE reply.
    Confirmed,
    /// Every byte was sent and DONE transmitted, but no confirmation
    /// arrived. Observed behavior of this device family; the image is
    /// almost certainly in place, but the caller should say so out loud.
    Unconfirmed,
}

pub struct Uploader<T> {
    transport: T,
}

impl<T: Transport> Uploader<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Deliver `image` to the device.
    ///
    /// Fails fast with [`UpdateError::ProtocolSizeMismatch`] before any
    /// packet is sent if the image is not exactly the expected receiver
    /// firmware size.
    pub async fn upload(&mut self, image: &FirmwareImage) -> Result<UploadOutcome, UpdateError> {
        let blob = image.data();
        if blob.len() != KNOWN_FIRMWARE_SIZE {
            return Err(UpdateError::ProtocolSizeMismatch {
                expected: KNOWN_FIRMWARE_SIZE,
                actual: blob.len(),
            });
        }
        if verify_image_crc(blob) {
            debug!("image CRC-32 trailer verified");
        } else {
            // Expected for this family: the 116 KiB image sits in a
            // 128 KiB slot and the trailer coverage is unknown.
            warn!("image CRC-32 trailer does not match, continuing anyway");
        }

        let total = blob.len();
        let mut current_packet = Packet::Start.encode();
        let mut expected_next_seq: u16 = 0;
        let mut timeouts: u32 = 0;
        let mut done_sent = false;

        info!("starting transfer of {total} bytes");
        loop {
            let reply = match self.transport.send_and_receive(&current_packet).await? {
                Some(reply) => reply,
                None => {
                    timeouts += 1;
                    if timeouts < MAX_TIMEOUTS {
                        warn!("no reply from device, retrying ({timeouts}/{MAX_TIMEOUTS})");
                        continue;
                    }
                    if done_sent {
                        info!("no final confirmation after DONE; assuming the image was accepted");
                        return Ok(UploadOutcome::Unconfirmed);
                    }
                    return Err(UpdateError::ProtocolTimeout(timeouts));
                }
            };

            if reply.len() < 4 {
                debug!("ignoring {}-byte reply", reply.len());
                continue;
            }
            let packet = match Packet::decode(&reply) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("ignoring unparseable reply: {e}");
                    continue;
                }
            };
            timeouts = 0;

            match packet {
                Packet::DataRequest { seq } => {
                    if seq != expected_next_seq {
                        debug!("ignoring request for seq {seq}, expected {expected_next_seq}");
                        continue;
                    }
                    let offset = seq as usize * DATA_CHUNK_SIZE;
                    if offset < total {
                        if seq % 32 == 0 {
                            info!("uploaded {offset}/{total} bytes");
                        }
                        let end = (offset + DATA_CHUNK_SIZE).min(total);
                        current_packet = Packet::Data {
                            seq,
                            payload: blob.slice(offset..end),
                        }
                        .encode();
                        expected_next_seq = seq + 1;
                    } else {
                        info!("all {total} bytes sent, finishing transfer");
                        current_packet = Packet::Done { seq }.encode();
                        done_sent = true;
                    }
                }
                Packet::Done { .. } => {
                    info!("device confirmed the upload");
                    return Ok(UploadOutcome::Confirmed);
                }
                Packet::CrcError { seq } => {
                    // The device resets itself after this; nothing to
                    // recover in-band.
                    return Err(UpdateError::ProtocolCrcError(seq));
                }
                other => {
                    debug!("ignoring reply {:?}", other.packet_type());
                }
            }
        }
    }
}
