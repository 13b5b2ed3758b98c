//! In-process device simulator.
//!
//! `FakeDevice` mimics the receiver controller closely enough to exercise
//! the whole upload path without a radio: it keeps its own 116 KiB flash
//! buffer, follows the wait/transfer/error/done state machine, verifies
//! the CRC of every DATA packet, and answers after a short artificial
//! latency. Its one deliberate quirk mirrors the real hardware: the DONE
//! confirmation is not sent, because in the field that reply is lost in
//! transit and the client must cope.

use bytes::Bytes;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::constants::{KNOWN_FIRMWARE_SIZE, SIMULATOR_LATENCY};
use crate::error::UpdateError;
use crate::packet::Packet;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Wait,
    Transfer,
    Error,
    Done,
}

pub struct FakeDevice {
    flash: Vec<u8>,
    state: DeviceState,
    next_seq: u16,
    drop_exchanges: usize,
    ack_done: bool,
    fail_at_seq: Option<u16>,
    received_seqs: Vec<u16>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            flash: vec![0xFF; KNOWN_FIRMWARE_SIZE],
            state: DeviceState::Wait,
            next_seq: 0,
            drop_exchanges: 0,
            ack_done: false,
            fail_at_seq: None,
            received_seqs: Vec::new(),
        }
    }

    /// Swallow the next `count` exchanges entirely, so the client sees
    /// timeouts and must retransmit.
    pub fn drop_next_exchanges(mut self, count: usize) -> Self {
        self.drop_exchanges = count;
        self
    }

    /// Acknowledge DONE with a reply instead of the field-observed silence.
    pub fn ack_done(mut self, ack: bool) -> Self {
        self.ack_done = ack;
        self
    }

    /// Enter the error state when the DATA packet with this sequence
    /// number arrives.
    pub fn fail_at_seq(mut self, seq: u16) -> Self {
        self.fail_at_seq = Some(seq);
        self
    }

    /// Flash contents received so far.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Sequence numbers of every accepted DATA packet, in arrival order.
    pub fn received_seqs(&self) -> &[u16] {
        &self.received_seqs
    }

    pub fn is_done(&self) -> bool {
        self.state == DeviceState::Done
    }

    fn process(&mut self, packet: Packet) -> Option<Packet> {
        if self.state == DeviceState::Error {
            return Some(Packet::CrcError { seq: self.next_seq });
        }

        match (self.state, packet) {
            (DeviceState::Wait, Packet::Start) => {
                debug!("device: transfer started");
                self.state = DeviceState::Transfer;
                self.next_seq = 0;
                Some(Packet::DataRequest { seq: 0 })
            }
            (DeviceState::Transfer, Packet::Data { seq, payload }) if seq == self.next_seq => {
                if self.fail_at_seq == Some(seq) {
                    debug!("device: injected CRC failure at seq {seq}");
                    self.state = DeviceState::Error;
                    return Some(Packet::CrcError { seq: self.next_seq });
                }
                let offset = seq as usize * 32;
                if offset + payload.len() > self.flash.len() {
                    debug!("device: write past end of flash at seq {seq}");
                    self.state = DeviceState::Error;
                    return Some(Packet::CrcError { seq: self.next_seq });
                }
                self.flash[offset..offset + payload.len()].copy_from_slice(&payload);
                self.received_seqs.push(seq);
                self.next_seq += 1;
                Some(Packet::DataRequest { seq: self.next_seq })
            }
            (DeviceState::Transfer, Packet::Done { seq }) if seq == self.next_seq => {
                debug!("device: transfer finished after {} packets", self.next_seq);
                // The hardware runs its whole-image CRC here; the gate is
                // currently an unconditional pass.
                self.state = DeviceState::Done;
                self.ack_done.then_some(Packet::Done { seq })
            }
            (state, packet) => {
                trace!("device: ignoring {packet:?} in state {state:?}");
                None
            }
        }
    }
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeDevice {
    async fn send_and_receive(&mut self, packet: &[u8]) -> Result<Option<Bytes>, UpdateError> {
        if self.drop_exchanges > 0 {
            self.drop_exchanges -= 1;
            trace!("device: exchange dropped ({} more to drop)", self.drop_exchanges);
            return Ok(None);
        }

        let packet = match Packet::decode(packet) {
            Ok(packet) => packet,
            // A corrupt packet is dropped silently; the client will
            // retransmit.
            Err(e) => {
                trace!("device: dropping undecodable packet: {e}");
                return Ok(None);
            }
        };

        let reply = self.process(packet);
        if reply.is_some() {
            sleep(SIMULATOR_LATENCY).await;
        }
        Ok(reply.map(|packet| packet.encode()))
    }
}
