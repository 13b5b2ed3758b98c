use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::archive::{FirmwareArchive, FirmwareImage};
use crate::cipher;
use crate::constants::KNOWN_FIRMWARE_SIZE;
use crate::crc::crc16;
use crate::error::UpdateError;
use crate::hexfile::{write_record, RecordType};
use crate::simulator::FakeDevice;
use crate::transport::{LoggingTransport, Transport};
use crate::upload::{UploadOutcome, Uploader};

fn data_line(out: &mut String, offset: u16, data: &[u8]) {
    write_record(out, offset, RecordType::Data, data);
}

fn eof_line(out: &mut String) {
    write_record(out, 0, RecordType::Eof, &[]);
}

fn segment_line(out: &mut String, segment: u16) {
    write_record(out, 0, RecordType::ExtendedSegmentAddress, &segment.to_be_bytes());
}

fn two_product_archive() -> String {
    let mut text = String::from("iboot-2.07\n");
    text.push_str("PE0653=Pool Receiver=3.44=Update both units together\n");
    data_line(&mut text, 0x0000, &(0x00..0x10).collect::<Vec<u8>>());
    data_line(&mut text, 0x0020, &(0xA0..0xB0).collect::<Vec<u8>>());
    eof_line(&mut text);
    text.push_str("PE0953=Handheld Remote=3.44=\n");
    data_line(&mut text, 0x0000, &[0x55; 16]);
    eof_line(&mut text);
    text
}

#[test]
fn archive_with_two_products() {
    let archive = FirmwareArchive::parse(two_product_archive().as_bytes()).unwrap();
    assert_eq!(archive.format_version, "iboot-2.07");
    assert_eq!(archive.products.len(), 2);

    let receiver = archive.product("PE0653").unwrap();
    assert_eq!(receiver.name, "Pool Receiver");
    assert_eq!(receiver.version, "3.44");
    assert_eq!(receiver.message, "Update both units together");
    let image = receiver.image().unwrap();

    let mut expected = vec![0xFFu8; 0x30];
    expected[..0x10].copy_from_slice(&(0x00..0x10).collect::<Vec<u8>>());
    expected[0x20..].copy_from_slice(&(0xA0..0xB0).collect::<Vec<u8>>());
    assert_eq!(image.len(), 0x30);
    assert_eq!(image.data().as_ref(), &expected[..]);
    // Bytes never written by a record stay at the 0xFF fill.
    assert!(image.data()[0x10..0x20].iter().all(|&b| b == 0xFF));
    assert_eq!(image.sha256(), hex::encode(Sha256::digest(&expected)));

    let handheld = archive.product("PE0953").unwrap();
    assert_eq!(handheld.message, "");
    assert_eq!(handheld.image().unwrap().len(), 16);
}

#[test]
fn archive_round_trips_through_encryption() {
    let plaintext = two_product_archive();
    let ciphertext = cipher::encrypt_archive(plaintext.as_bytes());
    let archive = FirmwareArchive::decrypt_and_parse(&ciphertext).unwrap();
    let reference = FirmwareArchive::parse(plaintext.as_bytes()).unwrap();
    assert_eq!(archive.format_version, reference.format_version);
    for (id, product) in &reference.products {
        assert_eq!(
            archive.product(id).unwrap().image().unwrap().sha256(),
            product.image().unwrap().sha256()
        );
    }
}

#[test]
fn extended_segment_addressing_places_records_high() {
    let mut text = String::from("v1\nPE0653=Receiver=1.0=\n");
    segment_line(&mut text, 0x1000);
    data_line(&mut text, 0x0000, &[0xAB; 16]);
    eof_line(&mut text);

    let archive = FirmwareArchive::parse(text.as_bytes()).unwrap();
    let image = archive.product("PE0653").unwrap().image().unwrap();
    assert_eq!(image.len(), 0x10010);
    assert!(image.data()[..0x10000].iter().all(|&b| b == 0xFF));
    assert!(image.data()[0x10000..].iter().all(|&b| b == 0xAB));
}

#[test]
fn archive_rejects_unsupported_record_type() {
    let text = "v1\nPE0653=Receiver=1.0=\n:0400000300003800C1\n";
    assert!(matches!(
        FirmwareArchive::parse(text.as_bytes()),
        Err(UpdateError::UnsupportedRecord(0x03))
    ));
}

#[test]
fn an_eof_with_no_data_records_yields_an_empty_image() {
    let mut text = String::from("v1\nPE0653=Receiver=1.0=\n");
    eof_line(&mut text);

    let archive = FirmwareArchive::parse(text.as_bytes()).unwrap();
    let image = archive.product("PE0653").unwrap().image().unwrap();
    assert!(image.is_empty());
    assert_eq!(image.sha256(), hex::encode(Sha256::digest(b"")));
}

#[test]
fn archive_rejects_second_eof_for_a_product() {
    let mut text = String::from("v1\nPE0653=Receiver=1.0=\n");
    data_line(&mut text, 0x0000, &[0x11; 16]);
    eof_line(&mut text);
    data_line(&mut text, 0x0010, &[0x22; 16]);
    eof_line(&mut text);

    match FirmwareArchive::parse(text.as_bytes()) {
        Err(UpdateError::ArchiveSemantics { message, .. }) => {
            assert!(message.contains("already has an image"), "{message}");
        }
        other => panic!("expected semantics error, got {other:?}"),
    }
}

#[test]
fn archive_rejects_metadata_inside_a_record_block() {
    let mut text = String::from("v1\nPE0653=Receiver=1.0=\n");
    data_line(&mut text, 0x0000, &[0x11; 16]);
    text.push_str("PE0953=Handheld=1.0=\n");

    assert!(matches!(
        FirmwareArchive::parse(text.as_bytes()),
        Err(UpdateError::ArchiveSemantics { line: 4, .. })
    ));
}

#[test]
fn archive_rejects_records_before_any_product() {
    let mut text = String::from("v1\n");
    data_line(&mut text, 0x0000, &[0x11; 16]);

    assert!(matches!(
        FirmwareArchive::parse(text.as_bytes()),
        Err(UpdateError::ArchiveSemantics { line: 2, .. })
    ));
}

#[test]
fn images_round_trip_through_ihex() {
    let archive = FirmwareArchive::parse(two_product_archive().as_bytes()).unwrap();
    let image = archive.product("PE0653").unwrap().image().unwrap();

    let mut text = String::from("v1\nPE0653=Receiver=1.0=\n");
    text.push_str(&image.to_ihex());
    let reparsed = FirmwareArchive::parse(text.as_bytes()).unwrap();
    assert_eq!(
        reparsed.product("PE0653").unwrap().image().unwrap().data(),
        image.data()
    );
}

/// Transport wrapper that records the raw bytes of every exchange.
struct Recording<T> {
    inner: T,
    sent: Vec<Vec<u8>>,
}

impl<T> Recording<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            sent: Vec::new(),
        }
    }

    fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for Recording<T> {
    async fn send_and_receive(&mut self, packet: &[u8]) -> Result<Option<Bytes>, UpdateError> {
        self.sent.push(packet.to_vec());
        self.inner.send_and_receive(packet).await
    }
}

fn test_image() -> FirmwareImage {
    let body: Vec<u8> = (0..KNOWN_FIRMWARE_SIZE)
        .map(|i| (i % 251) as u8 ^ (i >> 8) as u8)
        .collect();
    FirmwareImage::new(body)
}

#[tokio::test(start_paused = true)]
async fn upload_completes_and_tolerates_the_lost_done_reply() {
    let image = test_image();
    let mut uploader = Uploader::new(FakeDevice::new());
    let outcome = uploader.upload(&image).await.unwrap();
    // The simulator swallows the DONE confirmation by default, as the
    // real radio link does.
    assert_eq!(outcome, UploadOutcome::Unconfirmed);

    let device = uploader.into_inner();
    assert!(device.is_done());
    assert_eq!(device.flash(), image.data().as_ref());
    let expected: Vec<u16> = (0..(KNOWN_FIRMWARE_SIZE / 32) as u16).collect();
    assert_eq!(device.received_seqs(), &expected[..]);
}

#[tokio::test(start_paused = true)]
async fn upload_is_confirmed_when_the_done_reply_survives() {
    let image = test_image();
    let mut uploader = Uploader::new(LoggingTransport::new(FakeDevice::new().ack_done(true)));
    let outcome = uploader.upload(&image).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Confirmed);
    assert!(uploader.into_inner().into_inner().is_done());
}

#[tokio::test(start_paused = true)]
async fn wrong_sized_images_are_refused_before_any_exchange() {
    let image = FirmwareImage::new(vec![0u8; 117_000]);
    let mut uploader = Uploader::new(Recording::new(FakeDevice::new()));
    let err = uploader.upload(&image).await.unwrap_err();
    assert!(matches!(
        err,
        UpdateError::ProtocolSizeMismatch {
            expected: KNOWN_FIRMWARE_SIZE,
            actual: 117_000,
        }
    ));
    assert!(uploader.into_inner().sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_exchanges_are_retried_with_identical_bytes() {
    let image = test_image();
    let mut uploader = Uploader::new(Recording::new(FakeDevice::new().drop_next_exchanges(4)));
    let outcome = uploader.upload(&image).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Unconfirmed);

    let recording = uploader.into_inner();
    // The first packet timed out four times; each retry is byte-identical.
    assert_eq!(recording.sent[0], vec![42u8, 0]);
    assert!(recording.sent[..5].iter().all(|p| *p == recording.sent[0]));

    // Every emitted DATA packet carries a valid CRC trailer and a
    // window-sized payload.
    for packet in &recording.sent {
        if packet[1] == 2 {
            let n = packet.len();
            assert!((1..=32).contains(&(n - 6)));
            let trailer = u16::from_le_bytes([packet[n - 2], packet[n - 1]]);
            assert_eq!(trailer, crc16(&packet[..n - 2]));
        }
    }

    let device = recording.into_inner();
    assert_eq!(device.flash(), image.data().as_ref());
    let expected: Vec<u16> = (0..(KNOWN_FIRMWARE_SIZE / 32) as u16).collect();
    assert_eq!(device.received_seqs(), &expected[..]);
}

#[tokio::test(start_paused = true)]
async fn a_device_crc_report_is_fatal() {
    let image = test_image();
    let mut uploader = Uploader::new(Recording::new(FakeDevice::new().fail_at_seq(100)));
    let err = uploader.upload(&image).await.unwrap_err();
    assert!(matches!(err, UpdateError::ProtocolCrcError(100)));

    // The engine stops immediately: the last packet on the wire is the
    // DATA packet the device faulted on.
    let recording = uploader.into_inner();
    let last = recording.sent.last().unwrap();
    assert_eq!(last[1], 2);
    assert_eq!(u16::from_le_bytes([last[2], last[3]]), 100);
}

#[tokio::test(start_paused = true)]
async fn exhausted_timeouts_before_done_are_a_hard_error() {
    let image = test_image();
    let mut uploader = Uploader::new(FakeDevice::new().drop_next_exchanges(5));
    let err = uploader.upload(&image).await.unwrap_err();
    assert!(matches!(err, UpdateError::ProtocolTimeout(5)));
}
