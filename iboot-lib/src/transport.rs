//! Transport abstraction between the upload engine and a device.

use bytes::Bytes;
use tracing::debug;

use crate::error::UpdateError;

/// A bidirectional byte-packet link to the device.
///
/// One call transmits `packet` and waits for the next reply: `Ok(Some(_))`
/// is the reply, `Ok(None)` means the exchange window elapsed without one.
/// Errors are reserved for transport faults (broken broker connection,
/// malformed RPC responses), never for device silence.
pub trait Transport {
    async fn send_and_receive(&mut self, packet: &[u8]) -> Result<Option<Bytes>, UpdateError>;
}

/// Wraps another transport and logs every exchange as hex.
pub struct LoggingTransport<T> {
    inner: T,
}

impl<T: Transport> LoggingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for LoggingTransport<T> {
    async fn send_and_receive(&mut self, packet: &[u8]) -> Result<Option<Bytes>, UpdateError> {
        debug!(">> {}", hex::encode(packet));
        let reply = self.inner.send_and_receive(packet).await?;
        match &reply {
            Some(bytes) => debug!("<< {}", hex::encode(bytes)),
            None => debug!("<< (no reply)"),
        }
        Ok(reply)
    }
}
