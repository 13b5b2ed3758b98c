pub mod archive;
pub mod cipher;
pub mod constants;
pub mod crc;
pub mod error;
pub mod gateway;
pub mod hexfile;
pub mod packet;
pub mod simulator;
pub mod transport;
pub mod upload;

// Re-export the main types for easy access
pub use archive::{FirmwareArchive, FirmwareImage, FirmwareProduct};
pub use error::UpdateError;
pub use gateway::{GatewayClient, GatewayConfig, GatewayTransport, NodeInfo};
pub use simulator::FakeDevice;
pub use transport::{LoggingTransport, Transport};
pub use upload::{UploadOutcome, Uploader};

#[cfg(test)]
mod tests;
