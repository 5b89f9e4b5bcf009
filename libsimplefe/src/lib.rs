//! Streaming driver for the simpleFE SDR front end.
//!
//! A [`DeviceSession`] opens the board, programs the sample-rate divider and
//! enables TX/RX lanes. A [`TransferPump`] per direction keeps a ring of USB
//! transfers in flight, paced on the TX side by a [`RateController`] that
//! watches the board's FIFO level. [`TxStream`] and [`RxStream`] put a
//! blocking sample interface on top.
//!
//! The DSP helpers ([`BlockConvolver`], the polyphase [`Resampler`] and
//! [`Decimator`], [`BpskModulator`]) run on the application side of the ring
//! and never touch the device.

pub mod blkconv;
pub mod config;
pub mod device;
pub mod error;
pub mod polyphase;
pub mod pulse;
pub mod pump;
pub mod rate_control;
pub mod ring_buffer;
pub mod stream;
pub mod usb;
pub mod wire;

#[cfg(test)]
mod mock;

pub use blkconv::BlockConvolver;
pub use config::{DeviceConfig, RateControlConfig, StreamConfig};
pub use device::{
    nearest_sample_rate, supported_sample_rates, DeviceControl, DeviceSession, Direction, HookId, Lanes,
};
pub use error::{Result, SfeError, TransportError};
pub use polyphase::{Decimator, PathConverter, Resampler};
pub use pulse::{root_raised_cosine, BpskModulator};
pub use pump::{Flow, PumpState, StatsSnapshot, TransferPump, TransferQueue};
pub use rate_control::RateController;
pub use ring_buffer::{Conversion, SampleRingBuffer, SharedRingBuffer};
pub use stream::{ComplexRxStream, ComplexTxStream, RealRxStream, RealTxStream, RxStream, TxStream};
pub use usb::{list_devices, UsbControl, UsbTransport};

pub const SIMPLEFE_VER_MAJOR: u32 = 0;
pub const SIMPLEFE_VER_MINOR: u32 = 1;
pub const SIMPLEFE_VER_REVISION: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibVersion {
    pub major_version: u32,
    pub minor_version: u32,
    pub revision: u32,
}

pub fn lib_version() -> LibVersion {
    LibVersion {
        major_version: SIMPLEFE_VER_MAJOR,
        minor_version: SIMPLEFE_VER_MINOR,
        revision: SIMPLEFE_VER_REVISION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_manifest() {
        let v = lib_version();
        let manifest = format!("{}.{}.{}", v.major_version, v.minor_version, v.revision);
        assert_eq!(manifest, env!("CARGO_PKG_VERSION"));
    }
}
