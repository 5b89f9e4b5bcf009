//! nusb backend: vendor requests, the SPI bridge and the streaming endpoints.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, EndpointDirection, In, Out, Recipient,
    TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture};
use parking_lot::Mutex;

use crate::config::DeviceConfig;
use crate::device::{DeviceControl, Direction, FifoLevels};
use crate::error::{Result, SfeError, TransportError};
use crate::pump::{Completion, Slot, TransferQueue};

const VR_GPIO: u8 = 0xAA;
const VR_RATE: u8 = 0xAB;
const RATE_STATUS: u16 = 0x0000;
const RATE_CLOCK: u16 = 0x0001;
const SPI_CHUNK: usize = 64;
const DEFAULT_MAX_PACKET: usize = 512;

fn usb_err<E: Display>(e: E) -> SfeError {
    SfeError::Usb(e.to_string())
}

fn transport_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Cancelled => TransportError::Cancelled,
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Other(other.to_string()),
    }
}

/// Serial numbers of every attached board matching `config`'s VID/PID.
/// Boards without a serial string are listed as empty strings.
pub fn list_devices(config: &DeviceConfig) -> Result<Vec<String>> {
    let devices = nusb::list_devices().wait().map_err(usb_err)?;
    Ok(devices
        .filter(|d| d.vendor_id() == config.vendor_id && d.product_id() == config.product_id)
        .map(|d| d.serial_number().unwrap_or_default().to_string())
        .collect())
}

fn find_interface(config: &DeviceConfig) -> Result<Interface> {
    let info = nusb::list_devices()
        .wait()
        .map_err(usb_err)?
        .find(|d| d.vendor_id() == config.vendor_id && d.product_id() == config.product_id)
        .ok_or(SfeError::NotFound)?;
    let device = info.open().wait().map_err(usb_err)?;
    device
        .detach_and_claim_interface(config.interface)
        .wait()
        .map_err(usb_err)
}

fn max_packet_size(interface: &Interface, address: u8) -> usize {
    interface
        .descriptor()
        .and_then(|d| d.endpoints().find(|ep| ep.address() == address))
        .map(|ep| ep.max_packet_size())
        .unwrap_or(DEFAULT_MAX_PACKET)
}

struct SpiPipe {
    out: Endpoint<Bulk, Out>,
    inp: Endpoint<Bulk, In>,
}

/// [`DeviceControl`] over the board's vendor requests and SPI endpoints.
pub struct UsbControl {
    interface: Interface,
    spi: Mutex<SpiPipe>,
    timeout: Duration,
    max_out_packet: usize,
    max_in_packet: usize,
}

impl UsbControl {
    pub fn open(config: &DeviceConfig) -> Result<(Self, UsbTransport)> {
        let interface = find_interface(config)?;
        let spi = SpiPipe {
            out: interface.endpoint::<Bulk, Out>(config.ep_spi_out).map_err(usb_err)?,
            inp: interface.endpoint::<Bulk, In>(config.ep_spi_in).map_err(usb_err)?,
        };
        let max_out_packet = max_packet_size(&interface, config.ep_data_out);
        let max_in_packet = max_packet_size(&interface, config.ep_data_in);
        log::debug!("data endpoints: out {max_out_packet} B, in {max_in_packet} B per packet");

        let transport = UsbTransport {
            interface: interface.clone(),
            ep_out: config.ep_data_out,
            ep_in: config.ep_data_in,
        };
        let control = Self {
            interface,
            spi: Mutex::new(spi),
            timeout: config.control_timeout,
            max_out_packet,
            max_in_packet,
        };
        Ok((control, transport))
    }

    fn vendor_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: 0,
                    length,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| SfeError::Transfer(transport_error(e)))?;
        if data.len() < length as usize {
            return Err(SfeError::Usb(format!(
                "vendor request {request:#04x} returned {} of {length} bytes",
                data.len()
            )));
        }
        Ok(data)
    }
}

impl DeviceControl for UsbControl {
    fn set_gpio(&self, gpio: u8, value: u8) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: VR_GPIO,
                    value: ((gpio as u16) << 8) | value as u16,
                    index: 0,
                    data: &[],
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| SfeError::Transfer(transport_error(e)))
    }

    fn get_gpio(&self, gpio: u8) -> Result<u8> {
        let data = self.vendor_in(VR_GPIO, (gpio as u16) << 8, 1)?;
        Ok(data[0])
    }

    fn spi_transfer(&self, data: &mut [u8]) -> Result<()> {
        let mut pipe = self.spi.lock();
        for chunk in data.chunks_mut(SPI_CHUNK) {
            pipe.out.submit(Buffer::from(chunk.to_vec()));
            let sent = pipe
                .out
                .wait_next_complete(self.timeout)
                .ok_or_else(|| SfeError::Usb("SPI write timed out".into()))?;
            sent.status
                .map_err(|e| SfeError::Transfer(transport_error(e)))?;

            let packet = pipe.inp.max_packet_size();
            let buf = pipe.inp.allocate(packet);
            pipe.inp.submit(buf);
            let recv = pipe
                .inp
                .wait_next_complete(self.timeout)
                .ok_or_else(|| SfeError::Usb("SPI read timed out".into()))?;
            recv.status
                .map_err(|e| SfeError::Transfer(transport_error(e)))?;

            let got = recv.buffer.into_vec();
            let n = recv.actual_len.min(got.len());
            if n != 0 && n != chunk.len() {
                return Err(SfeError::Usb(format!(
                    "SPI sent {} bytes but received {n}",
                    chunk.len()
                )));
            }
            chunk[..n].copy_from_slice(&got[..n]);
        }
        Ok(())
    }

    fn fifo_levels(&self) -> Result<FifoLevels> {
        let data = self.vendor_in(VR_RATE, RATE_STATUS, 2)?;
        Ok(FifoLevels::decode([data[0], data[1]]))
    }

    fn clock_rate(&self) -> Result<u32> {
        let data = self.vendor_in(VR_RATE, RATE_CLOCK, 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    fn max_packet_size(&self, direction: Direction) -> usize {
        match direction {
            Direction::Tx => self.max_out_packet,
            Direction::Rx => self.max_in_packet,
        }
    }
}

/// Opens the streaming endpoints of a claimed interface.
#[derive(Clone)]
pub struct UsbTransport {
    interface: Interface,
    ep_out: u8,
    ep_in: u8,
}

impl UsbTransport {
    pub fn tx_queue(&self) -> Result<BulkQueue<Out>> {
        let endpoint = self
            .interface
            .endpoint::<Bulk, Out>(self.ep_out)
            .map_err(usb_err)?;
        Ok(BulkQueue::new(endpoint))
    }

    pub fn rx_queue(&self) -> Result<BulkQueue<In>> {
        let endpoint = self
            .interface
            .endpoint::<Bulk, In>(self.ep_in)
            .map_err(usb_err)?;
        Ok(BulkQueue::new(endpoint))
    }
}

/// [`TransferQueue`] over an nusb bulk endpoint. Completions come back in
/// submission order, so slot bookkeeping is a FIFO alongside the endpoint.
pub struct BulkQueue<D: EndpointDirection> {
    endpoint: Endpoint<Bulk, D>,
    in_flight: VecDeque<(usize, Vec<usize>)>,
}

impl<D: EndpointDirection> BulkQueue<D> {
    fn new(endpoint: Endpoint<Bulk, D>) -> Self {
        Self {
            endpoint,
            in_flight: VecDeque::new(),
        }
    }

    fn finish(&mut self, done: nusb::transfer::Completion) -> Option<Completion> {
        let (index, packets) = self.in_flight.pop_front()?;
        Some(Completion {
            actual_len: done.actual_len,
            status: done.status.map_err(transport_error),
            slot: Slot {
                index,
                data: done.buffer.into_vec(),
                packets,
            },
        })
    }
}

impl TransferQueue for BulkQueue<Out> {
    fn submit(&mut self, slot: Slot) -> std::result::Result<(), TransportError> {
        self.endpoint.submit(Buffer::from(slot.data));
        self.in_flight.push_back((slot.index, slot.packets));
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        let done = self.endpoint.wait_next_complete(timeout)?;
        self.finish(done)
    }

    fn pending(&self) -> usize {
        self.endpoint.pending()
    }

    fn cancel_all(&mut self) {
        self.endpoint.cancel_all();
    }
}

impl TransferQueue for BulkQueue<In> {
    fn submit(&mut self, slot: Slot) -> std::result::Result<(), TransportError> {
        // Reads land in the slot's own allocation; only the length is reset.
        let packet = self.endpoint.max_packet_size();
        let len = slot.data.len().div_ceil(packet) * packet;
        let mut data = slot.data;
        data.resize(len, 0);
        let mut buf = Buffer::from(data);
        buf.clear();
        buf.set_requested_len(len);
        self.endpoint.submit(buf);
        self.in_flight.push_back((slot.index, slot.packets));
        Ok(())
    }

    fn wait_complete(&mut self, timeout: Duration) -> Option<Completion> {
        let done = self.endpoint.wait_next_complete(timeout)?;
        self.finish(done)
    }

    fn pending(&self) -> usize {
        self.endpoint.pending()
    }

    fn cancel_all(&mut self) {
        self.endpoint.cancel_all();
    }
}
