use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use nusb::{
    MaybeFuture,
    io::{EndpointRead, EndpointWrite},
    transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient},
};

use super::{Transport, read_some};
use crate::error::ProtocolError;

// vendor interface of the ESP32 bridge
const BRIDGE_INTERFACE: u8 = 4;

const REQUEST_STATE: u8 = 0x22;
const REQUEST_RESET: u8 = 0x23;
const REQUEST_BAUDRATE: u8 = 0x24;
const REQUEST_MODE: u8 = 0x25;

// in units of 100 baud
const BRIDGE_BAUDRATE: u16 = (crate::UART_BAUD_RATE / 100) as u16;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const BOOT_DELAY: Duration = Duration::from_secs(4);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
const TRANSFER_BUFFER_SIZE: usize = 512;

/// What the ESP32 boots into when the bridge is switched on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BridgeMode {
    WebUsb = 1,
    FpgaDownload = 2,
}

/// Bulk endpoints of the badge's USB bridge
pub struct UsbTransport {
    interface: nusb::Interface,
    reader: EndpointRead<Bulk>,
    writer: EndpointWrite<Bulk>,
}

impl UsbTransport {
    /// Open the first badge matching `vid`/`pid` (badge ids by default)
    pub fn open(vid: Option<u16>, pid: Option<u16>) -> Result<Self, ProtocolError> {
        let vid = vid.unwrap_or(crate::BADGE_VID);
        let pid = pid.unwrap_or(crate::BADGE_PID);
        let info = nusb::list_devices()
            .wait()?
            .find(|dev| dev.vendor_id() == vid && dev.product_id() == pid)
            .ok_or(ProtocolError::DeviceNotFound)?;
        debug!(
            "Found badge {:04x}:{:04x} on bus {}",
            vid,
            pid,
            info.bus_id()
        );

        let device = info.open().wait()?;
        let (ep_in, ep_out) = bulk_endpoints(&device, BRIDGE_INTERFACE)
            .ok_or(ProtocolError::DeviceNotFound)?;
        let interface = device.claim_interface(BRIDGE_INTERFACE).wait()?;
        let reader = interface
            .endpoint::<Bulk, In>(ep_in)?
            .reader(TRANSFER_BUFFER_SIZE);
        let writer = interface
            .endpoint::<Bulk, Out>(ep_out)?
            .writer(TRANSFER_BUFFER_SIZE);

        Ok(UsbTransport {
            interface,
            reader,
            writer,
        })
    }

    /// Switch the bridge on and reset the ESP32 into `mode`
    pub fn enter_mode(&mut self, mode: BridgeMode) -> Result<(), ProtocolError> {
        info!("Switching bridge to {mode:?}");
        self.control(REQUEST_STATE, 1)?;
        self.control(REQUEST_MODE, mode as u16)?;
        self.control(REQUEST_RESET, 0)?;
        self.control(REQUEST_BAUDRATE, BRIDGE_BAUDRATE)
    }

    /// Enter [BridgeMode::WebUsb] and wait for the ESP32 to finish booting
    pub fn boot_webusb(&mut self) -> Result<(), ProtocolError> {
        self.enter_mode(BridgeMode::WebUsb)?;
        thread::sleep(BOOT_DELAY);
        let stale = self.drain().map_err(ProtocolError::TransportRead)?;
        debug!("Dropped {stale} bytes of boot output");
        Ok(())
    }

    /// Switch the bridge off, optionally resetting the ESP32
    pub fn leave(&mut self, reset: bool) -> Result<(), ProtocolError> {
        self.control(REQUEST_MODE, 0)?;
        self.control(REQUEST_STATE, 0)?;
        if reset {
            self.control(REQUEST_RESET, 0)?;
        }
        Ok(())
    }

    /// Switch the bridge off, leaving the ESP32 mode untouched
    pub fn detach(&mut self) -> Result<(), ProtocolError> {
        self.control(REQUEST_STATE, 0)
    }

    /// Discard whatever the badge already sent
    pub fn drain(&mut self) -> io::Result<usize> {
        let mut dropped = 0;
        loop {
            let data = self.read(TRANSFER_BUFFER_SIZE, DRAIN_TIMEOUT)?;
            if data.is_empty() {
                return Ok(dropped);
            }
            dropped += data.len();
        }
    }

    fn control(&self, request: u8, value: u16) -> Result<(), ProtocolError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data: &[],
                },
                CONTROL_TIMEOUT,
            )
            .wait()?)
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(data.len())
    }

    fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        self.reader.set_read_timeout(timeout);
        read_some(&mut self.reader, max_len)
    }
}

fn bulk_endpoints(device: &nusb::Device, interface: u8) -> Option<(u8, u8)> {
    device.configurations().find_map(|config| {
        config.interface_alt_settings().find_map(|alt_setting| {
            if alt_setting.interface_number() != interface
                || alt_setting.alternate_setting() != 0
            {
                return None;
            }
            let addresses: Vec<u8> =
                alt_setting.endpoints().map(|ep| ep.address()).collect();
            let ep_in = addresses.iter().copied().find(|a| a & 0x80 != 0)?;
            let ep_out = addresses.iter().copied().find(|a| a & 0x80 == 0)?;
            Some((ep_in, ep_out))
        })
    })
}
