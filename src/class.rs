//! `usb-device` class driving a [`BotSession`].
//!
//! [`MscClass`] registers one interface (mass storage, SCSI transparent
//! command set, Bulk-Only Transport) with a bulk endpoint pair. It splits the
//! session's IN transfers into packets, collects OUT packets into transfers
//! and turns `usb-device` callbacks into session events.

use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointType;
use usb_device::UsbError;

use crate::bot::{BotSession, BulkEndpoints, Endpoint, Event, REQ_BULK_ONLY_RESET, REQ_GET_MAX_LUN};
use crate::scsi::{BlockDevice, BUFFER_SIZE};

pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BBB: u8 = 0x50;

/// Largest bulk packet, high speed.
const MAX_PACKET: usize = 512;
/// An armed read completes once `want` bytes are in, and `want` never
/// exceeds one buffer, so one buffer plus one packet always fits.
const RX_CAPACITY: usize = BUFFER_SIZE + MAX_PACKET;

/// The endpoint pair plus the IN transfer being sent.
struct Port<'a, B: UsbBus> {
    ep_in: EndpointIn<'a, B>,
    ep_out: EndpointOut<'a, B>,
    tx: [u8; BUFFER_SIZE],
    tx_len: usize,
    tx_pos: usize,
    /// A packet is in the endpoint buffer, waiting for the host.
    in_flight: bool,
    /// Length of the armed OUT transfer, 0 when none.
    want: usize,
    /// OUT is stalled until the host clears the halt.
    out_halted: bool,
    aborted: Option<Endpoint>,
}

impl<B: UsbBus> Port<'_, B> {
    /// Drops the transfers in progress. A halt stays until the host clears it.
    fn clear(&mut self) {
        self.tx_len = 0;
        self.tx_pos = 0;
        self.in_flight = false;
        self.want = 0;
        self.aborted = None;
    }

    /// Hands the next packet of the transfer to the endpoint.
    fn flush(&mut self) {
        if self.in_flight || self.tx_pos >= self.tx_len {
            return;
        }
        let end = (self.tx_pos + usize::from(self.ep_in.max_packet_size())).min(self.tx_len);
        match self.ep_in.write(&self.tx[self.tx_pos..end]) {
            Ok(n) => {
                self.tx_pos += n;
                self.in_flight = true;
            }
            Err(UsbError::WouldBlock) => {}
            Err(e) => {
                warn!("MSC: IN write failed: {:?}", e);
                self.tx_len = 0;
                self.tx_pos = 0;
                self.aborted = Some(Endpoint::In);
            }
        }
    }
}

impl<B: UsbBus> BulkEndpoints for Port<'_, B> {
    fn read(&mut self, len: usize) {
        if self.want == 0 {
            self.want = len.clamp(1, BUFFER_SIZE);
        }
    }

    fn write(&mut self, data: &[u8]) {
        if self.tx_pos < self.tx_len {
            warn!("MSC: IN transfer replaced before completion");
        }
        let len = data.len().min(self.tx.len());
        self.tx[..len].copy_from_slice(&data[..len]);
        self.tx_len = len;
        self.tx_pos = 0;
        self.flush();
    }

    fn stall(&mut self, ep: Endpoint) {
        match ep {
            Endpoint::In => {
                self.tx_len = 0;
                self.tx_pos = 0;
                self.in_flight = false;
                self.ep_in.stall();
            }
            Endpoint::Out => {
                self.want = 0;
                self.out_halted = true;
                self.ep_out.stall();
            }
        }
    }
}

/// USB Mass Storage Bulk-Only class.
pub struct MscClass<'a, B: UsbBus, D> {
    interface: InterfaceNumber,
    port: Port<'a, B>,
    rx: [u8; RX_CAPACITY],
    rx_len: usize,
    /// The OUT transfer ended with a short packet.
    rx_done: bool,
    session: BotSession<D>,
    // Observed in control requests, fed to the session on the next poll.
    configured: bool,
    clear_in: bool,
    clear_out: bool,
}

impl<'a, B: UsbBus, D: BlockDevice> MscClass<'a, B, D> {
    /// `max_packet_size` is 64 on full speed, 512 on high speed.
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        max_packet_size: u16,
        session: BotSession<D>,
    ) -> Result<Self, UsbError> {
        if usize::from(max_packet_size) > MAX_PACKET {
            return Err(UsbError::EndpointMemoryOverflow);
        }
        let ep_in = alloc.alloc(None, EndpointType::Bulk, max_packet_size, 0)?;
        let ep_out = alloc.alloc(None, EndpointType::Bulk, max_packet_size, 0)?;

        Ok(Self {
            interface: alloc.interface(),
            port: Port {
                ep_in,
                ep_out,
                tx: [0; BUFFER_SIZE],
                tx_len: 0,
                tx_pos: 0,
                in_flight: false,
                want: 0,
                out_halted: false,
                aborted: None,
            },
            rx: [0; RX_CAPACITY],
            rx_len: 0,
            rx_done: false,
            session,
            configured: false,
            clear_in: false,
            clear_out: false,
        })
    }

    pub fn session(&self) -> &BotSession<D> {
        &self.session
    }

    fn is_ours(&self, index: u16) -> bool {
        index == u16::from(u8::from(self.interface))
    }

    /// Feeds everything pending to the session.
    fn pump(&mut self) {
        if core::mem::take(&mut self.configured) {
            self.rx_len = 0;
            self.rx_done = false;
            self.session.handle(&mut self.port, Event::Configured);
        }
        if core::mem::take(&mut self.clear_out) {
            self.port.out_halted = false;
            self.session.handle(&mut self.port, Event::ClearHalt(Endpoint::Out));
        }
        if core::mem::take(&mut self.clear_in) {
            self.session.handle(&mut self.port, Event::ClearHalt(Endpoint::In));
        }
        if let Some(ep) = self.port.aborted.take() {
            self.session.handle(&mut self.port, Event::Aborted(ep));
        }

        let want = self.port.want;
        if want != 0 && (self.rx_done || self.rx_len >= want) {
            let len = self.rx_len;
            self.rx_len = 0;
            self.rx_done = false;
            self.port.want = 0;
            self.session
                .handle(&mut self.port, Event::OutComplete(&self.rx[..len]));
        }

        if self.port.out_halted {
            self.rx_len = 0;
            self.rx_done = false;
        }
    }

    /// Reads and discards one packet from the halted OUT endpoint.
    fn drain_out(&mut self) {
        let mut packet = [0u8; MAX_PACKET];
        match self.port.ep_out.read(&mut packet) {
            Ok(n) => debug!("MSC: dropped {} bytes on halted OUT", n),
            Err(UsbError::WouldBlock) => {}
            Err(e) => warn!("MSC: OUT read failed: {:?}", e),
        }
    }
}

impl<B: UsbBus, D: BlockDevice> UsbClass<B> for MscClass<'_, B, D> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> usb_device::Result<()> {
        writer.interface(self.interface, CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BBB)?;
        writer.endpoint(&self.port.ep_in)?;
        writer.endpoint(&self.port.ep_out)?;
        Ok(())
    }

    fn reset(&mut self) {
        debug!("MSC: bus reset");
        self.port.clear();
        self.port.out_halted = false;
        self.rx_len = 0;
        self.rx_done = false;
        self.configured = false;
        self.clear_in = false;
        self.clear_out = false;
        self.session.reset();
    }

    fn poll(&mut self) {
        self.port.flush();
        self.pump();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        if req.request_type != RequestType::Class
            || req.recipient != Recipient::Interface
            || !self.is_ours(req.index)
        {
            return;
        }

        let data = self.session.class_request(&mut self.port, req.request);
        if req.request == REQ_GET_MAX_LUN {
            debug!("MSC: get max lun");
        }
        if let Err(e) = xfer.accept_with_static(data) {
            warn!("MSC: control IN failed: {:?}", e);
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();
        match (req.request_type, req.recipient) {
            (RequestType::Class, Recipient::Interface) if self.is_ours(req.index) => {
                if req.request == REQ_BULK_ONLY_RESET {
                    self.port.clear();
                    self.rx_len = 0;
                    self.rx_done = false;
                }
                self.session.class_request(&mut self.port, req.request);
                if let Err(e) = xfer.accept() {
                    warn!("MSC: control OUT failed: {:?}", e);
                }
            }

            // Standard requests are left to the device; only note them.
            (RequestType::Standard, Recipient::Device)
                if req.request == Request::SET_CONFIGURATION && req.value != 0 =>
            {
                self.configured = true;
            }

            (RequestType::Standard, Recipient::Endpoint)
                if req.request == Request::CLEAR_FEATURE
                    && req.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                let address = req.index as u8;
                if address == u8::from(self.port.ep_in.address()) {
                    self.clear_in = true;
                } else if address == u8::from(self.port.ep_out.address()) {
                    self.clear_out = true;
                }
            }

            _ => {}
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr != self.port.ep_out.address() {
            return;
        }
        // Data the host pushed before seeing the stall.
        if self.port.out_halted {
            self.drain_out();
            return;
        }
        // Without an armed read, or with a finished transfer not yet
        // consumed, the packet stays in the FIFO.
        if self.port.want == 0 || self.rx_done {
            return;
        }

        let packet = usize::from(self.port.ep_out.max_packet_size());
        match self.port.ep_out.read(&mut self.rx[self.rx_len..]) {
            Ok(n) => {
                self.rx_len += n;
                if n < packet {
                    self.rx_done = true;
                }
            }
            Err(UsbError::WouldBlock) => {}
            Err(e) => {
                warn!("MSC: OUT read failed: {:?}", e);
                self.rx_len = 0;
                self.port.aborted = Some(Endpoint::Out);
            }
        }
        self.pump();
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr != self.port.ep_in.address() {
            return;
        }
        self.port.in_flight = false;

        if self.port.tx_pos < self.port.tx_len {
            self.port.flush();
        } else if self.port.tx_len != 0 {
            self.port.tx_len = 0;
            self.port.tx_pos = 0;
            self.session.handle(&mut self.port, Event::InComplete);
        }
        self.pump();
    }
}
