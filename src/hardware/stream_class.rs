//! USB sample stream class
//!
//! # Design
//! A vendor specific interface with a single bulk-IN endpoint. Every capture buffer is sent as one
//! bulk transfer: a sequence of full packets, terminated by a short or zero length packet. The host
//! reads with a request size of at least one buffer.
//!
//! The class keeps at most one transfer. Its end is reported through [StreamClass::take_completion()]
//! and must be forwarded to the submission sink. A bus reset aborts the transfer.
//!
//! Capture can also be controlled with vendor requests to the interface, see [Request].
use iq_pipeline::hal::{BulkIn, Busy};
use iq_pipeline::{BufferHandle, Transfer, TransferStatus};
use num_enum::TryFromPrimitive;
use usb_device::class_prelude::*;
use usb_device::control::{Recipient, RequestType};

/// Vendor interface class code.
const CLASS_VENDOR: u8 = 0xFF;

/// Host requests (`bRequest` of vendor OUT requests to the interface).
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Request {
    Start = 1,
    Stop = 2,
}

struct Progress {
    transfer: Transfer,
    offset: usize,
    terminated: bool,
}

pub struct StreamClass<'a, B: UsbBus> {
    interface: InterfaceNumber,
    endpoint: EndpointIn<'a, B>,
    progress: Option<Progress>,
    completion: Option<(BufferHandle, TransferStatus)>,
    request: Option<Request>,
}

impl<'a, B: UsbBus> StreamClass<'a, B> {
    pub fn new(alloc: &'a UsbBusAllocator<B>, max_packet_size: u16) -> Self {
        Self {
            interface: alloc.interface(),
            endpoint: alloc.bulk(max_packet_size),
            progress: None,
            completion: None,
            request: None,
        }
    }

    /// The end of the last accepted transfer, if any.
    pub fn take_completion(
        &mut self,
    ) -> Option<(BufferHandle, TransferStatus)> {
        self.completion.take()
    }

    /// The last request from the host, if any.
    pub fn take_request(&mut self) -> Option<Request> {
        self.request.take()
    }

    /// Write the next packet of the transfer.
    ///
    /// # Returns
    /// True if the transfer was already completely written.
    fn advance(
        endpoint: &EndpointIn<'a, B>,
        progress: &mut Progress,
    ) -> usb_device::Result<bool> {
        // Note(unsafe): The buffer is owned by the USB hardware until the completion is taken.
        let data = unsafe { progress.transfer.as_slice() };
        if progress.terminated {
            return Ok(true);
        }

        let packet = endpoint.max_packet_size() as usize;
        let end = data.len().min(progress.offset + packet);
        endpoint.write(&data[progress.offset..end])?;

        // A short packet ends the transfer. A full last packet needs a zero length packet.
        progress.terminated = end - progress.offset < packet;
        progress.offset = end;
        Ok(false)
    }

    fn abort(&mut self) {
        if let Some(progress) = self.progress.take() {
            self.completion =
                Some((progress.transfer.handle, TransferStatus::Aborted));
        }
    }
}

impl<B: UsbBus> BulkIn for StreamClass<'_, B> {
    fn write(&mut self, transfer: Transfer) -> Result<(), Busy> {
        if self.progress.is_some() {
            return Err(Busy);
        }

        let mut progress = Progress {
            transfer,
            offset: 0,
            terminated: false,
        };
        match Self::advance(&self.endpoint, &mut progress) {
            Ok(_) => {
                self.progress = Some(progress);
                Ok(())
            }
            Err(UsbError::WouldBlock) => Err(Busy),
            Err(e) => {
                log::warn!("Bulk write failed: {e:?}");
                Err(Busy)
            }
        }
    }
}

impl<B: UsbBus> UsbClass<B> for StreamClass<'_, B> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        writer.interface(self.interface, CLASS_VENDOR, 0x00, 0x00)?;
        writer.endpoint(&self.endpoint)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.abort();
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr != self.endpoint.address() {
            return;
        }
        let Some(progress) = self.progress.as_mut() else {
            return;
        };

        match Self::advance(&self.endpoint, progress) {
            Ok(false) => {}
            Ok(true) => {
                let handle = progress.transfer.handle;
                self.progress = None;
                self.completion = Some((handle, TransferStatus::Complete));
            }
            Err(e) => {
                log::warn!("Bulk transfer failed: {e:?}");
                self.abort();
            }
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = xfer.request();
        if req.request_type != RequestType::Vendor
            || req.recipient != Recipient::Interface
            || req.index != u8::from(self.interface) as u16
        {
            return;
        }

        match Request::try_from(req.request) {
            Ok(request) => {
                self.request = Some(request);
                xfer.accept().ok();
            }
            Err(_) => {
                xfer.reject().ok();
            }
        }
    }
}
