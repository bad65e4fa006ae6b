use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::codec::{Binding, Frame, Tag};
use crate::config::LinkConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ProtocolError;
use crate::transport::Transport;

// time the badge needs after the UART sync before it accepts frames
const UART_SETTLE_DELAY: Duration = Duration::from_millis(500);
const UART_FRAME_GAP: Duration = Duration::from_millis(100);

/// Loads bitstreams into the badge's FPGA
///
/// The badge announces it is ready with an `FPGA` marker. Over the USB
/// bridge the bitstream follows as a single frame; over the UART the host
/// echoes the marker and sends any data bindings before the bitstream.
pub struct FpgaLoader<T: Transport> {
    dispatcher: Dispatcher<T>,
    settle_delay: Duration,
    frame_gap: Duration,
}

impl<T: Transport> FpgaLoader<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        FpgaLoader {
            dispatcher: Dispatcher::new(transport, config),
            settle_delay: UART_SETTLE_DELAY,
            frame_gap: UART_FRAME_GAP,
        }
    }

    /// Pauses of the UART flow, after the sync and before every frame
    pub fn with_delays(mut self, settle: Duration, frame_gap: Duration) -> Self {
        self.settle_delay = settle;
        self.frame_gap = frame_gap;
        self
    }

    pub fn into_transport(self) -> T {
        self.dispatcher.into_transport()
    }

    pub fn transport(&self) -> &T {
        self.dispatcher.transport()
    }

    pub fn upload_bitstream_usb<F>(
        &mut self,
        bitstream: &[u8],
        progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(usize, usize),
    {
        self.sync()?;
        info!("Loading {} byte bitstream", bitstream.len());
        let frame = Frame::new(Tag::FPGA, bitstream.to_vec());
        self.dispatcher.send_frame(&frame, progress)
    }

    /// Send `bindings` in order, then the bitstream
    ///
    /// `progress` is called with the frame being sent. Nothing after a
    /// failed frame is sent.
    pub fn upload_bitstream_uart<F>(
        &mut self,
        bitstream: &[u8],
        bindings: &[Binding],
        mut progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(&Binding),
    {
        self.sync()?;
        self.dispatcher.send_raw(Tag::FPGA.as_bytes())?;
        thread::sleep(self.settle_delay);

        let bitstream = Binding::Bitstream(bitstream.to_vec());
        for binding in bindings.iter().chain(std::iter::once(&bitstream)) {
            progress(binding);
            thread::sleep(self.frame_gap);
            let raw = binding.encode();
            debug!("Sending {} byte binding frame", raw.len());
            self.dispatcher.send_raw(&raw)?;
        }
        Ok(())
    }

    /// Forward the badge's console output to `output` for `duration`
    ///
    /// The FPGA loader reports on the console whether it accepted the
    /// frames. Bare `FPGA` markers are dropped.
    pub fn monitor<F>(
        &mut self,
        duration: Duration,
        mut output: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(&str),
    {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            let data = self.dispatcher.read()?;
            if data.is_empty() {
                thread::sleep(self.dispatcher.config().poll_interval);
            } else if data != Tag::FPGA.as_bytes() {
                output(&String::from_utf8_lossy(&data));
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), ProtocolError> {
        let timeout = self.dispatcher.config().timeout;
        self.dispatcher.synchronize(Tag::FPGA, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FRAME_HEADER_LEN, crc32};
    use crate::transport::mock::ScriptedTransport;

    fn config(base: LinkConfig) -> LinkConfig {
        base.with_chunk_delay(Duration::ZERO)
            .with_poll_interval(Duration::ZERO)
            .with_timeout(Duration::from_millis(100))
    }

    fn uart_loader(transport: ScriptedTransport) -> FpgaLoader<ScriptedTransport> {
        FpgaLoader::new(transport, config(LinkConfig::uart()))
            .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_usb_upload() {
        let transport = ScriptedTransport::new().with_fragments([b"FPGA"]);
        let mut loader = FpgaLoader::new(transport, config(LinkConfig::fpga_usb()));
        let bitstream: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        loader.upload_bitstream_usb(&bitstream, |_, _| {}).unwrap();

        let writes = loader.transport().writes();
        assert_eq!(writes[0].len(), FRAME_HEADER_LEN);
        assert_eq!(&writes[0][..4], b"FPGA");
        assert_eq!(writes[0][4..8], 5000u32.to_le_bytes());
        assert_eq!(writes[0][8..12], crc32(&bitstream).to_le_bytes());
        let sizes: Vec<usize> = writes[1..].iter().map(|w| w.len()).collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
    }

    #[test]
    fn test_uart_upload() {
        let transport =
            ScriptedTransport::new().with_fragments([&b"boot\r\nFPGA"[..]]);
        let mut loader = uart_loader(transport);
        let bindings = vec![
            Binding::Clear { fid: 1 },
            Binding::RemoteFile {
                fid: 2,
                path: "/sd/font.bin".into(),
            },
            Binding::DataBlock {
                fid: 3,
                data: b"abc".to_vec(),
            },
        ];
        let mut seen = 0;
        loader
            .upload_bitstream_uart(b"bits", &bindings, |_| seen += 1)
            .unwrap();
        assert_eq!(seen, 4);

        let mut expected = b"FPGA".to_vec();
        for binding in &bindings {
            expected.extend(binding.encode());
        }
        expected.extend(Binding::Bitstream(b"bits".to_vec()).encode());
        assert_eq!(loader.transport().written(), expected);
    }

    #[test]
    fn test_uart_console_output() {
        let transport = ScriptedTransport::new().with_fragments([
            &b"FPGA"[..],
            &b"FPGA"[..],
            &b"bitstream ok\r\n"[..],
            &b"fid 3 bound\r\n"[..],
        ]);
        let mut loader = uart_loader(transport);
        loader.upload_bitstream_uart(b"bits", &[], |_| {}).unwrap();
        let mut console = String::new();
        loader
            .monitor(Duration::from_millis(20), |text| console.push_str(text))
            .unwrap();
        assert_eq!(console, "bitstream ok\r\nfid 3 bound\r\n");
        assert_eq!(loader.transport().pending_reads(), 0);
    }

    #[test]
    fn test_uart_stops_on_failure() {
        let transport = ScriptedTransport::new()
            .with_fragments([b"FPGA"])
            .with_write_limit(16);
        let mut loader = uart_loader(transport);
        let err = loader
            .upload_bitstream_uart(b"bits", &[Binding::Clear { fid: 9 }], |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TransportWrite {
                written: 12,
                requested: 13,
                ..
            }
        ));
        // echo and the truncated clear frame only
        assert_eq!(loader.transport().writes().len(), 2);
    }

    #[test]
    fn test_no_marker() {
        let transport = ScriptedTransport::new().with_fragments([b"WUSB"]);
        let mut loader = uart_loader(transport);
        assert!(matches!(
            loader.upload_bitstream_uart(b"bits", &[], |_| {}),
            Err(ProtocolError::SyncTimeout(tag)) if tag == Tag::FPGA
        ));
        assert!(loader.transport().writes().is_empty());
    }
}
