use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::error::ProtocolError;
use crate::transport::Transport;

/// Writes a payload in bounded chunks with a pause after each one
///
/// The badge has a small receive buffer and the link has no flow control,
/// so the pause stands in for backpressure. Nothing is retried here.
#[derive(Debug, Clone)]
pub struct ChunkedSender {
    chunk_size: usize,
    delay: Duration,
}

impl ChunkedSender {
    pub fn new(chunk_size: usize, delay: Duration) -> Self {
        ChunkedSender {
            chunk_size: if chunk_size > 0 {
                chunk_size
            } else {
                crate::WEBUSB_CHUNK_SIZE
            },
            delay,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn send<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        data: &[u8],
    ) -> Result<usize, ProtocolError> {
        self.send_with_progress(transport, data, |_, _| {})
    }

    /// Same as [ChunkedSender::send], calling `progress(sent, total)` after
    /// every chunk
    pub fn send_with_progress<T, F>(
        &self,
        transport: &mut T,
        data: &[u8],
        mut progress: F,
    ) -> Result<usize, ProtocolError>
    where
        T: Transport + ?Sized,
        F: FnMut(usize, usize),
    {
        let total = data.len();
        let mut sent = 0;
        debug!(
            "Sending {total} bytes in chunks of {} bytes",
            self.chunk_size
        );

        for chunk in data.chunks(self.chunk_size) {
            let written = match transport.write(chunk) {
                Ok(n) => n,
                Err(err) => {
                    return Err(ProtocolError::TransportWrite {
                        written: sent,
                        requested: total,
                        cause: Some(err),
                    });
                }
            };
            trace!("Wrote {written} of {} bytes", chunk.len());
            sent += written;
            if written < chunk.len() {
                return Err(ProtocolError::TransportWrite {
                    written: sent,
                    requested: total,
                    cause: None,
                });
            }
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            progress(sent, total);
        }
        Ok(sent)
    }
}
