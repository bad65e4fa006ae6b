//! Byte channels to the badge

use std::io;
use std::time::Duration;

mod serial;
mod usb;

#[cfg(test)]
pub(crate) mod mock;

pub use serial::SerialTransport;
pub use usb::{BridgeMode, UsbTransport};

/// Duplex byte channel
///
/// Writes are best effort and may be short. Reads block for at most
/// `timeout` and return an empty buffer when nothing arrived.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn read(&mut self, max_len: usize, timeout: Duration)
    -> io::Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        (**self).read(max_len, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        (**self).read(max_len, timeout)
    }
}

/// Blocking read helper shared by the adapters: maps a timed out read to
/// an empty buffer
pub(crate) fn read_some<R: io::Read + ?Sized>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max_len];
    match reader.read(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Ok(buf)
        }
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stalled;

    impl io::Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::TimedOut))
        }
    }

    #[test]
    fn test_read_some() {
        let mut data: &[u8] = b"OKOKWUSB";
        assert_eq!(read_some(&mut data, 4).unwrap(), b"OKOK");
        assert_eq!(read_some(&mut data, 128).unwrap(), b"WUSB");
        assert!(read_some(&mut data, 128).unwrap().is_empty());
        assert!(read_some(&mut Stalled, 128).unwrap().is_empty());
    }
}
