use std::time::Duration;

/// Link tunables
///
/// The defaults suit the structured family over the USB bridge. Presets
/// for the other transfer styles are provided by [LinkConfig::webusb],
/// [LinkConfig::fpga_usb] and [LinkConfig::uart].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Largest single transport write
    pub chunk_size: usize,
    /// Pause after every chunk, final one included
    pub chunk_delay: Duration,
    /// Largest single transport read
    pub read_size: usize,
    /// Timeout of a single transport read
    pub read_timeout: Duration,
    /// Back-off when a read returned nothing
    pub poll_interval: Duration,
    /// Overall deadline of one exchange
    pub timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            chunk_size: crate::PACKET_CHUNK_SIZE,
            chunk_delay: crate::WEBUSB_CHUNK_DELAY,
            read_size: crate::DEFAULT_READ_SIZE,
            read_timeout: crate::DEFAULT_READ_TIMEOUT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            timeout: crate::DEFAULT_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Token family over the USB bridge
    pub fn webusb() -> Self {
        LinkConfig {
            chunk_size: crate::WEBUSB_CHUNK_SIZE,
            ..Default::default()
        }
    }

    /// Bitstream upload over the USB bridge
    pub fn fpga_usb() -> Self {
        LinkConfig {
            chunk_size: crate::FPGA_CHUNK_SIZE,
            chunk_delay: crate::FPGA_CHUNK_DELAY,
            ..Default::default()
        }
    }

    /// FPGA loader on a plain UART
    pub fn uart() -> Self {
        LinkConfig {
            chunk_size: crate::FPGA_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size > 0 {
            self.chunk_size = chunk_size;
        }
        self
    }

    pub fn with_chunk_delay(mut self, chunk_delay: Duration) -> Self {
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        if read_size > 0 {
            self.read_size = read_size;
        }
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert_eq!(LinkConfig::webusb().chunk_size, 512);
        assert_eq!(LinkConfig::fpga_usb().chunk_size, 2048);
        assert_eq!(
            LinkConfig::fpga_usb().chunk_delay,
            Duration::from_millis(50)
        );
        assert_eq!(LinkConfig::uart().chunk_delay, Duration::ZERO);
    }

    #[test]
    fn test_zero_sizes_keep_defaults() {
        let config = LinkConfig::default().with_chunk_size(0).with_read_size(0);
        assert_eq!(config, LinkConfig::default());
    }
}
