use std::time::Duration;

use badgelink::{Badge, BridgeMode, LinkConfig, UsbTransport};
use log::debug;

use crate::CliError;

/// Link settings shared by all subcommands
pub(crate) struct LinkOptions {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub timeout: Option<u64>,
    pub chunk_size: Option<usize>,
}

impl LinkOptions {
    pub fn config(&self, base: LinkConfig) -> LinkConfig {
        let mut config = base;
        if let Some(secs) = self.timeout {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(size) = self.chunk_size {
            config = config.with_chunk_size(size);
        }
        debug!("{config:?}");
        config
    }

    pub fn open(&self) -> Result<UsbTransport, CliError> {
        println!("Connecting...");
        Ok(UsbTransport::open(self.vendor, self.product)?)
    }
}

type UsbBadge<'a> = Badge<&'a mut UsbTransport>;

/// Run `f` against the structured family, then switch the bridge off
pub(crate) fn structured<R, F>(opts: &LinkOptions, f: F) -> Result<R, CliError>
where
    F: FnOnce(&mut UsbBadge) -> Result<R, CliError>,
{
    let mut usb = opts.open()?;
    usb.boot_webusb()?;
    let result = {
        let mut badge = Badge::new(&mut usb, opts.config(LinkConfig::default()));
        f(&mut badge)
    };
    finish(result, usb.leave(false))
}

/// Run `f` in a token family session
///
/// `reset` restarts the ESP32 once the bridge is switched off.
pub(crate) fn token<R, F>(
    opts: &LinkOptions,
    reset: bool,
    f: F,
) -> Result<R, CliError>
where
    F: FnOnce(&mut UsbBadge) -> Result<R, CliError>,
{
    let mut usb = opts.open()?;
    usb.enter_mode(BridgeMode::WebUsb)?;
    let result = {
        let mut badge = Badge::new(&mut usb, opts.config(LinkConfig::webusb()));
        f(&mut badge)
    };
    finish(result, usb.leave(reset))
}

// an error of the operation takes precedence over one while leaving
fn finish<R>(
    result: Result<R, CliError>,
    left: Result<(), badgelink::ProtocolError>,
) -> Result<R, CliError> {
    let value = result?;
    left?;
    Ok(value)
}
