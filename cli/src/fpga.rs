use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use badgelink::{
    Binding, BridgeMode, FpgaLoader, LinkConfig, SerialTransport,
    UART_BAUD_RATE,
};
use clap_num::maybe_hex;

use crate::session::LinkOptions;
use crate::{CliError, print_progress};

/// Binding as given on the command line
#[derive(Debug, PartialEq)]
enum BindingArg {
    /// `-fid`
    Clear(u32),
    /// `=fid:path`, a file on the badge
    Remote(u32, String),
    /// `fid:path`, a local file sent along
    Local(u32, PathBuf),
}

fn parse_binding(arg: &str) -> Result<BindingArg, CliError> {
    let invalid = || CliError::InvalidBinding(arg.to_string());
    if let Some(fid) = arg.strip_prefix('-') {
        return Ok(BindingArg::Clear(maybe_hex(fid).map_err(|_| invalid())?));
    }
    let (remote, rest) = match arg.strip_prefix('=') {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    let (fid, path) = rest.split_once(':').ok_or_else(invalid)?;
    let fid = maybe_hex(fid).map_err(|_| invalid())?;
    if path.is_empty() {
        return Err(invalid());
    }
    Ok(if remote {
        BindingArg::Remote(fid, path.to_string())
    } else {
        BindingArg::Local(fid, PathBuf::from(path))
    })
}

fn load_binding(arg: &str) -> Result<Binding, CliError> {
    Ok(match parse_binding(arg)? {
        BindingArg::Clear(fid) => Binding::Clear { fid },
        BindingArg::Remote(fid, path) => Binding::RemoteFile { fid, path },
        BindingArg::Local(fid, path) => Binding::DataBlock {
            fid,
            data: fs::read(path)?,
        },
    })
}

fn describe(binding: &Binding) -> String {
    match binding {
        Binding::Clear { fid } => format!("Clearing FID 0x{fid:08x}"),
        Binding::RemoteFile { fid, path } => {
            format!("Binding FID 0x{fid:08x} to path '{path}'")
        }
        Binding::DataBlock { fid, data } => format!(
            "Sending data block for FID 0x{fid:08x} ({} bytes)",
            data.len()
        ),
        Binding::Bitstream(data) => {
            format!("Sending bitstream ({} bytes)", data.len())
        }
    }
}

pub(crate) fn load_bitstream(
    opts: &LinkOptions,
    file: &Path,
    port: Option<&str>,
    monitor: Duration,
    bindings: &[String],
) -> Result<(), CliError> {
    let bitstream = fs::read(file)?;
    let bindings = bindings
        .iter()
        .map(|arg| load_binding(arg))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(port) = port {
        let serial = SerialTransport::open(port, UART_BAUD_RATE)?;
        println!("Waiting for badge...");
        let mut loader =
            FpgaLoader::new(serial, opts.config(LinkConfig::uart()));
        loader.upload_bitstream_uart(&bitstream, &bindings, |binding| {
            println!("{}", describe(binding))
        })?;
        loader.monitor(monitor, |text| {
            print!("{text}");
            let _ = io::stdout().flush();
        })?;
        println!();
        return Ok(());
    }

    if let Some(binding) = bindings.first() {
        return Err(CliError::InvalidBinding(format!(
            "{} (bindings require --port)",
            describe(binding)
        )));
    }

    let mut usb = opts.open()?;
    usb.enter_mode(BridgeMode::FpgaDownload)?;
    println!("Waiting for ESP32 to boot into FPGA download mode...");
    let result = {
        let mut loader =
            FpgaLoader::new(&mut usb, opts.config(LinkConfig::fpga_usb()));
        loader.upload_bitstream_usb(&bitstream, |sent, total| {
            print_progress("Loading", sent, total)
        })
    };
    println!();
    let detached = usb.detach();
    result?;
    Ok(detached?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("-0x10").ok(), Some(BindingArg::Clear(16)));
        assert_eq!(
            parse_binding("=3:/sd/font.bin").ok(),
            Some(BindingArg::Remote(3, "/sd/font.bin".into()))
        );
        assert_eq!(
            parse_binding("0x7:data/tiles.bin").ok(),
            Some(BindingArg::Local(7, PathBuf::from("data/tiles.bin")))
        );
        for arg in ["tiles.bin", "-zz", "=3:", "q:file"] {
            assert!(parse_binding(arg).is_err(), "{arg} accepted");
        }
    }
}
