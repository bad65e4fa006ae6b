use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use clap::{Parser, Subcommand};
use parse_size::parse_size;

use apps::*;
use error::CliError;
use files::*;
use fpga::*;
use session::LinkOptions;

mod apps;
mod error;
mod files;
mod fpga;
mod session;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// vendor ID (ex: "16d0")
    #[clap(short, long, value_parser=hex_u16, global = true)]
    vendor: Option<u16>,
    /// product ID (ex: "0f9a")
    #[clap(short, long, value_parser=hex_u16, global = true)]
    product: Option<u16>,
    /// reply timeout in seconds
    #[clap(short, long, global = true)]
    timeout: Option<u64>,
    /// largest single write (ex: 512, 2K)
    #[clap(long, value_parser=parse_chunk_size, global = true)]
    chunk_size: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list installed apps
    Apps {
        /// ask for app sizes instead of file ids
        #[clap(short, long)]
        sizes: bool,
    },
    /// install an app
    Install {
        /// app name
        name: String,
        /// app binary
        file: PathBuf,
        /// start the app once installed
        #[clap(short, long)]
        run: bool,
    },
    /// remove an app
    Remove {
        /// app name
        name: String,
    },
    /// start an installed app
    Run {
        /// app name
        name: String,
    },
    /// list a directory
    Ls {
        /// directory (ex: "/internal")
        path: String,
    },
    /// list a directory with sizes and modification times
    FsLs {
        /// directory (ex: "/sd")
        path: String,
    },
    /// check the badge is responding
    Heartbeat,
    /// read a file
    Cat {
        /// file on the badge
        path: String,
        /// local file to write (stdout if omitted)
        out: Option<PathBuf>,
    },
    /// write a file
    Push {
        /// file on the badge
        path: String,
        /// local file
        file: PathBuf,
    },
    /// delete a file
    Rm {
        /// file on the badge
        path: String,
    },
    /// create a directory
    Mkdir {
        /// directory on the badge
        path: String,
    },
    /// copy a file
    Cp {
        source: String,
        destination: String,
    },
    /// move or rename a file
    Mv {
        source: String,
        destination: String,
    },
    /// execute a file
    Exec {
        /// file on the badge
        path: String,
    },
    /// load an FPGA bitstream
    Fpga {
        /// bitstream binary
        bitstream: PathBuf,
        /// serial port (ex: "/dev/ttyACM0"), USB bridge if omitted
        #[clap(long)]
        port: Option<String>,
        /// seconds to show the badge's console after loading (UART only)
        #[clap(long, default_value_t = 5)]
        monitor: u64,
        /// data bindings: "-fid" clears, "=fid:path" binds a file on the
        /// badge, "fid:file" sends a local file (UART only)
        bindings: Vec<String>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Apps { sizes: false }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    match len.try_into() {
        Ok(0) => Err("chunk size must not be zero".to_string()),
        Ok(len) => Ok(len),
        Err(e) => Err(format!("{e}")),
    }
}

pub(crate) fn print_progress(label: &str, done: usize, total: usize) {
    let (percentage, filled) = if total == 0 {
        (100, 60)
    } else {
        ((100 * done) / total, (60 * done) / total)
    };
    print!(
        "\r  {} {:3}% [{}]",
        label,
        percentage,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    let opts = LinkOptions {
        vendor: cli.vendor,
        product: cli.product,
        timeout: cli.timeout,
        chunk_size: cli.chunk_size,
    };

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::Apps { sizes: false } => list_apps(&opts),
        Commands::Apps { sizes: true } => list_apps_sizes(&opts),
        Commands::Install { name, file, run } => install(&opts, name, file, *run),
        Commands::Remove { name } => apps::remove(&opts, name),
        Commands::Run { name } => run(&opts, name),
        Commands::Ls { path } => list_dir(&opts, path),
        Commands::FsLs { path } => list_dir_records(&opts, path),
        Commands::Heartbeat => heartbeat(&opts),
        Commands::Cat { path, out } => cat(&opts, path, out.as_deref()),
        Commands::Push { path, file } => push(&opts, path, file),
        Commands::Rm { path } => files::remove(&opts, path),
        Commands::Mkdir { path } => make_dir(&opts, path),
        Commands::Cp {
            source,
            destination,
        } => copy(&opts, source, destination),
        Commands::Mv {
            source,
            destination,
        } => rename(&opts, source, destination),
        Commands::Exec { path } => execute(&opts, path),
        Commands::Fpga {
            bitstream,
            port,
            monitor,
            bindings,
        } => load_bitstream(
            &opts,
            bitstream,
            port.as_deref(),
            Duration::from_secs(*monitor),
            bindings,
        ),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
