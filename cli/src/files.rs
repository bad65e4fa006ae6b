use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use badgelink::EntryKind;

use crate::session::{LinkOptions, structured, token};
use crate::{CliError, print_progress};

pub(crate) fn heartbeat(opts: &LinkOptions) -> Result<(), CliError> {
    let reply = structured(opts, |badge| Ok(badge.heartbeat()?))?;
    println!("Badge answered: {reply}");
    Ok(())
}

pub(crate) fn list_dir(opts: &LinkOptions, path: &str) -> Result<(), CliError> {
    let listing = structured(opts, |badge| Ok(badge.get_dir(path)?))?;
    println!("{}:", listing.dir);
    for dir in &listing.dirs {
        println!("  {dir}/");
    }
    for file in &listing.files {
        println!("  {file}");
    }
    Ok(())
}

/// Directory listing through the token family, with sizes and times
pub(crate) fn list_dir_records(
    opts: &LinkOptions,
    path: &str,
) -> Result<(), CliError> {
    let entries = token(opts, true, |badge| Ok(badge.wusb_list_dir(path)?))?;
    println!("{0: <10}  {1: <10}  {2:}", "size", "mtime", "name");
    println!("==============================");
    for (kind, entry) in entries {
        let suffix = if kind == EntryKind::Directory { "/" } else { "" };
        println!(
            "{0: <10}  {1: <10}  {2:}{3:}",
            entry.size, entry.mtime, entry.name, suffix
        );
    }
    Ok(())
}

pub(crate) fn cat(
    opts: &LinkOptions,
    path: &str,
    out: Option<&Path>,
) -> Result<(), CliError> {
    let data = structured(opts, |badge| Ok(badge.read_file(path)?))?;
    match out {
        Some(out) => {
            fs::write(out, &data)?;
            println!("Wrote {} bytes to {}", data.len(), out.display());
        }
        None => io::stdout().write_all(&data)?,
    }
    Ok(())
}

pub(crate) fn push(
    opts: &LinkOptions,
    path: &str,
    file: &Path,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    println!("Writing {} ({} bytes)...", path, data.len());
    structured(opts, |badge| {
        badge.write_file(path, &data, |sent, total| {
            print_progress("Writing", sent, total)
        })?;
        println!();
        Ok(())
    })
}

pub(crate) fn remove(opts: &LinkOptions, path: &str) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.delete_file(path)?))
}

pub(crate) fn make_dir(opts: &LinkOptions, path: &str) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.make_dir(path)?))
}

pub(crate) fn copy(
    opts: &LinkOptions,
    source: &str,
    destination: &str,
) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.duplicate_file(source, destination)?))
}

pub(crate) fn rename(
    opts: &LinkOptions,
    source: &str,
    destination: &str,
) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.move_file(source, destination)?))
}

pub(crate) fn execute(opts: &LinkOptions, path: &str) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.execute_file(path)?))
}
