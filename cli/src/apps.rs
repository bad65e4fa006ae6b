use std::{fs, path::Path};

use badgelink::AppEntry;

use crate::session::{LinkOptions, structured, token};
use crate::{CliError, print_progress};

pub(crate) fn list_apps(opts: &LinkOptions) -> Result<(), CliError> {
    let apps = token(opts, true, |badge| Ok(badge.wusb_list_apps()?))?;
    print_apps(&apps);
    Ok(())
}

/// App listing through the structured family, with sizes
pub(crate) fn list_apps_sizes(opts: &LinkOptions) -> Result<(), CliError> {
    let apps = structured(opts, |badge| Ok(badge.list_apps()?))?;
    print_apps(&apps);
    Ok(())
}

pub(crate) fn install(
    opts: &LinkOptions,
    name: &str,
    file: &Path,
    run: bool,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    println!("Installing application \"{}\" ({} bytes)...", name, data.len());
    // a reset would kill the app that was just started
    token(opts, !run, |badge| {
        badge.wusb_install_app(name, &data, run, |sent, total| {
            print_progress("Writing", sent, total)
        })?;
        println!();
        Ok(())
    })?;
    println!("Operation completed successfully");
    Ok(())
}

pub(crate) fn remove(opts: &LinkOptions, name: &str) -> Result<(), CliError> {
    println!("Removing application \"{name}\"...");
    token(opts, true, |badge| Ok(badge.wusb_remove_app(name)?))?;
    println!("Operation completed successfully");
    Ok(())
}

pub(crate) fn run(opts: &LinkOptions, name: &str) -> Result<(), CliError> {
    structured(opts, |badge| Ok(badge.app_boot(name)?))
}

fn print_apps(apps: &[AppEntry]) {
    let column = |value: Option<u32>| match value {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    };
    println!("Amount of apps: {}", apps.len());
    println!("{0: <5}  {1: <8}  {2:}", "fid", "size", "name");
    println!("==============================");
    for app in apps {
        println!(
            "{0: <5}  {1: <8}  \"{2:}\"",
            column(app.fid),
            column(app.size),
            app.name
        );
    }
}
