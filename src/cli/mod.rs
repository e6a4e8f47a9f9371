//! Command-line interface helpers
//!
//! No stability guaranties apply

use std::path::PathBuf;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::{Result, WrapErr};

use self::config::Config;
use crate::{
    connection::{open_port, Connection},
    error::Error,
    flasher::{ProgressCallbacks, UpdateClient},
    image::{
        hex::{HexImageLoader, UnknownRecordPolicy},
        verify::verify,
        MemoryImage,
    },
};

pub mod config;

/// Port used when neither the command line nor the configuration names one
pub const DEFAULT_PORT: &str = "ttyS0";

/// Serial connection options
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to the target device, e.g. `COM1` or `ttyUSB0`
    pub port: Option<String>,
}

/// Image loading and flashing options
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Intel hex image to write to the device
    pub image: PathBuf,
    /// Reject hex records of unknown type instead of stopping at them
    #[arg(long)]
    pub strict_records: bool,
    /// Parse and verify the image, then exit without contacting the device
    #[arg(long)]
    pub verify_only: bool,
}

/// Translate a user-supplied port name into a device path
///
/// `COMn` names the n-th serial port, `/dev/ttyS{n-1}` on Unix. Names starting
/// with `tty` are looked up in `/dev`.
pub fn parse_port_name(name: &str) -> Result<String, Error> {
    if let Some(number) = name.strip_prefix("COM") {
        return match number.parse::<u32>() {
            Ok(n) if n > 0 && cfg!(windows) => Ok(name.to_owned()),
            Ok(n) if n > 0 => Ok(format!("/dev/ttyS{}", n - 1)),
            _ => Err(Error::InvalidPortName(name.to_owned())),
        };
    }

    if name.starts_with("tty") && name.len() > 3 {
        return Ok(format!("/dev/{name}"));
    }

    Err(Error::InvalidPortName(name.to_owned()))
}

/// Load an image and run every check that must pass before it is sent
pub fn load_image(args: &FlashArgs, config: &Config) -> Result<MemoryImage> {
    let policy = if args.strict_records {
        UnknownRecordPolicy::Reject
    } else {
        config.record_policy()
    };

    let image = HexImageLoader::new(config.layout)
        .unknown_records(policy)
        .load_file(&args.image)
        .wrap_err_with(|| format!("Failed to load image {}", args.image.display()))?;

    let table = verify(&image).map_err(Error::from)?;
    info!(
        "Image spans {} bytes in {} page(s), reset vector {:#010x}",
        image.app_len(),
        image.page_count(),
        table.reset_vector
    );

    Ok(image)
}

/// Load, verify and transmit an image
///
/// The serial port is only opened once the image passed verification.
pub fn flash_hex_image(connect_args: &ConnectArgs, args: &FlashArgs, config: &Config) -> Result<()> {
    let image = load_image(args, config)?;
    if args.verify_only {
        info!("Image verified, not flashing");
        return Ok(());
    }

    let port_name = connect_args
        .port
        .as_deref()
        .or(config.port.as_deref())
        .unwrap_or(DEFAULT_PORT);
    let port_name = parse_port_name(port_name)?;
    debug!("Opening {}", port_name);

    let serial = open_port(&port_name, config.timeout()).map_err(Error::from)?;
    println!("Serial port: {port_name}");
    println!("Waiting for the device...");

    let mut progress = FlashProgress::default();
    UpdateClient::new(Connection::new(serial), &image, &mut progress)
        .with_max_attempts(config.handshake_retries)
        .run()?;

    Ok(())
}

/// Progress bar shown while pages are transmitted
#[derive(Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let pb = ProgressBar::new(total as u64)
            .with_message(format!("{addr:#x}"))
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {pos:>4}/{len:4} pages @ {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    #[cfg(unix)]
    fn com_ports_map_to_ttys() {
        assert_eq!(parse_port_name("COM1").unwrap(), "/dev/ttyS0");
        assert_eq!(parse_port_name("COM12").unwrap(), "/dev/ttyS11");
    }

    #[test]
    fn tty_names_live_in_dev() {
        assert_eq!(parse_port_name("ttyUSB0").unwrap(), "/dev/ttyUSB0");
        assert_eq!(parse_port_name(DEFAULT_PORT).unwrap(), "/dev/ttyS0");
    }

    #[test]
    fn other_names_are_rejected() {
        for name in ["COM0", "COM", "COMx", "tty", "/dev/ttyS0", "usb0"] {
            assert!(
                matches!(parse_port_name(name), Err(Error::InvalidPortName(n)) if n == name),
                "{name} was accepted"
            );
        }
    }
}
