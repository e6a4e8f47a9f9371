use clap::Parser;
use log::{debug, LevelFilter};
use m4fboot::{
    cli::{config::Config, flash_hex_image, ConnectArgs, FlashArgs},
    logging::initialize_logger,
};
use miette::Result;

/// Write an Intel hex application image to a Cortex-M4F device running the
/// serial bootloader
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    #[command(flatten)]
    flash_args: FlashArgs,
    #[command(flatten)]
    connect_args: ConnectArgs,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Print the help message and exit if the invocation is not correct
    let args = Cli::parse();
    debug!("{:#?}", args);

    // Load any user configuration, if present
    let config = Config::load()?;

    flash_hex_image(&args.connect_args, &args.flash_args, &config)?;
    if !args.flash_args.verify_only {
        println!("Bootload successful");
    }

    Ok(())
}
