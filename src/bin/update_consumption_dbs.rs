use std::error::Error;
use std::path::Path;

use clap::Parser;
use log::info;
use smartmeter::db::netznoe::consumption_archive::ConsumptionArchive;
use smartmeter::settings::Settings;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Env file with the portal credentials and the storage root
    #[arg(short, long, default_value = ".env")]
    env_file: String,
}

/// Run this job after every download run.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let _ = dotenvy::from_path(Path::new(&args.env_file));
    let settings = Settings::from_env()?;

    let archive = ConsumptionArchive {
        base_dir: settings.storage_path,
    };
    let merged = archive.update_duckdb_all()?;
    info!("merged {} new rows over all metering points", merged);

    Ok(())
}
