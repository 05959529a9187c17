use std::error::Error;
use std::path::Path;
use std::process;

use clap::Parser;
use log::{error, info};
use smartmeter::db::netznoe::consumption_archive::ConsumptionArchive;
use smartmeter::db::netznoe::lib_smartmeter::{PortalError, SmartMeterClient};
use smartmeter::settings::Settings;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Env file with the portal credentials and the storage root
    #[arg(short, long, default_value = ".env")]
    env_file: String,
}

/// Run this job once a day, late enough for the portal to have finished
/// yesterday's records.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    // settings may also come straight from the process environment
    let _ = dotenvy::from_path(Path::new(&args.env_file));
    let settings = Settings::from_env()?;

    let client = match SmartMeterClient::login(&settings) {
        Ok(client) => client,
        Err(PortalError::Maintenance) => {
            error!("the smartmeter portal is down for maintenance, try again later");
            process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    let archive = ConsumptionArchive {
        base_dir: settings.storage_path.clone(),
    };
    let mut downloaded = 0;
    for meter in client.consumption_info()? {
        info!(
            "looking for missing days of metering point {} ...",
            meter.metering_point_id
        );
        let count = archive.download_missing_days(&client, &meter, settings.measure_start_date)?;
        info!("  {} new files for {}", count, meter.metering_point_id);
        downloaded += count;
    }
    info!("downloaded {} new day files", downloaded);

    Ok(())
}
