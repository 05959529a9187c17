use std::{env, error::Error};

use jiff::civil::Date;

/// Run configuration for both binaries, read from the process environment.
/// The binaries load an env file first, so `.env`-style files work too.
#[derive(Clone)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub measure_start_date: Date,
    pub storage_path: String,
    pub user_agent: String,
}

impl Settings {
    pub fn from_env() -> Result<Settings, Box<dyn Error>> {
        Ok(Settings {
            username: var("WEB_PORTAL_USERNAME")?,
            password: var("WEB_PORTAL_PASSWORD")?,
            measure_start_date: var("MEASURE_START_DATE")?
                .parse()
                .map_err(|e| format!("failed to parse MEASURE_START_DATE: {}", e))?,
            storage_path: var("STORAGE_PATH")?,
            user_agent: var("USER_AGENT")?,
        })
    }
}

fn var(name: &str) -> Result<String, String> {
    env::var(name).map_err(|_| format!("environment variable {} is not set", name))
}
