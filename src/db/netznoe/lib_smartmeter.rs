use std::time::Duration;

use jiff::civil::Date;
use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::settings::Settings;

pub const BASE_URL: &str = "https://smartmeter.netz-noe.at/orchestration";

/// Status the portal answers the login with during maintenance windows.
/// `error_for_status` does not deal with it, 999 is outside the 4xx/5xx range.
const MAINTENANCE_STATUS: u16 = 999;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("the smartmeter portal is down for maintenance (status 999)")]
    Maintenance,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("got {count} consumption records for meter {metering_point_id} on {day}, expected exactly one")]
    UnexpectedRecordCount {
        metering_point_id: String,
        day: Date,
        count: usize,
    },
    #[error("consumption record for meter {metering_point_id} on {day} has no {field} array")]
    MissingField {
        metering_point_id: String,
        day: Date,
        field: &'static str,
    },
}

/// Selector for `User/GetMeteringPointsByBusinesspartnerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    ConsumptionInfo = 2,
    DownloadInfo = 5,
}

/// Only the needed fields of the consumption info response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionInfo {
    pub account_id: String,
    pub metering_point_id: String,
}

/// The day endpoint wraps the record in a one element array; older versions
/// of the portal returned the bare record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DayResponse {
    Records(Vec<Map<String, Value>>),
    Record(Map<String, Value>),
}

/// Cookie based session with the Netz NÖ smartmeter portal.
pub struct SmartMeterClient {
    client: Client,
    base_url: String,
}

impl SmartMeterClient {
    /// Log into the smartmeter portal from Netz NÖ and extend the session
    /// lifetime.
    pub fn login(settings: &Settings) -> Result<SmartMeterClient, PortalError> {
        Self::login_to(BASE_URL, settings)
    }

    /// Same as [`SmartMeterClient::login`] against an alternate base url.
    pub fn login_to(base_url: &str, settings: &Settings) -> Result<SmartMeterClient, PortalError> {
        let client = Client::builder()
            .user_agent(&settings.user_agent)
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .build()?;
        let smartmeter = SmartMeterClient {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        };

        let url = format!("{}/Authentication/Login", smartmeter.base_url);
        let response = smartmeter
            .client
            .post(&url)
            .json(&json!({"user": settings.username, "pwd": settings.password}))
            .send()?;
        if response.status().as_u16() == MAINTENANCE_STATUS {
            return Err(PortalError::Maintenance);
        }
        response.error_for_status()?;

        smartmeter.extend_session_lifetime()?;
        Ok(smartmeter)
    }

    fn extend_session_lifetime(&self) -> Result<(), PortalError> {
        let url = format!("{}/Authentication/ExtendSessionLifetime", self.base_url);
        self.client.get(&url).send()?.error_for_status()?;
        Ok(())
    }

    /// Retrieve all metering points and account ids linked to the login.
    pub fn consumption_info(&self) -> Result<Vec<ConsumptionInfo>, PortalError> {
        let url = format!(
            "{}/User/GetMeteringPointsByBusinesspartnerId",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .query(&[("context", Context::ConsumptionInfo as u8)])
            .send()?
            .error_for_status()?;
        let body: Value = response.json()?;
        debug!("response for '{}' was: {}", url, body);
        Ok(serde_json::from_value(body)?)
    }

    /// Retrieve the consumption record for one day of one metering point,
    /// with the day's mean profile merged in under `meanProfile` when asked
    /// for.  Returns `None` when the portal has no metered values for the
    /// day yet, which is common for the most recent days.
    pub fn consumption_record_for_day(
        &self,
        metering_point_id: &str,
        day: Date,
        include_mean_profile: bool,
    ) -> Result<Option<Map<String, Value>>, PortalError> {
        let url = format!("{}/ConsumptionRecord/Day", self.base_url);
        let day_iso = day.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("meterId", metering_point_id), ("day", day_iso.as_str())])
            .send()?
            .error_for_status()?;
        let body: Value = response.json()?;
        debug!("response for '{}' was: {}", url, body);

        let mut record = match serde_json::from_value::<DayResponse>(body)? {
            DayResponse::Records(mut records) => {
                if records.len() != 1 {
                    return Err(PortalError::UnexpectedRecordCount {
                        metering_point_id: metering_point_id.to_owned(),
                        day,
                        count: records.len(),
                    });
                }
                records.remove(0)
            }
            DayResponse::Record(record) => record,
        };

        if include_mean_profile {
            let mean_profile = self.mean_profile_for_day(metering_point_id, day)?;
            // the freshly fetched profile wins over any inline meanProfile key
            record.insert("meanProfile".to_owned(), mean_profile);
        }

        match record.get("meteredValues") {
            Some(Value::Array(values)) if values.is_empty() => Ok(None),
            Some(Value::Array(_)) => Ok(Some(record)),
            _ => Err(PortalError::MissingField {
                metering_point_id: metering_point_id.to_owned(),
                day,
                field: "meteredValues",
            }),
        }
    }

    /// Retrieve the mean profile for the given day, as returned by the portal.
    fn mean_profile_for_day(
        &self,
        metering_point_id: &str,
        day: Date,
    ) -> Result<Value, PortalError> {
        let url = format!("{}/ConsumptionRecord/MeanProfileDay", self.base_url);
        let day_iso = day.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("meterId", metering_point_id), ("day", day_iso.as_str())])
            .send()?
            .error_for_status()?;
        let body: Value = response.json()?;
        debug!("response for '{}' was: {}", url, body);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;

    use jiff::civil::date;
    use serde_json::json;

    use super::*;

    /// Serve one canned http response per connection, in order, on a loopback
    /// port.  Returns the base url to point the client at and the raw
    /// requests as the server saw them.
    fn serve_canned(responses: Vec<String>) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 8192];
                let n = stream.read(&mut buf).unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        (format!("http://{}", addr), rx)
    }

    fn http_json(status: u16, body: &str) -> String {
        format!(
            "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    fn login_ok() -> Vec<String> {
        // login + session lifetime extension
        vec![http_json(200, "{}"), http_json(200, "{}")]
    }

    fn test_settings() -> Settings {
        Settings {
            username: "user".to_owned(),
            password: "pwd".to_owned(),
            measure_start_date: date(2024, 1, 1),
            storage_path: "/tmp/smartmeter".to_owned(),
            user_agent: "smartmeter-tests".to_owned(),
        }
    }

    #[test]
    fn login_posts_credentials_and_extends_session() {
        let (base_url, requests) = serve_canned(login_ok());
        SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let login = requests.recv().unwrap();
        assert!(login.starts_with("POST /Authentication/Login"));
        assert!(login.contains(r#""user":"user""#));
        assert!(login.contains(r#""pwd":"pwd""#));
        let extend = requests.recv().unwrap();
        assert!(extend.starts_with("GET /Authentication/ExtendSessionLifetime"));
    }

    #[test]
    fn login_maintenance_aborts() {
        let (base_url, _requests) = serve_canned(vec![http_json(999, "{}")]);
        let err = SmartMeterClient::login_to(&base_url, &test_settings())
            .err()
            .unwrap();
        // one canned response only: had the client gone on to extend the
        // session this would be an Http error instead
        assert!(matches!(err, PortalError::Maintenance));
    }

    #[test]
    fn login_propagates_http_errors() {
        let (base_url, _requests) = serve_canned(vec![http_json(503, "{}")]);
        let err = SmartMeterClient::login_to(&base_url, &test_settings())
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::Http(_)));
    }

    #[test]
    fn failing_session_extension_is_fatal() {
        let (base_url, _requests) =
            serve_canned(vec![http_json(200, "{}"), http_json(500, "{}")]);
        let err = SmartMeterClient::login_to(&base_url, &test_settings())
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::Http(_)));
    }

    #[test]
    fn consumption_info_queries_the_consumption_context() {
        let mut responses = login_ok();
        responses.push(http_json(
            200,
            &json!([
                {"accountId": "A1", "meteringPointId": "M1", "typeOfRelationship": "owner"},
                {"accountId": "A1", "meteringPointId": "M2"}
            ])
            .to_string(),
        ));
        let (base_url, requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();
        let infos = client.consumption_info().unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].account_id, "A1");
        assert_eq!(infos[1].metering_point_id, "M2");
        let _login = requests.recv().unwrap();
        let _extend = requests.recv().unwrap();
        let request = requests.recv().unwrap();
        assert!(request.starts_with("GET /User/GetMeteringPointsByBusinesspartnerId?context=2"));
    }

    #[test]
    fn consumption_info_missing_field_is_fatal() {
        let mut responses = login_ok();
        responses.push(http_json(200, &json!([{"accountId": "A1"}]).to_string()));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();
        let err = client.consumption_info().err().unwrap();
        assert!(matches!(err, PortalError::Json(_)));
        assert!(err.to_string().contains("meteringPointId"));
    }

    #[test]
    fn day_record_merges_mean_profile() {
        let mut responses = login_ok();
        responses.push(http_json(
            200,
            &json!([{
                "peakDemandTimes": ["2023-11-26T00:15:00"],
                "meteredValues": [1.5],
                "estimatedValues": [null],
                "meteredPeakDemands": [5.0],
                "estimatedPeakDemands": [0.5]
            }])
            .to_string(),
        ));
        responses.push(http_json(200, &json!([9.0]).to_string()));
        let (base_url, requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let record = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), true)
            .unwrap()
            .unwrap();
        assert_eq!(record["meteredValues"], json!([1.5]));
        assert_eq!(record["meanProfile"], json!([9.0]));

        let _login = requests.recv().unwrap();
        let _extend = requests.recv().unwrap();
        let day = requests.recv().unwrap();
        assert!(day.starts_with("GET /ConsumptionRecord/Day?meterId=AT001&day=2023-11-26"));
        let profile = requests.recv().unwrap();
        assert!(
            profile.starts_with("GET /ConsumptionRecord/MeanProfileDay?meterId=AT001&day=2023-11-26")
        );
    }

    #[test]
    fn mean_profile_overwrites_inline_key() {
        let mut responses = login_ok();
        responses.push(http_json(
            200,
            &json!([{"meteredValues": [1.0], "meanProfile": [111.0]}]).to_string(),
        ));
        responses.push(http_json(200, &json!([9.0]).to_string()));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let record = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), true)
            .unwrap()
            .unwrap();
        assert_eq!(record["meanProfile"], json!([9.0]));
    }

    #[test]
    fn bare_day_record_without_mean_profile_is_accepted() {
        let mut responses = login_ok();
        // the pre-2022 portal returned the record itself, not an array
        responses.push(http_json(
            200,
            &json!({"meteredValues": [1.0, 2.0]}).to_string(),
        ));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let record = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), false)
            .unwrap()
            .unwrap();
        assert_eq!(record["meteredValues"], json!([1.0, 2.0]));
        assert!(!record.contains_key("meanProfile"));
    }

    #[test]
    fn empty_metered_values_mean_day_not_yet_available() {
        let mut responses = login_ok();
        responses.push(http_json(200, &json!([{"meteredValues": []}]).to_string()));
        responses.push(http_json(200, &json!([]).to_string()));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let record = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), true)
            .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn more_than_one_day_record_aborts() {
        let mut responses = login_ok();
        responses.push(http_json(
            200,
            &json!([{"meteredValues": [1.0]}, {"meteredValues": [2.0]}]).to_string(),
        ));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let err = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), true)
            .err()
            .unwrap();
        match err {
            PortalError::UnexpectedRecordCount { count, .. } => assert_eq!(count, 2),
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn missing_metered_values_is_a_shape_error() {
        let mut responses = login_ok();
        responses.push(http_json(
            200,
            &json!([{"peakDemandTimes": ["2023-11-26T00:15:00"]}]).to_string(),
        ));
        let (base_url, _requests) = serve_canned(responses);
        let client = SmartMeterClient::login_to(&base_url, &test_settings()).unwrap();

        let err = client
            .consumption_record_for_day("AT001", date(2023, 11, 26), false)
            .err()
            .unwrap();
        assert!(matches!(err, PortalError::MissingField { .. }));
        assert!(err.to_string().contains("meteredValues"));
    }

    #[ignore]
    #[test]
    fn login_to_real_portal() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        let _ = dotenvy::from_path(Path::new(".env"));
        let settings = Settings::from_env()?;
        let client = SmartMeterClient::login(&settings)?;
        let infos = client.consumption_info()?;
        println!("{:?}", infos);
        Ok(())
    }
}
