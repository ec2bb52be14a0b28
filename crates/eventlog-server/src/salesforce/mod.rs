//! Salesforce REST access to `EventLogFile` exports
//!
//! Listing pages through a SOQL query on `EventLogFile`. Content is streamed
//! as CSV straight from the `LogFile` resource without buffering the file.
//! Application log stats page through `Application_Log__c` the same way.

pub mod token;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use eventlog_common::{Category, FileLocator};
use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SalesforceConfig;
use crate::ingest::metrics::{MetricsRecorder, MetricsRegistry};
use crate::ingest::source::{AppLogStats, EventLogSource, LogFileReader, SourceError};

pub use token::{
    AccessToken, AccessTokenProvider, ClientCredentialsTokenProvider, StaticTokenProvider,
    TokenError,
};

/// One page of a SOQL query response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage<R> {
    #[serde(default)]
    total_size: u64,
    done: bool,
    next_records_url: Option<String>,
    #[serde(default = "Vec::new")]
    records: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct ApplicationLogRecord {
    #[serde(rename = "Log_Level__c")]
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventLogFileRecord {
    log_file: String,
    log_date: String,
}

impl EventLogFileRecord {
    fn into_locator(self, category: Category) -> Option<FileLocator> {
        let log_date = NaiveDate::parse_from_str(self.log_date.get(..10)?, "%Y-%m-%d").ok()?;
        Some(FileLocator {
            category,
            log_date,
            reference: self.log_file,
        })
    }
}

pub struct SalesforceClient {
    client: Client,
    stream_client: Client,
    tokens: Arc<dyn AccessTokenProvider>,
    api_version: String,
    metrics: Arc<dyn MetricsRecorder>,
}

impl SalesforceClient {
    pub fn new(
        config: &SalesforceConfig,
        tokens: Arc<dyn AccessTokenProvider>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("eventlog-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let stream_client = Client::builder()
            .connect_timeout(config.request_timeout())
            .timeout(config.stream_timeout())
            .user_agent(concat!("eventlog-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            stream_client,
            tokens,
            api_version: config.api_version.clone(),
            metrics,
        })
    }

    fn api_url(&self, token: &AccessToken, resource: &str) -> Result<Url, SourceError> {
        let path = format!("/services/data/{}/{}", self.api_version, resource);
        instance_url(token, &path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &AccessToken,
        url: Url,
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&token.access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn list_pages(
        &self,
        token: &AccessToken,
        category: Category,
        files: &mut Vec<FileLocator>,
    ) -> Result<(), SourceError> {
        let soql = format!(
            "SELECT Id, EventType, LogFile, LogDate FROM EventLogFile WHERE EventType='{}'",
            category
        );
        let mut url = self.api_url(token, "query")?;
        url.query_pairs_mut().append_pair("q", &soql);

        loop {
            let page: QueryPage<EventLogFileRecord> = self.get_json(token, url).await?;
            debug!(
                category = %category,
                total_size = page.total_size,
                records = page.records.len(),
                done = page.done,
                "Fetched listing page"
            );

            for record in page.records {
                let raw_date = record.log_date.clone();
                match record.into_locator(category) {
                    Some(locator) => files.push(locator),
                    None => warn!(category = %category, log_date = %raw_date, "Skipping record with unreadable LogDate"),
                }
            }

            match (page.done, page.next_records_url) {
                (false, Some(next)) => url = instance_url(token, &next)?,
                _ => return Ok(()),
            }
        }
    }
}

/// UTC bounds of a local calendar day, in SOQL datetime literal format
fn created_date_window(date: NaiveDate) -> (String, String) {
    let bound = |day: NaiveDate| {
        let midnight = day.and_time(NaiveTime::MIN);
        let utc: DateTime<Utc> = Local
            .from_local_datetime(&midnight)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc());
        utc.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    };
    let next = date.succ_opt().unwrap_or(date);
    (bound(date), bound(next))
}

fn instance_url(token: &AccessToken, path: &str) -> Result<Url, SourceError> {
    Ok(Url::parse(&token.instance_url)?.join(path)?)
}

#[async_trait]
impl EventLogSource for SalesforceClient {
    async fn list_log_files(&self, category: Category) -> Vec<FileLocator> {
        let token = self.tokens.token().await;
        let mut files = Vec::new();
        if let Err(e) = self.list_pages(&token, category, &mut files).await {
            warn!(
                category = %category,
                collected = files.len(),
                error = %e,
                "Listing log files failed, keeping what was collected"
            );
        }
        self.metrics.record_fetched(category, files.len());
        files
    }

    async fn open_log_file(&self, locator: &FileLocator) -> Result<LogFileReader, SourceError> {
        let token = self.tokens.token().await;
        let url = instance_url(&token, &locator.reference)?;

        let response = self
            .stream_client
            .get(url.clone())
            .bearer_auth(&token.access_token)
            .header(ACCEPT, "text/csv")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn org_limits(&self) -> Result<serde_json::Value, SourceError> {
        let token = self.tokens.token().await;
        let url = self.api_url(&token, "limits")?;
        self.get_json(&token, url).await
    }

    async fn application_log_stats(&self, date: NaiveDate) -> Result<AppLogStats, SourceError> {
        let token = self.tokens.token().await;
        let (start, end) = created_date_window(date);
        let soql = format!(
            "SELECT CreatedDate, Log_Level__c FROM Application_Log__c \
             WHERE Log_Level__c IN ('Critical', 'Error') \
             AND CreatedDate >= {start} AND CreatedDate < {end}"
        );
        let mut url = self.api_url(&token, "query")?;
        url.query_pairs_mut().append_pair("q", &soql);

        let mut stats = AppLogStats {
            date,
            error: 0,
            critical: 0,
            complete: true,
        };
        let mut first_page = true;
        loop {
            let page: QueryPage<ApplicationLogRecord> = match self.get_json(&token, url).await {
                Ok(page) => page,
                Err(e) if first_page => return Err(e),
                Err(e) => {
                    warn!(date = %date, error = %e, "Application log paging failed, counts are partial");
                    stats.complete = false;
                    return Ok(stats);
                },
            };
            first_page = false;

            for record in page.records {
                match record.log_level.as_deref() {
                    Some("Critical") => stats.critical += 1,
                    Some("Error") => stats.error += 1,
                    _ => {},
                }
            }

            match (page.done, page.next_records_url) {
                (false, Some(next)) => url = instance_url(&token, &next)?,
                _ => break,
            }
        }

        info!(date = %date, error = stats.error, critical = stats.critical, "Counted application logs");
        Ok(stats)
    }
}

/// Copy every limit that has `Max` and `Remaining` into the limit gauges.
/// Returns the number of limits recorded.
pub fn record_limits(metrics: &MetricsRegistry, limits: &serde_json::Value) -> usize {
    let Some(entries) = limits.as_object() else {
        return 0;
    };

    let mut recorded = 0;
    for (name, entry) in entries {
        let max = entry.get("Max").and_then(serde_json::Value::as_f64);
        let remaining = entry.get("Remaining").and_then(serde_json::Value::as_f64);
        if let (Some(max), Some(remaining)) = (max, remaining) {
            metrics.set_limit(name, max, remaining);
            recorded += 1;
        }
    }
    info!(recorded, "Updated org limit gauges");
    recorded
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_into_locator_takes_date_prefix() {
        let record = EventLogFileRecord {
            log_file: "/services/data/v58.0/sobjects/EventLogFile/0AT1/LogFile".to_string(),
            log_date: "2025-03-16T00:00:00.000+0000".to_string(),
        };
        let locator = record.into_locator(Category::ApexCallout).unwrap();
        assert_eq!(locator.log_date, NaiveDate::from_ymd_opt(2025, 3, 16).unwrap());
        assert!(locator.reference.ends_with("/LogFile"));
    }

    #[test]
    fn test_record_with_short_date_is_rejected() {
        let record = EventLogFileRecord {
            log_file: "/x".to_string(),
            log_date: "2025-03".to_string(),
        };
        assert!(record.into_locator(Category::ApexCallout).is_none());
    }

    #[test]
    fn test_instance_url_joins_absolute_paths() {
        let token = AccessToken {
            access_token: "t".to_string(),
            instance_url: "https://example.my.salesforce.com".to_string(),
        };
        let url = instance_url(&token, "/services/data/v58.0/query/01g-2000").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.my.salesforce.com/services/data/v58.0/query/01g-2000"
        );
    }

    #[test]
    fn test_created_date_window_spans_one_local_day() {
        let (start, end) = created_date_window(NaiveDate::from_ymd_opt(2025, 3, 16).unwrap());
        let parse = |raw: &str| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ").unwrap()
        };
        let hours = (parse(&end) - parse(&start)).num_hours();
        assert!((23..=25).contains(&hours), "window of {hours} hours");
        assert!(start.ends_with('Z'));
    }

    #[test]
    fn test_record_limits_skips_entries_without_counts() {
        let metrics = MetricsRegistry::new().unwrap();
        let limits = json!({
            "DailyApiRequests": { "Max": 15000, "Remaining": 14998 },
            "HourlyODataCallout": { "Max": 10000 },
            "Unrelated": "value"
        });
        assert_eq!(record_limits(&metrics, &limits), 1);
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("sf_limit_remaining{limit=\"DailyApiRequests\"} 14998"));
    }
}
