/*!
The notice poller queries the instance metadata service for a spot reclamation notice.

The metadata service answers `200 OK` on the termination-time path once the instance has been scheduled for
reclamation, with the termination time as the response body. Any other status means no notice has been issued.
*/
use crate::config::AgentConfig;
use models::constants::{
    METADATA_TOKEN_HEADER, METADATA_TOKEN_PATH, METADATA_TOKEN_TTL_HEADER,
    METADATA_TOKEN_TTL_SECONDS,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use snafu::ResultExt;
use std::fmt;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

/// The result of a single query against the reclamation notice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The instance is scheduled for reclamation.
    NoticePresent {
        /// When the provider will reclaim the instance, if the notice carried a readable time.
        termination_time: Option<DateTime<Utc>>,
    },
    /// The metadata service answered with a status other than `200 OK`.
    NoticeAbsent { status: u16 },
    /// The metadata service could not be queried.
    SignalError { cause: String },
}

impl PollOutcome {
    pub fn is_present(&self) -> bool {
        matches!(self, PollOutcome::NoticePresent { .. })
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::NoticePresent {
                termination_time: Some(time),
            } => write!(f, "{} (terminating at {})", StatusCode::OK.as_u16(), time.to_rfc3339()),
            PollOutcome::NoticePresent {
                termination_time: None,
            } => write!(f, "{}", StatusCode::OK.as_u16()),
            PollOutcome::NoticeAbsent { status } => write!(f, "{}", status),
            PollOutcome::SignalError { cause } => write!(f, "unreachable ({})", cause),
        }
    }
}

#[async_trait]
/// A source of reclamation notices. `poll` never fails: every problem querying the source is reported as
/// [`PollOutcome::SignalError`], so that a flaky source can never stop the watcher.
pub trait NoticeSource: Send + Sync {
    async fn poll(&self) -> PollOutcome;
}

#[cfg(test)]
mock! {
    /// A Mock NoticeSource for use in tests.
    pub NoticeSource {}
    #[async_trait]
    impl NoticeSource for NoticeSource {
        async fn poll(&self) -> PollOutcome;
    }
}

/// Queries the spot termination-time entry of the instance metadata service over HTTP.
#[derive(Clone, Debug)]
pub struct MetadataNoticeSource {
    http_client: reqwest::Client,
    notice_url: String,
    /// Set when session tokens (IMDSv2) are in use.
    token_url: Option<String>,
}

impl MetadataNoticeSource {
    pub fn new(
        endpoint: &str,
        notice_path: &str,
        request_timeout: Duration,
        imds_v2_enabled: bool,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context(notice_error::HttpClientCreateSnafu)?;

        Ok(MetadataNoticeSource {
            http_client,
            notice_url: format!("{}{}", endpoint, notice_path),
            token_url: imds_v2_enabled.then(|| format!("{}{}", endpoint, METADATA_TOKEN_PATH)),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(
            &config.notice_endpoint,
            &config.notice_path,
            config.notice_request_timeout,
            config.imds_v2_enabled,
        )
    }

    pub fn notice_url(&self) -> &str {
        &self.notice_url
    }

    async fn session_token(&self, token_url: &str) -> reqwest::Result<String> {
        self.http_client
            .put(token_url)
            .header(METADATA_TOKEN_TTL_HEADER, METADATA_TOKEN_TTL_SECONDS.to_string())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    async fn query(&self) -> reqwest::Result<PollOutcome> {
        let mut request = self.http_client.get(&self.notice_url);
        if let Some(token_url) = &self.token_url {
            let token = self.session_token(token_url).await?;
            request = request.header(METADATA_TOKEN_HEADER, token.trim());
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Ok(PollOutcome::NoticeAbsent {
                status: status.as_u16(),
            });
        }

        // The notice is present regardless of whether its body can be read.
        let termination_time = match response.text().await {
            Ok(body) => parse_termination_time(&body),
            Err(e) => {
                event!(Level::WARN, "Unable to read termination notice body: '{}'", e);
                None
            }
        };
        Ok(PollOutcome::NoticePresent { termination_time })
    }
}

#[async_trait]
impl NoticeSource for MetadataNoticeSource {
    #[instrument(skip(self), fields(url = %self.notice_url))]
    async fn poll(&self) -> PollOutcome {
        match self.query().await {
            Ok(outcome) => outcome,
            Err(e) => PollOutcome::SignalError {
                cause: e.to_string(),
            },
        }
    }
}

/// Parses the termination time carried by a reclamation notice, e.g. `2015-01-05T18:02:00Z`.
fn parse_termination_time(body: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(body.trim()) {
        Ok(time) => Some(time.with_timezone(&Utc)),
        Err(e) => {
            event!(
                Level::WARN,
                "Termination notice carried an unreadable time '{}': '{}'",
                body.trim(),
                e
            );
            None
        }
    }
}

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, notice_error::Error>;

pub mod notice_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create HTTP client for the metadata service: '{}'", source))]
        HttpClientCreate { source: reqwest::Error },
    }
}
