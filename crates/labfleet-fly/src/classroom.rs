//! Outbound classroom integration over HTTP

use crate::config::ClassroomConfig;
use crate::machines::USER_AGENT;
use async_trait::async_trait;
use labfleet_core::{ClassroomClient, IntegrationError, ScoreReport};
use reqwest::Client;
use std::time::Duration;

/// `POST`s each score report as JSON to the classroom's endpoint
#[derive(Debug, Clone)]
pub struct HttpClassroom {
    http: Client,
    config: ClassroomConfig,
}

impl HttpClassroom {
    /// Client for `config`
    ///
    /// # Errors
    /// [`IntegrationError::Unreachable`] if the HTTP client cannot be built.
    pub fn new(config: ClassroomConfig) -> Result<Self, IntegrationError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IntegrationError::Unreachable(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ClassroomClient for HttpClassroom {
    async fn report(&self, report: &ScoreReport) -> Result<(), IntegrationError> {
        if self.config.report_url.is_empty() {
            return Err(IntegrationError::Unreachable(
                "no classroom report_url configured".into(),
            ));
        }
        let mut request = self.http.post(&self.config.report_url).json(report);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| IntegrationError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(IntegrationError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
