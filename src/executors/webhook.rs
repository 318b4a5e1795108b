use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{DispatchError, JobExecutor, JobOutcome, payload_mismatch};
use crate::jobs::{Job, JobPayload};

/// Delivers outgoing webhooks and event-destination calls over HTTP.
pub struct WebhookExecutor {
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookExecutor {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl JobExecutor for WebhookExecutor {
    async fn execute(&self, job: &Job, deadline: Duration) -> Result<JobOutcome, DispatchError> {
        let hook = match &job.payload {
            JobPayload::OutgoingWebhook(hook) | JobPayload::EventDestination(hook) => hook,
            _ => return Err(payload_mismatch(job)),
        };
        let mut request = self.client.post(&hook.url).timeout(deadline).json(&hook.body);
        for (name, value) in &hook.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Err(DispatchError::TimedOut(deadline)),
            Err(err) if err.is_builder() => return Err(DispatchError::Rejected(err.to_string())),
            Err(err) => return Err(DispatchError::Transient(err.to_string())),
        };
        let status = response.status();
        debug!(job_id = %job.id, url = %hook.url, status = status.as_u16(), "webhook delivered");
        classify_status(status)
            .map(|()| JobOutcome::Delivered {
                status_code: status.as_u16(),
            })
            .inspect_err(|err| warn!(job_id = %job.id, url = %hook.url, error = %err, "webhook delivery failed"))
    }
}

fn classify_status(status: StatusCode) -> Result<(), DispatchError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DispatchError::Transient(format!("receiver answered {status}")))
    } else {
        Err(DispatchError::Rejected(format!("receiver answered {status}")))
    }
}
