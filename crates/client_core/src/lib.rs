//! HTTP client for the stepwise simulation control service.
//!
//! Step calls return as soon as the service has recorded the request; the
//! `wait_for_*` helpers poll until the worker has published a result.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    error::{ApiError, ApiException},
    protocol::{
        BatchCreationReply, EndSimulationReply, RenderFinishedReply, SensorPoseRequest,
        SimulationStatus, StepBatchReply, StepSampleReply, StepSampleRequest,
    },
};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service rejected the request: {0}")]
    Api(#[from] ApiException),
    #[error("gave up waiting for {what} after {waited:?}")]
    Timeout { what: &'static str, waited: Duration },
    #[error("scene engine failed: {0}")]
    EngineFailed(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct SimulationClient {
    http: Client,
    base: Url,
}

impl SimulationClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let mut base = Url::parse(server_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.base
    }

    pub async fn step_batch(&self) -> Result<StepBatchReply> {
        let res = self.http.post(self.endpoint("step/batch")?).send().await?;
        decode(res).await
    }

    pub async fn step_sample(&self, pose: SensorPoseRequest) -> Result<StepSampleReply> {
        let res = self
            .http
            .post(self.endpoint("step/sample")?)
            .json(&StepSampleRequest { pose })
            .send()
            .await?;
        decode(res).await
    }

    pub async fn poll_batch_creation(&self) -> Result<BatchCreationReply> {
        let res = self.http.get(self.endpoint("poll/batch")?).send().await?;
        decode(res).await
    }

    /// Takes the render manifest; a second poll after `done` returns no paths.
    pub async fn poll_render_finished(&self) -> Result<RenderFinishedReply> {
        let res = self.http.post(self.endpoint("poll/render")?).send().await?;
        decode(res).await
    }

    pub async fn end_simulation(&self) -> Result<EndSimulationReply> {
        let res = self.http.post(self.endpoint("end")?).send().await?;
        decode(res).await
    }

    pub async fn status(&self) -> Result<SimulationStatus> {
        let res = self.http.get(self.endpoint("status")?).send().await?;
        decode(res).await
    }

    /// Waits until the most recently requested batch has been consumed and
    /// finished, then returns its creation result.
    pub async fn wait_for_batch(&self, poll: PollSettings) -> Result<BatchCreationReply> {
        let started = Instant::now();
        loop {
            let status = self.status().await?;
            if !status.batch_requested && status.batch_state.is_terminal() {
                break;
            }
            wait_or_give_up("batch creation", started, poll).await?;
        }

        let reply = self.poll_batch_creation().await?;
        match reply.error {
            Some(message) => Err(ClientError::EngineFailed(message)),
            None => Ok(reply),
        }
    }

    /// Waits for the sample named by `ticket` and takes its file manifest.
    pub async fn wait_for_render(
        &self,
        ticket: &StepSampleReply,
        poll: PollSettings,
    ) -> Result<RenderFinishedReply> {
        let started = Instant::now();
        loop {
            let status = self.status().await?;
            let current = status.batch_id == ticket.batch_id && status.sample_id == ticket.sample_id;
            if current && !status.sample_requested && status.rendering_state.is_terminal() {
                break;
            }
            if status.batch_id > ticket.batch_id {
                warn!(
                    batch_id = %ticket.batch_id,
                    sample_id = %ticket.sample_id,
                    "a newer batch replaced the scene before the sample was rendered"
                );
                return Err(ClientError::EngineFailed(format!(
                    "sample {} of batch {} was superseded",
                    ticket.sample_id, ticket.batch_id
                )));
            }
            wait_or_give_up("sample render", started, poll).await?;
        }

        let reply = self.poll_render_finished().await?;
        match reply.error {
            Some(message) => Err(ClientError::EngineFailed(message)),
            None => Ok(reply),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }
}

async fn wait_or_give_up(what: &'static str, started: Instant, poll: PollSettings) -> Result<()> {
    let waited = started.elapsed();
    if waited >= poll.timeout {
        return Err(ClientError::Timeout { what, waited });
    }
    debug!(what, ?waited, "still waiting");
    sleep(poll.interval).await;
    Ok(())
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T> {
    if res.status().is_success() {
        return Ok(res.json().await?);
    }
    let status = res.status();
    match res.json::<ApiError>().await {
        Ok(err) => Err(ClientError::Api(err.into())),
        Err(_) => Err(ClientError::Api(ApiException::new(
            shared::error::ErrorCode::Internal,
            format!("unexpected response status {status}"),
        ))),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
