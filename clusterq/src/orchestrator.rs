use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use crate::error::Result;
use crate::job::{JobId, JobRequest};
use crate::queue::JobStore;
use crate::telemetry;

/// Submission entry point.
///
/// Validates requests, assigns ids and hands the jobs to the store.
/// Nothing else happens here.
pub struct Orchestrator<S> {
    store: Arc<S>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: JobStore> Orchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Submit one job. Invalid requests are rejected before the store is
    /// touched.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let job = request.into_job(JobId::new(), Utc::now())?;
        let id = self
            .store
            .submit(job)
            .instrument(telemetry::submit_span(1))
            .await?;
        telemetry::record_job_submitted(id);
        Ok(id)
    }

    /// Submit requests in order, stopping at the first failure.
    ///
    /// Jobs accepted before the failure stay submitted.
    pub async fn submit_many(&self, requests: Vec<JobRequest>) -> Result<Vec<JobId>> {
        let span = telemetry::submit_span(requests.len());
        async move {
            let mut ids = Vec::with_capacity(requests.len());
            for request in requests {
                ids.push(self.submit(request).await?);
            }
            Ok(ids)
        }
        .instrument(span)
        .await
    }
}
