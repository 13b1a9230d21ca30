pub mod api;
pub mod geolocation;
pub mod visitor;

pub use api::WorkflowApiClient;
pub use geolocation::{resolve_geolocation, HttpGeolocationProvider};
pub use visitor::{detect_device, record_visit, VisitorInfo};

use crate::errors::Result;
use crate::types::{ExecutionRecord, Geolocation, Workflow};
use async_trait::async_trait;

/// Where the active workflows for a page come from.
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn fetch_active(&self, page_url: &str) -> Result<Vec<Workflow>>;
}

/// Receives one record per trigger firing. Failures are logged by the caller
/// and never affect the page.
#[async_trait]
pub trait ExecutionReporter: Send + Sync {
    async fn report(&self, record: &ExecutionRecord) -> Result<()>;
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn locate(&self) -> Result<Geolocation>;
}
