use async_trait::async_trait;
use thiserror::Error;

use crate::event::ProcessedEvent;

pub mod bigquery;
pub mod print;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to build sink client: {0}")]
    ClientBuild(String),
    #[error("failed to obtain access token: {0}")]
    Auth(String),
    #[error("warehouse request failed: {0}")]
    Request(String),
    #[error("warehouse rejected rows: {0}")]
    RowErrors(String),
}

#[async_trait]
pub trait EventSink {
    async fn store(&self, event: ProcessedEvent) -> Result<(), SinkError>;
}
