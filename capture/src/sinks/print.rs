use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::event::ProcessedEvent;
use crate::sinks::{EventSink, SinkError};

pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn store(&self, event: ProcessedEvent) -> Result<(), SinkError> {
        info!("single event: {:?}", event);
        counter!("capture_events_ingested_total").increment(1);

        Ok(())
    }
}
