//! Bounded background queue that enriches and stores events after the response is sent.

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::enrichment::Enricher;
use crate::event::PendingEvent;
use crate::prometheus::report_dropped_events;
use crate::sinks::{EventSink, SinkError};

const STORE_FAILURES_TOTAL: &str = "capture_store_failures_total";
const FAILURE_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("pipeline queue is full")]
    QueueFull,
    #[error("pipeline is shut down")]
    Closed,
}

/// A row the sink refused.
#[derive(Debug)]
pub struct StoreFailure {
    pub event_name: String,
    pub error: SinkError,
}

#[derive(Clone)]
pub struct Pipeline {
    tx: mpsc::Sender<PendingEvent>,
}

impl Pipeline {
    /// Start the dispatcher. Store failures are reported on the returned receiver; the
    /// handle resolves once every `Pipeline` clone is dropped and queued work has finished.
    pub fn start(
        enricher: Enricher,
        sink: Arc<dyn EventSink + Send + Sync>,
        capacity: usize,
        concurrency: usize,
    ) -> (Pipeline, mpsc::Receiver<StoreFailure>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);

        let handle = tokio::spawn(dispatch(
            rx,
            enricher,
            sink,
            Arc::new(Semaphore::new(concurrency.max(1))),
            failures_tx,
        ));

        (Pipeline { tx }, failures_rx, handle)
    }

    /// Queue an event without waiting. A full or closed queue drops it.
    pub fn schedule(&self, event: PendingEvent) -> Result<(), ScheduleError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event_name = %event.event_name, "pipeline full, dropping event");
                report_dropped_events("queue_full", 1);
                Err(ScheduleError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event_name = %event.event_name, "pipeline closed, dropping event");
                report_dropped_events("queue_closed", 1);
                Err(ScheduleError::Closed)
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<PendingEvent>,
    enricher: Enricher,
    sink: Arc<dyn EventSink + Send + Sync>,
    permits: Arc<Semaphore>,
    failures: mpsc::Sender<StoreFailure>,
) {
    let mut jobs = JoinSet::new();

    while let Some(event) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let enricher = enricher.clone();
        let sink = sink.clone();
        let failures = failures.clone();

        jobs.spawn(async move {
            let event_name = event.event_name.clone();
            let processed = enricher.enrich(event).await;

            if let Err(error) = sink.store(processed).await {
                if let Err(err) = failures.try_send(StoreFailure { event_name, error }) {
                    // nobody is draining failures, at least log it
                    error!("store failed and could not be reported: {:?}", err.into_inner());
                }
            }
            drop(permit);
        });

        // reap finished jobs so the set does not grow unbounded
        while jobs.try_join_next().is_some() {}
    }

    debug!(in_flight = jobs.len(), "pipeline closed, waiting for jobs");
    while jobs.join_next().await.is_some() {}
}

/// Drain store failures into logs and metrics until the pipeline stops.
pub async fn log_failures(mut failures: mpsc::Receiver<StoreFailure>) {
    while let Some(failure) = failures.recv().await {
        counter!(STORE_FAILURES_TOTAL).increment(1);
        error!(
            event_name = %failure.event_name,
            error = %failure.error,
            "store task failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::enrichment::Geolocation;
    use crate::event::ProcessedEvent;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProcessedEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn store(&self, event: ProcessedEvent) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::RowErrors("rejected".to_string()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Blocks every store until released.
    struct GatedSink {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn store(&self, _event: ProcessedEvent) -> Result<(), SinkError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    fn pending(name: &str) -> PendingEvent {
        PendingEvent {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            event_type: "event".to_string(),
            event_name: name.to_string(),
            parameters: "{}".to_string(),
            user_agent: String::new(),
            url: String::new(),
            referrer: String::new(),
            client_id: None,
            hash: None,
            user_id: None,
            consent_given: false,
            client_ip: "10.1.2.3".to_string(),
        }
    }

    #[tokio::test]
    async fn stores_scheduled_events_and_drains_on_close() {
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, _failures, handle) =
            Pipeline::start(Enricher::new(Geolocation::Disabled), sink.clone(), 8, 2);

        for name in ["a", "b", "c"] {
            pipeline.schedule(pending(name)).unwrap();
        }
        drop(pipeline);
        handle.await.unwrap();

        let mut names: Vec<String> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn reports_store_failures() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (pipeline, mut failures, handle) =
            Pipeline::start(Enricher::new(Geolocation::Disabled), sink, 8, 2);

        pipeline.schedule(pending("broken")).unwrap();
        drop(pipeline);
        handle.await.unwrap();

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.event_name, "broken");
        assert!(matches!(failure.error, SinkError::RowErrors(_)));
    }

    #[tokio::test]
    async fn full_queue_drops_events() {
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(GatedSink { gate: gate.clone() });
        let (pipeline, _failures, _handle) =
            Pipeline::start(Enricher::new(Geolocation::Disabled), sink, 1, 1);

        // one job blocked in the sink, one waiting for a permit, one queued
        let mut results = vec![];
        for i in 0..10 {
            results.push(pipeline.schedule(pending(&i.to_string())));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(results.contains(&Err(ScheduleError::QueueFull)));
        gate.notify_waiters();
    }
}
