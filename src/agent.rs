//! Top-level control loop: register, start collectors, then run the heartbeat
//! and delivery loops side by side until shutdown.

use crate::collectors::Collector;
use crate::config::MonitoringConfig;
use crate::node::{NodeError, NodeManager};
use crate::queue::EventQueue;
use crate::shutdown::ShutdownSignal;
use crate::uplink::{ApiClient, EventIngestRequest};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Outcome of one delivery cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    /// Rejected by the server or lost in transport, back on the queue.
    pub failed: usize,
    /// Put back without an attempt because the node had no id.
    pub deferred: usize,
}

pub struct Agent {
    monitoring: MonitoringConfig,
    node: Arc<NodeManager>,
    api: Arc<dyn ApiClient>,
    queue: Arc<EventQueue>,
    collectors: Vec<Box<dyn Collector>>,
}

impl Agent {
    pub fn new(
        monitoring: MonitoringConfig,
        node: Arc<NodeManager>,
        api: Arc<dyn ApiClient>,
        queue: Arc<EventQueue>,
        collectors: Vec<Box<dyn Collector>>,
    ) -> Self {
        Self {
            monitoring,
            node,
            api,
            queue,
            collectors,
        }
    }

    pub fn node(&self) -> &Arc<NodeManager> {
        &self.node
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn collectors(&self) -> &[Box<dyn Collector>] {
        &self.collectors
    }

    /// Runs until `shutdown` fires. Fails only if registration fails, in which
    /// case no collector has been started.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), AgentError> {
        info!("agent starting");

        let registered = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = self.node.register() => Some(result?),
        };
        let Some(node_id) = registered else {
            info!("shutdown requested before registration completed");
            return Ok(());
        };
        info!(node_id, "node registered, starting collectors");

        for collector in &self.collectors {
            if let Err(e) = collector.start(shutdown.clone()).await {
                error!(collector = collector.name(), error = %e, "collector failed to start");
            }
        }
        let enabled = self.collectors.iter().filter(|c| c.is_enabled()).count();
        info!(enabled, total = self.collectors.len(), "agent running");

        tokio::join!(
            self.heartbeat_loop(shutdown.clone()),
            self.delivery_loop(shutdown.clone()),
        );

        info!("agent loops stopped");
        Ok(())
    }

    /// Stops every collector. Safe to call more than once.
    pub async fn stop(&self) {
        info!("stopping collectors");
        for collector in &self.collectors {
            collector.stop().await;
        }
    }

    async fn heartbeat_loop(&self, shutdown: ShutdownSignal) {
        let interval = self.monitoring.heartbeat_interval();
        let retry = self.monitoring.heartbeat_retry();
        while !shutdown.is_triggered() {
            let delay = match self.node.send_heartbeat().await {
                Ok(_) => interval,
                Err(e) => {
                    warn!(error = %e, retry_secs = retry.as_secs(), "heartbeat failed");
                    retry
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("heartbeat loop exited");
    }

    async fn delivery_loop(&self, shutdown: ShutdownSignal) {
        let period = self.monitoring.event_batch_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.deliver_batch().await;
        }
        debug!("delivery loop exited");
    }

    /// Sends up to `event_batch_size` events, one request each. Anything not
    /// delivered goes back on the queue.
    pub async fn deliver_batch(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let batch = self.queue.dequeue_batch(self.monitoring.event_batch_size);
        if batch.is_empty() {
            return report;
        }

        let mut pending = batch.into_iter();
        while let Some(event) = pending.next() {
            let Some(node_id) = self.node.node_id() else {
                let rest: Vec<_> = std::iter::once(event).chain(pending).collect();
                report.deferred = rest.len();
                warn!(count = rest.len(), "node not registered, re-queueing events");
                self.queue.enqueue_all(rest);
                break;
            };

            let request = EventIngestRequest {
                node_id,
                event_type: event.event_type().to_string(),
                severity: event.severity(),
                details: event.details().clone(),
            };
            match self.api.ingest_event(&request).await {
                Ok(()) => {
                    debug!(event_id = event.id(), event_type = event.event_type(), "event delivered");
                    report.sent += 1;
                }
                Err(e) => {
                    error!(
                        event_id = event.id(),
                        event_type = event.event_type(),
                        error = %e,
                        "failed to send event, re-queueing"
                    );
                    self.queue.enqueue(event);
                    report.failed += 1;
                }
            }
        }

        if report.sent > 0 {
            info!(sent = report.sent, failed = report.failed, "processed events");
        }
        report
    }
}
