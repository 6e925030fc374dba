//! Row intake: turning polled spreadsheet rows into queued jobs.
//!
//! A [`RowSource`] (external: the actual spreadsheet client stays out of
//! this crate) yields row snapshots every cycle. Each snapshot is routed by
//! its status pair: terminal rows release their control-set entry, pending
//! rows become conference jobs, rows awaiting document verification become
//! emission jobs, everything else is skipped. All enqueueing goes through
//! the [`Producer`], so a row whose job is currently executing is not
//! enqueued again.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationError;
use crate::job::{Job, JobType};
use crate::producer::Producer;

/// Errors that can occur during a poll cycle.
#[derive(Debug, Error)]
pub enum PollerError {
    /// The row source failed to produce rows.
    #[error("Row source failed: {0}")]
    Source(String),

    /// A coordination-store operation failed.
    #[error("Coordination store error: {0}")]
    Coordination(#[from] CoordinationError),
}

/// One polled row, already translated out of the spreadsheet API's shape.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    /// Stable row identity (becomes the job identity when non-empty).
    pub id: String,
    /// Human-facing load number; fallback identity component.
    pub load_number: String,
    /// Row reference in the source sheet.
    pub row: u64,
    /// Operational status of the shipment.
    pub status: String,
    /// Emission-workflow status of the row.
    pub emission_status: String,
    /// Full row payload forwarded to the worker function.
    pub payload: Map<String, Value>,
}

impl RowSnapshot {
    /// The job identity for this row: the stable id when present, otherwise
    /// load number + row.
    pub fn job_id(&self) -> String {
        let id = self.id.trim();
        if id.is_empty() {
            format!("{}-{}", self.load_number.trim(), self.row)
        } else {
            id.to_string()
        }
    }
}

/// Source of row snapshots, polled once per cycle.
#[async_trait]
pub trait RowSource: Send + Sync + 'static {
    /// Fetches the current view of all rows.
    async fn fetch_rows(&self) -> Result<Vec<RowSnapshot>, PollerError>;
}

/// What a poll cycle does with one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    /// The row reached a terminal status: release its control-set entry.
    CleanUp,
    /// The row needs a conference pass.
    EnqueueConference,
    /// The row needs its emitted documents verified.
    EnqueueEmission,
    /// Nothing to do for this row.
    Skip,
}

/// Status lists driving the routing decision, plus the cycle interval.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between poll cycles.
    pub poll_interval: Duration,
    /// Emission statuses meaning the row's workflow is finished.
    pub terminal_statuses: Vec<String>,
    /// Emission status that makes a row a conference candidate.
    pub conference_trigger: String,
    /// Shipment statuses eligible for conference.
    pub conference_eligible: Vec<String>,
    /// Emission status that makes a row an emission-verification candidate.
    pub emission_trigger: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            terminal_statuses: vec![
                "Finalizado".to_string(),
                "Nota de Serviço".to_string(),
                "Arquivo c/ Erro".to_string(),
                "Pendente de Infos".to_string(),
                String::new(),
            ],
            conference_trigger: "Pendente".to_string(),
            conference_eligible: vec![
                "ENTREGA FINALIZADA".to_string(),
                "EM TRANSITO".to_string(),
                "AGUARDANDO DESCARGA".to_string(),
            ],
            emission_trigger: "Verificar Emissão".to_string(),
        }
    }
}

/// Decides what to do with one row.
pub fn route_row(snapshot: &RowSnapshot, config: &PollerConfig) -> RowAction {
    if snapshot.load_number.trim().is_empty() {
        return RowAction::Skip;
    }

    let emission_status = snapshot.emission_status.trim();
    if config
        .terminal_statuses
        .iter()
        .any(|status| status == emission_status)
    {
        return RowAction::CleanUp;
    }

    if emission_status == config.conference_trigger {
        if config
            .conference_eligible
            .iter()
            .any(|status| status == snapshot.status.trim())
        {
            return RowAction::EnqueueConference;
        }
        return RowAction::Skip;
    }

    if emission_status == config.emission_trigger {
        return RowAction::EnqueueEmission;
    }

    RowAction::Skip
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Conference jobs accepted this cycle.
    pub enqueued_conference: usize,
    /// Emission jobs accepted this cycle.
    pub enqueued_emission: usize,
    /// Jobs dropped because their identity was already in flight.
    pub already_in_flight: usize,
    /// Control-set entries released for terminal rows.
    pub cleaned: usize,
}

/// Periodically polls a row source and feeds the job queues.
pub struct Poller<S: RowSource> {
    source: S,
    producer: Producer,
    config: PollerConfig,
}

impl<S: RowSource> Poller<S> {
    /// Creates a poller.
    pub fn new(source: S, producer: Producer, config: PollerConfig) -> Self {
        Self {
            source,
            producer,
            config,
        }
    }

    /// Runs one poll cycle: fetch, route, enqueue/clean.
    pub async fn run_cycle(&self) -> Result<CycleStats, PollerError> {
        let rows = self.source.fetch_rows().await?;
        let mut stats = CycleStats::default();

        for snapshot in rows {
            match route_row(&snapshot, &self.config) {
                RowAction::CleanUp => {
                    if self.producer.clear_finished(&snapshot.job_id()).await? {
                        stats.cleaned += 1;
                    }
                }
                RowAction::EnqueueConference => {
                    if self.enqueue(&snapshot, JobType::Conference).await? {
                        stats.enqueued_conference += 1;
                    } else {
                        stats.already_in_flight += 1;
                    }
                }
                RowAction::EnqueueEmission => {
                    if self.enqueue(&snapshot, JobType::Emission).await? {
                        stats.enqueued_emission += 1;
                    } else {
                        stats.already_in_flight += 1;
                    }
                }
                RowAction::Skip => {
                    debug!(row = snapshot.row, "Row skipped");
                }
            }
        }

        info!(
            conference = stats.enqueued_conference,
            emission = stats.enqueued_emission,
            in_flight = stats.already_in_flight,
            cleaned = stats.cleaned,
            "Poll cycle finished"
        );
        Ok(stats)
    }

    async fn enqueue(
        &self,
        snapshot: &RowSnapshot,
        job_type: JobType,
    ) -> Result<bool, CoordinationError> {
        let job = Job::new(snapshot.job_id(), job_type, snapshot.row)
            .with_payload(snapshot.payload.clone());
        self.producer.submit(job).await
    }

    /// Runs poll cycles until a shutdown signal arrives. A failed cycle is
    /// logged and retried after the normal interval.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Poller started"
        );
        loop {
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "Poll cycle failed, retrying next interval");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, load: &str, status: &str, emission_status: &str) -> RowSnapshot {
        RowSnapshot {
            id: id.to_string(),
            load_number: load.to_string(),
            row: 10,
            status: status.to_string(),
            emission_status: emission_status.to_string(),
            payload: Map::new(),
        }
    }

    #[test]
    fn terminal_rows_are_cleaned_up() {
        let config = PollerConfig::default();
        for status in ["Finalizado", "Nota de Serviço", "Arquivo c/ Erro", ""] {
            let row = snapshot("3zx-1", "LT-1", "EM TRANSITO", status);
            assert_eq!(route_row(&row, &config), RowAction::CleanUp, "{:?}", status);
        }
    }

    #[test]
    fn pending_eligible_rows_go_to_conference() {
        let config = PollerConfig::default();
        for status in ["ENTREGA FINALIZADA", "EM TRANSITO", "AGUARDANDO DESCARGA"] {
            let row = snapshot("3zx-2", "LT-2", status, "Pendente");
            assert_eq!(route_row(&row, &config), RowAction::EnqueueConference);
        }
    }

    #[test]
    fn pending_ineligible_rows_are_skipped() {
        let config = PollerConfig::default();
        let row = snapshot("3zx-3", "LT-3", "CANCELADA", "Pendente");
        assert_eq!(route_row(&row, &config), RowAction::Skip);
    }

    #[test]
    fn verification_rows_go_to_emission() {
        let config = PollerConfig::default();
        let row = snapshot("3zx-4", "LT-4", "EM TRANSITO", "Verificar Emissão");
        assert_eq!(route_row(&row, &config), RowAction::EnqueueEmission);
    }

    #[test]
    fn rows_without_load_number_are_skipped() {
        let config = PollerConfig::default();
        let row = snapshot("3zx-5", "  ", "EM TRANSITO", "Pendente");
        assert_eq!(route_row(&row, &config), RowAction::Skip);
    }

    #[test]
    fn unknown_emission_status_is_skipped() {
        let config = PollerConfig::default();
        let row = snapshot("3zx-6", "LT-6", "EM TRANSITO", "Em Processamento");
        assert_eq!(route_row(&row, &config), RowAction::Skip);
    }

    #[test]
    fn job_id_falls_back_to_load_number_and_row() {
        let row = snapshot("", "LT-7", "EM TRANSITO", "Pendente");
        assert_eq!(row.job_id(), "LT-7-10");

        let row = snapshot("3zx-7", "LT-7", "EM TRANSITO", "Pendente");
        assert_eq!(row.job_id(), "3zx-7");
    }
}
