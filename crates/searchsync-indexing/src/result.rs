//! Bulk write result interpretation.
//!
//! Classifies a [`BulkWriteOutcome`] and resolves the acknowledgement callbacks
//! of every model in it. Classification is first-match-wins:
//!
//! 1. `Unacknowledged`: no result, an unexpected failure, or an
//!    unacknowledged write. Nothing is provably durable; nack everything.
//! 2. `ConsistencyError`: an error index outside the batch. Nack everything
//!    and report loudly.
//! 3. `IncorrectPatch`: fewer non-delete operations matched or upserted than
//!    requested. Some patch hit an unexpected base revision; every patch model
//!    is retried with a full document on the next cycle.
//! 4. `WriteError`: per-index errors that reconcile with the counts, at least
//!    one of them not a duplicate-key conflict. Nack those; ack the rest.
//! 5. `Ok`: ack everything. Duplicate-key conflicts mean a newer document is
//!    already indexed.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use searchsync_types::{ChangeMetadata, WriteModel};

use crate::bulk_write::{BulkWriteOutcome, IndexedWriteError};

/// Classification of one bulk write outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkWriteStatus {
    Unacknowledged,
    ConsistencyError,
    IncorrectPatch,
    WriteError,
    Ok,
}

impl BulkWriteStatus {
    pub fn name(&self) -> &'static str {
        match self {
            BulkWriteStatus::Unacknowledged => "unacknowledged",
            BulkWriteStatus::ConsistencyError => "consistency_error",
            BulkWriteStatus::IncorrectPatch => "incorrect_patch",
            BulkWriteStatus::WriteError => "write_error",
            BulkWriteStatus::Ok => "ok",
        }
    }
}

impl std::fmt::Display for BulkWriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What interpretation did with one batch.
#[derive(Debug)]
pub struct ResultReport {
    pub status: BulkWriteStatus,
    pub acked: usize,
    pub nacked: usize,
    /// Changes to enqueue again, forcing a full retrieval
    pub retries: Vec<ChangeMetadata>,
}

/// Classify an outcome without touching its models.
pub fn classify(outcome: &BulkWriteOutcome) -> BulkWriteStatus {
    let result = match (&outcome.result, &outcome.unexpected) {
        (Some(result), None) if result.acknowledged => result,
        _ => return BulkWriteStatus::Unacknowledged,
    };

    let size = outcome.batch_size();
    if outcome.errors.iter().any(|e| e.index >= size) {
        return BulkWriteStatus::ConsistencyError;
    }

    let non_delete = outcome.models.iter().filter(|m| !m.is_delete()).count();
    let non_delete_errors = outcome
        .errors
        .iter()
        .filter(|e| !outcome.models[e.index].is_delete())
        .map(|e| e.index)
        .collect::<std::collections::HashSet<_>>()
        .len();
    if result.matched + result.upserted + non_delete_errors < non_delete {
        return BulkWriteStatus::IncorrectPatch;
    }

    if outcome.errors.iter().any(|e| !e.is_duplicate_key()) {
        return BulkWriteStatus::WriteError;
    }
    BulkWriteStatus::Ok
}

/// Classify an outcome and resolve the callbacks of all its models.
pub fn interpret(outcome: BulkWriteOutcome) -> ResultReport {
    let status = classify(&outcome);
    let mut report = ResultReport {
        status,
        acked: 0,
        nacked: 0,
        retries: Vec::new(),
    };

    match status {
        BulkWriteStatus::Unacknowledged => {
            let reason = outcome
                .unexpected
                .clone()
                .unwrap_or_else(|| "bulk write was not acknowledged".to_string());
            warn!(size = outcome.batch_size(), reason = %reason, "Bulk write not durable");
            nack_all(outcome.models, &reason, &mut report);
        }
        BulkWriteStatus::ConsistencyError => {
            error!(
                size = outcome.batch_size(),
                errors = ?outcome.errors.iter().map(|e| e.index).collect::<Vec<_>>(),
                "Bulk write reported error indices outside the batch"
            );
            nack_all(outcome.models, "inconsistent bulk write result", &mut report);
        }
        BulkWriteStatus::IncorrectPatch => {
            warn!(
                size = outcome.batch_size(),
                result = ?outcome.result,
                "Bulk write matched fewer documents than requested, retrying patches in full"
            );
            let failed = failed_indices(&outcome.errors);
            for (index, model) in outcome.models.into_iter().enumerate() {
                if model.is_patch() {
                    report.retries.push(model.into_metadata().into_full_retry());
                } else {
                    resolve(model, failed.get(&index).copied(), &mut report);
                }
            }
        }
        BulkWriteStatus::WriteError | BulkWriteStatus::Ok => {
            let failed = failed_indices(&outcome.errors);
            for (index, model) in outcome.models.into_iter().enumerate() {
                resolve(model, failed.get(&index).copied(), &mut report);
            }
        }
    }

    debug!(
        status = %report.status,
        acked = report.acked,
        nacked = report.nacked,
        retries = report.retries.len(),
        "Interpreted bulk write"
    );
    report
}

/// Non-duplicate-key errors by index.
fn failed_indices(errors: &[IndexedWriteError]) -> HashMap<usize, &IndexedWriteError> {
    errors
        .iter()
        .filter(|e| !e.is_duplicate_key())
        .map(|e| (e.index, e))
        .collect()
}

fn resolve(model: WriteModel, failure: Option<&IndexedWriteError>, report: &mut ResultReport) {
    let mut metadata = model.into_metadata();
    match failure {
        Some(error) => {
            debug!(
                thing_id = %metadata.thing_id,
                code = error.code,
                message = %error.message,
                "Write failed"
            );
            metadata.send_nack(format!("write failed with code {}: {}", error.code, error.message));
            report.nacked += 1;
        }
        None => {
            metadata.send_ack();
            report.acked += 1;
        }
    }
}

fn nack_all(models: Vec<WriteModel>, reason: &str, report: &mut ResultReport) {
    for model in models {
        model.into_metadata().send_nack(reason);
        report.nacked += 1;
    }
}
