//! Concurrent batch delivery.
//!
//! The dispatch loop admits at most `workers` batches at a time (a
//! semaphore) and spawns each send into a `JoinSet`; the moment any send
//! finishes its permit frees the next batch. Each send retries transient
//! failures with backoff, then folds the final response into the run
//! counters as a [`DispatchOutcome`]. A failed batch never fails the run;
//! rejected credentials do.

mod client;
mod response;
mod retry;

pub use client::{Endpoint, RawResponse, Transport, region_base};
pub use response::{DispatchOutcome, RecordFailure, event_outcome, profile_outcome};
pub use retry::{RetryConfig, is_transient_error, is_transient_status};

use crate::chunker::Batch;
use crate::config::RecordType;
use crate::error::{IngestError, Result};
use crate::state::{FailedRecord, RunCounters, RunState};
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Called with every batch outcome.
pub type ResponseHook = Arc<dyn Fn(&DispatchOutcome) + Send + Sync>;
/// Called with every failed attempt and its 1-based attempt number.
pub type ErrorHook = Arc<dyn Fn(&IngestError, u32) + Send + Sync>;

/// Optional monitoring callbacks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_response: Option<ResponseHook>,
    pub on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_response", &self.on_response.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Sends batches for one run.
pub struct Dispatcher {
    /// `None` in dry-run mode.
    transport: Option<Transport>,
    state: Arc<RunState>,
    hooks: Hooks,
}

impl Dispatcher {
    /// # Errors
    /// Returns configuration errors from building the transport.
    pub fn new(state: Arc<RunState>, hooks: Hooks, workers: usize) -> Result<Self> {
        let transport = if state.config.dry_run {
            None
        } else {
            Some(Transport::new(&state.config, workers)?)
        };
        Ok(Self {
            transport,
            state,
            hooks,
        })
    }

    /// Drain `rx` with at most `workers` sends in flight.
    ///
    /// # Errors
    /// Returns the first fatal error (rejected credentials). Remaining
    /// in-flight sends are cancelled and `rx` is closed so upstream stops.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Batch>, workers: usize) -> Result<()> {
        let workers = workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<Result<DispatchOutcome>> = JoinSet::new();
        info!(workers, dry_run = self.transport.is_none(), "dispatch started");

        let mut fatal = None;
        'recv: while let Some(batch) = rx.recv().await {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| IngestError::Closed("dispatch semaphore"))?;
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = flatten(joined) {
                    fatal = Some(e);
                    break 'recv;
                }
            }
            let this = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                this.dispatch(batch).await
            });
        }

        if fatal.is_none() {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = flatten(joined) {
                    fatal = Some(e);
                    break;
                }
            }
        }
        match fatal {
            Some(e) => {
                rx.close();
                tasks.shutdown().await;
                error!(error = %e, "dispatch aborted");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Send one batch and fold its outcome into the counters.
    ///
    /// # Errors
    /// Only fatal errors escape; everything else becomes an outcome.
    pub async fn dispatch(&self, batch: Batch) -> Result<DispatchOutcome> {
        let counters = &self.state.counters;
        RunCounters::add(&counters.batches, 1);
        RunCounters::add(&counters.bytes, batch.bytes as u64);

        let Some(transport) = &self.transport else {
            let outcome = DispatchOutcome::Success {
                num_imported: batch.len() as u64,
            };
            self.fold(&batch, &outcome);
            self.state.keep_dry_run(batch, outcome.clone());
            return Ok(outcome);
        };

        let body = batch
            .to_json_body()
            .map_err(|e| IngestError::Other(anyhow::Error::new(e).context("serialize batch")))
            .and_then(|b| transport.encode_body(b));
        let outcome = match body {
            Ok(body) => self.send_with_retry(transport, body, batch.len()).await?,
            Err(e) => DispatchOutcome::Failure {
                error: e.to_string(),
            },
        };
        self.fold(&batch, &outcome);
        Ok(outcome)
    }

    /// Upload a lookup table as one request.
    ///
    /// # Errors
    /// As for [`dispatch`](Self::dispatch).
    pub async fn upload_table(&self, csv: String, rows: usize) -> Result<DispatchOutcome> {
        let counters = &self.state.counters;
        RunCounters::add(&counters.total, rows as u64);
        RunCounters::add(&counters.batches, 1);
        RunCounters::add(&counters.bytes, csv.len() as u64);
        let outcome = match &self.transport {
            None => DispatchOutcome::Success {
                num_imported: rows as u64,
            },
            Some(transport) => match transport.encode_body(csv.into_bytes()) {
                Ok(body) => self.send_with_retry(transport, body, rows).await?,
                Err(e) => DispatchOutcome::Failure {
                    error: e.to_string(),
                },
            },
        };
        match &outcome {
            DispatchOutcome::Failure { .. } => RunCounters::add(&counters.failed, rows as u64),
            other => RunCounters::add(&counters.success, other.num_imported()),
        }
        self.notify(&outcome);
        Ok(outcome)
    }

    async fn send_with_retry(
        &self,
        transport: &Transport,
        body: Bytes,
        batch_len: usize,
    ) -> Result<DispatchOutcome> {
        let counters = &self.state.counters;
        let retry = &self.state.config.retry;
        let mut retries = 0u32;
        loop {
            RunCounters::add(&counters.requests, 1);
            let attempt = retries + 1;
            let (err, retry_after) = match transport.send(body.clone()).await {
                Ok(resp) if resp.status.is_success() => {
                    return Ok(self.interpret(&resp.body, batch_len));
                }
                Ok(resp) if matches!(resp.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                    let err = IngestError::Auth {
                        url: transport.endpoint().url.to_string(),
                        status: resp.status,
                        body: resp.body,
                    };
                    self.report(&err, attempt);
                    return Err(err);
                }
                Ok(resp) if is_transient_status(resp.status) => {
                    let hint = (resp.status == StatusCode::TOO_MANY_REQUESTS)
                        .then_some(resp.retry_after)
                        .flatten();
                    (
                        IngestError::Http {
                            status: resp.status,
                            body: resp.body,
                        },
                        hint,
                    )
                }
                Ok(resp) => {
                    // Non-transient client error: per-record detail if the
                    // endpoint gave any, otherwise the whole batch failed.
                    let err = IngestError::Http {
                        status: resp.status,
                        body: resp.body,
                    };
                    self.report(&err, attempt);
                    let detail = match &err {
                        IngestError::Http { body, .. }
                            if self.state.config.record_type == RecordType::Event =>
                        {
                            event_outcome(body, batch_len)
                        }
                        _ => None,
                    };
                    return Ok(detail.unwrap_or(DispatchOutcome::Failure {
                        error: err.to_string(),
                    }));
                }
                Err(e) if is_transient_error(&e) => (e, None),
                Err(e) => {
                    self.report(&e, attempt);
                    return Ok(DispatchOutcome::Failure {
                        error: e.to_string(),
                    });
                }
            };

            self.report(&err, attempt);
            if retries >= retry.max_retries {
                warn!(attempts = attempt, error = %err, "giving up on batch");
                return Ok(DispatchOutcome::Failure {
                    error: err.to_string(),
                });
            }
            retries += 1;
            RunCounters::add(&counters.retries, 1);
            if let IngestError::Http { status, .. } = &err {
                if *status == StatusCode::TOO_MANY_REQUESTS {
                    RunCounters::add(&counters.rate_limited, 1);
                } else {
                    RunCounters::add(&counters.server_errors, 1);
                }
            }
            let delay = retry.delay_with_hint(retries, retry_after);
            debug!(retry = retries, ?delay, error = %err, "retrying batch");
            tokio::time::sleep(delay).await;
        }
    }

    fn interpret(&self, body: &str, batch_len: usize) -> DispatchOutcome {
        match self.state.config.record_type {
            RecordType::Event => event_outcome(body, batch_len).unwrap_or(DispatchOutcome::Success {
                num_imported: batch_len as u64,
            }),
            RecordType::User | RecordType::Group => profile_outcome(body, batch_len),
            RecordType::Table => DispatchOutcome::Success {
                num_imported: batch_len as u64,
            },
        }
    }

    fn fold(&self, batch: &Batch, outcome: &DispatchOutcome) {
        let counters = &self.state.counters;
        match outcome {
            DispatchOutcome::Success { .. } => {
                RunCounters::add(&counters.success, batch.len() as u64);
            }
            DispatchOutcome::PartialFailure { failed, .. } => {
                RunCounters::add(&counters.success, (batch.len() - failed.len()) as u64);
                RunCounters::add(&counters.failed, failed.len() as u64);
                for f in failed {
                    self.state.log_failure(FailedRecord {
                        batch: batch.index,
                        index: f.index,
                        message: f.message.clone(),
                        record: batch.records[f.index].clone(),
                    });
                }
            }
            DispatchOutcome::Failure { error } => {
                RunCounters::add(&counters.failed, batch.len() as u64);
                for (index, record) in batch.records.iter().enumerate() {
                    self.state.log_failure(FailedRecord {
                        batch: batch.index,
                        index,
                        message: error.clone(),
                        record: record.clone(),
                    });
                }
            }
        }
        self.notify(outcome);
    }

    fn notify(&self, outcome: &DispatchOutcome) {
        if let Some(hook) = &self.hooks.on_response {
            hook(outcome);
        }
    }

    fn report(&self, err: &IngestError, attempt: u32) {
        if let Some(hook) = &self.hooks.on_error {
            hook(err, attempt);
        }
    }
}

fn flatten(joined: std::result::Result<Result<DispatchOutcome>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            warn!(error = %e, "batch send failed");
            Ok(())
        }
        Err(join) if join.is_panic() => Err(IngestError::Other(anyhow::anyhow!(
            "dispatch task panicked: {join}"
        ))),
        Err(_) => Ok(()),
    }
}
