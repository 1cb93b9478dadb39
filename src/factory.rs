//! Factory role: claim a batch, produce it, report it, repeat.

use std::fmt;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::ProgressSink;
use crate::error::SimResult;
use crate::message::{Message, WorkerTag};
use crate::semaphore::LogLock;
use crate::shared_state::SharedOrderState;
use crate::types::{WorkerId, WorkerSpec};

/// Lifetime totals of one factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactorySummary {
    pub total_parts: u32,
    pub iterations: u32,
    /// Batches whose production report could not be delivered.
    pub undelivered: u32,
}

/// One factory bound to the shared order, the log lock and the progress channel.
pub struct Factory<'a, L, S> {
    spec: WorkerSpec,
    order: &'a SharedOrderState,
    lock: &'a L,
    sink: &'a S,
}

impl<'a, L: LogLock, S: ProgressSink> Factory<'a, L, S> {
    pub fn new(spec: WorkerSpec, order: &'a SharedOrderState, lock: &'a L, sink: &'a S) -> Self {
        Self {
            spec,
            order,
            lock,
            sink,
        }
    }

    fn tag(&self) -> WorkerTag {
        WorkerTag {
            worker_id: self.spec.id,
            capacity: self.spec.capacity,
            duration_ms: self.spec.duration_ms,
        }
    }

    /// Run until the order is exhausted. Every line written to `out` is
    /// written while the log lock is held. Log lines are best effort: a
    /// failed write never interrupts a claim, a record or the completion.
    pub fn run(&self, out: &mut impl Write) -> SimResult<FactorySummary> {
        let WorkerSpec {
            id,
            capacity,
            duration_ms,
        } = self.spec;
        self.lock.critical(|| {
            emit(
                out,
                id,
                format_args!(
                    "Factory # {id:2}: STARTED. My Capacity = {capacity:3}, in {duration_ms:4} milliSeconds"
                ),
            )
        })?;

        let mut summary = FactorySummary::default();
        while self.order.remaining() > 0 {
            let amount = self.lock.critical(|| {
                // Another factory may have taken the rest since the unlocked check.
                if self.order.remaining() == 0 {
                    return 0;
                }
                let amount = self.order.claim(capacity);
                emit(
                    out,
                    id,
                    format_args!(
                        "Factory # {id:2}: Going to make {amount:3} parts in {duration_ms:4} milliSecs"
                    ),
                );
                amount
            })?;
            if amount == 0 {
                break;
            }

            thread::sleep(Duration::from_millis(u64::from(duration_ms)));

            self.lock.critical(|| self.order.record(amount))?;
            summary.total_parts += amount;
            summary.iterations += 1;

            let report = Message::Production {
                worker: self.tag(),
                parts_made: amount,
            };
            if let Err(err) = self.sink.send(&report.encode()) {
                summary.undelivered += 1;
                self.lock.critical(|| {
                    warn!(factory = id, parts = amount, error = %err, "production report lost")
                })?;
            }
        }

        let completion = Message::Completion {
            worker: self.tag(),
            total_parts_made: summary.total_parts,
            iterations: summary.iterations,
        };
        if let Err(err) = self.sink.send(&completion.encode()) {
            self.lock
                .critical(|| warn!(factory = id, error = %err, "completion report lost"))?;
        }

        self.lock.critical(|| {
            self.order.retire_worker();
            emit(
                out,
                id,
                format_args!(
                    ">>> Factory # {id:2}: Terminating after making total of {:4} parts in {:4} iterations",
                    summary.total_parts, summary.iterations
                ),
            )
        })?;
        debug!(factory = id, ?summary, "factory finished");
        Ok(summary)
    }
}

/// Write one log line, reporting a failed write instead of propagating it.
fn emit(out: &mut impl Write, factory: WorkerId, line: fmt::Arguments<'_>) {
    if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
        warn!(factory, error = %err, "failed to write log line");
    }
}
