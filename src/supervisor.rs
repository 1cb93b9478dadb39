//! Supervisor role: drain the progress channel, then report once Sales allows it.

use std::io::Write;

use tracing::{debug, warn};

use crate::channel::ProgressSource;
use crate::error::SimResult;
use crate::ledger::{Observation, ProductionLedger};
use crate::message::{Message, WireError};
use crate::semaphore::Rendezvous;
use crate::shared_state::{OrderSnapshot, SharedOrderState};

pub struct Supervisor<'a, S> {
    source: &'a S,
    ledger: ProductionLedger,
}

impl<'a, S: ProgressSource> Supervisor<'a, S> {
    pub fn new(source: &'a S, workers: u32) -> Self {
        Self {
            source,
            ledger: ProductionLedger::new(workers),
        }
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &ProductionLedger {
        &self.ledger
    }

    /// Block on the channel until every factory has completed. There is no
    /// timeout: a factory that never completes stalls this loop.
    pub fn drain(&mut self, out: &mut impl Write) -> SimResult<()> {
        writeln!(out, "SUPERVISOR: Started")?;
        out.flush()?;
        while !self.ledger.is_settled() {
            let bytes = self.source.recv()?;
            let message = match Message::decode(&bytes) {
                Ok(message) => message,
                Err(WireError::UnknownPurpose(code)) => {
                    debug!(code, "ignoring message with unrecognised purpose");
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed frame");
                    continue;
                }
            };

            match (self.ledger.observe(&message), message) {
                (
                    Observation::Produced {
                        worker_id,
                        parts_made,
                    },
                    Message::Production { worker, .. },
                ) => {
                    writeln!(
                        out,
                        "SUPERVISOR: Factory # {worker_id:2} produced {parts_made:3} parts in {:4} milliSecs",
                        worker.duration_ms
                    )?;
                }
                (
                    Observation::Completed {
                        worker_id,
                        shortfall,
                    },
                    _,
                ) => {
                    writeln!(
                        out,
                        "SUPERVISOR: Factory # {worker_id:2}        COMPLETED its task"
                    )?;
                    debug!(
                        factory = worker_id,
                        outstanding = self.ledger.outstanding(),
                        "factory completed"
                    );
                    if shortfall > 0 {
                        warn!(
                            factory = worker_id,
                            missing_parts = shortfall,
                            "completion total exceeds received production reports"
                        );
                    }
                }
                (Observation::DuplicateCompletion { worker_id }, _) => {
                    warn!(factory = worker_id, "ignoring repeated completion");
                }
                (Observation::UnknownWorker { worker_id }, _) => {
                    warn!(factory = worker_id, "ignoring report from unknown factory");
                }
                (observation, message) => {
                    debug!(?observation, ?message, "ignoring message");
                }
            }
            out.flush()?;
        }
        Ok(())
    }

    /// Compare the received reports with what the factories recorded in
    /// shared memory. A gap means production reports were lost in transit.
    pub fn reconcile(&self, snapshot: &OrderSnapshot) -> bool {
        let reported = self.ledger.grand_total();
        let recorded = u64::from(snapshot.made);
        if reported != recorded {
            warn!(reported, recorded, "reports do not match the shared order state");
            return false;
        }
        true
    }

    /// Phase one of the handshake, then block until Sales grants permission
    /// and print the final report.
    pub fn finish(
        &self,
        rendezvous: &Rendezvous,
        order: &SharedOrderState,
        out: &mut impl Write,
    ) -> SimResult<()> {
        writeln!(
            out,
            "SUPERVISOR: Manufacturing is complete. Awaiting permission to print final report"
        )?;
        out.flush()?;
        rendezvous.announce_done()?;
        rendezvous.await_print()?;

        self.ledger
            .write_report(out, "SUPERVISOR: Final Report", order.order_size())?;
        writeln!(out)?;
        writeln!(out, ">>> Supervisor Terminated")?;
        out.flush()?;
        Ok(())
    }
}
