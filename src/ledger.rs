//! Per-factory production totals and the completion countdown.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::message::Message;
use crate::types::WorkerId;

/// Running totals for one factory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactoryTally {
    pub parts: u32,
    pub iterations: u32,
    pub completed: bool,
}

/// What the ledger did with one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// A batch was added to the factory's totals.
    Produced {
        worker_id: WorkerId,
        parts_made: u32,
    },
    /// The factory completed. `shortfall` is how many parts the factory
    /// claims to have made beyond what its production reports covered.
    Completed {
        worker_id: WorkerId,
        shortfall: u32,
    },
    /// A second completion for an already completed factory.
    DuplicateCompletion { worker_id: WorkerId },
    /// A report naming an id outside `1..=N`.
    UnknownWorker { worker_id: WorkerId },
    /// A message that carries no factory report.
    Ignored,
}

/// Id-keyed aggregation of factory reports with a countdown of factories that
/// have not completed yet.
#[derive(Debug, Clone)]
pub struct ProductionLedger {
    tallies: BTreeMap<WorkerId, FactoryTally>,
    outstanding: u32,
}

impl ProductionLedger {
    /// Track factories `1..=workers`.
    pub fn new(workers: u32) -> Self {
        Self {
            tallies: (1..=workers).map(|id| (id, FactoryTally::default())).collect(),
            outstanding: workers,
        }
    }

    pub fn observe(&mut self, message: &Message) -> Observation {
        match *message {
            Message::Production { worker, parts_made } => {
                let Some(tally) = self.tallies.get_mut(&worker.worker_id) else {
                    return Observation::UnknownWorker {
                        worker_id: worker.worker_id,
                    };
                };
                tally.parts = tally.parts.saturating_add(parts_made);
                tally.iterations += 1;
                Observation::Produced {
                    worker_id: worker.worker_id,
                    parts_made,
                }
            }
            Message::Completion {
                worker,
                total_parts_made,
                ..
            } => {
                let Some(tally) = self.tallies.get_mut(&worker.worker_id) else {
                    return Observation::UnknownWorker {
                        worker_id: worker.worker_id,
                    };
                };
                if tally.completed {
                    return Observation::DuplicateCompletion {
                        worker_id: worker.worker_id,
                    };
                }
                tally.completed = true;
                self.outstanding -= 1;
                Observation::Completed {
                    worker_id: worker.worker_id,
                    shortfall: total_parts_made.saturating_sub(tally.parts),
                }
            }
            Message::Request { .. } | Message::Confirmation { .. } => Observation::Ignored,
        }
    }

    /// Factories that have not reported completion yet.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn is_settled(&self) -> bool {
        self.outstanding == 0
    }

    #[cfg(test)]
    pub fn tally(&self, worker_id: WorkerId) -> Option<&FactoryTally> {
        self.tallies.get(&worker_id)
    }

    pub fn grand_total(&self) -> u64 {
        self.tallies.values().map(|t| u64::from(t.parts)).sum()
    }

    /// Per-factory lines followed by the grand total against the order size.
    pub fn write_report(
        &self,
        out: &mut impl Write,
        title: &str,
        order_size: u32,
    ) -> io::Result<()> {
        writeln!(out)?;
        writeln!(out, "****** {title} ******")?;
        for (id, tally) in &self.tallies {
            writeln!(
                out,
                "Factory # {id:3} made a total of {:5} parts in {:5} iterations",
                tally.parts, tally.iterations
            )?;
        }
        writeln!(out, "===============================")?;
        writeln!(
            out,
            "Grand total parts made = {:5}   vs   order size of {:5}",
            self.grand_total(),
            order_size
        )?;
        out.flush()
    }
}
