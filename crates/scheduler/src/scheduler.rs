//! Scheduler driver: split every non-tail call, then wrap multiply-called bodies.

use crate::boundary::{separate_shared_handles, Boundary, BoundaryBuilder, ExitSharing};
use crate::catalog::SubgraphCatalog;
use crate::detector::{non_tail_calls, NonTailCallDetector};
use crate::error::{ScheduleError, ScheduleResult, ScheduleWarning};
use crate::links::LinkRecorder;
use crate::report::ScheduleReport;
use crate::splitter::split_at_first_non_tail_call;
use crate::state::{StateTable, SubgraphState};
use callflow_ir::{NodeId, Pass, Program, SubgraphId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Upper bound on split steps; defaults to the program's call count plus one.
    pub max_split_iterations: Option<usize>,
    pub exit_sharing: ExitSharing,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_split_iterations: None,
            exit_sharing: ExitSharing::ByDestination,
        }
    }
}

pub struct ControlFlowScheduler {
    options: SchedulerOptions,
}

/// Mutable bookkeeping for one scheduling run.
#[derive(Default)]
struct Run {
    states: StateTable,
    queue: VecDeque<SubgraphId>,
    links: LinkRecorder,
    warnings: Vec<ScheduleWarning>,
    non_tail_calls: Vec<NodeId>,
    splits: usize,
    boundaries: Vec<Boundary>,
}

impl Run {
    /// Records an analysis result and either queues the subgraph or marks it stable.
    fn settle(&mut self, id: SubgraphId, non_tail_calls: usize) -> ScheduleResult<()> {
        self.states
            .transition(id, SubgraphState::Analyzed { non_tail_calls })?;
        if non_tail_calls > 0 {
            self.states.transition(id, SubgraphState::PendingSplit)?;
            self.queue.push_back(id);
        } else {
            self.states.transition(id, SubgraphState::Stable)?;
        }
        Ok(())
    }
}

impl ControlFlowScheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Schedules `program`. On error the program is left exactly as it was.
    pub fn schedule(&self, program: &mut Program) -> ScheduleResult<ScheduleReport> {
        let mut working = program.clone();
        let report = self.schedule_in_place(&mut working)?;
        *program = working;
        Ok(report)
    }

    fn schedule_in_place(&self, program: &mut Program) -> ScheduleResult<ScheduleReport> {
        let rewired_calls = separate_shared_handles(program);
        let catalog = SubgraphCatalog::build(program)?;
        let detection = NonTailCallDetector::new(program).detect(&catalog)?;
        info!(
            subgraphs = program.subgraphs.len(),
            non_tail_calls = detection.non_tail_count(),
            multiply_called = detection.multiply_called.len(),
            "scheduling control flow"
        );

        let mut run = Run::default();
        for id in program.order.clone() {
            run.states.track(id);
            let count = detection.non_tail_calls.get(&id).map_or(0, Vec::len);
            run.settle(id, count)?;
        }

        self.split_pending(program, &mut run)?;
        self.build_boundaries(program, &mut run)?;
        run.states.finalize()?;

        let (links, mut warnings) = run.links.into_parts();
        warnings.append(&mut run.warnings);
        program
            .links
            .extend(links.iter().map(|(call, link)| (*call, link.clone())));
        let report = ScheduleReport {
            rewired_calls,
            non_tail_calls: run.non_tail_calls,
            links,
            splits: run.splits,
            boundaries: run.boundaries,
            states: run.states.into_inner(),
            warnings,
        };
        info!(
            splits = report.splits,
            links = report.links.len(),
            boundaries = report.boundaries.len(),
            warnings = report.warnings.len(),
            "control flow scheduled"
        );
        Ok(report)
    }

    fn split_pending(&self, program: &mut Program, run: &mut Run) -> ScheduleResult<()> {
        let limit = self
            .options
            .max_split_iterations
            .unwrap_or_else(|| program.call_count() + 1);
        let mut iterations = 0;

        while let Some(id) = run.queue.pop_front() {
            iterations += 1;
            if iterations > limit {
                return Err(ScheduleError::SplitLimitExceeded {
                    subgraph: id,
                    iterations: limit,
                });
            }
            run.states.transition(id, SubgraphState::Split)?;

            let Some(outcome) = split_at_first_non_tail_call(program, id) else {
                run.settle(id, 0)?;
                continue;
            };
            run.splits += 1;
            run.non_tail_calls.push(outcome.call);
            run.links.record_link(outcome.link);

            run.settle(id, non_tail_calls(program, id).len())?;
            run.states.track(outcome.continuation);
            run.settle(outcome.continuation, outcome.remaining_non_tail)?;
        }
        debug!(iterations, limit, "split worklist drained");
        Ok(())
    }

    fn build_boundaries(&self, program: &mut Program, run: &mut Run) -> ScheduleResult<()> {
        let catalog = SubgraphCatalog::build(program)?;
        let builder = BoundaryBuilder::new(self.options.exit_sharing);

        for body in catalog.multiply_called() {
            let callers = catalog.callers(body);
            let groups = builder.group_callers(program, body, &callers, &mut run.warnings)?;
            if groups.is_empty() {
                warn!(subgraph = %body, "no caller reaches a call; boundary not built");
                run.warnings.push(ScheduleWarning::UnusedBoundary { subgraph: body });
                continue;
            }
            if BoundaryBuilder::is_bounded(program, body, &groups) {
                debug!(subgraph = %body, "callers already enter through wrappers");
                continue;
            }

            run.states.track(body);
            run.states.transition(body, SubgraphState::PendingBoundary)?;
            let boundary = builder.build(program, body, groups, &mut run.links);
            for wrapper in &boundary.entrances {
                run.states.track_final(wrapper.entrance);
            }
            for &exit in &boundary.exits {
                run.states.track_final(exit);
            }
            run.states.transition(body, SubgraphState::Bounded)?;
            run.boundaries.push(boundary);
        }
        Ok(())
    }
}

/// Shared slot holding the report of the latest [`ControlFlowPass`] run.
pub type ReportSlot = Arc<Mutex<Option<ScheduleReport>>>;

/// Adapts [`ControlFlowScheduler`] to the IR pass pipeline.
pub struct ControlFlowPass {
    scheduler: ControlFlowScheduler,
    report: ReportSlot,
}

impl ControlFlowPass {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            scheduler: ControlFlowScheduler::new(options),
            report: ReportSlot::default(),
        }
    }

    /// Handle that stays readable after the pass is boxed into a pipeline.
    pub fn report_slot(&self) -> ReportSlot {
        Arc::clone(&self.report)
    }

    pub fn take_report(&self) -> Option<ScheduleReport> {
        take_report(&self.report)
    }
}

pub fn take_report(slot: &ReportSlot) -> Option<ScheduleReport> {
    slot.lock().ok().and_then(|mut report| report.take())
}

impl Pass for ControlFlowPass {
    fn name(&self) -> &str {
        "schedule-control-flow"
    }

    fn run(&self, program: &mut Program) -> anyhow::Result<()> {
        let report = self.scheduler.schedule(program)?;
        if let Ok(mut slot) = self.report.lock() {
            *slot = Some(report);
        }
        Ok(())
    }
}
