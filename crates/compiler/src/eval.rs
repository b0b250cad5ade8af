//! Control-equivalence evaluation.
//!
//! Every case is run twice: the reference interpreter executes the program as
//! written, and the sequential executor runs the scheduled plan. A case passes
//! when both produce the same outputs and enter every body subgraph the same
//! number of times. Results are collected in a reproducible JSON report.

use crate::pipeline::CompileArtifacts;
use crate::samples::{random_program, samples, SampleProgram};
use crate::session::CompilerSession;
use anyhow::Result;
use callflow_runtime::Execution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum CaseOutcome {
    Equivalent {
        max_abs_error: f64,
        body_entries: usize,
    },
    Diverged {
        reason: String,
    },
    Rejected {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalenceResult {
    pub case: String,
    pub splits: usize,
    pub links: usize,
    pub entrances: usize,
    pub expect_rejection: bool,
    pub outcome: CaseOutcome,
}

impl EquivalenceResult {
    pub fn passed(&self) -> bool {
        match self.outcome {
            CaseOutcome::Equivalent { .. } => !self.expect_rejection,
            CaseOutcome::Rejected { .. } => self.expect_rejection,
            CaseOutcome::Diverged { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub exit_sharing: String,
    pub generated_at_unix_ms: u128,
    pub cases: Vec<EquivalenceResult>,
}

impl EvaluationReport {
    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(EquivalenceResult::passed)
    }

    pub fn failures(&self) -> Vec<&EquivalenceResult> {
        self.cases.iter().filter(|case| !case.passed()).collect()
    }

    pub fn as_map(&self) -> BTreeMap<&str, &EquivalenceResult> {
        self.cases
            .iter()
            .map(|case| (case.case.as_str(), case))
            .collect()
    }

    /// Save report to JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Compares a reference run with a scheduled run of the same inputs.
pub fn compare_executions(reference: &Execution, scheduled: &Execution) -> CaseOutcome {
    if reference.outputs.len() != scheduled.outputs.len() {
        return CaseOutcome::Diverged {
            reason: format!(
                "reference produced {} outputs, scheduled {}",
                reference.outputs.len(),
                scheduled.outputs.len()
            ),
        };
    }
    let mut max_abs_error = 0.0_f64;
    for (index, (expected, actual)) in reference
        .outputs
        .iter()
        .zip(&scheduled.outputs)
        .enumerate()
    {
        if expected.shape() != actual.shape() {
            return CaseOutcome::Diverged {
                reason: format!(
                    "output {} has shape {:?}, expected {:?}",
                    index,
                    actual.shape(),
                    expected.shape()
                ),
            };
        }
        max_abs_error = expected
            .iter()
            .zip(actual.iter())
            .fold(max_abs_error, |acc, (a, b)| acc.max((a - b).abs() as f64));
    }
    if max_abs_error != 0.0 {
        return CaseOutcome::Diverged {
            reason: format!("outputs differ by up to {:.3e}", max_abs_error),
        };
    }
    if reference.call_counts != scheduled.call_counts {
        return CaseOutcome::Diverged {
            reason: format!(
                "call counts differ: reference {:?}, scheduled {:?}",
                reference.call_counts, scheduled.call_counts
            ),
        };
    }
    CaseOutcome::Equivalent {
        max_abs_error,
        body_entries: scheduled.call_counts.values().sum(),
    }
}

pub struct EvaluationSuite {
    cases: Vec<SampleProgram>,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<SampleProgram>) -> Self {
        Self { cases }
    }

    pub fn samples() -> Result<Self> {
        Ok(Self::new(samples()?))
    }

    /// Appends `count` random acyclic programs seeded from `seed` upwards.
    pub fn with_random(mut self, count: usize, seed: u64) -> Result<Self> {
        for offset in 0..count as u64 {
            self.cases.push(random_program(seed + offset)?);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn run(&self, session: &CompilerSession) -> Result<EvaluationReport> {
        let mut results = Vec::with_capacity(self.cases.len());
        for case in &self.cases {
            let result = match session.compile(case.program.clone()) {
                Ok(artifacts) => evaluate_case(session, case, &artifacts),
                Err(err) => {
                    if !case.expect_rejection {
                        warn!(case = %case.name, error = %err, "scheduling failed");
                    }
                    EquivalenceResult {
                        case: case.name.clone(),
                        splits: 0,
                        links: 0,
                        entrances: 0,
                        expect_rejection: case.expect_rejection,
                        outcome: CaseOutcome::Rejected {
                            error: format!("{:#}", err),
                        },
                    }
                }
            };
            info!(case = %result.case, passed = result.passed(), "evaluated case");
            results.push(result);
        }

        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();

        Ok(EvaluationReport {
            exit_sharing: format!("{:?}", session.config().scheduler.exit_sharing),
            generated_at_unix_ms,
            cases: results,
        })
    }
}

fn evaluate_case(
    session: &CompilerSession,
    case: &SampleProgram,
    artifacts: &CompileArtifacts,
) -> EquivalenceResult {
    let outcome = match (
        session.run_reference(&artifacts.original, &case.inputs),
        session.run_scheduled(artifacts, &case.inputs),
    ) {
        (Ok(reference), Ok(scheduled)) => compare_executions(&reference, &scheduled),
        (Err(err), _) => CaseOutcome::Diverged {
            reason: format!("reference run failed: {:#}", err),
        },
        (_, Err(err)) => CaseOutcome::Diverged {
            reason: format!("scheduled run failed: {:#}", err),
        },
    };
    EquivalenceResult {
        case: case.name.clone(),
        splits: artifacts.report.splits,
        links: artifacts.report.links.len(),
        entrances: artifacts
            .report
            .boundaries
            .iter()
            .map(|boundary| boundary.entrances.len())
            .sum(),
        expect_rejection: case.expect_rejection,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_ir::SubgraphId;
    use ndarray::{arr1, ArrayD};

    fn execution(values: &[f32], calls: &[(usize, usize)]) -> Execution {
        Execution {
            outputs: vec![arr1(values).into_dyn()],
            call_counts: calls
                .iter()
                .map(|&(id, count)| (SubgraphId(id), count))
                .collect(),
            steps: 0,
        }
    }

    #[test]
    fn identical_runs_are_equivalent() {
        let run = execution(&[1.0, 2.0], &[(0, 1), (1, 2)]);
        assert_eq!(
            compare_executions(&run, &run.clone()),
            CaseOutcome::Equivalent {
                max_abs_error: 0.0,
                body_entries: 3
            }
        );
    }

    #[test]
    fn call_count_drift_is_divergence() {
        let reference = execution(&[1.0], &[(0, 1), (1, 2)]);
        let scheduled = execution(&[1.0], &[(0, 1), (1, 3)]);
        assert!(matches!(
            compare_executions(&reference, &scheduled),
            CaseOutcome::Diverged { .. }
        ));
    }

    #[test]
    fn shape_change_is_divergence() {
        let reference = execution(&[1.0], &[]);
        let mut scheduled = reference.clone();
        scheduled.outputs[0] = ArrayD::zeros(ndarray::IxDyn(&[2]));
        assert!(matches!(
            compare_executions(&reference, &scheduled),
            CaseOutcome::Diverged { .. }
        ));
    }
}
