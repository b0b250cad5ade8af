//! Compiler pass pipeline assembly.

use anyhow::{bail, Context, Result};
use callflow_ir::{ExecutionPlan, PassPipeline, Program, ValidateStructure};
use callflow_runtime::{ReferenceInterpreter, RuntimeOptions, SequentialExecutor};
use callflow_scheduler::{take_report, ControlFlowPass, ScheduleReport, SchedulerOptions};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::eval::{compare_executions, CaseOutcome};
use crate::samples::deterministic_inputs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Validate the program before and after scheduling.
    pub validate: bool,
    pub scheduler: SchedulerOptions,
    /// Run both interpreters on seeded inputs and fail on any divergence.
    pub check_equivalence: bool,
    pub runtime: RuntimeOptions,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            validate: true,
            scheduler: SchedulerOptions::default(),
            check_equivalence: false,
            runtime: RuntimeOptions::default(),
        }
    }
}

impl CompilerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[derive(Debug)]
pub struct CompileArtifacts {
    /// The program as it was handed in.
    pub original: Program,
    pub plan: ExecutionPlan,
    pub report: ScheduleReport,
    pub text: String,
}

pub struct CompilerPipeline {
    config: CompilerConfig,
}

impl CompilerPipeline {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn compile(&self, program: Program) -> Result<CompileArtifacts> {
        let original = program.clone();
        let mut program = program;

        let scheduling = ControlFlowPass::new(self.config.scheduler.clone());
        let slot = scheduling.report_slot();
        let mut passes = PassPipeline::new();
        if self.config.validate {
            passes.add_pass(ValidateStructure);
        }
        passes.add_pass(scheduling);
        if self.config.validate {
            passes.add_pass(ValidateStructure);
        }
        debug!(passes = ?passes.pass_names(), "running compiler passes");
        passes.run(&mut program)?;

        let Some(report) = take_report(&slot) else {
            bail!("scheduling pass finished without a report");
        };
        let text = program.to_text();
        let plan = ExecutionPlan::lower(program)?;
        info!(
            splits = report.splits,
            links = report.links.len(),
            boundaries = report.boundaries.len(),
            "compiled program"
        );

        let artifacts = CompileArtifacts {
            original,
            plan,
            report,
            text,
        };
        if self.config.check_equivalence {
            let inputs = deterministic_inputs(&artifacts.original, 0);
            match self.check(&artifacts, &inputs)? {
                CaseOutcome::Equivalent { .. } => {}
                CaseOutcome::Diverged { reason } | CaseOutcome::Rejected { error: reason } => {
                    bail!("scheduled program is not equivalent to its source: {}", reason)
                }
            }
        }
        Ok(artifacts)
    }

    /// Runs the source program and the plan on the same inputs and compares them.
    pub fn check(&self, artifacts: &CompileArtifacts, inputs: &[ArrayD<f32>]) -> Result<CaseOutcome> {
        let reference = ReferenceInterpreter::new(&artifacts.original, self.config.runtime.clone())
            .run(inputs)
            .context("reference run")?;
        let scheduled = SequentialExecutor::new(&artifacts.plan, self.config.runtime.clone())
            .run(inputs)
            .context("scheduled run")?;
        Ok(compare_executions(&reference, &scheduled))
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::sample;
    use callflow_scheduler::ExitSharing;

    #[test]
    fn partial_config_fills_defaults() -> Result<()> {
        let config: CompilerConfig =
            serde_json::from_str(r#"{"scheduler": {"exit_sharing": "per-caller"}}"#)?;
        assert!(config.validate);
        assert_eq!(config.scheduler.exit_sharing, ExitSharing::PerCaller);
        assert_eq!(config.scheduler.max_split_iterations, None);
        assert_eq!(config.runtime, RuntimeOptions::default());
        Ok(())
    }

    #[test]
    fn equivalence_check_runs_during_compile() -> Result<()> {
        let config = CompilerConfig {
            check_equivalence: true,
            ..CompilerConfig::default()
        };
        let Some(nested) = sample("nested")? else {
            bail!("nested sample missing");
        };
        let artifacts = CompilerPipeline::new(config).compile(nested.program)?;
        assert_eq!(artifacts.report.splits, 3);
        assert!(artifacts.text.contains("[entrance]"));
        Ok(())
    }

    #[test]
    fn rejected_program_fails_compile() -> Result<()> {
        let Some(recursive) = sample("self-recursion")? else {
            bail!("self-recursion sample missing");
        };
        let err = CompilerPipeline::new(CompilerConfig::default())
            .compile(recursive.program)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("non-tail call"));
        Ok(())
    }
}
