//! Compiler session orchestration.

use crate::pipeline::{CompileArtifacts, CompilerConfig, CompilerPipeline};
use anyhow::Result;
use callflow_ir::Program;
use callflow_runtime::{Execution, ReferenceInterpreter, SequentialExecutor};
use ndarray::ArrayD;
use tracing::info;

pub struct CompilerSession {
    pipeline: CompilerPipeline,
}

impl CompilerSession {
    pub fn new(config: CompilerConfig) -> Self {
        info!(
            exit_sharing = ?config.scheduler.exit_sharing,
            max_split_iterations = ?config.scheduler.max_split_iterations,
            check_equivalence = config.check_equivalence,
            "starting compiler session"
        );
        Self {
            pipeline: CompilerPipeline::new(config),
        }
    }

    pub fn compile(&self, program: Program) -> Result<CompileArtifacts> {
        self.pipeline.compile(program)
    }

    pub fn run_reference(&self, program: &Program, inputs: &[ArrayD<f32>]) -> Result<Execution> {
        ReferenceInterpreter::new(program, self.config().runtime.clone()).run(inputs)
    }

    pub fn run_scheduled(
        &self,
        artifacts: &CompileArtifacts,
        inputs: &[ArrayD<f32>],
    ) -> Result<Execution> {
        SequentialExecutor::new(&artifacts.plan, self.config().runtime.clone()).run(inputs)
    }

    pub fn config(&self) -> &CompilerConfig {
        self.pipeline.config()
    }
}

impl Default for CompilerSession {
    fn default() -> Self {
        Self::new(CompilerConfig::default())
    }
}
