//! Transformation passes over callflow programs.

use crate::program::Program;
use anyhow::Result;
use tracing::debug;

pub trait Pass {
    fn name(&self) -> &str;
    fn run(&self, program: &mut Program) -> Result<()>;
}

pub struct ValidateStructure;

impl Pass for ValidateStructure {
    fn name(&self) -> &str {
        "validate-structure"
    }

    fn run(&self, program: &mut Program) -> Result<()> {
        program.validate()?;
        debug!(
            pass = self.name(),
            subgraphs = program.subgraphs.len(),
            nodes = program.nodes.len(),
            "program structure validated"
        );
        Ok(())
    }
}

pub struct PassPipeline {
    passes: Vec<Box<dyn Pass + Send + Sync>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_default_passes() -> Self {
        Self {
            passes: vec![Box::new(ValidateStructure)],
        }
    }

    pub fn add_pass<P>(&mut self, pass: P)
    where
        P: Pass + Send + Sync + 'static,
    {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn run(&self, program: &mut Program) -> Result<()> {
        for pass in &self.passes {
            debug!(pass = pass.name(), "running pass");
            pass.run(program)?;
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}
