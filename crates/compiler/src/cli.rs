//! CLI wiring for the callflow scheduler.

use crate::eval::EvaluationSuite;
use crate::pipeline::CompilerConfig;
use crate::samples::{deterministic_inputs, sample, samples, SampleProgram};
use crate::session::CompilerSession;
use anyhow::{bail, ensure, Result};
use callflow_ir::Program;
use callflow_scheduler::ExitSharing;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "callflow", about = "Control-flow subgraph scheduler toolkit")]
pub struct Cli {
    /// JSON compiler configuration; flags below override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    pub exit_sharing: Option<ExitSharingArg>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ExitSharingArg {
    ByDestination,
    PerCaller,
}

impl From<ExitSharingArg> for ExitSharing {
    fn from(value: ExitSharingArg) -> ExitSharing {
        match value {
            ExitSharingArg::ByDestination => ExitSharing::ByDestination,
            ExitSharingArg::PerCaller => ExitSharing::PerCaller,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Schedule a program and print the scheduling report.
    Schedule {
        #[arg(long, conflicts_with = "sample")]
        input: Option<PathBuf>,
        #[arg(long)]
        sample: Option<String>,
        /// Write the lowered execution plan as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Print the scheduled program as text.
        #[arg(long, default_value_t = false)]
        text: bool,
    },
    /// Run a program through the reference interpreter and the scheduled executor.
    Run {
        #[arg(long, conflicts_with = "sample")]
        input: Option<PathBuf>,
        #[arg(long)]
        sample: Option<String>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Check control equivalence over the samples and random programs.
    Eval {
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        random: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// List the built-in sample programs.
    Samples,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli {
        config,
        exit_sharing,
        command,
    } = cli;
    let mut config = match config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };
    if let Some(sharing) = exit_sharing {
        config.scheduler.exit_sharing = sharing.into();
    }
    let session = CompilerSession::new(config);

    match command {
        Command::Schedule {
            input,
            sample,
            output,
            text,
        } => {
            let source = load_program(input, sample, 0)?;
            let artifacts = session.compile(source.program)?;
            println!("{}", artifacts.report.to_json()?);
            if text {
                println!("{}", artifacts.text);
            }
            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&artifacts.plan)?)?;
                info!(path = %path.display(), "wrote execution plan");
            }
        }
        Command::Run {
            input,
            sample,
            seed,
        } => {
            let source = load_program(input, sample, seed)?;
            let artifacts = session.compile(source.program.clone())?;
            let reference = session.run_reference(&source.program, &source.inputs)?;
            let scheduled = session.run_scheduled(&artifacts, &source.inputs)?;

            println!("program={} splits={}", source.name, artifacts.report.splits);
            for (index, (expected, actual)) in
                reference.outputs.iter().zip(&scheduled.outputs).enumerate()
            {
                println!("- output {}: reference={} scheduled={}", index, expected, actual);
            }
            for (id, count) in &scheduled.call_counts {
                let expected = reference.call_counts.get(id).copied().unwrap_or(0);
                println!(
                    "- {} ({}): reference_calls={} scheduled_calls={}",
                    id,
                    artifacts.original.subgraph(*id).name,
                    expected,
                    count
                );
            }
            println!(
                "steps: reference={} scheduled={}",
                reference.steps, scheduled.steps
            );
        }
        Command::Eval {
            output,
            random,
            seed,
        } => {
            let suite = EvaluationSuite::samples()?.with_random(random, seed)?;
            let report = suite.run(&session)?;

            println!(
                "exit_sharing={}, cases={}, generated_at={}",
                report.exit_sharing,
                report.cases.len(),
                report.generated_at_unix_ms
            );
            for case in &report.cases {
                println!(
                    "- {}: passed={} splits={} links={} entrances={}",
                    case.case,
                    case.passed(),
                    case.splits,
                    case.links,
                    case.entrances
                );
            }

            if let Some(path) = output {
                report.save(&path)?;
            }
            ensure!(
                report.all_passed(),
                "{} case(s) failed the equivalence check",
                report.failures().len()
            );
        }
        Command::Samples => {
            for sample in samples()? {
                let marker = if sample.expect_rejection {
                    " (rejected)"
                } else {
                    ""
                };
                println!("{}{}: {}", sample.name, marker, sample.description);
            }
        }
    }
    Ok(())
}

fn load_program(
    input: Option<PathBuf>,
    sample_name: Option<String>,
    seed: u64,
) -> Result<SampleProgram> {
    match (input, sample_name) {
        (Some(path), _) => {
            let program = Program::load(&path)?;
            let inputs = deterministic_inputs(&program, seed);
            Ok(SampleProgram {
                name: path.display().to_string(),
                description: "loaded from file".to_string(),
                program,
                inputs,
                expect_rejection: false,
            })
        }
        (None, Some(name)) => match sample(&name)? {
            Some(found) => Ok(found),
            None => bail!("unknown sample '{}'; run `callflow samples` for the list", name),
        },
        (None, None) => bail!("pass --input FILE or --sample NAME"),
    }
}
