use std::{
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use sweep_engine::{
    confirm::{AssumeNo, AssumeYes, ConfirmationPolicy, StdinPrompt, UseDefaults},
    report::{OutputReport, RunStatus, VerificationReport},
    SweepConfig, SweepEngine, SweepTelemetry,
};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "sweep", version, about = "Stellar parameter sweep pipeline")]
struct Cli {
    /// Sweep configuration file.
    #[arg(long, global = true, default_value = "sweep.toml")]
    config: PathBuf,
    /// Print stage results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renders one inlist per table row.
    GenerateInputs(Answers),
    /// Reconciles the table with the generated inlists.
    VerifyInputs,
    /// Runs the simulator for every pending job.
    RunJobs {
        #[command(flatten)]
        answers: Answers,
        /// Re-run jobs whose previous attempt failed.
        #[arg(long)]
        rerun_failed: bool,
    },
    /// Reconciles the table with run records and classifies each run.
    VerifyOutputs,
    /// Extracts metrics from completed runs into the summary table.
    Aggregate {
        /// Summary path; defaults to `paths.summary`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Counts across inputs, runs and timing.
    Status,
}

#[derive(Args, Debug, Clone, Copy)]
struct Answers {
    /// Answer yes to every question.
    #[arg(long, conflicts_with = "no")]
    yes: bool,
    /// Answer no to every question.
    #[arg(long)]
    no: bool,
}

impl Answers {
    fn policy(self) -> Box<dyn ConfirmationPolicy> {
        if self.yes {
            Box::new(AssumeYes)
        } else if self.no {
            Box::new(AssumeNo)
        } else if std::io::stdin().is_terminal() {
            Box::new(StdinPrompt)
        } else {
            Box::new(UseDefaults)
        }
    }
}

#[derive(Serialize)]
struct StageOutput<'a, T: Serialize> {
    stage: &'a str,
    batch_id: &'a str,
    clean: bool,
    result: &'a T,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = SweepConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let telemetry = SweepTelemetry::builder("sweep-cli")
        .log_path(&config.paths.log)
        .min_level(config.logging.min_level())
        .mirror_stderr(config.logging.stderr)
        .build()?;
    telemetry
        .log(
            LogLevel::Info,
            "cli.command",
            json!({ "command": format!("{:?}", cli.command), "config": cli.config }),
        )
        .with_context(|| format!("writing {}", config.paths.log.display()))?;
    let engine = SweepEngine::builder(config)
        .telemetry(telemetry.clone())
        .build()?;
    let printer = Printer {
        json: cli.json,
        batch_id: telemetry.batch_id().to_string(),
    };

    let clean = match cli.command {
        Commands::GenerateInputs(answers) => {
            let report = engine.generate_inputs(answers.policy().as_ref())?;
            let clean = report.failures.is_empty();
            printer.emit("generate-inputs", clean, &report, || {
                println!(
                    "created={} updated={} unchanged={} failed={}",
                    report.count(sweep_engine::generator::ArtifactChange::Created),
                    report.count(sweep_engine::generator::ArtifactChange::Updated),
                    report.count(sweep_engine::generator::ArtifactChange::Unchanged),
                    report.failures.len()
                );
                for failure in &report.failures {
                    println!("  failed {}: {}", failure.job_id, failure.reason);
                }
            })?;
            clean
        }
        Commands::VerifyInputs => {
            let report = engine.verify_inputs()?;
            let clean = report.is_clean();
            printer.emit("verify-inputs", clean, &report, || {
                println!("{}", report.counts());
                print_reconciliation(&report, "inlist");
            })?;
            clean
        }
        Commands::RunJobs {
            answers,
            rerun_failed,
        } => {
            let runtime = Runtime::new()?;
            let summary = runtime.block_on(engine.run_jobs(answers.policy().as_ref(), rerun_failed))?;
            let clean = summary.failed() == 0 && summary.missing_input() == 0;
            printer.emit("run-jobs", clean, &summary, || {
                if summary.declined {
                    println!("declined; no jobs were run");
                }
                println!(
                    "executed={} completed={} failed={} skipped={} missing_input={}",
                    summary.executed(),
                    summary.completed(),
                    summary.failed(),
                    summary.skipped(),
                    summary.missing_input()
                );
            })?;
            clean
        }
        Commands::VerifyOutputs => {
            let report = engine.verify_outputs()?;
            let clean = report.is_clean();
            printer.emit("verify-outputs", clean, &report, || {
                println!("{}", report.counts());
                print_outputs(&report);
            })?;
            clean
        }
        Commands::Aggregate { output } => {
            let outcome = engine.aggregate()?;
            let path = engine.write_summary(&outcome, output.as_deref())?;
            let clean = outcome.skipped.is_empty();
            printer.emit("aggregate", clean, &outcome, || {
                println!(
                    "rows={} skipped={} summary={}",
                    outcome.rows.len(),
                    outcome.skipped.len(),
                    path.display()
                );
                for skipped in &outcome.skipped {
                    println!("  skipped {}: {}", skipped.job_id, skipped.reason);
                }
            })?;
            clean
        }
        Commands::Status => {
            let status = engine.status()?;
            printer.emit("status", true, &status, || {
                println!("rows={} timed_jobs={}", status.rows, status.timed_jobs);
                println!("inputs:  {}", status.inputs);
                println!("outputs: {}", status.outputs);
            })?;
            true
        }
    };

    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

struct Printer {
    json: bool,
    batch_id: String,
}

impl Printer {
    fn emit<T: Serialize>(&self, stage: &str, clean: bool, result: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            let output = StageOutput {
                stage,
                batch_id: &self.batch_id,
                clean,
                result,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            human();
        }
        Ok(())
    }
}

fn print_reconciliation(report: &VerificationReport, noun: &str) {
    for id in &report.missing {
        println!("  missing {noun}: {id}");
    }
    for id in &report.orphaned {
        println!("  orphaned {noun}: {id}");
    }
    for mismatch in &report.mismatched {
        println!("  mismatched {}:", mismatch.job_id);
        for field in &mismatch.fields {
            println!("    {field}");
        }
    }
}

fn print_outputs(report: &OutputReport) {
    print_reconciliation(&report.reconciliation, "run");
    for (id, status) in &report.statuses {
        match status {
            RunStatus::Completed => {}
            RunStatus::Incomplete => println!("  incomplete: {id}"),
            RunStatus::Failed { reason } => println!("  failed: {id} ({reason})"),
        }
    }
}
