//! Data-Parallel Training Worker
//!
//! One process per rank. Placement comes from the scheduler's environment
//! (`SLURM_*`, or `WORLD_SIZE`/`RANK`/`LOCAL_RANK`), rendezvous goes to
//! `MASTER_ADDR:MASTER_PORT`, and every failure maps to a distinct exit code.
//!
//! # Usage
//!
//! ```bash
//! # One rank of a scheduled job
//! srun ddp-worker --config ddp.toml
//!
//! # Resume the job from its newest checkpoint
//! ddp-worker --config ddp.toml --resume-latest
//!
//! # A resubmitted job continuing from its predecessor's checkpoints
//! ddp-worker --config ddp.toml --resume-latest --resume-job 41
//!
//! # Four ranks as threads of this process
//! ddp-worker simulate --world-size 4
//! ```

mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use ddp_core::checkpoint::ResumeTarget;
use worker::WorkerOptions;

/// Synchronous data-parallel training worker
#[derive(Parser, Debug)]
#[command(name = "ddp-worker")]
#[command(about = "Per-rank worker for synchronous data-parallel training")]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Resume from the newest checkpoint of the job, if any
    #[arg(long, global = true, conflicts_with = "resume_epoch")]
    resume_latest: bool,

    /// Resume from the checkpoint of this epoch
    #[arg(long, global = true)]
    resume_epoch: Option<u64>,

    /// Read the resume checkpoint from this job instead of the current one
    #[arg(long, global = true)]
    resume_job: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run as one rank of a scheduled job (default)
    Run,
    /// Run every rank as a thread of this process
    Simulate {
        #[arg(short, long, default_value = "2")]
        world_size: usize,
    },
}

impl Args {
    fn options(&self) -> WorkerOptions {
        let resume = match (self.resume_latest, self.resume_epoch) {
            (_, Some(epoch)) => Some(ResumeTarget::Epoch(epoch)),
            (true, None) => Some(ResumeTarget::Latest),
            (false, None) => None,
        };
        WorkerOptions {
            config_path: self.config.clone(),
            log_level: self.log_level.clone(),
            resume,
            resume_job_id: self.resume_job.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let options = args.options();

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => worker::run_rank(&options).map(|_| ()),
        Command::Simulate { world_size } => worker::simulate(&options, world_size).map(|_| ()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ddp-worker: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
