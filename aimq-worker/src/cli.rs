//! Command-line interface.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};

/// aimq-worker - background job worker for the ai-marketing backend
#[derive(Parser, Debug)]
#[command(name = "aimq-worker", version, about = "Background job worker and queue CLI")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true, env = "AIMQ_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Use the in-process backend instead of Redis
    #[arg(long, global = true)]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Reject flag combinations clap cannot express.
    pub fn validate(&self) -> Result<(), clap::Error> {
        if self.memory && self.command.is_one_shot() {
            return Err(Self::command().error(
                ErrorKind::ArgumentConflict,
                "--memory only applies to `run`: an in-process queue dies with this command, \
                 so nothing would ever process or report on it",
            ));
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start workers for the configured queues and run until Ctrl-C
    Run {
        /// Queues to consume (comma separated, overrides configuration)
        #[arg(long, value_delimiter = ',')]
        queues: Vec<String>,

        /// Concurrency per worker (defaults to the configured value)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Submit a job
    Enqueue {
        /// Target queue (defaults to the job's built-in queue)
        #[arg(long, short = 'q')]
        queue: Option<String>,

        /// Job name (e.g. `send-email`, `campaign-report`)
        #[arg(long, short = 'n')]
        name: String,

        /// Job payload as JSON
        #[arg(long, short = 'd', default_value = "{}")]
        data: String,

        /// Attempts before the job is marked failed
        #[arg(long)]
        attempts: Option<u32>,

        /// Initial delay in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Print job counts for a queue as JSON
    Counts {
        /// Queue name
        #[arg(long, short = 'q')]
        queue: String,
    },
}

impl Commands {
    /// Commands that exit after one request against the store.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Enqueue { .. } | Self::Counts { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue() {
        let cli = Cli::try_parse_from([
            "aimq-worker",
            "enqueue",
            "--name",
            "send-email",
            "--data",
            r#"{"to":"a@b.io"}"#,
            "--attempts",
            "2",
        ])
        .unwrap();
        assert!(!cli.memory);
        assert!(cli.validate().is_ok());
        match cli.command {
            Commands::Enqueue {
                queue,
                name,
                attempts,
                delay_ms,
                ..
            } => {
                assert_eq!(queue, None);
                assert_eq!(name, "send-email");
                assert_eq!(attempts, Some(2));
                assert_eq!(delay_ms, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_splits_queue_list() {
        let cli = Cli::try_parse_from(["aimq-worker", "run", "--queues", "notifications,reports"])
            .unwrap();
        match cli.command {
            Commands::Run { queues, .. } => assert_eq!(queues, ["notifications", "reports"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn memory_backend_is_only_for_run() {
        for args in [
            &["aimq-worker", "--memory", "enqueue", "--name", "send-email"][..],
            &["aimq-worker", "counts", "-q", "reports", "--memory"][..],
        ] {
            let cli = Cli::try_parse_from(args).unwrap();
            assert!(cli.command.is_one_shot());
            let err = cli.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        }

        let cli = Cli::try_parse_from(["aimq-worker", "--memory", "run"]).unwrap();
        assert!(!cli.command.is_one_shot());
        assert!(cli.validate().is_ok());
    }
}
