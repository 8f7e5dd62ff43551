use clap::Parser;
use clap_complete::Shell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "jobman",
    author,
    version = jobman::core::version(),
    about = "Runs jobs on TPU pods: acquires the pod, prepares its workers, and keeps the workload going."
)]
#[command(styles = jobman::utils::STYLES)]
pub struct JobMan {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding job state (overrides the config file)
    #[arg(long, global = true, value_hint = clap::ValueHint::DirPath)]
    pub jobs_dir: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Register a job from a YAML config and start it in the background
    #[command(alias = "submit")]
    Create {
        /// Path to the job config
        #[arg(value_hint = clap::ValueHint::FilePath)]
        config: PathBuf,

        /// Register the job without starting it
        #[arg(long)]
        no_start: bool,
    },
    /// Start a stopped job again in a new background session
    Resume {
        /// Job ID, e.g. 000042
        id: String,
    },
    /// Stop a running job
    Cancel {
        /// Job ID(s). Supports ranges like "1-3" or lists like "1,2,3"
        ids: String,
    },
    /// Cancel a job, delete its TPU, and remove its files
    #[command(alias = "rm")]
    Delete {
        /// Job ID(s). Supports ranges like "1-3" or lists like "1,2,3"
        ids: String,
    },
    /// List all jobs
    #[command(alias = "ls")]
    List,
    /// Show the details of one job
    Status {
        /// Job ID, e.g. 000042
        id: String,
    },
    /// Run a job in the foreground (used by background sessions)
    Run {
        /// Job ID, e.g. 000042
        id: String,

        /// Only run the command, assuming the pod is already provisioned
        #[arg(long)]
        command_only: bool,
    },
    /// Generate shell completion scripts
    Completion {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
