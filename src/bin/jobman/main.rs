use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;

mod cli;
mod commands;
mod completion;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    match real_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::from(1)
        }
    }
}

async fn real_main() -> anyhow::Result<()> {
    let args = cli::JobMan::parse();

    if let cli::Commands::Completion { shell } = args.command {
        let mut cmd = <cli::JobMan as clap::CommandFactory>::command();
        return completion::generate_to_stdout(shell, &mut cmd, "jobman");
    }

    let mut settings = jobman::config::load_config(args.config.as_ref())?;
    // CLI flag overrides config file
    if let Some(jobs_dir) = args.jobs_dir.clone() {
        settings.jobs_dir = jobs_dir;
    }

    // Console (stderr) + daily rolling file appender under the registry dir
    let log_dir = settings.jobs_dir.join(jobman::core::store::STATE_DIR).join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("jobman")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::from(
            args.verbosity,
        ))
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!("{:?}", settings);
    commands::handle_commands(&settings, args.config.as_ref(), args.command).await
}
