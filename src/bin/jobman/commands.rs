use crate::cli::Commands;
use jobman::cloud::gcloud::GcloudCli;
use jobman::config::Settings;
use jobman::core::jobman::JobMan;
use jobman::core::session::TmuxSupervisor;
use std::path::PathBuf;
use std::sync::Arc;

mod cancel;
mod create;
mod delete;
mod list;
mod resume;
mod run;
mod status;

pub async fn handle_commands(
    settings: &Settings,
    config_path: Option<&PathBuf>,
    command: Commands,
) -> anyhow::Result<()> {
    let jm = build(settings, config_path)?;

    match command {
        Commands::Create { config, no_start } => create::handle_create(&jm, &config, no_start).await,
        Commands::Resume { id } => resume::handle_resume(&jm, &id).await,
        Commands::Cancel { ids } => cancel::handle_cancel(&jm, &ids).await,
        Commands::Delete { ids } => delete::handle_delete(&jm, &ids).await,
        Commands::List => list::handle_list(&jm).await,
        Commands::Status { id } => status::handle_status(&jm, &id).await,
        Commands::Run { id, command_only } => run::handle_run(&jm, &id, command_only).await,
        Commands::Completion { .. } => Ok(()),
    }
}

fn build(settings: &Settings, config_path: Option<&PathBuf>) -> anyhow::Result<JobMan> {
    let cloud = GcloudCli::new(settings.gcloud.bin.clone(), settings.connect_timeout());
    let jm = JobMan::new(
        settings.jobs_dir.clone(),
        Arc::new(cloud),
        Arc::new(TmuxSupervisor),
        settings.run_settings(),
    );

    // Background sessions re-enter this binary with the same settings.
    let Some(path) = config_path else {
        return Ok(jm);
    };
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
    let launcher = format!(
        "{} --config {}",
        jm.launcher(),
        shell_escape::escape(path.to_string_lossy())
    );
    Ok(jm.with_launcher(launcher))
}
