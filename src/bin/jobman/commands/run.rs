use anyhow::Result;
use jobman::core::controller::JobOutcome;
use jobman::core::jobman::JobMan;

pub async fn handle_run(jm: &JobMan, id: &str, command_only: bool) -> Result<()> {
    match jm.run(id, command_only).await? {
        JobOutcome::Done => {
            tracing::info!("Job {} finished", id);
            Ok(())
        }
        JobOutcome::Failed => anyhow::bail!("Job {id} failed"),
        JobOutcome::Interrupted => anyhow::bail!("Job {id} interrupted"),
    }
}
