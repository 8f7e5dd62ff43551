use anyhow::Result;
use jobman::core::jobman::JobMan;
use jobman::utils::parse_job_ids;

pub async fn handle_cancel(jm: &JobMan, ids: &str) -> Result<()> {
    for id in parse_job_ids(ids)? {
        if jm.cancel(&id).await? {
            println!("Job {id} cancelled");
        } else {
            println!("Job {id} was not running");
        }
    }
    Ok(())
}
