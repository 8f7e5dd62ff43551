use anyhow::Result;
use jobman::core::jobman::JobMan;
use jobman::utils::parse_job_ids;

pub async fn handle_delete(jm: &JobMan, ids: &str) -> Result<()> {
    let mut failed = Vec::new();
    for id in parse_job_ids(ids)? {
        if jm.delete(&id).await? {
            println!("Job {id} deleted");
        } else {
            failed.push(id);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Job(s) not deleted, see the log for details: {}", failed.join(", "));
    }
    Ok(())
}
