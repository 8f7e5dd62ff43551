use anyhow::Result;
use jobman::core::jobman::JobMan;

pub async fn handle_resume(jm: &JobMan, id: &str) -> Result<()> {
    jm.resume(id).await?;
    println!("Resumed job {id}");
    Ok(())
}
