use anyhow::Result;
use jobman::core::jobman::JobMan;
use std::path::Path;

pub async fn handle_create(jm: &JobMan, config: &Path, no_start: bool) -> Result<()> {
    let id = jm.create(config).await?;
    println!("Created job {id}");

    if no_start {
        println!("Start it with `jobman resume {id}`");
        return Ok(());
    }
    jm.start(&id).await?;
    println!("Job {id} is running in session job_{id}");
    Ok(())
}
