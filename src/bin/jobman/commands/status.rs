use super::list::colored_status;
use anyhow::Result;
use jobman::core::jobman::JobMan;
use jobman::utils::{format_elapsed_time, format_timestamp};

pub async fn handle_status(jm: &JobMan, id: &str) -> Result<()> {
    let Some(job) = jm.status(id).await? else {
        anyhow::bail!("Job {id} not found");
    };
    let record = &job.record;
    let or_dash = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

    println!("Job:         {}", record.id);
    println!("Name:        {}", or_dash(&job.name));
    println!("Status:      {}", colored_status(record.status));
    println!("Created:     {}", format_timestamp(Some(record.created_at)));
    println!("Started:     {}", format_timestamp(record.started_at));
    println!("Ended:       {}", format_timestamp(record.ended_at));
    println!("Elapsed:     {}", format_elapsed_time(record.started_at, record.ended_at));
    println!("Last seen:   {}", format_timestamp(record.last_seen));
    println!("Accelerator: {}", or_dash(&job.accelerator));
    println!("Zone:        {}", or_dash(&job.zone));
    println!("External IP: {}", or_dash(&job.external_ip));
    println!("Session:     {}", or_dash(&record.session_name));
    if let Some(log) = &record.log_file {
        println!("Log:         {}", log.display());
    }
    Ok(())
}
