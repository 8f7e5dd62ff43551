use anyhow::Result;
use jobman::core::job::JobStatus;
use jobman::core::jobman::JobMan;
use jobman::utils::format_elapsed_time;
use owo_colors::OwoColorize;
use tabled::{builder::Builder, settings::style::Style};

pub async fn handle_list(jm: &JobMan) -> Result<()> {
    let jobs = jm.list().await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    let mut builder = Builder::default();
    builder.push_record([
        "ID",
        "Name",
        "Started",
        "Time",
        "Accelerator",
        "Zone",
        "External IP",
        "Status",
    ]);

    for job in jobs {
        let dash = || "-".to_string();
        builder.push_record([
            job.record.id.clone(),
            job.name.clone().unwrap_or_else(dash),
            job.started().format("%Y-%m-%d %H:%M").to_string(),
            format_elapsed_time(job.record.started_at, job.record.ended_at),
            job.accelerator.clone().unwrap_or_else(dash),
            job.zone.clone().unwrap_or_else(dash),
            job.external_ip.clone().unwrap_or_else(dash),
            colored_status(job.record.status),
        ]);
    }

    let table = builder.build().with(Style::rounded()).to_string();
    println!("{}", table);

    Ok(())
}

pub fn colored_status(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Running => text.green().to_string(),
        JobStatus::Idle => text.cyan().to_string(),
        JobStatus::Init => text.yellow().to_string(),
        JobStatus::Failed | JobStatus::Dead => text.red().to_string(),
        JobStatus::Cancelled => text.dimmed().to_string(),
    }
}
