use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clinic_bot::{config, db};

/// Print the reminder and survey jobs still waiting to fire.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show jobs for this appointment
    #[arg(long)]
    appointment: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let jobs: Vec<_> = db::list_jobs(&pool)
        .await?
        .into_iter()
        .filter(|job| args.appointment.map_or(true, |id| job.key.appointment_id == id))
        .collect();
    if jobs.is_empty() {
        println!("No pending jobs.");
        return Ok(());
    }
    let offset = cfg.utc_offset();
    for job in jobs {
        println!(
            "{:<16} due {}  chat {}",
            job.key.to_string(),
            job.due_at.with_timezone(&offset).format("%Y-%m-%d %H:%M %:z"),
            job.payload.chat_id,
        );
    }
    Ok(())
}
