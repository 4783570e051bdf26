//! backupctl - drive the backup orchestrator from the command line.

mod client;

use anyhow::Result;
use backup_orchestrator::job::{JobView, Target};
use clap::{Parser, Subcommand};
use client::Client;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Orchestrator base URL
    #[arg(long, env = "BACKUP_ORCHESTRATOR_URL", default_value = "http://127.0.0.1:8081")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a backup
    Backup {
        /// nvme, usb or network (server default when omitted)
        #[arg(short, long, value_parser = parse_target)]
        target: Option<Target>,
        #[arg(required = true)]
        components: Vec<String>,
    },
    /// Restore a backup, optionally only some components
    Restore {
        backup_id: String,
        components: Vec<String>,
    },
    /// Show one job, or the current job when no id is given
    Status { job_id: Option<String> },
    /// List jobs since the orchestrator started
    Jobs,
    /// Abort a job
    Abort { job_id: String },
    /// Print a job log
    Log {
        job_id: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Keep polling until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// List completed backups
    List {
        #[arg(short, long, value_parser = parse_target)]
        target: Option<Target>,
    },
    /// Delete a backup
    Delete { backup_id: String },
    /// Show backup statistics
    Stats,
}

fn parse_target(s: &str) -> std::result::Result<Target, String> {
    s.parse().map_err(|_| {
        let known: Vec<&str> = Target::ALL.iter().map(Target::as_str).collect();
        format!("unknown target {s:?}, expected one of {}", known.join(", "))
    })
}

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new(&args.url);

    match args.command {
        Command::Backup { target, components } => {
            let started = client
                .start_backup(target.as_ref().map(Target::as_str), &components)
                .await?;
            println!("{} {}", started.job_id, started.status);
        }
        Command::Restore { backup_id, components } => {
            let subset = (!components.is_empty()).then_some(components.as_slice());
            let started = client.start_restore(&backup_id, subset).await?;
            println!("{} {}", started.job_id, started.status);
        }
        Command::Status { job_id: Some(id) } => print_job(&client.job(&id).await?),
        Command::Status { job_id: None } => {
            let current = client.current().await?;
            match current.job {
                Some(job) => print_job(&job),
                None => println!("no jobs yet"),
            }
            if !current.running {
                println!("idle");
            }
        }
        Command::Jobs => {
            for job in client.jobs().await? {
                println!(
                    "{}  {:<7} {:<9} {:<7} {}",
                    job.id,
                    job.kind.mode(),
                    job.status.to_string(),
                    job.target,
                    job.components.join(",")
                );
            }
        }
        Command::Abort { job_id } => print_job(&client.abort(&job_id).await?),
        Command::Log { job_id, offset, follow } => {
            let mut offset = offset;
            loop {
                let chunk = client.log(&job_id, offset).await?;
                for line in &chunk.lines {
                    println!("{line}");
                }
                offset = chunk.next_offset;
                if !follow || chunk.complete {
                    break;
                }
                if chunk.lines.is_empty() {
                    tokio::time::sleep(FOLLOW_INTERVAL).await;
                }
            }
        }
        Command::List { target } => {
            for record in client.list(target.as_ref().map(Target::as_str)).await? {
                println!(
                    "{}  {:<7} {}  {:>12}  {}",
                    record.id,
                    record.target,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.size_bytes,
                    record.manifest.components.join(",")
                );
            }
        }
        Command::Delete { backup_id } => {
            client.delete(&backup_id).await?;
            println!("deleted {backup_id}");
        }
        Command::Stats => {
            let stats = client.stats().await?;
            println!("backups:     {}", stats.total_count);
            println!("total size:  {}", stats.total_size);
            match stats.last_backup {
                Some(at) => println!("last backup: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("last backup: never"),
            }
        }
    }
    Ok(())
}

fn print_job(job: &JobView) {
    println!("job:        {}", job.id);
    println!("kind:       {}", job.kind.mode());
    println!("target:     {}", job.target);
    println!("components: {}", job.components.join(", "));
    println!("backup:     {}", job.backup_id);
    println!("status:     {}", job.status);
    println!("started:    {}", job.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ended) = job.ended_at {
        println!("ended:      {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(reason) = &job.exit_reason {
        println!("reason:     {reason}");
    }
}
