//! Job store commands: submit, status, list and requeue.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::Colorize;
use crucible_core::{
    CrucibleConfig, HttpLedger, JobFilter, JobRepository, Ledger, SqliteJobRepository,
};
use crucible_training::{CostEstimator, JobId, JobRequest, JobStatus, TrainingJob};
use serde_json::json;
use std::time::Duration;

fn open_store(config: &CrucibleConfig) -> Result<SqliteJobRepository> {
    SqliteJobRepository::open(&config.orchestrator.database).with_context(|| {
        format!("Failed to open job database {}", config.orchestrator.database.display())
    })
}

/// Enqueue a job after checking the user can afford its estimate.
///
/// Nothing is charged here; the worker charges when it claims the job.
pub async fn submit(config: &CrucibleConfig, request: JobRequest, json_output: bool) -> Result<()> {
    request.validate().context("Invalid job request")?;
    let estimate = CostEstimator::new(config.estimator.clone())
        .estimate(&request.model_family, request.total_steps, request.dataset_size)
        .context("Cannot estimate job")?;

    let ledger = HttpLedger::new(
        &config.ledger.base_url,
        config.ledger.api_key.clone(),
        Duration::from_secs(config.ledger.timeout_secs),
    )?;
    let affordable = ledger
        .check_balance(&request.user_id, estimate.points)
        .await
        .context("Balance check failed")?;
    if !affordable {
        bail!(
            "user {} cannot afford this job: {} points required",
            request.user_id,
            estimate.points
        );
    }

    let store = open_store(config)?;
    let job = TrainingJob::queued(request, Utc::now())?;
    store.insert(&job).context("Failed to enqueue job")?;

    if json_output {
        let out = json!({
            "job_id": job.id,
            "environment": job.environment,
            "status": job.status,
            "estimate": estimate,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{} {}", "Submitted job".green(), job.id.to_string().bold());
        println!("  Environment: {}", job.environment);
        println!("  Estimate:    {} points", estimate.points);
    }
    Ok(())
}

pub fn status(config: &CrucibleConfig, job_id: &str, json_output: bool) -> Result<()> {
    let store = open_store(config)?;
    let job = store.get(&JobId::from(job_id))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("{} {}", "Job".bold().cyan(), job.id.to_string().bold());
    println!("  Status:      {}", paint_status(job.status, job.status.as_str()));
    println!("  User:        {}", job.user_id);
    println!("  Environment: {}", job.environment);
    println!("  Family:      {}", job.model_family);
    println!(
        "  Progress:    {}/{} ({:.0}%)",
        job.current_step,
        job.total_steps,
        job.progress_fraction() * 100.0
    );
    if let Some(loss) = job.current_loss {
        println!("  Loss:        {loss:.4}");
    }
    if let Some(worker) = &job.claimed_by {
        println!("  Worker:      {worker}");
    }
    if let Some(instance) = &job.instance_id {
        let state = if job.instance_terminated_at.is_some() { "terminated" } else { "live" };
        println!(
            "  Instance:    {instance} ({state}, {} at ${:.2}/h)",
            job.gpu_type.as_deref().unwrap_or("?"),
            job.hourly_rate.unwrap_or_default()
        );
    }
    if let Some(points) = job.estimated_cost_points {
        let actual = job.actual_cost_points.map_or_else(|| "-".to_string(), |p| p.to_string());
        println!("  Cost:        {points} charged, {actual} actual");
    }
    if let Some(reason) = job.failure_reason {
        println!(
            "  Failure:     {} {}",
            reason.to_string().red(),
            job.failure_detail.as_deref().unwrap_or_default().dimmed()
        );
    }
    if let Some(uri) = &job.artifact_uri {
        let partial = if job.partial_result { " (partial)" } else { "" };
        println!("  Artifact:    {uri}{partial}");
    }
    Ok(())
}

pub fn list(
    config: &CrucibleConfig,
    status: Option<&str>,
    limit: usize,
    json_output: bool,
) -> Result<()> {
    let status = status
        .map(str::parse::<JobStatus>)
        .transpose()
        .context("Invalid --status")?;
    let store = open_store(config)?;
    let jobs = store.list(&JobFilter { status, limit: Some(limit), ..JobFilter::default() })?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("  {}", "No jobs found.".dimmed());
        return Ok(());
    }

    println!("{:<38} {:<13} {:<12} {:<12} {}", "ID", "Status", "Family", "Progress", "Updated");
    println!("{}", "─".repeat(100));
    for job in jobs {
        println!(
            "{:<38} {} {:<12} {:<12} {}",
            job.id.to_string(),
            paint_status(job.status, &format!("{:<13}", job.status.as_str())),
            job.model_family,
            format!("{}/{}", job.current_step, job.total_steps),
            job.updated_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    Ok(())
}

pub fn requeue(config: &CrucibleConfig, job_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let fresh = store
        .requeue(&JobId::from(job_id), Utc::now())
        .with_context(|| format!("Failed to requeue {job_id}"))?;
    println!("{} {} as {}", "Requeued".green(), job_id, fresh.id.to_string().bold());
    Ok(())
}

fn paint_status(status: JobStatus, label: &str) -> colored::ColoredString {
    match status {
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red(),
        JobStatus::Queued => label.dimmed(),
        _ => label.yellow(),
    }
}
