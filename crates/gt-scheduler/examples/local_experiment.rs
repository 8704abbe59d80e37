//! Runs a tiny local "simulation study": a shell script stands in for the
//! expensive forward model, a DirectScheduler launches it once per sampled
//! parameter vector, and the runner polls the batch to completion.
//!
//! Run with: cargo run --example local_experiment

use std::sync::Arc;

use gt_exec::{CsvColumnReader, PlaceholderTemplater};
use gt_scheduler::{create_scheduler, ExperimentEvent, ExperimentRunner, InMemoryRegistry};
use gt_types::{DriverConfig, JobStatus, ParameterSet, ParameterValue, SchedulerConfig, SchedulerKind};
use rand::Rng;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let workdir = tempfile::tempdir()?;
    println!("experiment directory: {}", workdir.path().display());

    // The "simulation": reads the rendered input file, writes the squared
    // value as its output. Any executable with the same
    // `solver <input> <output>` calling convention would do.
    let script = workdir.path().join("solver.sh");
    std::fs::write(
        &script,
        "x=$(cat \"$1\")\nawk \"BEGIN { print $x * $x }\" > \"$2\"\n",
    )?;

    let template = workdir.path().join("model.tmpl");
    std::fs::write(&template, "{{ x }}\n")?;

    let config = SchedulerConfig::new(
        SchedulerKind::Direct,
        "squares",
        workdir.path(),
        DriverConfig::new("sh", &template).with_arg(script.display().to_string()),
    )
    .with_polling(1, Some(60))
    .with_max_concurrent(2);

    let registry = Arc::new(InMemoryRegistry::new());
    let scheduler = create_scheduler(
        config.clone(),
        registry.clone(),
        Arc::new(PlaceholderTemplater::new()),
        Arc::new(CsvColumnReader::new()),
    )?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let runner = ExperimentRunner::new(scheduler, registry, config).with_events(event_tx);

    // Draw a handful of parameter vectors, the way a sampling iterator would.
    let mut rng = rand::rng();
    let parameter_sets: Vec<ParameterSet> = (0..5)
        .map(|_| {
            let mut parameters = ParameterSet::new();
            parameters.insert("x".into(), ParameterValue::Float(rng.random_range(-3.0..3.0)));
            parameters
        })
        .collect();

    runner.pre_run().await?;
    let jobs = runner.run_batch(parameter_sets).await?;
    runner.post_run().await?;

    println!("\njob results:");
    for job in &jobs {
        let x = &job.parameters["x"];
        match job.status {
            JobStatus::Complete => {
                let values = &job.output.as_ref().expect("complete job has output").values;
                println!("  job {:>2}  x = {x:>20}  x^2 = {values:?}", job.id);
            }
            status => println!("  job {:>2}  x = {x:>20}  {status}", job.id),
        }
    }

    let stats = runner.stats();
    println!(
        "\n{} submitted, {} completed, {} failed over {} polls",
        stats.jobs_submitted, stats.jobs_completed, stats.jobs_failed, stats.polls
    );

    let submissions = event_rx
        .try_iter()
        .filter(|event| matches!(event, ExperimentEvent::JobSubmitted { .. }))
        .count();
    println!("{submissions} submission events observed");

    Ok(())
}
