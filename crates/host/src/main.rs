use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chunky_engine::config::ChunkyConfig;
use chunky_engine::event_bus::EventBus;
use chunky_engine::metrics::MetricsSnapshot;
use chunky_engine::region::RegionCache;
use chunky_engine::region::position::ChunkCoord;
use chunky_engine::scheduler::{TaskOutcome, TaskScheduler};
use chunky_host::pregen::{Area, GenerationTask, Pregenerator, SimulatedGenerator};
use chunky_host::report::ProgressReporter;
use serde::Serialize;

const DEFAULT_RADIUS: i32 = 64;

#[derive(Serialize)]
struct WorldReport {
    world: String,
    outcome: &'static str,
    regions: usize,
    full_regions: usize,
    metrics: MetricsSnapshot,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let json = args.iter().any(|a| a == "--json");
    let radius: i32 = args
        .iter()
        .skip_while(|a| *a != "--radius")
        .nth(1)
        .map(|s| s.parse::<i32>().context("--radius expects an integer"))
        .transpose()?
        .unwrap_or(DEFAULT_RADIUS);
    anyhow::ensure!(radius >= 0, "--radius must not be negative, got {radius}");
    let delay_us: u64 = args
        .iter()
        .skip_while(|a| *a != "--delay-us")
        .nth(1)
        .map(|s| s.parse::<u64>().context("--delay-us expects an integer"))
        .transpose()?
        .unwrap_or(0);
    let assumed_radius: Option<i32> = args
        .iter()
        .skip_while(|a| *a != "--assume-generated")
        .nth(1)
        .map(|s| s.parse::<i32>().context("--assume-generated expects an integer"))
        .transpose()?;
    let mut worlds: Vec<String> = args
        .windows(2)
        .filter(|w| w[0] == "--world")
        .map(|w| w[1].clone())
        .collect();
    if worlds.is_empty() {
        worlds.push("overworld".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ChunkyConfig::from_env();
    let cache = Arc::new(RegionCache::with_metrics(config.metrics_enabled));
    let bus = Arc::new(EventBus::new());
    let scheduler = Arc::new(
        TaskScheduler::new(config.scheduler.clone()).context("failed to start task scheduler")?,
    );
    let reporter = ProgressReporter::attach(&bus, Arc::clone(&cache));

    let on_interrupt = Arc::clone(&scheduler);
    ctrlc::set_handler(move || {
        tracing::info!("Interrupt received, cancelling generation tasks...");
        on_interrupt.cancel_tasks();
    })
    .context("failed to install Ctrl-C handler")?;

    let generator = Arc::new(SimulatedGenerator {
        cost: Duration::from_micros(delay_us),
    });
    let pregen = Arc::new(Pregenerator::new(
        Arc::clone(&cache),
        Arc::clone(&bus),
        generator,
    ));

    tracing::info!(
        "Pre-generating {} world(s) with radius {} ({} chunks each)",
        worlds.len(),
        radius,
        Area::new(ChunkCoord::new(0, 0), radius).chunk_count()
    );

    if let Some(assumed) = assumed_radius {
        for world in &worlds {
            let marked = pregen.assume_generated(world, Area::new(ChunkCoord::new(0, 0), assumed));
            tracing::info!("Treating {} chunks of '{}' as already generated", marked, world);
        }
    }

    let mut handles = Vec::with_capacity(worlds.len());
    for world in &worlds {
        let task = GenerationTask::new(world.clone(), Area::new(ChunkCoord::new(0, 0), radius));
        let handle = pregen
            .start(&scheduler, task)
            .with_context(|| format!("failed to schedule generation for '{world}'"))?;
        handles.push((world, handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (world, handle) in handles {
        let outcome = match handle.wait() {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Failed => "failed",
        };
        reports.push(WorldReport {
            world: world.clone(),
            outcome,
            regions: cache.region_count(world),
            full_regions: cache.full_region_count(world),
            metrics: cache.metrics(world),
        });
    }
    reporter.detach(&bus);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("failed to encode report")?
        );
    } else {
        for report in &reports {
            println!(
                "{}: {} ({} regions, {} complete)\n{}",
                report.world, report.outcome, report.regions, report.full_regions, report.metrics
            );
        }
    }
    Ok(())
}
