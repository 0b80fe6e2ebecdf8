use anyhow::{Context, Result, bail};
use env_logger::Builder;
use log::{LevelFilter, info, warn};
use std::fs::File;
use std::io::BufWriter;

use coexistence_simulator::scenario::load_scenario;
use coexistence_simulator::simulation::metrics::{family_summaries, fbe_fairness, fbe_variant_summaries};
use coexistence_simulator::simulation::{RunResult, run_batch};

const USAGE: &str = "usage: coexistence-simulator <scenario.json|scenario.toml> [--json <results.json>]";

struct Args {
    scenario: String,
    json_output: Option<String>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut scenario = None;
    let mut json_output = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json_output = Some(iter.next().context("--json needs a file path")?),
            "-h" | "--help" => bail!(USAGE),
            _ if scenario.is_none() => scenario = Some(arg),
            _ => bail!("unexpected argument '{}'\n{}", arg, USAGE),
        }
    }
    let scenario = scenario.context(USAGE)?;
    Ok(Args { scenario, json_output })
}

fn report(result: &RunResult) {
    info!("Run with seed {}: {} events over {} µs", result.seed, result.events.len(), result.horizon);
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    for summary in family_summaries(result) {
        let label = summary.family.map(|f| f.to_string()).unwrap_or_else(|| "All".to_string());
        info!(
            "  {:<6} succeeded {:>7} failed {:>7} collision probability {:.4} occupancy {:.4} efficiency {:.4}",
            label, summary.succeeded, summary.failed, summary.collision_probability, summary.normalized_occupancy, summary.normalized_efficiency
        );
    }
    for variant in fbe_variant_summaries(result) {
        info!(
            "  {:<26} entities {:>3} airtime {:>9} µs mean {:.1} µs fairness {:.4}",
            variant.variant, variant.entities, variant.total_airtime, variant.mean_airtime, variant.fairness
        );
    }
    if result.entities.iter().any(|e| e.variant.is_some()) {
        info!("  FBE fairness {:.4}", fbe_fairness(result));
    }
    for entity in &result.entities {
        info!(
            "  [{}] succeeded {} failed {} airtime {} µs control {} µs",
            entity.name, entity.stats.succeeded, entity.stats.failed, entity.stats.airtime, entity.stats.control_airtime
        );
    }
}

fn main() -> Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("coexistence_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    info!("Starting up");

    let args = parse_args()?;
    let scenario = load_scenario(&args.scenario)?;
    info!("Loaded scenario '{}': {} entities, {} run(s)", args.scenario, scenario.entities.len(), scenario.runs);

    let results = run_batch(scenario.horizon, &scenario.seeds(), &scenario.entities).context("Simulation aborted")?;
    for result in &results {
        report(result);
    }

    if let Some(path) = args.json_output {
        let file = File::create(&path).with_context(|| format!("Failed to create file: {}", path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &results).with_context(|| format!("Failed to write results to {}", path))?;
        info!("Results written to {}", path);
    }
    Ok(())
}
