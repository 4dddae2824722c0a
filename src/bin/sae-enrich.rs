//! sae-enrich - cell-type enrichment of sparse autoencoder features
//!
//! Command-line interface for checkpointed enrichment runs.

use clap::{Parser, Subcommand};
use sae_enrich::data::UnitReport;
use sae_enrich::error::Result;
use sae_enrich::pipeline::{CheckpointedRunner, RunConfig, RunOutcome};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Feature-to-label enrichment over streamed SAE activations
#[derive(Parser)]
#[command(name = "sae-enrich")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter (e.g. "info", "sae_enrich=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run enrichment for the units of a YAML configuration
    Run {
        /// Path to run configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Only run these units (comma-separated); default is all
        #[arg(short, long, value_delimiter = ',')]
        units: Vec<u32>,
    },

    /// Write an example run configuration
    Example {
        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the state of every unit of a configuration
    Status {
        /// Path to run configuration YAML
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Summarize a written unit report
    Inspect {
        /// Path to a unit report JSON
        #[arg(short, long)]
        report: PathBuf,

        /// Number of features to list
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run { config, units } => cmd_run(&config, &units),
        Commands::Example { output } => cmd_example(output.as_ref()),
        Commands::Status { config } => cmd_status(&config),
        Commands::Inspect {
            report,
            top,
            format,
        } => cmd_inspect(&report, top, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Run or resume the configured units
fn cmd_run(config_path: &PathBuf, units: &[u32]) -> Result<()> {
    eprintln!("Loading run configuration from {:?}...", config_path);
    let config = RunConfig::load(config_path)?;

    eprintln!("Loading entity metadata from {:?}...", config.metadata);
    let runner = CheckpointedRunner::from_config(config)?;

    let cancel = runner.cancel_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nStopping after the current batch...");
        cancel.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    eprintln!("Running '{}'...", runner.config().name);
    match runner.run(units)? {
        RunOutcome::Completed { written, skipped } => {
            eprintln!(
                "Done! {} unit(s) written, {} skipped (output exists)",
                written.len(),
                skipped.len()
            );
            for id in written {
                eprintln!("  {}", runner.config().output_path(id).display());
            }
        }
        RunOutcome::Interrupted {
            unit,
            entities_completed,
        } => {
            eprintln!(
                "Interrupted in unit {} after {} entities; re-run to resume.",
                unit, entities_completed
            );
            std::process::exit(130);
        }
    }
    Ok(())
}

/// Write an example configuration
fn cmd_example(output: Option<&PathBuf>) -> Result<()> {
    let config = RunConfig::example();
    match output {
        Some(path) => {
            config.save(path)?;
            eprintln!("Wrote example configuration to {:?}", path);
        }
        None => print!("{}", config.to_yaml()?),
    }
    Ok(())
}

/// Print unit states
fn cmd_status(config_path: &PathBuf) -> Result<()> {
    let config = RunConfig::load(config_path)?;
    let runner = CheckpointedRunner::from_config(config)?;

    println!("Run: {}", runner.config().name);
    println!("Checkpoint: {}", runner.config().checkpoint_path().display());
    for (unit, state) in runner.status()? {
        println!("  unit {:>3}  {}", unit, state);
    }
    Ok(())
}

/// Print an overview of one report
fn cmd_inspect(report_path: &PathBuf, top: usize, format: &str) -> Result<()> {
    let report = UnitReport::read_json(report_path)?;
    let ranked = report.most_enriched(top);

    match format {
        "json" => {
            let features: Vec<serde_json::Value> = ranked
                .iter()
                .map(|&(f, n)| {
                    serde_json::json!({
                        "feature": f,
                        "n_enrichments": n,
                        "enrichments": report.features[&f].enrichments,
                    })
                })
                .collect();
            let overview = serde_json::json!({
                "unit": report.unit,
                "n_entities": report.n_entities,
                "n_features": report.n_features,
                "n_features_tested": report.n_features_tested,
                "n_positions": report.n_positions,
                "mean_active_per_position": report.mean_active_per_position,
                "n_with_enrichment": report.n_with_enrichment,
                "category_counts": report.category_counts,
                "most_enriched": features,
            });
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
        _ => {
            println!("Unit {}", report.unit);
            println!(
                "  {} entities, {} positions, {:.2} active features per position",
                report.n_entities, report.n_positions, report.mean_active_per_position
            );
            println!(
                "  {} of {} features tested (top_frac {}, min active {}, alpha {})",
                report.n_features_tested,
                report.n_features,
                report.top_frac,
                report.min_active_entities,
                report.alpha
            );
            for (column, n) in &report.n_with_enrichment {
                let levels = report.category_counts.get(column).map_or(0, |c| c.len());
                println!("  {}: {} levels, {} features enriched", column, levels, n);
            }

            if !ranked.is_empty() {
                println!("\nMost enriched features:");
            }
            for (feature, _) in ranked {
                let fr = &report.features[&feature];
                println!("  feature {} ({} active entities)", feature, fr.n_active_entities);
                for (column, hits) in &fr.enrichments {
                    for e in hits.iter().take(3) {
                        println!(
                            "    {:<10} {:<24} q={:.2e} OR={:.2} {}/{}",
                            column, e.category, e.p_adj, e.odds_ratio, e.n_top, e.n_total
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
