use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use eustay_engine::{
    run_scan, summarize_country_weights, ScanOutcome, ScanParams, ScanPaths,
};
use eustay_storage::RunStore;

#[derive(Debug, Parser)]
#[command(name = "eustay")]
#[command(about = "EU budget stay scanner command-line interface")]
struct Cli {
    /// Workspace directory holding config/ and data/.
    #[arg(long, default_value = ".")]
    workspace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan and print the ranked country results.
    Scan {
        #[arg(long)]
        checkin: NaiveDate,
        #[arg(long)]
        checkout: NaiveDate,
        #[arg(long)]
        min_price: Option<f64>,
        #[arg(long)]
        max_price: Option<f64>,
        /// Cost-index exponent; overrides the configured value.
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        min_rating: Option<f64>,
        #[arg(long)]
        min_stars: Option<u8>,
        #[arg(long, default_value = "EUR")]
        base_currency: String,
        /// Record the run but withhold its id from the output.
        #[arg(long)]
        hide_run_id: bool,
        /// Weight countries by past runs before scanning.
        #[arg(long)]
        use_optimizer: bool,
        /// Scan only the k highest-weighted countries.
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long, default_value_t = 0.5)]
        min_weight: f64,
        #[arg(long, default_value_t = 2.0)]
        max_weight: f64,
    },
    /// Print the historical per-country price summary.
    History,
    /// Run the HTTP API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let paths = ScanPaths::from_workspace_root(&cli.workspace);

    match cli.command {
        Commands::Scan {
            checkin,
            checkout,
            min_price,
            max_price,
            alpha,
            min_rating,
            min_stars,
            base_currency,
            hide_run_id,
            use_optimizer,
            top_k,
            min_weight,
            max_weight,
        } => {
            anyhow::ensure!(checkout > checkin, "checkout must be after checkin");

            let params = ScanParams {
                checkin,
                checkout,
                min_price,
                max_price,
                alpha_override: alpha,
                min_rating_override: min_rating,
                min_stars_override: min_stars,
                base_currency,
                log_results: !hide_run_id,
                use_optimizer,
                optimizer_top_k: top_k,
                optimizer_min_weight: min_weight,
                optimizer_max_weight: max_weight,
            };

            let outcome = run_scan(&params, &paths).await?;
            print_scan_outcome(&outcome);
        }
        Commands::History => {
            let store = RunStore::open(&paths.db_path).await?;
            let summary = store.historical_country_summary().await?;
            if summary.is_empty() {
                println!("no runs logged yet");
            } else {
                if let Some(run_id) = store.latest_run_id().await? {
                    println!("latest run: {run_id}");
                }
                println!(
                    "{:<6} {:<16} {:>6} {:>12} {:>12}",
                    "code", "country", "ci", "avg median", "normalized"
                );
                for row in summary {
                    println!(
                        "{:<6} {:<16} {:>6.2} {:>12.2} {:>12.2}",
                        row.country_code,
                        row.country_name,
                        row.cost_index,
                        row.avg_median_price,
                        row.normalized_median
                    );
                }
            }
        }
        Commands::Serve => {
            eustay_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_scan_outcome(outcome: &ScanOutcome) {
    if let Some(weights) = &outcome.country_scan_weights {
        println!("scan plan:");
        println!(
            "{:<6} {:<16} {:>6} {:>12} {:>8}",
            "code", "country", "ci", "normalized", "weight"
        );
        let plan = summarize_country_weights(
            &outcome.cost_index_by_country,
            &outcome.historical_summary,
            weights,
        );
        for row in plan {
            println!(
                "{:<6} {:<16} {:>6.2} {:>12} {:>8.2}",
                row.country_code,
                row.country_name,
                row.cost_index,
                row.normalized_median
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
                row.scan_weight
            );
        }
        println!();
    }

    if outcome.metrics_by_country.is_empty() {
        println!("no offers found");
        return;
    }

    let mut by_raw_min: Vec<_> = outcome.metrics_by_country.values().collect();
    by_raw_min.sort_by(|a, b| {
        a.min_price_per_night
            .partial_cmp(&b.min_price_per_night)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    println!("cheapest by raw price per night ({}):", outcome.base_currency);
    println!(
        "{:<6} {:<16} {:>8} {:>8} {:>8} {:>7}",
        "code", "country", "min", "median", "p90", "offers"
    );
    for m in &by_raw_min {
        println!(
            "{:<6} {:<16} {:>8.2} {:>8.2} {:>8.2} {:>7}",
            m.country_code,
            m.country_name,
            m.min_price_per_night,
            m.median_price_per_night,
            m.p90_price_per_night,
            m.offer_count
        );
    }

    let mut by_effective: Vec<_> = outcome.metrics_by_country.values().collect();
    by_effective.sort_by(|a, b| {
        a.effective_min_price
            .partial_cmp(&b.effective_min_price)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    println!();
    println!("best value adjusted for local costs:");
    println!(
        "{:<6} {:<16} {:>6} {:>10} {:>12}",
        "code", "country", "ci", "eff. min", "eff. median"
    );
    for m in &by_effective {
        println!(
            "{:<6} {:<16} {:>6.2} {:>10.2} {:>12.2}",
            m.country_code,
            m.country_name,
            m.cost_index,
            m.effective_min_price,
            m.effective_median_price
        );
    }

    println!();
    match outcome.run_id {
        Some(run_id) => println!("run {run_id} logged"),
        None => println!("run logged, id withheld"),
    }
}
