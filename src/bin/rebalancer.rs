use anyhow::Error;
use clap::Parser;
use config::{Config, File};
use log::info;
use rebalancer::inventory::Inventory;
use rebalancer::nova::NovaApi;
use rebalancer::planner::Planner;
use rebalancer::report::InventoryReport;
use rebalancer::settings::Settings;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Where to write the inventory report as JSON
    #[clap(long)]
    report: Option<PathBuf>,

    /// Override the number of optimization passes
    #[clap(long)]
    iterations: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args = Args::parse();

    let settings: Settings = Config::builder()
        .add_source(File::from(
            args.config.unwrap_or(PathBuf::from("config.yaml")),
        ))
        .build()?
        .try_deserialize()?;

    let api = NovaApi::login(&settings.openstack).await?;
    let mut inventory = Inventory::load(&api, settings.overcommit()).await?;

    let iterations = args.iterations.unwrap_or(settings.iterations);
    let migrations = Planner::new(&mut inventory).optimize(iterations)?;
    info!("Planned {} migrations", migrations.len());

    for migration in &migrations {
        println!("{}", migration);
    }

    if let Some(path) = args.report {
        let report = InventoryReport::from(&inventory);
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}
