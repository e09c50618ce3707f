use anyhow::{Context, Result, anyhow};

use wc26_forecast::cli_args::CliArgs;
use wc26_forecast::logging;
use wc26_forecast::source_loader::{self, SourcePaths};

fn main() -> Result<()> {
    logging::init();
    let _ = dotenvy::dotenv();
    let args = CliArgs::from_env();

    let db_path = args
        .path("--db")
        .or_else(|| std::env::var("WC26_SOURCE_DB").ok().map(Into::into))
        .context("pass --db PATH or set WC26_SOURCE_DB")?;
    let paths = SourcePaths {
        teams: args.path("--teams"),
        matches: args.path("--matches"),
        rankings: args.path("--rankings"),
        venues: args.path("--venues"),
        weather: args.path("--weather"),
        awards: args.path("--awards"),
    };
    if !paths.has_any() {
        return Err(anyhow!("no source files passed to ingest"));
    }

    let tables = source_loader::load_json_sources(&paths)?;
    let mut conn = source_loader::open_db(&db_path)?;
    let summary = source_loader::ingest_sources(&mut conn, db_path.clone(), &tables)?;

    println!("Source ingest complete");
    println!("DB: {}", summary.db_path.display());
    println!(
        "Teams: {}  Matches: {}  Rankings: {}",
        summary.teams, summary.matches, summary.rankings
    );
    println!(
        "Venues: {}  Weather: {}  Awards: {}",
        summary.venues, summary.weather, summary.awards
    );
    println!(
        "Latest match: {}",
        summary.latest_match_date.as_deref().unwrap_or("n/a")
    );
    Ok(())
}
