use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use serde_json::json;

use wc26_forecast::artifact::{FileArtifactStore, ModelArtifact};
use wc26_forecast::cli_args::CliArgs;
use wc26_forecast::error::ForecastError;
use wc26_forecast::inference::{InferenceService, PredictionRequest};
use wc26_forecast::logging;

const DEFAULT_STORE_DIR: &str = "artifacts";

fn main() -> ExitCode {
    logging::init();
    let args = CliArgs::from_env();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(ForecastError::InvalidInput { field, reason }) =
                err.downcast_ref::<ForecastError>()
            {
                let body = json!({
                    "error": "invalid_input",
                    "field": field,
                    "reason": reason,
                });
                println!("{body}");
                return ExitCode::from(2);
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &CliArgs) -> Result<()> {
    let artifact = match args.path("--artifact") {
        Some(path) => ModelArtifact::load_path(&path)?,
        None => {
            let dir = args
                .path("--store")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
            FileArtifactStore::new(&dir)
                .load_current()
                .with_context(|| format!("load current artifact from {}", dir.display()))?
        }
    };
    let service = InferenceService::with_artifact(artifact)?;

    let request = read_request(args)?;
    let response = service.predict(&request)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn read_request(args: &CliArgs) -> Result<PredictionRequest> {
    if let Some(path) = args.path("--request") {
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        return serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("decode request {}", path.display()));
    }

    let team_a = args
        .value("--team-a")
        .ok_or_else(|| anyhow!("missing --team-a"))?;
    let team_b = args
        .value("--team-b")
        .ok_or_else(|| anyhow!("missing --team-b"))?;
    let temperature_c = match args.value("--temperature") {
        None => None,
        Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
            ForecastError::invalid_input("temperature", format!("`{raw}` is not a number"))
        })?),
    };
    Ok(PredictionRequest {
        team_a,
        team_b,
        venue_id: args.value("--venue"),
        temperature_c,
        stage: args.value("--stage"),
    })
}
