#![allow(dead_code)]

//! Synthetic tournament history shared by the integration tests.
//!
//! 24 ranked men's teams `T01..T24` (rank `2 + 2i`, so `T04` is 10 and `T24` is 50)
//! meet across six editions. Results follow the ranking gap with a deterministic
//! low-discrepancy noise sequence. `T04` and `T24` never meet. `T25` plays but has no
//! ranking history, and `W01` is a women's team that never plays.

use once_cell::sync::Lazy;

use wc26_forecast::artifact::ModelArtifact;
use wc26_forecast::config::PipelineConfig;
use wc26_forecast::records::{
    RawAward, RawMatch, RawRanking, RawTeam, RawVenue, RawWeather, SourceTables,
};
use wc26_forecast::trainer::{CancelToken, train_pipeline};

pub const EDITIONS: [i32; 6] = [1998, 2002, 2006, 2010, 2014, 2018];
pub const VENUE_TEMPS: [f64; 6] = [8.0, 15.0, 20.0, 24.0, 28.0, 32.0];

static TRAINED: Lazy<ModelArtifact> = Lazy::new(|| {
    train_pipeline(&tournament(), &pipeline_config(), &CancelToken::new())
        .expect("synthetic tournament trains")
        .artifact
});

/// Artifact trained once per test binary on `tournament()`.
pub fn trained_artifact() -> ModelArtifact {
    TRAINED.clone()
}

pub fn pipeline_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.train.min_rows = 50;
    cfg.train.max_iters = 400;
    cfg
}

pub fn team_id(i: usize) -> String {
    format!("T{i:02}")
}

pub fn rank_of(i: usize) -> f64 {
    2.0 + 2.0 * i as f64
}

pub fn team(id: &str, gender: &str) -> RawTeam {
    RawTeam {
        id: Some(id.to_string()),
        name: Some(format!("Team {id}")),
        confederation: Some("UEFA".to_string()),
        gender: Some(gender.to_string()),
    }
}

pub fn ranking(team_id: &str, date: &str, rank: f64) -> RawRanking {
    RawRanking {
        team_id: Some(team_id.to_string()),
        date: Some(date.to_string()),
        rank: Some(rank),
    }
}

pub fn venue(id: &str, city: &str, temp: Option<f64>) -> RawVenue {
    RawVenue {
        venue_id: Some(id.to_string()),
        city: Some(city.to_string()),
        avg_temp_c: temp,
    }
}

pub fn raw_match(home: &str, away: &str, date: &str, outcome: &str) -> RawMatch {
    RawMatch {
        match_id: None,
        edition: Some(format!("{} FIFA World Cup", &date[..4])),
        date: Some(date.to_string()),
        home_team_id: Some(home.to_string()),
        away_team_id: Some(away.to_string()),
        venue_id: None,
        home_score: None,
        away_score: None,
        outcome: Some(outcome.to_string()),
        stage: None,
    }
}

fn noise(k: usize) -> f64 {
    ((k as f64 + 1.0) * 0.618_033_988_749_895).fract()
}

fn scripted_result(rank_home: f64, rank_away: f64, k: usize) -> (&'static str, i32, i32) {
    let diff = (rank_away - rank_home) / 48.0;
    let p_home = 0.36 + 0.30 * diff;
    let p_draw = 0.26;
    let u = noise(k);
    if u < p_home {
        ("home team win", 2, 0)
    } else if u < p_home + p_draw {
        ("draw", 1, 1)
    } else {
        ("away team win", 0, 1)
    }
}

pub fn tournament() -> SourceTables {
    let mut teams: Vec<RawTeam> = (1..=24).map(|i| team(&team_id(i), "men")).collect();
    teams.push(team("T25", "men"));
    teams.push(team("W01", "women"));

    let mut rankings = Vec::new();
    for i in 1..=24 {
        rankings.push(ranking(&team_id(i), "1994-01-01", rank_of(i)));
        rankings.push(ranking(&team_id(i), "2010-01-01", rank_of(i)));
    }

    let venues: Vec<RawVenue> = VENUE_TEMPS
        .iter()
        .enumerate()
        .map(|(v, t)| venue(&format!("V{}", v + 1), &format!("C{}", v + 1), Some(*t)))
        .collect();

    let weather = vec![RawWeather {
        city: Some("C5".to_string()),
        year: Some(2018),
        avg_temp_c: Some(34.0),
    }];

    let awards = [("T01", 1990), ("T01", 2002), ("T02", 2006), ("T03", 2014)]
        .into_iter()
        .map(|(id, year)| RawAward {
            team_id: Some(id.to_string()),
            year: Some(year),
            award: Some("Fair Play".to_string()),
        })
        .collect();

    let mut matches = Vec::new();
    let mut k = 0usize;
    for (e, year) in EDITIONS.iter().enumerate() {
        for i in 1..=24usize {
            for j in (i + 1)..=24 {
                if (i + j + e) % 3 != 0 || (i == 4 && j == 24) {
                    continue;
                }
                let (home, away) = if (i + j + e) % 2 == 0 { (i, j) } else { (j, i) };
                let (label, hs, aws) = scripted_result(rank_of(home), rank_of(away), k);
                matches.push(RawMatch {
                    match_id: Some(format!("M{k:04}")),
                    edition: Some(format!("{year} FIFA World Cup")),
                    date: Some(format!("{year}-06-{:02}", 10 + k % 20)),
                    home_team_id: Some(team_id(home)),
                    away_team_id: Some(team_id(away)),
                    venue_id: Some(format!("V{}", k % 6 + 1)),
                    home_score: Some(hs),
                    away_score: Some(aws),
                    outcome: Some(label.to_string()),
                    stage: Some(if k % 7 == 0 { "knockout" } else { "group stage" }.to_string()),
                });
                k += 1;
            }
        }
        let opponent = team_id(e * 4 + 1);
        matches.push(RawMatch {
            match_id: Some(format!("M{k:04}")),
            edition: Some(format!("{year} FIFA World Cup")),
            date: Some(format!("{year}-07-01")),
            home_team_id: Some("T25".to_string()),
            away_team_id: Some(opponent),
            venue_id: Some("V3".to_string()),
            home_score: Some(0),
            away_score: Some(2),
            outcome: Some("away team win".to_string()),
            stage: Some("group stage".to_string()),
        });
        k += 1;
    }

    SourceTables {
        teams,
        matches,
        venues,
        rankings,
        weather,
        awards,
    }
}
