mod common;

use common::{ranking, raw_match, team, tournament, venue};
use wc26_forecast::config::FeatureConfig;
use wc26_forecast::fusion::{
    DropReason, FusionWarningKind, RankValue, SourceKind, TemperatureSource, fuse, fuse_sources,
};
use wc26_forecast::records::{OutcomeLabel, RawAward, RawWeather, SourceTables};

#[test]
fn fusion_is_deterministic() {
    let sources = tournament();
    let cfg = FeatureConfig::default();
    let first = fuse_sources(&sources, &cfg);
    let second = fuse_sources(&sources, &cfg);

    assert_eq!(first.rows, second.rows);
    assert_eq!(first.warnings, second.warnings);
    assert_eq!(first.dropped, second.dropped);
    assert_eq!(first.rows.len(), sources.matches.len());
    assert!(first.dropped.is_empty());
}

#[test]
fn rows_keep_source_order() {
    let out = fuse_sources(&tournament(), &FeatureConfig::default());
    assert!(
        out.rows
            .windows(2)
            .all(|w| w[0].source_index < w[1].source_index)
    );
}

#[test]
fn bad_rows_are_dropped_with_reasons() {
    let mut no_outcome = raw_match("ITA", "FRA", "2006-07-09", "draw");
    no_outcome.outcome = None;
    let mut bad_date = raw_match("ITA", "FRA", "2006-07-09", "draw");
    bad_date.date = Some("9 July 2006".into());

    let out = fuse(
        &[
            raw_match("ITA", "FRA", "2006-07-09", "abandoned"),
            raw_match("ITA", "XYZ", "2006-07-04", "home team win"),
            no_outcome,
            bad_date,
            raw_match("ITA", "FRA", "2006-07-09", "draw"),
        ],
        &[team("ITA", "men"), team("FRA", "men")],
        &[],
        &[],
    );

    assert_eq!(out.rows.len(), 1);
    assert_eq!(out.rows[0].source_index, 4);
    let reasons: Vec<_> = out.dropped.iter().map(|d| (d.index, d.reason.clone())).collect();
    assert_eq!(
        reasons,
        vec![
            (
                0,
                DropReason::InvalidOutcome {
                    raw: "abandoned".into()
                }
            ),
            (
                1,
                DropReason::UnknownTeam {
                    team_id: "XYZ".into()
                }
            ),
            (
                2,
                DropReason::MissingField {
                    field: "outcome".into()
                }
            ),
            (
                3,
                DropReason::InvalidField {
                    field: "date".into(),
                    problem: "unparseable `9 July 2006`".into()
                }
            ),
        ]
    );
}

#[test]
fn duplicate_matches_keep_the_first_even_when_sides_are_reversed() {
    let out = fuse(
        &[
            raw_match("ITA", "FRA", "2006-07-09", "draw"),
            raw_match("FRA", "ITA", "2006-07-09", "home team win"),
        ],
        &[team("ITA", "men"), team("FRA", "men")],
        &[],
        &[],
    );
    assert_eq!(out.rows.len(), 1);
    assert_eq!(out.rows[0].outcome, OutcomeLabel::Draw);
    let dup = out
        .warnings
        .iter()
        .find(|w| matches!(w.kind, FusionWarningKind::DuplicateMatch { .. }))
        .expect("duplicate warning");
    assert_eq!(dup.index, 1);
    assert_eq!(dup.kind, FusionWarningKind::DuplicateMatch { first_index: 0 });
}

#[test]
fn ranking_uses_latest_entry_on_or_before_the_match() {
    let out = fuse(
        &[
            raw_match("ITA", "FRA", "2006-07-09", "draw"),
            raw_match("ITA", "GER", "2006-07-04", "home team win"),
        ],
        &[team("ITA", "men"), team("FRA", "men"), team("GER", "men")],
        &[],
        &[
            ranking("ITA", "2006-01-01", 13.0),
            ranking("ITA", "2006-07-09", 2.0),
            ranking("ITA", "2007-01-01", 1.0),
            ranking("FRA", "2008-01-01", 7.0),
        ],
    );

    let final_row = &out.rows[0];
    assert_eq!(final_row.home_rank, RankValue::Ranked(2.0));
    // FRA only has an entry after the match
    assert_eq!(final_row.away_rank, RankValue::Ranked(7.0));

    let semi = &out.rows[1];
    assert_eq!(semi.home_rank, RankValue::Ranked(13.0));
    assert_eq!(semi.away_rank, RankValue::Unranked);

    let match_warnings: Vec<_> = out
        .warnings
        .iter()
        .filter(|w| w.source == SourceKind::Match)
        .map(|w| (w.index, w.kind.clone()))
        .collect();
    assert_eq!(
        match_warnings,
        vec![
            (
                0,
                FusionWarningKind::RankingAfterMatch {
                    team_id: "FRA".into()
                }
            ),
            (
                1,
                FusionWarningKind::NoRankingHistory {
                    team_id: "GER".into()
                }
            ),
        ]
    );
}

#[test]
fn temperature_prefers_weather_then_venue_then_default() {
    let mut with_weather = raw_match("ITA", "FRA", "2006-07-09", "draw");
    with_weather.venue_id = Some("BER".into());
    let mut venue_only = raw_match("ITA", "GER", "2006-07-04", "home team win");
    venue_only.venue_id = Some("DOR".into());
    let mut unknown_venue = raw_match("FRA", "GER", "2006-07-08", "draw");
    unknown_venue.venue_id = Some("XXX".into());
    let no_venue = raw_match("FRA", "POR", "2006-07-05", "home team win");

    let sources = SourceTables {
        teams: ["ITA", "FRA", "GER", "POR"]
            .iter()
            .map(|id| team(id, "men"))
            .collect(),
        matches: vec![with_weather, venue_only, unknown_venue, no_venue],
        venues: vec![
            venue("BER", "Berlin", Some(19.0)),
            venue("DOR", "Dortmund", Some(17.5)),
        ],
        rankings: Vec::new(),
        weather: vec![RawWeather {
            city: Some("BERLIN".into()),
            year: Some(2006),
            avg_temp_c: Some(27.0),
        }],
        awards: Vec::new(),
    };
    let cfg = FeatureConfig {
        default_temperature_c: 21.0,
        ..FeatureConfig::default()
    };
    let out = fuse_sources(&sources, &cfg);

    let temps: Vec<_> = out
        .rows
        .iter()
        .map(|r| (r.temperature_c, r.temperature_source))
        .collect();
    assert_eq!(
        temps,
        vec![
            (27.0, TemperatureSource::Weather),
            (17.5, TemperatureSource::Venue),
            (21.0, TemperatureSource::Default),
            (21.0, TemperatureSource::Default),
        ]
    );

    let venue_warnings: Vec<_> = out
        .warnings
        .iter()
        .filter(|w| matches!(w.kind, FusionWarningKind::UnknownVenue { .. }))
        .map(|w| w.index)
        .collect();
    assert_eq!(venue_warnings, vec![2]);
}

#[test]
fn contradicting_score_keeps_label_and_warns() {
    let mut m = raw_match("ITA", "FRA", "2006-07-09", "home team win");
    m.home_score = Some(1);
    m.away_score = Some(1);
    let out = fuse(&[m], &[team("ITA", "men"), team("FRA", "men")], &[], &[]);

    assert_eq!(out.rows[0].outcome, OutcomeLabel::HomeWin);
    assert!(out.warnings.iter().any(|w| w.kind
        == FusionWarningKind::LabelScoreMismatch {
            label: OutcomeLabel::HomeWin,
            home: 1,
            away: 1
        }));
}

#[test]
fn awards_count_only_earlier_years() {
    let sources = SourceTables {
        teams: vec![team("ITA", "men"), team("FRA", "men")],
        matches: vec![raw_match("ITA", "FRA", "2006-07-09", "draw")],
        awards: [("ITA", 1982), ("ITA", 2006), ("FRA", 1998), ("FRA", 2018)]
            .into_iter()
            .map(|(id, year)| RawAward {
                team_id: Some(id.into()),
                year: Some(year),
                award: None,
            })
            .collect(),
        ..SourceTables::default()
    };
    let out = fuse_sources(&sources, &FeatureConfig::default());
    assert_eq!(out.rows[0].home_awards, 1);
    assert_eq!(out.rows[0].away_awards, 1);
}

#[test]
fn invalid_reference_records_are_skipped_with_warnings() {
    let out = fuse(
        &[raw_match("ITA", "FRA", "2006-07-09", "draw")],
        &[team("ITA", "men"), team("FRA", "men")],
        &[venue("BER", "Berlin", Some(f64::NAN))],
        &[ranking("ITA", "not a date", 3.0)],
    );
    assert_eq!(out.rows.len(), 1);
    let sources: Vec<_> = out
        .warnings
        .iter()
        .filter(|w| matches!(w.kind, FusionWarningKind::InvalidRecord { .. }))
        .map(|w| w.source)
        .collect();
    assert_eq!(sources, vec![SourceKind::Venue, SourceKind::Ranking]);
    assert!(out.venues.is_empty());
}

#[test]
fn synthetic_history_flags_unranked_team() {
    let out = fuse_sources(&tournament(), &FeatureConfig::default());
    let unranked = out
        .warnings
        .iter()
        .filter(|w| {
            w.kind
                == FusionWarningKind::NoRankingHistory {
                    team_id: "T25".into(),
                }
        })
        .count();
    assert_eq!(unranked, common::EDITIONS.len());
    assert!(out.rows.iter().any(|r| r.temperature_source == TemperatureSource::Weather));
}
