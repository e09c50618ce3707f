//! Reads the raw source tables from JSON files or from a SQLite source database.
//!
//! Records are decoded into the all-optional `Raw*` shapes in file order; every
//! semantic check happens in fusion.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, Transaction, params};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::records::{RawAward, RawMatch, RawRanking, RawTeam, RawVenue, RawWeather, SourceTables};

/// Locations of the JSON source files. Teams, matches and rankings are required.
#[derive(Debug, Clone, Default)]
pub struct SourcePaths {
    pub teams: Option<PathBuf>,
    pub matches: Option<PathBuf>,
    pub rankings: Option<PathBuf>,
    pub venues: Option<PathBuf>,
    pub weather: Option<PathBuf>,
    pub awards: Option<PathBuf>,
}

impl SourcePaths {
    pub fn has_any(&self) -> bool {
        self.teams.is_some()
            || self.matches.is_some()
            || self.rankings.is_some()
            || self.venues.is_some()
            || self.weather.is_some()
            || self.awards.is_some()
    }
}

/// Decodes a JSON array file, or one record per line for `.jsonl` / `.ndjson`.
pub fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);
    let line_delimited = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl") || e.eq_ignore_ascii_case("ndjson"));

    if !line_delimited {
        return serde_json::from_reader(reader)
            .with_context(|| format!("decode JSON array {}", path.display()));
    }

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("decode {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }
    Ok(out)
}

fn load_optional<T: DeserializeOwned>(path: Option<&PathBuf>) -> Result<Vec<T>> {
    match path {
        Some(p) => load_records(p),
        None => Ok(Vec::new()),
    }
}

fn load_required<T: DeserializeOwned>(path: Option<&PathBuf>, what: &str) -> Result<Vec<T>> {
    let path = path.ok_or_else(|| anyhow!("missing path for {what} records"))?;
    load_records(path)
}

pub fn load_json_sources(paths: &SourcePaths) -> Result<SourceTables> {
    let tables = SourceTables {
        teams: load_required(paths.teams.as_ref(), "team")?,
        matches: load_required(paths.matches.as_ref(), "match")?,
        rankings: load_required(paths.rankings.as_ref(), "ranking")?,
        venues: load_optional(paths.venues.as_ref())?,
        weather: load_optional(paths.weather.as_ref())?,
        awards: load_optional(paths.awards.as_ref())?,
    };
    info!(
        teams = tables.teams.len(),
        matches = tables.matches.len(),
        rankings = tables.rankings.len(),
        venues = tables.venues.len(),
        weather = tables.weather.len(),
        awards = tables.awards.len(),
        "source records loaded"
    );
    Ok(tables)
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub db_path: PathBuf,
    pub teams: usize,
    pub matches: usize,
    pub venues: usize,
    pub rankings: usize,
    pub weather: usize,
    pub awards: usize,
    pub latest_match_date: Option<String>,
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create db directory {}", parent.display()))?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Every table keeps the source position in `seq` so loads return records in the
/// order they were ingested.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS teams (
            seq INTEGER PRIMARY KEY,
            team_id TEXT NULL,
            name TEXT NULL,
            confederation TEXT NULL,
            gender TEXT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS matches (
            seq INTEGER PRIMARY KEY,
            match_id TEXT NULL,
            edition TEXT NULL,
            match_date TEXT NULL,
            home_team_id TEXT NULL,
            away_team_id TEXT NULL,
            venue_id TEXT NULL,
            home_score INTEGER NULL,
            away_score INTEGER NULL,
            outcome TEXT NULL,
            stage TEXT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(match_date);
        CREATE TABLE IF NOT EXISTS venues (
            seq INTEGER PRIMARY KEY,
            venue_id TEXT NULL,
            city TEXT NULL,
            avg_temp_c REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS rankings (
            seq INTEGER PRIMARY KEY,
            team_id TEXT NULL,
            rank_date TEXT NULL,
            rank REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rankings_team ON rankings(team_id);
        CREATE TABLE IF NOT EXISTS weather (
            seq INTEGER PRIMARY KEY,
            city TEXT NULL,
            year INTEGER NULL,
            avg_temp_c REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS awards (
            seq INTEGER PRIMARY KEY,
            team_id TEXT NULL,
            year INTEGER NULL,
            award TEXT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            records_upserted INTEGER NOT NULL
        );
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

/// Upserts every table in one transaction. Rows beyond the new record count are
/// removed, so the database mirrors the latest source files.
pub fn ingest_sources(
    conn: &mut Connection,
    db_path: PathBuf,
    tables: &SourceTables,
) -> Result<IngestSummary> {
    let started_at = Utc::now().to_rfc3339();
    let now = started_at.clone();

    let tx = conn.transaction().context("begin ingest transaction")?;
    for (seq, t) in tables.teams.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO teams (seq, team_id, name, confederation, gender, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(seq) DO UPDATE SET
                team_id = excluded.team_id,
                name = excluded.name,
                confederation = excluded.confederation,
                gender = excluded.gender,
                updated_at = excluded.updated_at
            "#,
            params![seq as i64, t.id, t.name, t.confederation, t.gender, now],
        )
        .context("upsert team")?;
    }
    for (seq, m) in tables.matches.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO matches (
                seq, match_id, edition, match_date, home_team_id, away_team_id,
                venue_id, home_score, away_score, outcome, stage, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(seq) DO UPDATE SET
                match_id = excluded.match_id,
                edition = excluded.edition,
                match_date = excluded.match_date,
                home_team_id = excluded.home_team_id,
                away_team_id = excluded.away_team_id,
                venue_id = excluded.venue_id,
                home_score = excluded.home_score,
                away_score = excluded.away_score,
                outcome = excluded.outcome,
                stage = excluded.stage,
                updated_at = excluded.updated_at
            "#,
            params![
                seq as i64,
                m.match_id,
                m.edition,
                m.date,
                m.home_team_id,
                m.away_team_id,
                m.venue_id,
                m.home_score,
                m.away_score,
                m.outcome,
                m.stage,
                now,
            ],
        )
        .context("upsert match")?;
    }
    for (seq, v) in tables.venues.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO venues (seq, venue_id, city, avg_temp_c, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(seq) DO UPDATE SET
                venue_id = excluded.venue_id,
                city = excluded.city,
                avg_temp_c = excluded.avg_temp_c,
                updated_at = excluded.updated_at
            "#,
            params![seq as i64, v.venue_id, v.city, v.avg_temp_c, now],
        )
        .context("upsert venue")?;
    }
    for (seq, r) in tables.rankings.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO rankings (seq, team_id, rank_date, rank, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(seq) DO UPDATE SET
                team_id = excluded.team_id,
                rank_date = excluded.rank_date,
                rank = excluded.rank,
                updated_at = excluded.updated_at
            "#,
            params![seq as i64, r.team_id, r.date, r.rank, now],
        )
        .context("upsert ranking")?;
    }
    for (seq, w) in tables.weather.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO weather (seq, city, year, avg_temp_c, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(seq) DO UPDATE SET
                city = excluded.city,
                year = excluded.year,
                avg_temp_c = excluded.avg_temp_c,
                updated_at = excluded.updated_at
            "#,
            params![seq as i64, w.city, w.year, w.avg_temp_c, now],
        )
        .context("upsert weather reading")?;
    }
    for (seq, a) in tables.awards.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO awards (seq, team_id, year, award, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(seq) DO UPDATE SET
                team_id = excluded.team_id,
                year = excluded.year,
                award = excluded.award,
                updated_at = excluded.updated_at
            "#,
            params![seq as i64, a.team_id, a.year, a.award, now],
        )
        .context("upsert award")?;
    }

    for (table, len) in [
        ("teams", tables.teams.len()),
        ("matches", tables.matches.len()),
        ("venues", tables.venues.len()),
        ("rankings", tables.rankings.len()),
        ("weather", tables.weather.len()),
        ("awards", tables.awards.len()),
    ] {
        trim_table(&tx, table, len)?;
    }

    let upserted = tables.teams.len()
        + tables.matches.len()
        + tables.venues.len()
        + tables.rankings.len()
        + tables.weather.len()
        + tables.awards.len();
    tx.execute(
        "INSERT INTO ingest_runs(started_at, finished_at, records_upserted) VALUES (?1, ?2, ?3)",
        params![started_at, Utc::now().to_rfc3339(), upserted as i64],
    )
    .context("insert ingest run")?;
    tx.commit().context("commit ingest transaction")?;

    let latest_match_date = conn
        .query_row("SELECT MAX(match_date) FROM matches", [], |row| {
            row.get::<_, Option<String>>(0)
        })
        .context("query latest match date")?;

    Ok(IngestSummary {
        db_path,
        teams: tables.teams.len(),
        matches: tables.matches.len(),
        venues: tables.venues.len(),
        rankings: tables.rankings.len(),
        weather: tables.weather.len(),
        awards: tables.awards.len(),
        latest_match_date,
    })
}

fn trim_table(tx: &Transaction<'_>, table: &str, len: usize) -> Result<()> {
    // table names come from the fixed list in ingest_sources
    tx.execute(&format!("DELETE FROM {table} WHERE seq >= ?1"), params![len as i64])
        .with_context(|| format!("trim {table}"))?;
    Ok(())
}

pub fn load_db_sources(conn: &Connection) -> Result<SourceTables> {
    let teams = query_all(
        conn,
        "SELECT team_id, name, confederation, gender FROM teams ORDER BY seq",
        |row| {
            Ok(RawTeam {
                id: row.get(0)?,
                name: row.get(1)?,
                confederation: row.get(2)?,
                gender: row.get(3)?,
            })
        },
    )
    .context("load teams")?;
    let matches = query_all(
        conn,
        r#"
        SELECT match_id, edition, match_date, home_team_id, away_team_id,
               venue_id, home_score, away_score, outcome, stage
        FROM matches ORDER BY seq
        "#,
        |row| {
            Ok(RawMatch {
                match_id: row.get(0)?,
                edition: row.get(1)?,
                date: row.get(2)?,
                home_team_id: row.get(3)?,
                away_team_id: row.get(4)?,
                venue_id: row.get(5)?,
                home_score: row.get(6)?,
                away_score: row.get(7)?,
                outcome: row.get(8)?,
                stage: row.get(9)?,
            })
        },
    )
    .context("load matches")?;
    let venues = query_all(
        conn,
        "SELECT venue_id, city, avg_temp_c FROM venues ORDER BY seq",
        |row| {
            Ok(RawVenue {
                venue_id: row.get(0)?,
                city: row.get(1)?,
                avg_temp_c: row.get(2)?,
            })
        },
    )
    .context("load venues")?;
    let rankings = query_all(
        conn,
        "SELECT team_id, rank_date, rank FROM rankings ORDER BY seq",
        |row| {
            Ok(RawRanking {
                team_id: row.get(0)?,
                date: row.get(1)?,
                rank: row.get(2)?,
            })
        },
    )
    .context("load rankings")?;
    let weather = query_all(
        conn,
        "SELECT city, year, avg_temp_c FROM weather ORDER BY seq",
        |row| {
            Ok(RawWeather {
                city: row.get(0)?,
                year: row.get(1)?,
                avg_temp_c: row.get(2)?,
            })
        },
    )
    .context("load weather")?;
    let awards = query_all(
        conn,
        "SELECT team_id, year, award FROM awards ORDER BY seq",
        |row| {
            Ok(RawAward {
                team_id: row.get(0)?,
                year: row.get(1)?,
                award: row.get(2)?,
            })
        },
    )
    .context("load awards")?;

    Ok(SourceTables {
        teams,
        matches,
        venues,
        rankings,
        weather,
        awards,
    })
}

fn query_all<T, F>(conn: &Connection, sql: &str, map: F) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql).context("prepare source query")?;
    let rows = stmt.query_map([], map).context("run source query")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode source row")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tables() -> SourceTables {
        SourceTables {
            teams: vec![
                RawTeam {
                    id: Some("BRA".into()),
                    name: Some("Brazil".into()),
                    confederation: Some("CONMEBOL".into()),
                    gender: Some("men".into()),
                },
                RawTeam::default(),
            ],
            matches: vec![RawMatch {
                match_id: Some("M-1".into()),
                edition: Some("1970 FIFA World Cup".into()),
                date: Some("1970-06-21".into()),
                home_team_id: Some("BRA".into()),
                away_team_id: Some("ITA".into()),
                venue_id: Some("S-1".into()),
                home_score: Some(4),
                away_score: Some(1),
                outcome: Some("home team win".into()),
                stage: Some("final".into()),
            }],
            rankings: vec![RawRanking {
                team_id: Some("BRA".into()),
                date: Some("1993-08-08".into()),
                rank: Some(3.0),
            }],
            ..SourceTables::default()
        }
    }

    #[test]
    fn sqlite_ingest_round_trips_records_in_order() {
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        init_schema(&conn).expect("schema");
        let tables = sample_tables();
        let summary = ingest_sources(&mut conn, PathBuf::from(":memory:"), &tables)
            .expect("ingest");
        assert_eq!(summary.teams, 2);
        assert_eq!(summary.latest_match_date.as_deref(), Some("1970-06-21"));

        let loaded = load_db_sources(&conn).expect("load");
        assert_eq!(loaded.teams.len(), 2);
        assert_eq!(loaded.teams[0].id.as_deref(), Some("BRA"));
        assert!(loaded.teams[1].id.is_none());
        assert_eq!(loaded.matches[0].home_score, Some(4));
        assert_eq!(loaded.rankings[0].rank, Some(3.0));
        assert!(loaded.weather.is_empty());
    }

    #[test]
    fn reingest_with_fewer_records_trims_stale_rows() {
        let mut conn = Connection::open_in_memory().expect("in-memory db");
        init_schema(&conn).expect("schema");
        let mut tables = sample_tables();
        ingest_sources(&mut conn, PathBuf::from(":memory:"), &tables).expect("first ingest");
        tables.teams.truncate(1);
        ingest_sources(&mut conn, PathBuf::from(":memory:"), &tables).expect("second ingest");
        let loaded = load_db_sources(&conn).expect("load");
        assert_eq!(loaded.teams.len(), 1);
    }

    #[test]
    fn open_db_reports_an_unusable_parent_directory() {
        let blocker = std::env::temp_dir().join(format!(
            "wc26_forecast_blocker_{}",
            std::process::id()
        ));
        std::fs::write(&blocker, b"not a directory").expect("blocker file");

        let err = open_db(&blocker.join("sources.sqlite")).unwrap_err();
        assert!(
            format!("{err:#}").contains("create db directory"),
            "{err:#}"
        );
        let _ = std::fs::remove_file(&blocker);
    }
}
