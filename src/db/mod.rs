use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod models;
use models::*;

use crate::error::RepositoryError;
use crate::repository::{ChangeStream, Repository};

/// Thread-safe SQLite store (single connection with mutex) holding the
/// region → competition → fixture tree and its scores.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    watch_poll: Duration,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private database that disappears with the handle
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            watch_poll: Duration::from_secs(1),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// How often a watch polls for new score rows
    pub fn with_watch_poll(mut self, every: Duration) -> Self {
        self.watch_poll = every;
        self
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database mutex poisoned"))
    }

    // ── Regions & competitions ───────────────────────────────────────────────

    pub fn upsert_region(&self, id: &str, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO regions (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name",
            params![id, name],
        )?;
        Ok(())
    }

    /// Upsert a competition, creating its region (named after its id) if missing
    pub fn upsert_competition(&self, region_id: &str, id: &str, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO regions (id, name) VALUES (?1, ?1)",
            params![region_id],
        )?;
        conn.execute(
            "INSERT INTO competitions (region_id, id, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(region_id, id) DO UPDATE SET name=excluded.name",
            params![region_id, id, name],
        )?;
        Ok(())
    }

    pub fn regions(&self) -> Result<Vec<Region>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM regions ORDER BY rowid")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Region {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn competitions(&self, region_id: &str) -> Result<Vec<Competition>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, region_id, name FROM competitions WHERE region_id=?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![region_id], |row| {
                Ok(Competition {
                    id: row.get(0)?,
                    region_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Fixtures ──────────────────────────────────────────────────────────────

    /// Insert a fixture, creating its region and competition as needed.
    /// The document is stored as given; parsing happens on read.
    pub fn insert_fixture(
        &self,
        region_id: &str,
        competition_id: &str,
        doc: &FixtureDoc,
    ) -> Result<()> {
        if doc.id.trim().is_empty() {
            bail!("fixture id must not be empty");
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO regions (id, name) VALUES (?1, ?1)",
            params![region_id],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO competitions (region_id, id, name) VALUES (?1, ?2, ?2)",
            params![region_id, competition_id],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fixtures (
                region_id, competition_id, id, home_team, away_team, venue, date, time, status
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                region_id,
                competition_id,
                doc.id,
                doc.home_team,
                doc.away_team,
                doc.venue,
                doc.date,
                doc.time,
                doc.status.as_deref().unwrap_or("Scheduled"),
            ],
        )?;
        if inserted == 0 {
            bail!("fixture {}/{}/{} already exists", region_id, competition_id, doc.id);
        }
        Ok(())
    }

    pub fn fixtures(&self, region_id: &str, competition_id: &str) -> Result<Vec<FixtureDoc>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, home_team, away_team, venue, date, time, status
             FROM fixtures WHERE region_id=?1 AND competition_id=?2 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![region_id, competition_id], map_fixture_doc)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn fixture_exists(conn: &Connection, key: &FixtureKey) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM fixtures WHERE region_id=?1 AND competition_id=?2 AND id=?3",
                params![key.region_id, key.competition_id, key.fixture_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Scores ────────────────────────────────────────────────────────────────

    /// Record a crowd-sourced score. A Scheduled fixture moves to InProgress;
    /// later statuses are left alone.
    pub fn add_score_submission(
        &self,
        key: &FixtureKey,
        score: MatchScore,
        submitted_by: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<ScoreSubmission> {
        let submitted_by = submitted_by
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("anonymous")
            .to_string();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !Self::fixture_exists(&tx, key)? {
            bail!("fixture {} not found", key);
        }
        tx.execute(
            "INSERT INTO scores (
                region_id, competition_id, fixture_id,
                team_a_goals, team_a_points, team_b_goals, team_b_points,
                timestamp, submitted_by
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                key.region_id,
                key.competition_id,
                key.fixture_id,
                score.team_a.goals,
                score.team_a.points,
                score.team_b.goals,
                score.team_b.points,
                timestamp,
                submitted_by,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.execute(
            "UPDATE fixtures SET status='InProgress'
             WHERE region_id=?1 AND competition_id=?2 AND id=?3
               AND (status IS NULL OR status='Scheduled')",
            params![key.region_id, key.competition_id, key.fixture_id],
        )?;
        tx.commit()?;

        let id = submission_id(seq);
        debug!("Score {} for {} recorded as {}", score, key, id);
        Ok(ScoreSubmission {
            id,
            fixture_id: key.fixture_id.clone(),
            score,
            timestamp,
            submitted_by,
        })
    }

    pub fn scores(&self, key: &FixtureKey) -> Result<Vec<ScoreDoc>> {
        Ok(self.scores_after(key, 0)?.into_iter().map(|(_, doc)| doc).collect())
    }

    /// Score rows with a sequence number above `after`, oldest first
    fn scores_after(&self, key: &FixtureKey, after: i64) -> Result<Vec<(i64, ScoreDoc)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, team_a_goals, team_a_points, team_b_goals, team_b_points,
                    timestamp, submitted_by
             FROM scores
             WHERE region_id=?1 AND competition_id=?2 AND fixture_id=?3 AND seq > ?4
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(
                params![key.region_id, key.competition_id, key.fixture_id, after],
                |row| {
                    let seq: i64 = row.get(0)?;
                    Ok((
                        seq,
                        ScoreDoc {
                            id: submission_id(seq),
                            team_a: Some(TeamScoreDoc {
                                goals: row.get(1)?,
                                points: row.get(2)?,
                            }),
                            team_b: Some(TeamScoreDoc {
                                goals: row.get(3)?,
                                points: row.get(4)?,
                            }),
                            timestamp: row.get(5)?,
                            submitted_by: row.get(6)?,
                        },
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Official results ──────────────────────────────────────────────────────

    /// Record the single official result of a fixture and mark it Completed.
    pub fn record_official_result(
        &self,
        key: &FixtureKey,
        score: MatchScore,
        source: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> Result<OfficialResult> {
        let source = source
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("official")
            .to_string();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !Self::fixture_exists(&tx, key)? {
            bail!("fixture {} not found", key);
        }
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO official_results (
                region_id, competition_id, fixture_id,
                team_a_goals, team_a_points, team_b_goals, team_b_points,
                source, recorded_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                key.region_id,
                key.competition_id,
                key.fixture_id,
                score.team_a.goals,
                score.team_a.points,
                score.team_b.goals,
                score.team_b.points,
                source,
                recorded_at,
            ],
        )?;
        if inserted == 0 {
            bail!("fixture {} already has an official result", key);
        }
        tx.execute(
            "UPDATE fixtures SET status='Completed'
             WHERE region_id=?1 AND competition_id=?2 AND id=?3",
            params![key.region_id, key.competition_id, key.fixture_id],
        )?;
        tx.commit()?;

        info!("Official result {} recorded for {}", score, key);
        Ok(OfficialResult {
            fixture_id: key.fixture_id.clone(),
            score,
            source,
            recorded_at,
        })
    }

    pub fn official_result(&self, key: &FixtureKey) -> Result<Option<OfficialResultDoc>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                "SELECT team_a_goals, team_a_points, team_b_goals, team_b_points,
                        source, recorded_at
                 FROM official_results
                 WHERE region_id=?1 AND competition_id=?2 AND fixture_id=?3",
                params![key.region_id, key.competition_id, key.fixture_id],
                |row| {
                    Ok(OfficialResultDoc {
                        team_a: Some(TeamScoreDoc {
                            goals: row.get(0)?,
                            points: row.get(1)?,
                        }),
                        team_b: Some(TeamScoreDoc {
                            goals: row.get(2)?,
                            points: row.get(3)?,
                        }),
                        source: row.get(4)?,
                        recorded_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    // ── Demo data ─────────────────────────────────────────────────────────────

    /// Load a small Mayo/Sligo data set. Does nothing if the Mayo fixture is
    /// already present.
    pub fn seed_demo(&self) -> Result<()> {
        let f1 = FixtureKey::new("mayo", "senior-football-championship", "F1");
        if Self::fixture_exists(&*self.lock()?, &f1)? {
            debug!("Demo data already present");
            return Ok(());
        }

        self.upsert_region("mayo", "Mayo")?;
        self.upsert_region("sligo", "Sligo")?;
        let competitions = [
            ("mayo", "senior-football-championship", "Senior Football Championship"),
            ("mayo", "junior-b-league", "Junior B League"),
            ("sligo", "intermediate-championship", "Intermediate Championship"),
        ];
        for (region, id, name) in competitions {
            self.upsert_competition(region, id, name)?;
        }

        let fixtures = [
            (
                "mayo",
                "senior-football-championship",
                "F1",
                ("Castlebar Mitchels", "Westport"),
                "MacHale Park",
                "19:30",
            ),
            (
                "mayo",
                "junior-b-league",
                "F2",
                ("Ballaghaderreen", "Kiltimagh"),
                "Ballaghaderreen",
                "TBA",
            ),
            (
                "sligo",
                "intermediate-championship",
                "F3",
                ("Tubbercurry", "Coolera/Strandhill"),
                "Markievicz Park",
                "14:00",
            ),
        ];
        for (region, competition, id, (home, away), venue, time) in fixtures {
            self.insert_fixture(
                region,
                competition,
                &FixtureDoc {
                    id: id.into(),
                    home_team: Some(home.into()),
                    away_team: Some(away.into()),
                    venue: Some(venue.into()),
                    date: Some("2024-05-15".into()),
                    time: Some(time.into()),
                    status: Some(FixtureStatus::Scheduled.to_string()),
                },
            )?;
        }

        let at = |secs: i64| Utc.timestamp_opt(1_715_801_400 + secs, 0).single();
        let opponent = TeamScore::new(0, 1);
        for (goals, points, secs) in [(1, 2, 10), (2, 3, 20)] {
            let ts = at(secs).context("demo timestamp out of range")?;
            self.add_score_submission(
                &f1,
                MatchScore::new(TeamScore::new(goals, points), opponent),
                Some("demo"),
                ts,
            )?;
        }
        info!("Demo data seeded");
        Ok(())
    }

    // ── Async bridge ─────────────────────────────────────────────────────────

    /// Run a blocking query off the async executor
    async fn blocking<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| RepositoryError::unavailable(format!("database task failed: {}", e)))?
            .map_err(RepositoryError::from)
    }
}

/// Zero-padded so that ids compare in insertion order as strings.
fn submission_id(seq: i64) -> String {
    format!("s{:019}", seq)
}

/// Poll one fixture for new score rows and a first official result until
/// the receiving side goes away.
async fn poll_fixture(
    db: Database,
    key: FixtureKey,
    mut last_seq: i64,
    mut has_official: bool,
    tx: mpsc::Sender<Result<ChangeEvent, RepositoryError>>,
) {
    let every = db.watch_poll;
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            _ = tokio::time::sleep(every) => {}
        }

        let poll_key = key.clone();
        let polled = db
            .blocking(move |db| {
                let rows = db.scores_after(&poll_key, last_seq)?;
                let official = if has_official {
                    None
                } else {
                    db.official_result(&poll_key)?
                };
                Ok((rows, official))
            })
            .await;

        let (rows, official) = match polled {
            Ok(found) => found,
            Err(e) => {
                warn!("Watch on {} failed: {}", key, e);
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        let mut events = Vec::with_capacity(rows.len() + 1);
        for (seq, doc) in rows {
            last_seq = seq;
            match doc.parse(&key.fixture_id) {
                Ok(sub) => events.push(ChangeEvent {
                    fixture: key.clone(),
                    kind: ChangeKind::SubmissionAdded,
                    score: Some(sub.score),
                    timestamp: sub.timestamp,
                }),
                Err(e) => warn!("Skipping unreadable score row: {}", e),
            }
        }
        if let Some(doc) = official {
            has_official = true;
            match doc.parse(&key.fixture_id) {
                Ok(result) => events.push(ChangeEvent {
                    fixture: key.clone(),
                    kind: ChangeKind::OfficialResultSet,
                    score: Some(result.score),
                    timestamp: result.recorded_at,
                }),
                Err(e) => warn!("Skipping unreadable official result: {}", e),
            }
        }

        for event in events {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    }
    debug!("Watch on {} closed", key);
}

#[async_trait]
impl Repository for Database {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn list_regions(&self) -> Result<Vec<Region>, RepositoryError> {
        self.blocking(|db| db.regions()).await
    }

    async fn list_competitions(
        &self,
        region_id: &str,
    ) -> Result<Vec<Competition>, RepositoryError> {
        let region_id = region_id.to_string();
        self.blocking(move |db| db.competitions(&region_id)).await
    }

    async fn list_fixtures(
        &self,
        region_id: &str,
        competition_id: &str,
    ) -> Result<Vec<FixtureDoc>, RepositoryError> {
        let (region_id, competition_id) = (region_id.to_string(), competition_id.to_string());
        self.blocking(move |db| db.fixtures(&region_id, &competition_id)).await
    }

    async fn list_scores(&self, fixture: &FixtureKey) -> Result<Vec<ScoreDoc>, RepositoryError> {
        let key = fixture.clone();
        self.blocking(move |db| db.scores(&key)).await
    }

    async fn get_official_result(
        &self,
        fixture: &FixtureKey,
    ) -> Result<Option<OfficialResultDoc>, RepositoryError> {
        let key = fixture.clone();
        self.blocking(move |db| db.official_result(&key)).await
    }

    async fn watch_scores(&self, fixture: &FixtureKey) -> Result<ChangeStream, RepositoryError> {
        let key = fixture.clone();
        let baseline_key = key.clone();
        let (last_seq, has_official) = self
            .blocking(move |db| {
                let last = db
                    .scores_after(&baseline_key, 0)?
                    .last()
                    .map(|(seq, _)| *seq)
                    .unwrap_or(0);
                Ok((last, db.official_result(&baseline_key)?.is_some()))
            })
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(poll_fixture(self.clone(), key, last_seq, has_official, tx));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_fixture_doc(row: &rusqlite::Row) -> rusqlite::Result<FixtureDoc> {
    Ok(FixtureDoc {
        id: row.get(0)?,
        home_team: row.get(1)?,
        away_team: row.get(2)?,
        venue: row.get(3)?,
        date: row.get(4)?,
        time: row.get(5)?,
        status: row.get(6)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS regions (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS competitions (
    region_id TEXT NOT NULL,
    id        TEXT NOT NULL,
    name      TEXT NOT NULL,
    PRIMARY KEY (region_id, id),
    FOREIGN KEY (region_id) REFERENCES regions(id)
);

CREATE TABLE IF NOT EXISTS fixtures (
    region_id      TEXT NOT NULL,
    competition_id TEXT NOT NULL,
    id             TEXT NOT NULL,
    home_team      TEXT,
    away_team      TEXT,
    venue          TEXT,
    date           TEXT,
    time           TEXT,
    status         TEXT,
    PRIMARY KEY (region_id, competition_id, id),
    FOREIGN KEY (region_id, competition_id) REFERENCES competitions(region_id, id)
);

CREATE TABLE IF NOT EXISTS scores (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    region_id      TEXT    NOT NULL,
    competition_id TEXT    NOT NULL,
    fixture_id     TEXT    NOT NULL,
    team_a_goals   INTEGER NOT NULL,
    team_a_points  INTEGER NOT NULL,
    team_b_goals   INTEGER NOT NULL,
    team_b_points  INTEGER NOT NULL,
    timestamp      TEXT    NOT NULL,
    submitted_by   TEXT    NOT NULL DEFAULT 'anonymous',
    FOREIGN KEY (region_id, competition_id, fixture_id)
        REFERENCES fixtures(region_id, competition_id, id)
);

CREATE TABLE IF NOT EXISTS official_results (
    region_id      TEXT    NOT NULL,
    competition_id TEXT    NOT NULL,
    fixture_id     TEXT    NOT NULL,
    team_a_goals   INTEGER NOT NULL,
    team_a_points  INTEGER NOT NULL,
    team_b_goals   INTEGER NOT NULL,
    team_b_points  INTEGER NOT NULL,
    source         TEXT    NOT NULL DEFAULT 'official',
    recorded_at    TEXT    NOT NULL,
    PRIMARY KEY (region_id, competition_id, fixture_id),
    FOREIGN KEY (region_id, competition_id, fixture_id)
        REFERENCES fixtures(region_id, competition_id, id)
);

CREATE INDEX IF NOT EXISTS idx_scores_fixture ON scores(region_id, competition_id, fixture_id, seq);
"#;
