use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::db::models::{
    Competition, Fixture, FixtureKey, FixtureStatus, MatchScore, OfficialResult, Region,
    ScoreSubmission,
};

/// Best-known score of one fixture and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CurrentScore {
    pub score: MatchScore,
    pub is_official: bool,
    /// Timestamp of the submission or result the score was taken from
    pub as_of: Option<DateTime<Utc>>,
}

/// A fixture merged with its current score, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsolidatedMatch {
    pub fixture_id: String,
    pub region_id: String,
    pub region_name: String,
    pub competition_id: String,
    pub competition_name: String,
    pub home_team: String,
    pub away_team: String,
    pub venue: String,
    pub date: NaiveDate,
    pub time: String,
    pub status: FixtureStatus,
    pub current_score: MatchScore,
    pub is_official: bool,
    pub score_as_of: Option<DateTime<Utc>>,
    /// Number of submissions seen, including ones after the official result
    pub submission_count: usize,
}

impl ConsolidatedMatch {
    pub fn key(&self) -> FixtureKey {
        FixtureKey::new(&self.region_id, &self.competition_id, &self.fixture_id)
    }
}

/// One fixture with every score reported for it.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureDetail {
    #[serde(flatten)]
    pub fixture: ConsolidatedMatch,
    /// Newest first
    pub history: Vec<ScoreSubmission>,
}

/// Merge a fixture's official result with its submissions.
///
/// An official result always wins, however many submissions follow it.
/// Without one, the latest submission by (timestamp, id) is used; with
/// neither the score is zero-zero. Submissions filed against another
/// fixture are ignored.
pub fn consolidate(
    fixture: &Fixture,
    official: Option<&OfficialResult>,
    submissions: &[ScoreSubmission],
) -> CurrentScore {
    if let Some(result) = official.filter(|r| r.fixture_id == fixture.id) {
        return CurrentScore {
            score: result.score,
            is_official: true,
            as_of: Some(result.recorded_at),
        };
    }

    let latest = submissions
        .iter()
        .filter(|s| {
            let own = s.fixture_id == fixture.id;
            if !own {
                debug!(
                    "Ignoring submission {} for fixture {} on {}",
                    s.id, s.fixture_id, fixture.id
                );
            }
            own
        })
        .max_by(|a, b| later(a, b));

    match latest {
        Some(s) => CurrentScore {
            score: s.score,
            is_official: false,
            as_of: Some(s.timestamp),
        },
        None => CurrentScore {
            score: MatchScore::default(),
            is_official: false,
            as_of: None,
        },
    }
}

fn later(a: &ScoreSubmission, b: &ScoreSubmission) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

/// The submissions of `fixture_id`, newest first. Reports of the same score
/// at the same instant are collapsed into the newest of them.
pub fn score_history(fixture_id: &str, submissions: &[ScoreSubmission]) -> Vec<ScoreSubmission> {
    let mut own: Vec<&ScoreSubmission> =
        submissions.iter().filter(|s| s.fixture_id == fixture_id).collect();
    own.sort_by(|a, b| later(b, a));

    let mut seen: HashSet<(DateTime<Utc>, MatchScore)> = HashSet::with_capacity(own.len());
    own.into_iter()
        .filter(|s| seen.insert((s.timestamp, s.score)))
        .cloned()
        .collect()
}

/// Status shown for a fixture. A recorded submission means the game is under
/// way and an official result means it is over, even when the stored status
/// lags behind; the stored status is never lowered.
pub fn effective_status(
    fixture: &Fixture,
    official: Option<&OfficialResult>,
    submissions: &[ScoreSubmission],
) -> FixtureStatus {
    let mut status = fixture.status;
    if submissions.iter().any(|s| s.fixture_id == fixture.id) {
        status = status.max(FixtureStatus::InProgress);
    }
    if official.is_some_and(|r| r.fixture_id == fixture.id) {
        status = FixtureStatus::Completed;
    }
    status
}

pub fn consolidate_match(
    region: &Region,
    competition: &Competition,
    fixture: Fixture,
    official: Option<&OfficialResult>,
    submissions: &[ScoreSubmission],
) -> ConsolidatedMatch {
    let current = consolidate(&fixture, official, submissions);
    let status = effective_status(&fixture, official, submissions);
    let submission_count = submissions.iter().filter(|s| s.fixture_id == fixture.id).count();

    ConsolidatedMatch {
        fixture_id: fixture.id,
        region_id: region.id.clone(),
        region_name: region.name.clone(),
        competition_id: competition.id.clone(),
        competition_name: competition.name.clone(),
        home_team: fixture.home_team,
        away_team: fixture.away_team,
        venue: fixture.venue,
        date: fixture.date,
        time: fixture.time,
        status,
        current_score: current.score,
        is_official: current.is_official,
        score_as_of: current.as_of,
        submission_count,
    }
}
