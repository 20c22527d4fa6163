use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MalformedRecord, RecordKind};

/// Top-level grouping (a county) owning competitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
}

/// A named tournament within a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: String,
    /// Back-reference to the owning region
    pub region_id: String,
    pub name: String,
}

/// Full path of a fixture in the region → competition → fixture hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixtureKey {
    pub region_id: String,
    pub competition_id: String,
    pub fixture_id: String,
}

impl FixtureKey {
    pub fn new(
        region_id: impl Into<String>,
        competition_id: impl Into<String>,
        fixture_id: impl Into<String>,
    ) -> Self {
        FixtureKey {
            region_id: region_id.into(),
            competition_id: competition_id.into(),
            fixture_id: fixture_id.into(),
        }
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region_id, self.competition_id, self.fixture_id)
    }
}

/// Lifecycle of a fixture. Ordering follows the lifecycle, so the
/// later of two statuses is their `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FixtureStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl FixtureStatus {
    pub fn rank(self) -> u8 {
        match self {
            FixtureStatus::Scheduled => 0,
            FixtureStatus::InProgress => 1,
            FixtureStatus::Completed => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FixtureStatus::Scheduled => "Scheduled",
            FixtureStatus::InProgress => "InProgress",
            FixtureStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for FixtureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixtureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '_', '-'], "").as_str() {
            "scheduled" | "ns" | "notstarted" => Ok(FixtureStatus::Scheduled),
            "inprogress" | "live" => Ok(FixtureStatus::InProgress),
            "completed" | "ft" | "finished" => Ok(FixtureStatus::Completed),
            other => Err(format!("unknown fixture status '{}'", other)),
        }
    }
}

/// One scheduled match between two teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: String,
    pub region_id: String,
    pub competition_id: String,
    pub home_team: String,
    pub away_team: String,
    pub venue: String,
    /// Scheduled day in the tracker's fixed zone
    pub date: NaiveDate,
    /// Throw-in time as entered, e.g. "19:30", "TBA", "FT"
    pub time: String,
    pub status: FixtureStatus,
}

impl Fixture {
    pub fn key(&self) -> FixtureKey {
        FixtureKey::new(&self.region_id, &self.competition_id, &self.id)
    }
}

/// Goals and points for one team. A goal is worth three points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamScore {
    pub goals: u32,
    pub points: u32,
}

impl TeamScore {
    pub fn new(goals: u32, points: u32) -> Self {
        TeamScore { goals, points }
    }

    pub fn total(&self) -> u32 {
        self.goals * 3 + self.points
    }
}

impl fmt::Display for TeamScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.goals, self.points)
    }
}

/// Scoreline of a match; team A is the home side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchScore {
    pub team_a: TeamScore,
    pub team_b: TeamScore,
}

impl MatchScore {
    pub fn new(team_a: TeamScore, team_b: TeamScore) -> Self {
        MatchScore { team_a, team_b }
    }
}

impl fmt::Display for MatchScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.team_a, self.team_b)
    }
}

/// A single community-submitted, non-authoritative score report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSubmission {
    pub id: String,
    pub fixture_id: String,
    pub score: MatchScore,
    pub timestamp: DateTime<Utc>,
    pub submitted_by: String,
}

/// The authoritative final score of a fixture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficialResult {
    pub fixture_id: String,
    pub score: MatchScore,
    /// Where the result came from, e.g. "hoganstand"
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SubmissionAdded,
    OfficialResultSet,
}

/// Change notification emitted by a repository watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub fixture: FixtureKey,
    pub kind: ChangeKind,
    pub score: Option<MatchScore>,
    pub timestamp: DateTime<Utc>,
}

// ── Raw documents ────────────────────────────────────────────────────────────

/// Fixture as stored. Every field the store might omit is optional; parsing
/// into [`Fixture`] decides what is recoverable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDoc {
    pub id: String,
    #[serde(default, alias = "homeTeam")]
    pub home_team: Option<String>,
    #[serde(default, alias = "awayTeam")]
    pub away_team: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    /// "YYYY-MM-DD" or an RFC 3339 instant
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl FixtureDoc {
    pub fn parse(
        self,
        region_id: &str,
        competition_id: &str,
        zone: FixedOffset,
    ) -> Result<Fixture, MalformedRecord> {
        let malformed = |reason: &str| MalformedRecord::new(RecordKind::Fixture, &self.id, reason);

        let home_team =
            non_empty(self.home_team.as_deref()).ok_or_else(|| malformed("missing home team"))?;
        let away_team =
            non_empty(self.away_team.as_deref()).ok_or_else(|| malformed("missing away team"))?;
        let raw_date = self.date.as_deref().ok_or_else(|| malformed("missing date"))?;
        let date = parse_fixture_date(raw_date, zone)
            .ok_or_else(|| malformed(&format!("unparseable date '{}'", raw_date)))?;
        let status = match non_empty(self.status.as_deref()) {
            Some(s) => s.parse().map_err(|e: String| malformed(&e))?,
            None => FixtureStatus::Scheduled,
        };

        Ok(Fixture {
            region_id: region_id.to_string(),
            competition_id: competition_id.to_string(),
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            venue: self.venue.clone().unwrap_or_default(),
            date,
            time: non_empty(self.time.as_deref()).unwrap_or("TBA").to_string(),
            status,
            id: self.id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TeamScoreDoc {
    pub goals: i64,
    pub points: i64,
}

impl TeamScoreDoc {
    fn parse(&self) -> Result<TeamScore, String> {
        let goals = u32::try_from(self.goals).map_err(|_| format!("invalid goals {}", self.goals))?;
        let points =
            u32::try_from(self.points).map_err(|_| format!("invalid points {}", self.points))?;
        Ok(TeamScore { goals, points })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreDoc {
    pub id: String,
    #[serde(default, alias = "teamA")]
    pub team_a: Option<TeamScoreDoc>,
    #[serde(default, alias = "teamB")]
    pub team_b: Option<TeamScoreDoc>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "submittedBy")]
    pub submitted_by: Option<String>,
}

impl ScoreDoc {
    pub fn parse(self, fixture_id: &str) -> Result<ScoreSubmission, MalformedRecord> {
        let malformed = |reason: String| MalformedRecord::new(RecordKind::Score, &self.id, reason);

        let score =
            parse_match_score(self.team_a.as_ref(), self.team_b.as_ref()).map_err(malformed)?;
        let timestamp = self.timestamp.ok_or_else(|| malformed("missing timestamp".into()))?;

        Ok(ScoreSubmission {
            fixture_id: fixture_id.to_string(),
            score,
            timestamp,
            submitted_by: non_empty(self.submitted_by.as_deref())
                .unwrap_or("anonymous")
                .to_string(),
            id: self.id,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfficialResultDoc {
    #[serde(default, alias = "homeScore")]
    pub team_a: Option<TeamScoreDoc>,
    #[serde(default, alias = "awayScore")]
    pub team_b: Option<TeamScoreDoc>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl OfficialResultDoc {
    pub fn parse(self, fixture_id: &str) -> Result<OfficialResult, MalformedRecord> {
        let malformed =
            |reason: String| MalformedRecord::new(RecordKind::OfficialResult, fixture_id, reason);

        let score =
            parse_match_score(self.team_a.as_ref(), self.team_b.as_ref()).map_err(malformed)?;
        let recorded_at = self
            .recorded_at
            .ok_or_else(|| malformed("missing timestamp".into()))?;

        Ok(OfficialResult {
            fixture_id: fixture_id.to_string(),
            score,
            source: non_empty(self.source.as_deref()).unwrap_or("official").to_string(),
            recorded_at,
        })
    }
}

fn parse_match_score(
    team_a: Option<&TeamScoreDoc>,
    team_b: Option<&TeamScoreDoc>,
) -> Result<MatchScore, String> {
    let team_a = team_a.ok_or("missing team A score")?.parse()?;
    let team_b = team_b.ok_or("missing team B score")?.parse()?;
    Ok(MatchScore { team_a, team_b })
}

/// Fixture dates arrive either as plain calendar days or as instants; an
/// instant is placed on the calendar of `zone`.
pub fn parse_fixture_date(raw: &str, zone: FixedOffset) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|instant| instant.with_timezone(&zone).date_naive())
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
