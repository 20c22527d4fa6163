//! In-memory [`Repository`] with fault injection.
//!
//! Holds the whole region → competition → fixture tree in a tokio `RwLock`
//! and fans change events out over a broadcast channel. Individual calls can
//! be made to fail or to stall, and the peak number of concurrent calls is
//! recorded, which is what the engine tests lean on.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::{ChangeStream, Repository};
use crate::db::models::{
    ChangeEvent, ChangeKind, Competition, FixtureDoc, FixtureKey, FixtureStatus, MatchScore,
    OfficialResultDoc, Region, ScoreDoc, TeamScoreDoc,
};
use crate::error::RepositoryError;

/// A repository call that can be targeted by [`InMemoryRepository::fail`]
/// and [`InMemoryRepository::stall`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallSite {
    Regions,
    Competitions(String),
    Fixtures(String, String),
    Scores(FixtureKey),
    Watch(FixtureKey),
}

#[derive(Default)]
struct Inner {
    regions: Vec<Region>,
    competitions: Vec<Competition>,
    /// (region_id, competition_id, doc) in insertion order
    fixtures: Vec<(String, String, FixtureDoc)>,
    scores: HashMap<FixtureKey, Vec<ScoreDoc>>,
    officials: HashMap<FixtureKey, OfficialResultDoc>,
    failing: HashSet<CallSite>,
    stalls: HashMap<CallSite, Duration>,
    next_score_id: u64,
}

#[derive(Clone)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<Result<ChangeEvent, RepositoryError>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `capacity` change events are buffered per watch; a watch that falls
    /// further behind yields an error.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        InMemoryRepository {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn add_region(&self, id: &str, name: &str) {
        self.inner.write().await.regions.push(Region {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub async fn add_competition(&self, region_id: &str, id: &str, name: &str) {
        self.inner.write().await.competitions.push(Competition {
            id: id.to_string(),
            region_id: region_id.to_string(),
            name: name.to_string(),
        });
    }

    pub async fn add_fixture(&self, region_id: &str, competition_id: &str, doc: FixtureDoc) {
        self.inner.write().await.fixtures.push((
            region_id.to_string(),
            competition_id.to_string(),
            doc,
        ));
    }

    /// Record a submission, move the fixture to InProgress, and notify watchers.
    pub async fn add_submission(
        &self,
        key: &FixtureKey,
        score: MatchScore,
        timestamp: DateTime<Utc>,
    ) -> String {
        let id = {
            let mut inner = self.inner.write().await;
            inner.next_score_id += 1;
            let id = format!("s{:019}", inner.next_score_id);
            inner.scores.entry(key.clone()).or_default().push(ScoreDoc {
                id: id.clone(),
                team_a: Some(team_doc(score.team_a.goals, score.team_a.points)),
                team_b: Some(team_doc(score.team_b.goals, score.team_b.points)),
                timestamp: Some(timestamp),
                submitted_by: None,
            });
            if let Some(doc) = inner.fixture_doc_mut(key) {
                let current = doc
                    .status
                    .as_deref()
                    .and_then(|s| s.parse::<FixtureStatus>().ok())
                    .unwrap_or(FixtureStatus::Scheduled);
                if current == FixtureStatus::Scheduled {
                    doc.status = Some(FixtureStatus::InProgress.to_string());
                }
            }
            id
        };
        self.emit(ChangeEvent {
            fixture: key.clone(),
            kind: ChangeKind::SubmissionAdded,
            score: Some(score),
            timestamp,
        });
        id
    }

    /// Store a score document verbatim, without notifying watchers.
    pub async fn add_raw_score(&self, key: &FixtureKey, doc: ScoreDoc) {
        self.inner
            .write()
            .await
            .scores
            .entry(key.clone())
            .or_default()
            .push(doc);
    }

    pub async fn set_official_result(
        &self,
        key: &FixtureKey,
        score: MatchScore,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.officials.contains_key(key) {
                bail!("fixture {} already has an official result", key);
            }
            inner.officials.insert(
                key.clone(),
                OfficialResultDoc {
                    team_a: Some(team_doc(score.team_a.goals, score.team_a.points)),
                    team_b: Some(team_doc(score.team_b.goals, score.team_b.points)),
                    source: Some("official".into()),
                    recorded_at: Some(recorded_at),
                },
            );
            if let Some(doc) = inner.fixture_doc_mut(key) {
                doc.status = Some(FixtureStatus::Completed.to_string());
            }
        }
        self.emit(ChangeEvent {
            fixture: key.clone(),
            kind: ChangeKind::OfficialResultSet,
            score: Some(score),
            timestamp: recorded_at,
        });
        Ok(())
    }

    /// Push a change event to every open watch on its fixture.
    pub fn emit(&self, event: ChangeEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(Ok(event));
    }

    /// Make every open watch yield `err`.
    pub fn break_watches(&self, err: RepositoryError) {
        let _ = self.events.send(Err(err));
    }

    pub async fn fail(&self, site: CallSite) {
        self.inner.write().await.failing.insert(site);
    }

    pub async fn heal(&self, site: &CallSite) {
        self.inner.write().await.failing.remove(site);
    }

    /// Delay every call to `site` by `delay` before answering.
    pub async fn stall(&self, site: CallSite, delay: Duration) {
        self.inner.write().await.stalls.insert(site, delay);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, site: CallSite) -> Result<InFlight, RepositoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));

        let (stall, failing) = {
            let inner = self.inner.read().await;
            (inner.stalls.get(&site).copied(), inner.failing.contains(&site))
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if failing {
            let reason = format!("injected failure at {:?}", site);
            return Err(RepositoryError::unavailable(reason));
        }
        Ok(guard)
    }
}

impl Inner {
    fn fixture_doc_mut(&mut self, key: &FixtureKey) -> Option<&mut FixtureDoc> {
        self.fixtures
            .iter_mut()
            .find(|(r, c, d)| {
                *r == key.region_id && *c == key.competition_id && d.id == key.fixture_id
            })
            .map(|(_, _, d)| d)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn team_doc(goals: u32, points: u32) -> TeamScoreDoc {
    TeamScoreDoc {
        goals: goals as i64,
        points: points as i64,
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn list_regions(&self) -> Result<Vec<Region>, RepositoryError> {
        let _guard = self.enter(CallSite::Regions).await?;
        Ok(self.inner.read().await.regions.clone())
    }

    async fn list_competitions(
        &self,
        region_id: &str,
    ) -> Result<Vec<Competition>, RepositoryError> {
        let _guard = self.enter(CallSite::Competitions(region_id.to_string())).await?;
        let inner = self.inner.read().await;
        Ok(inner
            .competitions
            .iter()
            .filter(|c| c.region_id == region_id)
            .cloned()
            .collect())
    }

    async fn list_fixtures(
        &self,
        region_id: &str,
        competition_id: &str,
    ) -> Result<Vec<FixtureDoc>, RepositoryError> {
        let _guard = self
            .enter(CallSite::Fixtures(region_id.to_string(), competition_id.to_string()))
            .await?;
        let inner = self.inner.read().await;
        Ok(inner
            .fixtures
            .iter()
            .filter(|(r, c, _)| r == region_id && c == competition_id)
            .map(|(_, _, d)| d.clone())
            .collect())
    }

    async fn list_scores(&self, fixture: &FixtureKey) -> Result<Vec<ScoreDoc>, RepositoryError> {
        let _guard = self.enter(CallSite::Scores(fixture.clone())).await?;
        Ok(self
            .inner
            .read()
            .await
            .scores
            .get(fixture)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_official_result(
        &self,
        fixture: &FixtureKey,
    ) -> Result<Option<OfficialResultDoc>, RepositoryError> {
        let _guard = self.enter(CallSite::Scores(fixture.clone())).await?;
        Ok(self.inner.read().await.officials.get(fixture).cloned())
    }

    async fn watch_scores(&self, fixture: &FixtureKey) -> Result<ChangeStream, RepositoryError> {
        let _guard = self.enter(CallSite::Watch(fixture.clone())).await?;
        let rx = self.events.subscribe();
        let key = fixture.clone();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(item) => Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    let reason = format!("watch fell behind by {} event(s)", missed);
                    Some((Err(RepositoryError::unavailable(reason)), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter(move |item| {
            let keep = match item {
                Ok(ev) => ev.fixture == key,
                Err(_) => true,
            };
            futures_util::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}
