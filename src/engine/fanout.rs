//! Region → competition → fixture traversal.
//!
//! ```text
//!  list_regions ──(fatal on error)──▶ regions, in store order
//!      │ buffered(workers)
//!      ▼
//!  list_competitions(region) ──(error: region branch fails)
//!      │ buffered(workers)
//!      ▼
//!  list_fixtures(region, competition) ──(error: competition branch fails)
//!      │ parse, skip malformed, keep fixtures on the target day
//!      ▼
//!  official result + scores ──▶ consolidate ──▶ ConsolidatedMatch
//! ```
//!
//! Every repository call holds a permit from one semaphore per pass, so at
//! most `workers` calls are in flight however wide the tree is, and each
//! call is bounded by `call_timeout`. `buffered` keeps results in
//! enumeration order.

use chrono::{FixedOffset, Offset, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::consolidate::{consolidate_match, score_history, ConsolidatedMatch, FixtureDetail};
use super::date_matcher::MonthDay;
use super::view::sort_by_date;
use crate::db::models::{
    Competition, Fixture, FixtureKey, OfficialResult, Region, ScoreSubmission,
};
use crate::error::{AggregateError, BranchFailure, BranchId, PartialFailure, RepositoryError};
use crate::repository::Repository;

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    /// Maximum concurrent repository calls per pass
    pub workers: usize,
    pub call_timeout: Duration,
    /// Zone fixture instants are placed in before date matching
    pub zone: FixedOffset,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        FanoutSettings {
            workers: 4,
            call_timeout: Duration::from_secs(5),
            zone: Utc.fix(),
        }
    }
}

/// Result of one pass: a best-effort match list plus the branches that
/// could not be read.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub target: MonthDay,
    /// Regions in repository enumeration order
    pub regions: Vec<Region>,
    /// Competitions whose fixtures were listed successfully
    pub competitions: Vec<Competition>,
    /// Matches in region, then competition, then fixture enumeration order
    pub matches: Vec<ConsolidatedMatch>,
    pub failures: Vec<BranchFailure>,
}

impl Aggregation {
    pub fn partial_failure(&self) -> Option<PartialFailure> {
        if self.failures.is_empty() {
            None
        } else {
            Some(PartialFailure {
                failures: self.failures.clone(),
            })
        }
    }

    pub fn fixture_keys(&self) -> Vec<FixtureKey> {
        self.matches.iter().map(|m| m.key()).collect()
    }
}

/// Every fixture of one region, whatever its date.
#[derive(Debug, Clone, Serialize)]
pub struct RegionFixtures {
    pub region: Region,
    /// By date, then throw-in time
    pub matches: Vec<ConsolidatedMatch>,
    pub partial_failure: Option<PartialFailure>,
}

#[derive(Default)]
struct BranchOutcome {
    competitions: Vec<Competition>,
    matches: Vec<ConsolidatedMatch>,
    failures: Vec<BranchFailure>,
}

impl BranchOutcome {
    fn failed(branch: BranchId, error: RepositoryError) -> Self {
        warn!("Branch {} excluded: {}", branch, error);
        BranchOutcome {
            failures: vec![BranchFailure { branch, error }],
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: BranchOutcome) {
        self.competitions.extend(other.competitions);
        self.matches.extend(other.matches);
        self.failures.extend(other.failures);
    }
}

#[derive(Clone)]
pub struct FanoutAggregator {
    repo: Arc<dyn Repository>,
    settings: FanoutSettings,
}

impl FanoutAggregator {
    pub fn new(repo: Arc<dyn Repository>, settings: FanoutSettings) -> Self {
        let workers = settings.workers.max(1);
        FanoutAggregator {
            repo,
            settings: FanoutSettings { workers, ..settings },
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Collect every fixture on `target` (any year) across all regions.
    ///
    /// Only a failure to list the regions themselves is an error; anything
    /// below that is recorded in [`Aggregation::failures`] and its subtree
    /// left out.
    pub async fn aggregate(&self, target: MonthDay) -> Result<Aggregation, AggregateError> {
        let permits = Semaphore::new(self.settings.workers);

        let regions = self
            .call(&permits, self.repo.list_regions())
            .await
            .map_err(|e| {
                error!("[{}] Listing regions failed: {}", self.repo.name(), e);
                AggregateError::TotalFailure(e)
            })?;

        let outcomes: Vec<BranchOutcome> = stream::iter(regions.clone())
            .map(|region| self.region_branch(&permits, region, Some(target)))
            .buffered(self.settings.workers)
            .collect()
            .await;

        let mut total = BranchOutcome::default();
        for outcome in outcomes {
            total.absorb(outcome);
        }

        let aggregation = Aggregation {
            target,
            regions,
            competitions: total.competitions,
            matches: dedup_by_fixture_id(total.matches),
            failures: total.failures,
        };
        info!(
            "Aggregated {}: {} match(es) across {} region(s), {} failed branch(es)",
            target,
            aggregation.matches.len(),
            aggregation.regions.len(),
            aggregation.failures.len()
        );
        Ok(aggregation)
    }

    /// Re-read only the competitions touched by `affected` and splice them
    /// into `previous`. Falls back to a full pass when `previous` had failed
    /// branches or does not know one of the affected competitions.
    pub async fn refresh(
        &self,
        previous: &Aggregation,
        affected: &[FixtureKey],
    ) -> Result<Aggregation, AggregateError> {
        let wanted: BTreeSet<(String, String)> = affected
            .iter()
            .map(|k| (k.region_id.clone(), k.competition_id.clone()))
            .collect();

        let mut branches: Vec<(Region, Competition)> = Vec::with_capacity(wanted.len());
        for (region_id, competition_id) in &wanted {
            let competition = previous
                .competitions
                .iter()
                .find(|c| &c.region_id == region_id && &c.id == competition_id);
            let region = previous.regions.iter().find(|r| &r.id == region_id);
            match (region, competition) {
                (Some(r), Some(c)) => branches.push((r.clone(), c.clone())),
                _ => {
                    debug!(
                        "Competition {}/{} unknown, running full pass",
                        region_id, competition_id
                    );
                    return self.aggregate(previous.target).await;
                }
            }
        }
        if !previous.failures.is_empty() || branches.is_empty() {
            return self.aggregate(previous.target).await;
        }

        let permits = Semaphore::new(self.settings.workers);
        let target = previous.target;
        let outcomes: Vec<BranchOutcome> = stream::iter(branches)
            .map(|(region, competition)| {
                let permits = &permits;
                async move {
                    self.competition_branch(permits, &region, competition, Some(target))
                        .await
                }
            })
            .buffered(self.settings.workers)
            .collect()
            .await;

        let mut fresh = BranchOutcome::default();
        for outcome in outcomes {
            fresh.absorb(outcome);
        }

        let in_wanted = |region_id: &str, competition_id: &str| {
            wanted.contains(&(region_id.to_string(), competition_id.to_string()))
        };
        let competitions: Vec<Competition> = previous
            .competitions
            .iter()
            .filter(|c| !in_wanted(&c.region_id, &c.id) || fresh.competitions.contains(c))
            .cloned()
            .collect();

        let mut matches: Vec<ConsolidatedMatch> = previous
            .matches
            .iter()
            .filter(|m| !in_wanted(&m.region_id, &m.competition_id))
            .cloned()
            .chain(fresh.matches)
            .collect();
        let position = |m: &ConsolidatedMatch| {
            let region = previous.regions.iter().position(|r| r.id == m.region_id);
            let competition = previous
                .competitions
                .iter()
                .position(|c| c.region_id == m.region_id && c.id == m.competition_id);
            (region, competition)
        };
        matches.sort_by_key(|m| position(m));

        debug!(
            "Refreshed {} competition(s) for {}: {} match(es)",
            wanted.len(),
            target,
            matches.len()
        );
        Ok(Aggregation {
            target,
            regions: previous.regions.clone(),
            competitions,
            matches: dedup_by_fixture_id(matches),
            failures: fresh.failures,
        })
    }

    /// Every fixture of `region_id` on any day, sorted by date. `None` when
    /// the region does not exist.
    pub async fn region_fixtures(
        &self,
        region_id: &str,
    ) -> Result<Option<RegionFixtures>, AggregateError> {
        let permits = Semaphore::new(self.settings.workers);
        let regions = self
            .call(&permits, self.repo.list_regions())
            .await
            .map_err(AggregateError::TotalFailure)?;
        let Some(region) = regions.into_iter().find(|r| r.id == region_id) else {
            return Ok(None);
        };

        let mut outcome = self.region_branch(&permits, region.clone(), None).await;
        sort_by_date(&mut outcome.matches);
        debug!(
            "Listed {} fixture(s) for region {}",
            outcome.matches.len(),
            region.id
        );
        let partial_failure = if outcome.failures.is_empty() {
            None
        } else {
            Some(PartialFailure {
                failures: outcome.failures,
            })
        };
        Ok(Some(RegionFixtures {
            region,
            matches: outcome.matches,
            partial_failure,
        }))
    }

    /// One fixture merged with its scores, plus its score history. `None`
    /// when the region, competition or fixture does not exist or the
    /// fixture record is unreadable.
    pub async fn fixture_detail(
        &self,
        key: &FixtureKey,
    ) -> Result<Option<FixtureDetail>, RepositoryError> {
        let permits = Semaphore::new(self.settings.workers);
        let (regions, competitions, docs) = tokio::try_join!(
            self.call(&permits, self.repo.list_regions()),
            self.call(&permits, self.repo.list_competitions(&key.region_id)),
            self.call(
                &permits,
                self.repo.list_fixtures(&key.region_id, &key.competition_id)
            ),
        )?;

        let region = regions.into_iter().find(|r| r.id == key.region_id);
        let competition = competitions.into_iter().find(|c| c.id == key.competition_id);
        let doc = docs.into_iter().find(|d| d.id == key.fixture_id);
        let (Some(region), Some(competition), Some(doc)) = (region, competition, doc) else {
            debug!("Fixture {} not found", key);
            return Ok(None);
        };
        let fixture = match doc.parse(&region.id, &competition.id, self.settings.zone) {
            Ok(f) => f,
            Err(e) => {
                warn!("Fixture {} unreadable: {}", key, e);
                return Ok(None);
            }
        };

        let (official, submissions) = self.scores_of(&permits, key).await?;
        let history = score_history(&fixture.id, &submissions);
        let fixture = consolidate_match(
            &region,
            &competition,
            fixture,
            official.as_ref(),
            &submissions,
        );
        Ok(Some(FixtureDetail { fixture, history }))
    }

    async fn region_branch(
        &self,
        permits: &Semaphore,
        region: Region,
        target: Option<MonthDay>,
    ) -> BranchOutcome {
        let competitions = match self
            .call(permits, self.repo.list_competitions(&region.id))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                return BranchOutcome::failed(
                    BranchId::Region {
                        region_id: region.id.clone(),
                    },
                    e,
                )
            }
        };

        let outcomes: Vec<BranchOutcome> = stream::iter(competitions)
            .map(|competition| self.competition_branch(permits, &region, competition, target))
            .buffered(self.settings.workers)
            .collect()
            .await;

        let mut total = BranchOutcome::default();
        for outcome in outcomes {
            total.absorb(outcome);
        }
        total
    }

    async fn competition_branch(
        &self,
        permits: &Semaphore,
        region: &Region,
        competition: Competition,
        target: Option<MonthDay>,
    ) -> BranchOutcome {
        let docs = match self
            .call(permits, self.repo.list_fixtures(&region.id, &competition.id))
            .await
        {
            Ok(d) => d,
            Err(e) => {
                return BranchOutcome::failed(
                    BranchId::Competition {
                        region_id: region.id.clone(),
                        competition_id: competition.id.clone(),
                    },
                    e,
                )
            }
        };

        let fixtures: Vec<Fixture> = docs
            .into_iter()
            .filter_map(|doc| match doc.parse(&region.id, &competition.id, self.settings.zone) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("Skipping record in {}/{}: {}", region.id, competition.id, e);
                    None
                }
            })
            .filter(|f| target.map_or(true, |t| t.matches(f.date)))
            .collect();

        let results: Vec<Result<ConsolidatedMatch, BranchFailure>> = stream::iter(fixtures)
            .map(|fixture| self.fixture_unit(permits, region, &competition, fixture))
            .buffered(self.settings.workers)
            .collect()
            .await;

        let mut outcome = BranchOutcome::default();
        for result in results {
            match result {
                Ok(m) => outcome.matches.push(m),
                Err(failure) => {
                    warn!("Branch {} excluded: {}", failure.branch, failure.error);
                    outcome.failures.push(failure);
                }
            }
        }
        outcome.competitions.push(competition);
        outcome
    }

    async fn fixture_unit(
        &self,
        permits: &Semaphore,
        region: &Region,
        competition: &Competition,
        fixture: Fixture,
    ) -> Result<ConsolidatedMatch, BranchFailure> {
        let key = fixture.key();
        let loaded = self.scores_of(permits, &key).await;
        let (official, submissions) = loaded.map_err(|error| BranchFailure {
            branch: BranchId::Fixture {
                region_id: key.region_id.clone(),
                competition_id: key.competition_id.clone(),
                fixture_id: key.fixture_id.clone(),
            },
            error,
        })?;

        Ok(consolidate_match(
            region,
            competition,
            fixture,
            official.as_ref(),
            &submissions,
        ))
    }

    /// Official result and readable submissions of one fixture. Unreadable
    /// records are logged and left out.
    async fn scores_of(
        &self,
        permits: &Semaphore,
        key: &FixtureKey,
    ) -> Result<(Option<OfficialResult>, Vec<ScoreSubmission>), RepositoryError> {
        let (official, scores) = tokio::join!(
            self.call(permits, self.repo.get_official_result(key)),
            self.call(permits, self.repo.list_scores(key)),
        );
        let (official, scores) = (official?, scores?);

        let official = official.and_then(|doc| match doc.parse(&key.fixture_id) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Ignoring official result for {}: {}", key, e);
                None
            }
        });
        let submissions = scores
            .into_iter()
            .filter_map(|doc| match doc.parse(&key.fixture_id) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Skipping score for {}: {}", key, e);
                    None
                }
            })
            .collect();
        Ok((official, submissions))
    }

    /// Run one repository call under a pool permit and the call timeout.
    async fn call<T>(
        &self,
        permits: &Semaphore,
        fut: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, RepositoryError> {
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| RepositoryError::unavailable("worker pool closed"))?;
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::Timeout(self.settings.call_timeout)),
        }
    }
}

/// Keep the first match per fixture id.
fn dedup_by_fixture_id(matches: Vec<ConsolidatedMatch>) -> Vec<ConsolidatedMatch> {
    let mut seen: HashSet<String> = HashSet::with_capacity(matches.len());
    matches
        .into_iter()
        .filter(|m| {
            let novel = seen.insert(m.fixture_id.clone());
            if !novel {
                debug!("Dropping duplicate fixture {} from {}", m.fixture_id, m.competition_id);
            }
            novel
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{FixtureDoc, MatchScore, ScoreDoc, TeamScore};
    use crate::repository::memory::CallSite;
    use crate::repository::InMemoryRepository;
    use chrono::TimeZone;

    fn fixture_doc(id: &str, date: &str, time: &str) -> FixtureDoc {
        FixtureDoc {
            id: id.into(),
            home_team: Some(format!("{} home", id)),
            away_team: Some(format!("{} away", id)),
            venue: Some("Pitch".into()),
            date: Some(date.into()),
            time: Some(time.into()),
            status: None,
        }
    }

    fn score(ag: u32, ap: u32, bg: u32, bp: u32) -> MatchScore {
        MatchScore::new(TeamScore::new(ag, ap), TeamScore::new(bg, bp))
    }

    fn target() -> MonthDay {
        MonthDay::new(5, 15).unwrap()
    }

    fn aggregator(repo: &InMemoryRepository, workers: usize) -> FanoutAggregator {
        FanoutAggregator::new(
            Arc::new(repo.clone()),
            FanoutSettings {
                workers,
                call_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_mayo_example_latest_submission() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition(
            "mayo",
            "senior-football-championship",
            "Senior Football Championship",
        )
        .await;
        repo.add_fixture(
            "mayo",
            "senior-football-championship",
            FixtureDoc {
                id: "F1".into(),
                home_team: Some("Castlebar Mitchels".into()),
                away_team: Some("Westport".into()),
                venue: Some("MacHale Park".into()),
                date: Some("2024-05-15".into()),
                time: Some("19:30".into()),
                status: Some("Scheduled".into()),
            },
        )
        .await;
        let key = FixtureKey::new("mayo", "senior-football-championship", "F1");
        repo.add_submission(&key, score(1, 2, 0, 1), Utc.timestamp_opt(10, 0).unwrap())
            .await;
        repo.add_submission(&key, score(2, 3, 0, 1), Utc.timestamp_opt(20, 0).unwrap())
            .await;

        let agg = aggregator(&repo, 4)
            .aggregate("2031-05-15".parse().unwrap())
            .await
            .unwrap();
        assert!(agg.partial_failure().is_none());
        assert_eq!(agg.matches.len(), 1);
        let m = &agg.matches[0];
        assert_eq!(m.fixture_id, "F1");
        assert_eq!(m.region_name, "Mayo");
        assert_eq!(m.current_score.team_a, TeamScore::new(2, 3));
        assert_eq!(m.current_score.team_b, TeamScore::new(0, 1));
        assert!(!m.is_official);
    }

    #[tokio::test]
    async fn test_other_days_are_filtered_out() {
        let repo = InMemoryRepository::new();
        repo.add_region("sligo", "Sligo").await;
        repo.add_competition("sligo", "ifc", "Intermediate").await;
        repo.add_fixture("sligo", "ifc", fixture_doc("a", "2020-05-15", "14:00")).await;
        repo.add_fixture("sligo", "ifc", fixture_doc("b", "2024-05-16", "14:00")).await;
        repo.add_fixture("sligo", "ifc", fixture_doc("c", "2024-06-15", "14:00")).await;

        let agg = aggregator(&repo, 2).aggregate(target()).await.unwrap();
        let ids: Vec<_> = agg.matches.iter().map(|m| m.fixture_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_competition_is_isolated() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "c1", "Broken Cup").await;
        repo.add_competition("mayo", "c2", "Working Cup").await;
        repo.add_fixture("mayo", "c1", fixture_doc("x", "2024-05-15", "12:00")).await;
        repo.add_fixture("mayo", "c2", fixture_doc("y", "2024-05-15", "12:00")).await;
        repo.fail(CallSite::Fixtures("mayo".into(), "c1".into())).await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        assert_eq!(agg.matches.len(), 1);
        assert_eq!(agg.matches[0].fixture_id, "y");
        let pf = agg.partial_failure().unwrap();
        assert_eq!(
            pf.failures[0].branch,
            BranchId::Competition {
                region_id: "mayo".into(),
                competition_id: "c1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_region_does_not_abort_siblings() {
        let repo = InMemoryRepository::new();
        repo.add_region("a", "A").await;
        repo.add_region("b", "B").await;
        repo.add_competition("a", "c", "Cup").await;
        repo.add_competition("b", "c", "Cup").await;
        repo.add_fixture("a", "c", fixture_doc("fa", "2024-05-15", "12:00")).await;
        repo.add_fixture("b", "c", fixture_doc("fb", "2024-05-15", "12:00")).await;
        repo.fail(CallSite::Competitions("a".into())).await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        assert_eq!(agg.matches.len(), 1);
        assert_eq!(agg.matches[0].region_id, "b");
        assert_eq!(agg.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_first_region_keeps_enumeration_order() {
        let repo = InMemoryRepository::new();
        repo.add_region("a", "A").await;
        repo.add_region("b", "B").await;
        repo.add_competition("a", "c", "Cup").await;
        repo.add_competition("b", "c", "Cup").await;
        repo.add_fixture("a", "c", fixture_doc("fa", "2024-05-15", "12:00")).await;
        repo.add_fixture("b", "c", fixture_doc("fb", "2024-05-15", "12:00")).await;
        // region a answers well after region b
        repo.stall(CallSite::Competitions("a".into()), Duration::from_millis(100))
            .await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        let regions: Vec<_> = agg.matches.iter().map(|m| m.region_id.as_str()).collect();
        assert_eq!(regions, vec!["a", "b"]);
        let listed: Vec<_> = agg.regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(listed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_region_listing_failure_is_total() {
        let repo = InMemoryRepository::new();
        repo.fail(CallSite::Regions).await;
        let err = aggregator(&repo, 4).aggregate(target()).await.unwrap_err();
        assert!(matches!(err, AggregateError::TotalFailure(_)));
    }

    #[tokio::test]
    async fn test_slow_branch_times_out_as_branch_failure() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "slow", "Slow").await;
        repo.add_competition("mayo", "fast", "Fast").await;
        repo.add_fixture("mayo", "fast", fixture_doc("f", "2024-05-15", "12:00")).await;
        repo.stall(
            CallSite::Fixtures("mayo".into(), "slow".into()),
            Duration::from_secs(5),
        )
        .await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        assert_eq!(agg.matches.len(), 1);
        assert_eq!(agg.failures.len(), 1);
        assert!(matches!(agg.failures[0].error, RepositoryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let repo = InMemoryRepository::new();
        for r in 0..6 {
            let region = format!("r{}", r);
            repo.add_region(&region, &region).await;
            for c in 0..4 {
                let comp = format!("c{}", c);
                repo.add_competition(&region, &comp, &comp).await;
                let site = CallSite::Fixtures(region.clone(), comp.clone());
                repo.stall(site, Duration::from_millis(20)).await;
                let id = format!("{}{}", region, comp);
                repo.add_fixture(&region, &comp, fixture_doc(&id, "2024-05-15", "12:00"))
                    .await;
            }
        }

        let agg = aggregator(&repo, 3).aggregate(target()).await.unwrap();
        assert_eq!(agg.matches.len(), 24);
        assert!(repo.peak_in_flight() <= 3, "peak was {}", repo.peak_in_flight());
        assert!(repo.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_duplicate_fixture_ids_kept_once() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "league", "League").await;
        repo.add_competition("mayo", "cup", "Cup").await;
        repo.add_fixture("mayo", "league", fixture_doc("shared", "2024-05-15", "12:00")).await;
        repo.add_fixture("mayo", "cup", fixture_doc("shared", "2024-05-15", "12:00")).await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        assert_eq!(agg.matches.len(), 1);
        assert_eq!(agg.matches[0].competition_id, "league");
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "sfc", "SFC").await;
        repo.add_fixture("mayo", "sfc", fixture_doc("good", "2024-05-15", "12:00")).await;
        let mut bad = fixture_doc("bad", "not-a-date", "12:00");
        bad.home_team = None;
        repo.add_fixture("mayo", "sfc", bad).await;
        let key = FixtureKey::new("mayo", "sfc", "good");
        repo.add_raw_score(
            &key,
            ScoreDoc {
                id: "broken".into(),
                team_a: None,
                team_b: None,
                timestamp: None,
                submitted_by: None,
            },
        )
        .await;
        repo.add_submission(&key, score(0, 3, 0, 2), Utc.timestamp_opt(50, 0).unwrap())
            .await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        assert!(agg.failures.is_empty());
        assert_eq!(agg.matches.len(), 1);
        assert_eq!(agg.matches[0].current_score, score(0, 3, 0, 2));
        assert_eq!(agg.matches[0].submission_count, 1);
    }

    #[tokio::test]
    async fn test_official_result_marks_match_official() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "sfc", "SFC").await;
        repo.add_fixture("mayo", "sfc", fixture_doc("f", "2023-05-15", "FT")).await;
        let key = FixtureKey::new("mayo", "sfc", "f");
        repo.set_official_result(&key, score(1, 10, 0, 9), Utc.timestamp_opt(100, 0).unwrap())
            .await
            .unwrap();
        repo.add_submission(&key, score(4, 4, 4, 4), Utc.timestamp_opt(500, 0).unwrap())
            .await;

        let agg = aggregator(&repo, 4).aggregate(target()).await.unwrap();
        let m = &agg.matches[0];
        assert!(m.is_official);
        assert_eq!(m.current_score, score(1, 10, 0, 9));
        assert_eq!(m.status, crate::db::models::FixtureStatus::Completed);
    }

    #[tokio::test]
    async fn test_refresh_rereads_only_affected_competition() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "c1", "One").await;
        repo.add_competition("mayo", "c2", "Two").await;
        repo.add_fixture("mayo", "c1", fixture_doc("f1", "2024-05-15", "12:00")).await;
        repo.add_fixture("mayo", "c2", fixture_doc("f2", "2024-05-15", "12:00")).await;
        let agg = aggregator(&repo, 4);
        let first = agg.aggregate(target()).await.unwrap();

        let key = FixtureKey::new("mayo", "c2", "f2");
        repo.add_submission(&key, score(0, 1, 0, 0), Utc.timestamp_opt(5, 0).unwrap())
            .await;
        // a write to c1 that the refresh must not pick up
        repo.add_submission(
            &FixtureKey::new("mayo", "c1", "f1"),
            score(3, 0, 0, 0),
            Utc.timestamp_opt(6, 0).unwrap(),
        )
        .await;

        let calls_before = repo.call_count();
        let refreshed = agg.refresh(&first, &[key]).await.unwrap();
        // one list_fixtures plus official + scores for f2
        assert_eq!(repo.call_count() - calls_before, 3);
        let ids: Vec<_> = refreshed.matches.iter().map(|m| m.fixture_id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert_eq!(refreshed.matches[0].current_score, MatchScore::default());
        assert_eq!(refreshed.matches[1].current_score, score(0, 1, 0, 0));
    }

    #[tokio::test]
    async fn test_refresh_after_failures_runs_full_pass() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "c1", "One").await;
        repo.add_fixture("mayo", "c1", fixture_doc("f1", "2024-05-15", "12:00")).await;
        repo.fail(CallSite::Fixtures("mayo".into(), "c1".into())).await;
        let agg = aggregator(&repo, 4);
        let first = agg.aggregate(target()).await.unwrap();
        assert!(first.matches.is_empty());

        repo.heal(&CallSite::Fixtures("mayo".into(), "c1".into())).await;
        let refreshed = agg
            .refresh(&first, &[FixtureKey::new("mayo", "c1", "f1")])
            .await
            .unwrap();
        assert_eq!(refreshed.matches.len(), 1);
        assert!(refreshed.failures.is_empty());
    }

    #[tokio::test]
    async fn test_region_fixtures_span_all_days_sorted_by_date() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_region("sligo", "Sligo").await;
        repo.add_competition("mayo", "league", "League").await;
        repo.add_competition("mayo", "cup", "Cup").await;
        repo.add_fixture("mayo", "league", fixture_doc("aug", "2024-08-02", "18:00")).await;
        repo.add_fixture("mayo", "league", fixture_doc("may-late", "2024-05-15", "19:30"))
            .await;
        repo.add_fixture("mayo", "cup", fixture_doc("may-early", "2024-05-15", "11:00"))
            .await;
        repo.add_fixture("mayo", "cup", fixture_doc("march", "2024-03-01", "TBA")).await;
        repo.add_competition("sligo", "c", "Other").await;
        repo.add_fixture("sligo", "c", fixture_doc("elsewhere", "2024-05-15", "12:00"))
            .await;

        let listed = aggregator(&repo, 2)
            .region_fixtures("mayo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listed.region.name, "Mayo");
        assert!(listed.partial_failure.is_none());
        let ids: Vec<_> = listed.matches.iter().map(|m| m.fixture_id.as_str()).collect();
        assert_eq!(ids, vec!["march", "may-early", "may-late", "aug"]);
    }

    #[tokio::test]
    async fn test_region_fixtures_unknown_region_and_failed_competition() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "ok", "Ok").await;
        repo.add_competition("mayo", "broken", "Broken").await;
        repo.add_fixture("mayo", "ok", fixture_doc("f", "2024-01-01", "12:00")).await;
        repo.fail(CallSite::Fixtures("mayo".into(), "broken".into())).await;
        let agg = aggregator(&repo, 4);

        assert!(agg.region_fixtures("kerry").await.unwrap().is_none());
        let listed = agg.region_fixtures("mayo").await.unwrap().unwrap();
        assert_eq!(listed.matches.len(), 1);
        assert_eq!(listed.partial_failure.unwrap().failures.len(), 1);

        repo.fail(CallSite::Regions).await;
        assert!(matches!(
            agg.region_fixtures("mayo").await,
            Err(AggregateError::TotalFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_fixture_detail_carries_history() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "sfc", "SFC").await;
        repo.add_fixture("mayo", "sfc", fixture_doc("f", "2024-05-15", "19:30")).await;
        let key = FixtureKey::new("mayo", "sfc", "f");
        let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        repo.add_submission(&key, score(0, 1, 0, 0), at(10)).await;
        repo.add_submission(&key, score(0, 2, 0, 1), at(20)).await;
        repo.add_submission(&key, score(0, 2, 0, 1), at(20)).await;

        let detail = aggregator(&repo, 4)
            .fixture_detail(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.fixture.current_score, score(0, 2, 0, 1));
        assert_eq!(detail.fixture.submission_count, 3);
        let history: Vec<_> = detail.history.iter().map(|s| s.score).collect();
        assert_eq!(history, vec![score(0, 2, 0, 1), score(0, 1, 0, 0)]);
    }

    #[tokio::test]
    async fn test_fixture_detail_missing_and_failing() {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_competition("mayo", "sfc", "SFC").await;
        repo.add_fixture("mayo", "sfc", fixture_doc("f", "2024-05-15", "19:30")).await;
        let agg = aggregator(&repo, 4);

        let missing = FixtureKey::new("mayo", "sfc", "nope");
        assert!(agg.fixture_detail(&missing).await.unwrap().is_none());
        let wrong_region = FixtureKey::new("kerry", "sfc", "f");
        assert!(agg.fixture_detail(&wrong_region).await.unwrap().is_none());

        let key = FixtureKey::new("mayo", "sfc", "f");
        repo.fail(CallSite::Scores(key.clone())).await;
        assert!(agg.fixture_detail(&key).await.is_err());
    }
}
