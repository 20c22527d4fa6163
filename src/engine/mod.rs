pub mod consolidate;
pub mod date_matcher;
pub mod dedup;
pub mod fanout;
pub mod subscription;
pub mod view;

pub use consolidate::{consolidate, score_history, ConsolidatedMatch, CurrentScore, FixtureDetail};
pub use date_matcher::MonthDay;
pub use dedup::DedupCache;
pub use fanout::{Aggregation, FanoutAggregator, FanoutSettings, RegionFixtures};
pub use subscription::{
    SubscriptionHandle, SubscriptionSettings, SubscriptionState, ViewUpdate,
};
pub use view::{organize, sort_by_date, GroupedView, RegionGroup};

use std::sync::Arc;
use tracing::info;

use crate::db::models::FixtureKey;
use crate::error::{AggregateError, PartialFailure, RepositoryError, SubscriptionError};
use crate::repository::Repository;

#[derive(Debug, Clone, Default)]
pub struct TrackerSettings {
    pub fanout: FanoutSettings,
    pub subscription: SubscriptionSettings,
}

/// Entry point tying the engine together over one repository.
#[derive(Clone)]
pub struct Tracker {
    aggregator: FanoutAggregator,
    settings: TrackerSettings,
}

impl Tracker {
    pub fn new(repo: Arc<dyn Repository>, settings: TrackerSettings) -> Self {
        info!(
            "Tracker over {} ({} workers, {:?} call timeout)",
            repo.name(),
            settings.fanout.workers,
            settings.fanout.call_timeout
        );
        Tracker {
            aggregator: FanoutAggregator::new(repo, settings.fanout.clone()),
            settings,
        }
    }

    /// One full pass for `target`, grouped and sorted.
    pub async fn aggregate_once(
        &self,
        target: MonthDay,
    ) -> Result<(GroupedView, Option<PartialFailure>), AggregateError> {
        let aggregation = self.aggregator.aggregate(target).await?;
        Ok((organize(&aggregation.matches), aggregation.partial_failure()))
    }

    /// A single fixture with its score history.
    pub async fn fixture_detail(
        &self,
        key: &FixtureKey,
    ) -> Result<Option<FixtureDetail>, RepositoryError> {
        self.aggregator.fixture_detail(key).await
    }

    /// Every fixture of one region, in date order.
    pub async fn region_fixtures(
        &self,
        region_id: &str,
    ) -> Result<Option<RegionFixtures>, AggregateError> {
        self.aggregator.region_fixtures(region_id).await
    }

    /// Follow `target` live. Must be called from within a tokio runtime.
    pub fn subscribe<U, E>(
        &self,
        target: MonthDay,
        on_update: U,
        on_error: E,
    ) -> SubscriptionHandle
    where
        U: Fn(ViewUpdate) + Send + Sync + 'static,
        E: Fn(SubscriptionError) + Send + Sync + 'static,
    {
        subscription::spawn_subscription(
            self.aggregator.clone(),
            self.settings.subscription.clone(),
            target,
            Arc::new(on_update),
            Arc::new(on_error),
        )
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        self.aggregator.repository()
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FixtureDoc;
    use crate::repository::memory::CallSite;
    use crate::repository::InMemoryRepository;

    async fn repo() -> InMemoryRepository {
        let repo = InMemoryRepository::new();
        repo.add_region("mayo", "Mayo").await;
        repo.add_region("sligo", "Sligo").await;
        repo.add_competition("mayo", "sfc", "Senior Football Championship").await;
        repo.add_competition("sligo", "jfc", "Junior Football Championship").await;
        for (region, comp, id, date, time) in [
            ("mayo", "sfc", "m1", "2024-05-15", "19:30"),
            ("mayo", "sfc", "m2", "2023-05-15", "14:00"),
            ("sligo", "jfc", "s1", "2024-05-15", "TBA"),
            ("sligo", "jfc", "s2", "2024-05-16", "12:00"),
        ] {
            repo.add_fixture(
                region,
                comp,
                FixtureDoc {
                    id: id.into(),
                    home_team: Some("Home".into()),
                    away_team: Some("Away".into()),
                    date: Some(date.into()),
                    time: Some(time.into()),
                    ..Default::default()
                },
            )
            .await;
        }
        repo
    }

    #[tokio::test]
    async fn test_aggregate_once_groups_by_region() {
        let repo = repo().await;
        let tracker = Tracker::new(Arc::new(repo), TrackerSettings::default());
        let (view, failure) = tracker
            .aggregate_once("05-15".parse().unwrap())
            .await
            .unwrap();
        assert!(failure.is_none());
        assert_eq!(view.regions.len(), 2);
        let mayo = view.region("mayo").unwrap();
        let ids: Vec<_> = mayo.matches.iter().map(|m| m.fixture_id.as_str()).collect();
        // other years still count for the same month and day
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(view.region("sligo").unwrap().matches.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_once_total_failure() {
        let repo = repo().await;
        repo.fail(CallSite::Regions).await;
        let tracker = Tracker::new(Arc::new(repo), TrackerSettings::default());
        let err = tracker
            .aggregate_once("05-15".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::TotalFailure(_)));
    }

    #[tokio::test]
    async fn test_region_fixtures_and_detail() {
        let repo = repo().await;
        let tracker = Tracker::new(Arc::new(repo), TrackerSettings::default());
        let sligo = tracker.region_fixtures("sligo").await.unwrap().unwrap();
        let ids: Vec<_> = sligo.matches.iter().map(|m| m.fixture_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let detail = tracker
            .fixture_detail(&FixtureKey::new("mayo", "sfc", "m2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.fixture.region_name, "Mayo");
        assert!(detail.history.is_empty());
    }
}
