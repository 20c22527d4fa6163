pub mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::db::models::{
    ChangeEvent, Competition, FixtureDoc, FixtureKey, OfficialResultDoc, Region, ScoreDoc,
};
use crate::error::RepositoryError;

/// Stream of change notifications for one fixture. It only ends when the
/// underlying store goes away; dropping it closes the watch.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RepositoryError>>;

/// Narrow read interface over the hierarchical fixture store.
///
/// Implementations return raw documents; the engine parses them and skips
/// the ones that are malformed. All methods must tolerate concurrent calls
/// from several aggregations and subscriptions at once.
#[async_trait]
pub trait Repository: Send + Sync {
    /// All regions, in the store's enumeration order.
    async fn list_regions(&self) -> Result<Vec<Region>, RepositoryError>;

    async fn list_competitions(&self, region_id: &str) -> Result<Vec<Competition>, RepositoryError>;

    async fn list_fixtures(
        &self,
        region_id: &str,
        competition_id: &str,
    ) -> Result<Vec<FixtureDoc>, RepositoryError>;

    /// Every score submission recorded for a fixture, in any order.
    async fn list_scores(&self, fixture: &FixtureKey) -> Result<Vec<ScoreDoc>, RepositoryError>;

    async fn get_official_result(
        &self,
        fixture: &FixtureKey,
    ) -> Result<Option<OfficialResultDoc>, RepositoryError>;

    /// Emit a [`ChangeEvent`] for every submission added to, and the official
    /// result recorded for, this fixture from now on.
    async fn watch_scores(&self, fixture: &FixtureKey) -> Result<ChangeStream, RepositoryError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}
