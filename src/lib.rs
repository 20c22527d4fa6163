//! Live club-fixture tracking.
//!
//! [`engine::Tracker`] fans out over a [`repository::Repository`] to collect
//! the fixtures played on a given month and day in any year, consolidates
//! community score submissions against official results, and keeps a
//! grouped, sorted view up to date through live subscriptions.

pub mod config;
pub mod dashboard;
pub mod db;
pub mod engine;
pub mod error;
pub mod repository;
