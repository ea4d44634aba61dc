//! Audience evaluation service: storage boundary, evaluation facade,
//! population sweeps and fixture loading.

pub mod fixture;
pub mod service;
pub mod storage;
pub mod sweep;

pub use fixture::{Fixture, FixtureSummary};
pub use service::AudienceService;
pub use storage::{EventQuery, EventStore, InMemoryStore};
pub use sweep::SweepReport;
