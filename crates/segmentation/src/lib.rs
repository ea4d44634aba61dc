//! Audience segmentation engine: schema registry, constraint dispatch,
//! event aggregation, formula fields and segment membership.

pub mod aggregate;
pub mod builder;
pub mod computed;
pub mod engine;
pub mod formula;
pub mod predicates;
pub mod registry;
pub mod schema;
pub mod timeframe;
pub mod wire;

pub use aggregate::{AggregateOutcome, EventAggregator, ScanLimits};
pub use builder::SegmentBuilder;
pub use computed::{ComputedResolver, ComputedValue};
pub use engine::{MembershipOutcome, SegmentEvaluator};
pub use predicates::Constraint;
pub use registry::{SchemaRegistry, SchemaSnapshot};
pub use schema::{AggregateConfig, ComputedSchema, SegmentDefinition};
pub use timeframe::{TimeWindow, Timeframe};
