//! Audience reporting: per-profile report tables with sorting, pagination
//! and CSV/JSON export.

pub mod export;
pub mod report_builder;

pub use export::{export, export_csv, export_json, ExportFormat, ExportMode};
pub use report_builder::{
    ColumnFormat, ProfileRow, ReportColumnSpec, ReportPlan, ReportResolver, ReportRow, ReportSpec,
    ReportTable, SortOrder, SortSpec,
};
