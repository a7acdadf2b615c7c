//! Report import: partitioned fetch-and-store tasks and groups of them.
//!
//! - [`backend`] - [`ReportBackend`] and [`BulkParser`] seams plus HTTP/JSON implementations
//! - [`task`] - [`ImportTask`], one center's reports fetched partition by partition
//! - [`group`] - [`ImportGroupTask`], several import tasks reported as one

mod backend;
mod group;
mod task;


pub use backend::{BulkParser, HttpReportBackend, JsonBulkParser, ReportBackend};
pub use group::ImportGroupTask;
pub use task::{ImportTask, ImportTaskParams};
