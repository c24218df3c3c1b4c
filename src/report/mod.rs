//! Report generation: render the artifact, upload it, hand back a link.

pub mod content;
pub mod producer;

pub use content::{CsvReport, ReportContent};
pub use producer::{DEFAULT_PRESIGN_TTL, REPORT_CONTENT_TYPE, ReportProducer};
