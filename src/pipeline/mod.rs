//! The report pipeline built on the broker layer: request boundary, report
//! worker, notification router, dead-letter replay and the process roles
//! that wire them to configuration.

pub mod messages;
pub mod replay;
pub mod requests;
pub mod router;
pub mod runtime;
pub mod worker;

pub use messages::{NotificationEvent, ReportJob};
pub use replay::{ReplayOptions, ReplaySummary, replay_dead_letters};
pub use requests::ReportRequests;
pub use router::NotificationRouter;
pub use runtime::Runtime;
pub use worker::ReportWorker;

#[cfg(test)]
mod tests;
