//! Shared plumbing used across the pipeline: the error taxonomy, logging
//! initialisation and trace-context propagation through message headers.

pub mod error;
pub mod logging;
pub mod propagation;

#[cfg(test)]
mod tests;
