//! automanager: natural-language file management with validated, reversible plans.
//!
//! An utterance is turned into a [`models::plan::Plan`] by the intent parser,
//! checked by the plan validator against a snapshot of the filesystem, run by
//! the execution engine with rollback on failure, and recorded in the undo
//! ledger. [`Assistant`] ties the pieces together for a front end.

pub mod ai;
pub mod assistant;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod security;
pub mod session;
pub mod utils;
pub mod validation;

pub use assistant::{Assistant, PlanSummary, Proposal, SubmitOutcome};
pub use config::AppConfig;
pub use error::{Error, Result};
