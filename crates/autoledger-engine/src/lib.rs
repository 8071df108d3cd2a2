#![forbid(unsafe_code)]
//! Event loop, posting gate and correction learner on top of a
//! [`autoledger_store_core::LedgerStore`].

pub mod config;
pub mod learner;
pub mod orchestrator;
pub mod validator;

pub use config::{EngineConfig, FailurePolicy};
pub use learner::{Learner, LearningOutcome, LearningReport, PatternChange};
pub use orchestrator::{BatchSummary, BookingDecision, Dispatcher, Orchestrator, RunSummary};
pub use validator::{BookingValidator, PostingError};
