//! Periodic conversion of the candidate set into an ordered queue.
//!
//! Each cycle reads candidates, publish policies and target state, ranks
//! the candidates and writes the result to the queue:
//!
//! ```text
//!   candidates ──┐
//!   policies  ───┼──► Ranker::schedule ──► Queue::push ──► Queue::retain_pending
//!   targets   ───┤
//!   queue     ───┘
//! ```
//!
//! # Guarantees
//!
//! - Ranking is deterministic: ties break on staleness, then (target, suite).
//! - Staleness grows without bound, so every well-formed candidate is
//!   eventually ranked ahead of any fixed-score candidate.
//! - Keys that are claimed or running are never admitted again until the
//!   run finishes.
//! - Overflow beyond the queue depth is omitted, never discarded.

pub mod cycle;
pub mod ranking;

pub use cycle::{CycleReport, Scheduler, SchedulerError};
pub use ranking::{MalformedCandidate, Ranker, Schedule};
