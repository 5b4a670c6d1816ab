//! SM-2 spaced repetition scheduling for flashcards, with a small SQLite
//! card store around it.
//!
//! The scheduler in [`scheduler`] is pure and has no dependency on the store;
//! [`db::Database`] feeds it persisted card state and writes the result back.

pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;

pub use error::{Error, Result};
pub use scheduler::{compute_next_state, compute_next_state_at, CardMemoryState, Quality, ScheduleError};
