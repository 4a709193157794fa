//! Encrypted local storage for the Workflow Tracker.
//!
//! Everything lives in one data directory: `workflow.enc` holds the live
//! database sealed under the master password, `auth.json` the password
//! verifier, and `meta.json` plus `dbs/` the imported read-only copies.
//! Open a [`Store`], then [`Store::setup`] or [`Store::unlock`] it to get a
//! [`Session`].

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod merge;
pub mod meta;
pub mod migrate;
pub mod model;
pub mod ops;
pub mod recycle;
pub mod store;
pub mod util;
pub mod validate;

pub use config::{LoadFailurePolicy, StoreConfig};
pub use error::{Conflict, Result, StoreError};
pub use merge::MergeSummary;
pub use meta::{DatabaseEntry, Source};
pub use model::{
    CandidateField, CandidateRow, Card, Column, Day, DayEntry, Document, Todo, WeekRecord,
};
pub use ops::{CardUpdate, NewCard};
pub use recycle::RecyclePolicy;
pub use store::{ImportAction, ImportOutcome, Session, Store};
