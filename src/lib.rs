//! Bounded-concurrency job admission with a fair FIFO waiting line.
//!
//! An [AdmissionController] runs at most [limit](AdmissionController::limit) jobs at once, one per
//! [Owner]. Jobs requested while at capacity wait in line and are admitted in request order as
//! slots free up or the limit is raised.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod admin;
mod config;
mod controller;
mod error;
mod limit;

pub use config::{ControllerConfig, JOB_TIMEOUT_ENV, LIMIT_ENV};
pub use controller::{
    Admission, AdmissionController, ControllerState, JobRequest, JobState, Owner, StateChange,
};
pub use error::{BoxError, ConfigError, TimedOut};
pub use limit::Limit;
