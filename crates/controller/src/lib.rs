//! Tandem controller: work queue, reconcile loop and the secret annotator.

#![forbid(unsafe_code)]

mod annotator;
mod client;
mod config;
mod controller;
mod poll;
mod queue;

pub use annotator::{Annotator, AnnotatorStats, SECRET_FOUND_KEY, SECRET_FOUND_VALUE};
pub use client::Client;
pub use config::ControllerConfig;
pub use controller::{Action, Controller, Reconciler};
pub use poll::{poll_until, PollError};
pub use queue::WorkQueue;
