//! perfsonar-uploader ships perfSONAR measurements to a message broker. Raw
//! datapoints are published in size-bounded chunks, summaries are published
//! as-is, and per-event-type checkpoints are persisted so that the next run
//! picks up where this one left off.
//!
//! The pipeline, leaf to root:
//!
//!  * `batch` splits a datapoint collection into timestamp-ordered chunks.
//!  * `publisher` refuses oversized messages and hands the rest to a
//!    `transport`, one channel per publish.
//!  * `checkpoint` tracks the next timestamp to request per event type.
//!  * `uploader` drives the above for one collector hand-off.
//!
//! Delivery is at-least-once across runs and best-effort within a run: a
//! failed publish is logged and counted, never retried.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]
extern crate byteorder;
extern crate chrono;
extern crate clap;
#[macro_use]
extern crate serde_json;
extern crate toml;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod datapoint;
pub mod message;
pub mod publisher;
pub mod transport;
pub mod uploader;
