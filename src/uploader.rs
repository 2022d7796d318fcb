//! Drive one measurement's data through the publisher.
//!
//! Summaries go out first, once each. Raw datapoints follow, chunk by chunk
//! in ascending timestamp order, and the checkpoint moves past every chunk
//! whether or not its messages made it. The checkpoint is written out once,
//! at the very end, so a run that dies half way repeats itself next time
//! rather than losing data.
use crate::batch;
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::config::Args;
use crate::datapoint::{self, Collection, DatapointCollection, EventType, RequestMetadata,
                       SummaryCollection, SummarySpec};
use crate::message::{Body, Header};
use crate::publisher::{Ack, PublishError, Publisher};
use chrono::Utc;
use std::collections::BTreeMap;

/// What a `post_data` call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostReport {
    /// Chunks of raw datapoints processed.
    pub chunks: usize,
    /// Raw datapoint messages published.
    pub published: usize,
    /// Messages dropped for exceeding the size limit.
    pub oversized: usize,
    /// Messages lost to encoding or transport failures.
    pub failed: usize,
    /// Summary messages published.
    pub summaries: usize,
    /// Whether the checkpoint was written out.
    pub flushed: bool,
}

impl PostReport {
    fn tally(&mut self, result: &Result<Ack, PublishError>) -> bool {
        match *result {
            Ok(_) => true,
            Err(PublishError::PayloadTooLarge { .. }) => {
                self.oversized += 1;
                false
            }
            Err(_) => {
                self.failed += 1;
                false
            }
        }
    }
}

/// Publishes measurements and keeps their checkpoints.
pub struct Uploader<'a> {
    args: &'a Args,
    publisher: Publisher,
    checkpoints: BTreeMap<String, Checkpoint>,
}

impl<'a> Uploader<'a> {
    /// Create an uploader. Checkpoints are read from `args.tmp_directory`
    /// as measurements are posted.
    pub fn new(args: &'a Args, publisher: Publisher) -> Uploader<'a> {
        Uploader {
            args: args,
            publisher: publisher,
            checkpoints: BTreeMap::new(),
        }
    }

    /// The checkpoint of `checkpoint_key` as the last `post_data` left it.
    pub fn checkpoint(&self, checkpoint_key: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(checkpoint_key)
    }

    /// Publish everything in `collection`. See `post_data`.
    pub fn post_collection(&mut self, collection: &Collection) -> Result<PostReport, CheckpointError> {
        self.post_data(
            &collection.meta,
            &collection.event_types,
            &collection.summaries,
            &collection.summary_data,
            &collection.checkpoint_key,
            &collection.datapoints,
        )
    }

    /// Publish the summaries and raw datapoints of one measurement, then
    /// write the checkpoint to `<tmp-directory>/<checkpoint_key>`.
    ///
    /// The checkpoint is read from the same file before anything is
    /// published, and an unusable key or checkpoint file stops the call
    /// there. Nothing at all happens when `datapoints` holds no datapoint,
    /// not even summary publishing. Publish failures are counted in the report and
    /// otherwise ignored; only a failure to write the checkpoint is an error.
    pub fn post_data(
        &mut self,
        meta: &RequestMetadata,
        event_types: &[EventType],
        summaries: &[SummarySpec],
        summary_data: &SummaryCollection,
        checkpoint_key: &str,
        datapoints: &DatapointCollection,
    ) -> Result<PostReport, CheckpointError> {
        let mut report = PostReport::default();
        let max_count = datapoint::max_count(datapoints);
        if max_count == 0 {
            info!(
                "No new datapoints for {} -> {}, nothing to post",
                meta.input_source, meta.input_destination
            );
            return Ok(report);
        }
        let path = self.args.checkpoint_path(checkpoint_key)?;
        let mut checkpoint = Checkpoint::load(&path)?;
        for event_type in datapoints.keys() {
            if !event_types.is_empty() && !event_types.contains(event_type) {
                debug!("Datapoints of undeclared event type {}", event_type);
            }
        }
        for event_type in batch::barren_event_types(datapoints) {
            trace!("No datapoints for event type {}", event_type);
        }
        for spec in summaries {
            debug!(
                "Summary {} of {} over {}s",
                spec.summary_type, spec.event_type, spec.summary_window
            );
        }

        info!(
            "Posting new metadata and data of {} -> {} to message queue",
            meta.input_source, meta.input_destination
        );
        self.post_summaries(meta, summary_data, &mut report);

        for chunk in batch::chunks(datapoints, self.args.batch_size) {
            trace!("Posting chunk {} of {} datapoints", chunk.index(), chunk.len());
            for (event_type, series) in chunk.iter() {
                if series.is_empty() {
                    continue;
                }
                if !self.args.is_allowed(event_type) {
                    debug!("Event type {} not allowed, not posting", event_type);
                    continue;
                }
                let header = Header::raw(meta, event_type, Utc::now());
                let result = self.publisher.publish(header, &Body::datapoints(meta, series));
                if report.tally(&result) {
                    report.published += 1;
                }
            }
            for (event_type, _) in chunk.iter() {
                if let Some(max) = chunk.max_timestamp(event_type) {
                    checkpoint.advance(event_type, max);
                }
            }
            report.chunks += 1;
        }

        let flushed = checkpoint.flush(&path);
        self.checkpoints.insert(checkpoint_key.to_string(), checkpoint);
        flushed?;
        report.flushed = true;
        info!(
            "Posted {} chunks of {} -> {}: {} published, {} oversized, {} failed",
            report.chunks,
            meta.input_source,
            meta.input_destination,
            report.published,
            report.oversized,
            report.failed
        );
        Ok(report)
    }

    fn post_summaries(
        &mut self,
        meta: &RequestMetadata,
        summary_data: &SummaryCollection,
        report: &mut PostReport,
    ) {
        if summary_data.values().all(datapoint::is_empty_payload) {
            return;
        }
        info!("Posting summaries of {} -> {}", meta.input_source, meta.input_destination);
        for (event_type, payload) in summary_data {
            if datapoint::is_empty_payload(payload) {
                continue;
            }
            let header = Header::summary(meta, event_type, Utc::now());
            let result = self.publisher.publish(header, &Body::summaries(meta, payload));
            if report.tally(&result) {
                report.summaries += 1;
            }
        }
    }
}
