//! Remote-write wire format
//!
//! This module turns resource records into "info metric" time series and
//! ships them to the ingestion endpoint:
//! - One `<prefix>_<kind>_labels` series per record, plus `<prefix>_<kind>_annotations`
//!   when annotations are tracked
//! - Protobuf `WriteRequest` bodies, snappy block-compressed
//! - An HTTP client with per-attempt timeouts and exponential backoff

mod client;
pub mod proto;

pub use client::{RemoteWriteClient, RetryPolicy};
pub use proto::{Label, Sample, TimeSeries, WriteRequest};

use crate::error::PushError;
use crate::models::{LabelMap, ResourceRecord};
use prost::Message;
use std::collections::BTreeMap;

/// Reserved label carrying the series name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Prefix applied to every label or annotation key
pub const LABEL_KEY_PREFIX: &str = "label_";

pub const LABELS_SUFFIX: &str = "labels";
pub const ANNOTATIONS_SUFFIX: &str = "annotations";

/// `<prefix>_<kind>_<suffix>`
pub fn series_name(prefix: &str, record: &ResourceRecord, suffix: &str) -> String {
    format!("{}_{}_{}", prefix, record.kind.metric_name(), suffix)
}

/// Series for a batch of records, in record order.
pub fn format_series(records: &[ResourceRecord], prefix: &str) -> Vec<TimeSeries> {
    let mut series = Vec::with_capacity(records.len() * 2);
    for record in records {
        let timestamp = record.last_observed().timestamp_millis();
        let empty = LabelMap::new();
        series.push(info_series(
            series_name(prefix, record, LABELS_SUFFIX),
            &record.metric_labels,
            record.labels.as_ref().unwrap_or(&empty),
            timestamp,
        ));
        if let Some(annotations) = &record.annotations {
            series.push(info_series(
                series_name(prefix, record, ANNOTATIONS_SUFFIX),
                &record.metric_labels,
                annotations,
                timestamp,
            ));
        }
    }
    series
}

fn info_series(name: String, dimensions: &LabelMap, tags: &LabelMap, timestamp: i64) -> TimeSeries {
    let mut labels: BTreeMap<String, String> = dimensions.clone();
    for (key, value) in tags {
        labels.insert(format!("{LABEL_KEY_PREFIX}{key}"), value.clone());
    }
    labels.insert(METRIC_NAME_LABEL.to_string(), name);

    TimeSeries {
        labels: labels
            .into_iter()
            .map(|(name, value)| Label { name, value })
            .collect(),
        samples: vec![Sample {
            value: 1.0,
            timestamp,
        }],
    }
}

/// Marshal and snappy-compress a write request.
pub fn encode(timeseries: Vec<TimeSeries>) -> Result<Vec<u8>, PushError> {
    let request = WriteRequest { timeseries };
    let mut raw = Vec::with_capacity(request.encoded_len());
    request.encode(&mut raw)?;
    Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
}
