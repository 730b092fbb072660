//! Error taxonomy surfaced by the ingestion pipeline.

use std::fmt;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::model::Measurement;
use crate::store::StoreError;

/// Pipeline stage at which an ingestion failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Lookup,
    Store,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Lookup => "lookup",
            Stage::Store => "store",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Errors returned by the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    /// Malformed input; nothing was stored or published
    #[error("Invalid measurement: {0}")]
    Validation(String),

    /// The referenced sensor does not exist; nothing was stored or published
    #[error("Sensor {sensor_id} does not exist{}", fmt_index(.index))]
    Referential {
        sensor_id: i64,
        /// Batch position of the offending item, if any
        index: Option<usize>,
    },

    /// The durable write failed; nothing was published by single ingest
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The event did not reach the broker. For single ingest the row is
    /// already committed and carried here so the publish can be retried.
    #[error("Publish failure: {source}")]
    Publish {
        measurement: Option<Box<Measurement>>,
        #[source]
        source: BrokerError,
    },

    /// The broker client was not ready; nothing was stored or published
    #[error("Broker client misuse: {0}")]
    IllegalState(#[source] BrokerError),

    #[error("Measurement {0} not found")]
    NotFound(i64),
}

fn fmt_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" (batch item {i})"),
        None => String::new(),
    }
}

impl From<BrokerError> for IngestError {
    fn from(e: BrokerError) -> Self {
        IngestError::from_publish(e, None)
    }
}

impl IngestError {
    /// Classify a broker failure, attaching the committed row if there is one.
    ///
    /// Once a row is committed the failure is always `Publish`, so the row
    /// stays reachable for a republish even if the client closed meanwhile.
    pub(crate) fn from_publish(source: BrokerError, measurement: Option<Measurement>) -> Self {
        match measurement {
            None if source.is_illegal_state() => IngestError::IllegalState(source),
            measurement => IngestError::Publish {
                measurement: measurement.map(Box::new),
                source,
            },
        }
    }

    /// The stage that failed
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::Validation(_) => Stage::Validate,
            IngestError::Referential { .. } | IngestError::NotFound(_) => Stage::Lookup,
            IngestError::Storage(_) => Stage::Store,
            IngestError::Publish { .. } | IngestError::IllegalState(_) => Stage::Publish,
        }
    }

    /// Whether the measurement is durably stored despite this error.
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            IngestError::Publish {
                measurement: Some(_),
                ..
            }
        )
    }

    /// The committed row for a failed publish, so a caller can republish it.
    pub fn stored_measurement(&self) -> Option<&Measurement> {
        match self {
            IngestError::Publish {
                measurement: Some(m),
                ..
            } => Some(m),
            _ => None,
        }
    }
}
