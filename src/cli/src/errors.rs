//! Attributing and rendering command failures.
//!
//! Only a transfer error at the top of the chain is attributed to an
//! endpoint. Errors that were already wrapped with context (a backup tag
//! step, a failed resolve) are printed as they are.

use std::error::Error;

use a3s_relay_core::error::{CopyOrigin, RelayError};
use a3s_relay_runtime::StoreKind;

/// One side of a copy, as named on the command line.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub kind: StoreKind,
    pub reference: String,
}

impl Endpoint {
    pub fn new(kind: StoreKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }
}

/// A transfer failure attributed to the source or destination endpoint.
#[derive(Debug, thiserror::Error)]
#[error("Error from {origin} {kind} for \"{reference}\": {source}")]
pub struct EndpointError {
    pub origin: CopyOrigin,
    pub kind: StoreKind,
    pub reference: String,
    #[source]
    pub source: RelayError,
}

/// Attribute a direct transfer error to the endpoint it came from.
pub fn attribute(err: RelayError, source: &Endpoint, destination: &Endpoint) -> Box<dyn Error> {
    let Some(origin) = err.origin() else {
        return Box::new(err);
    };
    let endpoint = match origin {
        CopyOrigin::Source => source,
        CopyOrigin::Destination => destination,
    };
    Box::new(EndpointError {
        origin,
        kind: endpoint.kind,
        reference: endpoint.reference.clone(),
        source: err.unwrap_copy(),
    })
}

/// Lines printed to stderr for a failed command.
pub fn render_error(err: &(dyn Error + 'static)) -> Vec<String> {
    let (headline, recommendation) = if let Some(e) = err.downcast_ref::<EndpointError>() {
        (e.to_string(), e.source.recommendation())
    } else {
        let recommendation = err
            .downcast_ref::<RelayError>()
            .and_then(RelayError::recommendation);
        (format!("Error: {err}"), recommendation)
    };

    let mut lines = vec![headline];
    if let Some(recommendation) = recommendation {
        lines.push(format!("Recommendation: {recommendation}"));
    }
    lines
}
