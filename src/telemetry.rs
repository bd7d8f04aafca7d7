// Copyright 2026 Palisade Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry boundary.
//!
//! Delivery to a backend collector is out of scope; this crate only
//! defines the sink interface. Reporting is best-effort and must never
//! block or fail request handling.

use std::error::Error;
use tracing::{debug, error};

/// Metric namespace used for all engine counters.
pub const METRICS_NAMESPACE: &str = "appsec";

/// Sink for engine errors, exception reports, and counters.
pub trait TelemetrySink: Send + Sync {
    /// Record an error message.
    fn error(&self, message: &str);

    /// Record an exception with a human-readable description.
    fn report(&self, error: &(dyn Error + 'static), description: &str);

    /// Increment a counter under `namespace` with the given tags.
    fn inc(&self, namespace: &str, metric: &str, value: u64, tags: &[(&str, &str)]);
}

/// Default sink that forwards everything to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn error(&self, message: &str) {
        error!(target: "telemetry", "{message}");
    }

    fn report(&self, error: &(dyn Error + 'static), description: &str) {
        error!(target: "telemetry", error = %error, "{description}");
    }

    fn inc(&self, namespace: &str, metric: &str, value: u64, tags: &[(&str, &str)]) {
        debug!(
            target: "telemetry",
            namespace,
            metric,
            value,
            ?tags,
            "metric increment"
        );
    }
}
