//! Metric events emitted by the channel.

use std::sync::Mutex;

/// Protocol phase names.
pub mod phases {
    /// Worker process startup through StartStream.
    pub const WORKER_STARTUP: &str = "WorkerStartup";
    /// WorkerInit request/response.
    pub const WORKER_INITIALIZATION: &str = "WorkerInitialization";
    /// Function load request/response.
    pub const FUNCTION_LOAD: &str = "FunctionLoad";
    /// Environment reload request/response.
    pub const ENVIRONMENT_RELOAD: &str = "EnvironmentReload";
}

/// Marker event names.
pub mod markers {
    /// End of the function load exchange.
    pub const FUNCTION_LOAD_REQUEST_RESPONSE: &str = "FunctionLoadRequestResponse";
    /// End of the specialization environment reload exchange.
    pub const SPECIALIZATION_ENVIRONMENT_RELOAD_REQUEST_RESPONSE: &str =
        "SpecializationEnvironmentReloadRequestResponse";
}

/// One metric event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    /// A protocol phase began.
    PhaseBegin {
        /// Phase name from [`phases`].
        phase: &'static str,
    },
    /// A protocol phase ended.
    PhaseEnd {
        /// Phase name from [`phases`].
        phase: &'static str,
    },
    /// A named marker from [`markers`].
    Marker {
        /// Marker name.
        name: &'static str,
    },
}

/// Sink for channel metric events.
pub trait MetricsSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: MetricEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Sink that retains every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// True if the given marker was recorded.
    #[must_use]
    pub fn has_marker(&self, name: &str) -> bool {
        self.events()
            .iter()
            .any(|event| matches!(event, MetricEvent::Marker { name: n } if *n == name))
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_retains_events() {
        let sink = RecordingMetrics::new();
        sink.record(MetricEvent::PhaseBegin {
            phase: phases::FUNCTION_LOAD,
        });
        sink.record(MetricEvent::Marker {
            name: markers::FUNCTION_LOAD_REQUEST_RESPONSE,
        });

        assert_eq!(sink.events().len(), 2);
        assert!(sink.has_marker(markers::FUNCTION_LOAD_REQUEST_RESPONSE));
        assert!(!sink.has_marker(markers::SPECIALIZATION_ENVIRONMENT_RELOAD_REQUEST_RESPONSE));
    }
}
