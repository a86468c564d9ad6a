//! Server-wide dispatch of per-request recorders

use tracing::debug;

use crate::events::{StatsEvent, StatsEvents};
use crate::recorder::{RecorderHandle, RequestInfo, RequestStatsRecorder, StatsListener};
use crate::server::HttpStatsServer;

/// Creates one recorder per dispatched request and republishes its
/// lifecycle on a shared [`StatsEvents`] registry.
///
/// Recorders are never shared between requests; only the connection and its
/// checkpoint are.
#[derive(Debug, Clone, Default)]
pub struct ServerStatsHub {
    events: StatsEvents,
}

impl ServerStatsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &StatsEvents {
        &self.events
    }

    /// Instrument every request `server` dispatches from now on
    pub fn attach(&self, server: &mut HttpStatsServer, listener: Option<StatsListener>) {
        if let Some(listener) = listener {
            self.events.on_complete(move |result| listener(result));
        }
        server.set_hub(self.clone());
    }

    /// Start recording one request.
    ///
    /// Publishes [`StatsEvent::Request`] right away and
    /// [`StatsEvent::Complete`] when the recorder produces its result.
    pub fn dispatch(&self, request: RequestInfo) -> RecorderHandle {
        debug!(
            method = %request.method,
            path = %request.path,
            connection = ?request.connection.as_ref().map(|c| c.id()),
            "Dispatching request"
        );
        let handle = RequestStatsRecorder::new(request).observe(None);
        let events = self.events.clone();
        handle.on_result(move |result| {
            events.publish(&StatsEvent::Complete(result.clone()));
        });
        self.events.publish(&StatsEvent::Request(handle.clone()));
        handle
    }
}
