//! Connection handler - frames bytes into payloads and runs them through the router

use std::time::{Duration, Instant};

use swb_core::{Payload, Protocol, Router};
use swb_protocol::Parser;
use tracing::{debug, warn};

/// Handles a single client connection
pub struct ConnectionHandler {
    /// Unique connection ID
    pub connection_id: String,
    /// Per-connection protocol state
    router: Router,
    /// Line framing
    parser: Parser,
    /// A terminal response was produced; nothing more is processed
    finished: bool,
    /// Oversized lines dropped since last taken
    dropped_frames: u64,
    /// Request actions handled since last taken, with their processing time
    handled: Vec<(String, Duration)>,
}

impl ConnectionHandler {
    pub fn new(connection_id: impl Into<String>, router: Router) -> Self {
        Self::with_parser(connection_id, router, Parser::new())
    }

    pub fn with_parser(connection_id: impl Into<String>, router: Router, parser: Parser) -> Self {
        Self {
            connection_id: connection_id.into(),
            router,
            parser,
            finished: false,
            dropped_frames: 0,
            handled: Vec::new(),
        }
    }

    /// Process incoming bytes and return one response per complete line.
    ///
    /// An oversized line is dropped and answered as a `Ping`. Processing
    /// stops after a terminal response.
    pub fn process(&mut self, data: &[u8]) -> Vec<Payload> {
        let mut responses = Vec::new();
        if self.finished {
            return responses;
        }

        let oversized = match self.parser.feed(data) {
            Ok(()) => false,
            Err(e) => {
                warn!(conn = %self.connection_id, error = %e, "Oversized frame");
                self.dropped_frames += 1;
                true
            }
        };

        while let Some(payload) = self.parser.next_payload() {
            let response = self.handle_payload(payload);
            let terminal = response.is_terminal();
            responses.push(response);
            if terminal {
                self.finished = true;
                return responses;
            }
        }

        if oversized {
            responses.push(self.handle_payload(Payload::ping()));
        }
        responses
    }

    /// Handle a single decoded payload
    pub fn handle_payload(&mut self, payload: Payload) -> Payload {
        let action = payload.effective_action().to_string();
        debug!(conn = %self.connection_id, action = %action, "Processing payload");
        let started = Instant::now();
        let response = self.router.process(payload);
        self.handled.push((action, started.elapsed()));
        response
    }

    /// Fit an out-of-band protocol payload to the current menu
    pub fn annotate(&self, payload: Payload) -> Payload {
        self.router.annotate(payload)
    }

    /// Key of the protocol currently selected on this connection
    pub fn active_protocol(&self) -> Option<&str> {
        self.router.active_key()
    }

    /// Oversized lines dropped since the last call
    pub fn take_dropped_frames(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_frames)
    }

    /// Request actions handled since the last call
    pub fn take_handled(&mut self) -> Vec<(String, Duration)> {
        std::mem::take(&mut self.handled)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Close every protocol instance of this connection
    pub fn cleanup(&mut self) {
        self.router.close();
    }
}
