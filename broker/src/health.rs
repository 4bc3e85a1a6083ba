//! A minimal readiness `Handler` for the monitoring sub-router. `core` has
//! no dedicated health module of its own (unlike the teacher's
//! `HealthReporting`/`HttpHealthEndpoint` pair); a bare `AtomicBool` is all
//! the `/health/readiness` route needs here.

use anyhow::Result;
use broker_core::http_server::Handler;
use rouille::{Request, Response};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct ReadinessFlag {
    ready: AtomicBool,
}

impl ReadinessFlag {
    pub fn new() -> Self {
        ReadinessFlag {
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

impl Handler for ReadinessFlag {
    fn handle_request(&self, _: &Request) -> Result<Response> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(Response::text("ready").with_status_code(200))
        } else {
            Ok(Response::text("not ready").with_status_code(503))
        }
    }
}
