use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::proxy::http::HeaderMap;

pub const BLOCK_STATUS_CODE: u16 = 403;
pub const BLOCK_MESSAGE: &str = "Forbidden - blocked by safe-chain";

/// Synthetic response written instead of contacting the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub status_code: u16,
    pub message: String,
}

/// Emitted once per block decision, before the handler is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalwareBlocked {
    pub package_name: String,
    pub version: String,
    pub target_url: String,
    pub timestamp_millis: u128,
}

/// Sink for interception events. The proxy controller owns the aggregate
/// state behind this seam; interceptors never see the controller itself.
pub trait InterceptEvents: Send + Sync {
    fn malware_blocked(&self, event: MalwareBlocked);
    fn versions_suppressed(&self);
}

pub type HeaderModifier = Box<dyn Fn(&mut HeaderMap) + Send + Sync>;
pub type BodyModifier = Box<dyn Fn(Vec<u8>, &mut HeaderMap) -> Vec<u8> + Send + Sync>;
pub type SetupFn = Box<dyn Fn(&mut InterceptionContext) + Send + Sync>;

/// Mutable per-request builder handed to the setup chain. Becomes an
/// immutable [`InterceptionHandler`] once every setup has run.
pub struct InterceptionContext {
    target_url: String,
    block_response: Option<BlockResponse>,
    header_modifiers: Vec<HeaderModifier>,
    body_modifiers: Vec<BodyModifier>,
    pending_events: Vec<MalwareBlocked>,
}

impl InterceptionContext {
    fn new(target_url: &str) -> InterceptionContext {
        InterceptionContext {
            target_url: target_url.to_string(),
            block_response: None,
            header_modifiers: Vec::new(),
            body_modifiers: Vec::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// Record a block decision for this request.
    pub fn block_malware(&mut self, name: &str, version: &str) {
        self.block_response = Some(BlockResponse {
            status_code: BLOCK_STATUS_CODE,
            message: BLOCK_MESSAGE.to_string(),
        });
        self.pending_events.push(MalwareBlocked {
            package_name: name.to_string(),
            version: version.to_string(),
            target_url: self.target_url.clone(),
            timestamp_millis: unix_millis(),
        });
    }

    pub fn modify_request_headers<F>(&mut self, modifier: F)
    where
        F: Fn(&mut HeaderMap) + Send + Sync + 'static,
    {
        self.header_modifiers.push(Box::new(modifier));
    }

    pub fn modify_body<F>(&mut self, modifier: F)
    where
        F: Fn(Vec<u8>, &mut HeaderMap) -> Vec<u8> + Send + Sync + 'static,
    {
        self.body_modifiers.push(Box::new(modifier));
    }

    fn build(self) -> (InterceptionHandler, Vec<MalwareBlocked>) {
        (
            InterceptionHandler {
                block_response: self.block_response,
                header_modifiers: self.header_modifiers,
                body_modifiers: self.body_modifiers,
            },
            self.pending_events,
        )
    }
}

/// Immutable per-request decision produced by the setup chain.
pub struct InterceptionHandler {
    pub block_response: Option<BlockResponse>,
    header_modifiers: Vec<HeaderModifier>,
    body_modifiers: Vec<BodyModifier>,
}

impl InterceptionHandler {
    pub fn modifies_response(&self) -> bool {
        !self.body_modifiers.is_empty()
    }

    /// Apply request-header modifiers in registration order.
    pub fn modify_request_headers(&self, headers: &mut HeaderMap) {
        for modifier in &self.header_modifiers {
            modifier(headers);
        }
    }

    /// Apply body modifiers in registration order over the accumulated
    /// bytes. Header mutations feed through to the client-visible response.
    pub fn modify_body(&self, body: Vec<u8>, headers: &mut HeaderMap) -> Vec<u8> {
        let mut current = body;
        for modifier in &self.body_modifiers {
            current = modifier(current, headers);
        }
        current
    }
}

/// A stateless per-ecosystem interceptor: a chain of setup functions plus
/// the event sink they report into. All request state lives in the
/// per-request context.
pub struct Interceptor {
    setups: Vec<SetupFn>,
    events: Arc<dyn InterceptEvents>,
}

impl Interceptor {
    pub fn handle_request(&self, target_url: &str) -> InterceptionHandler {
        let mut context = InterceptionContext::new(target_url);
        for setup in &self.setups {
            setup(&mut context);
        }
        let (handler, events) = context.build();
        // Bookkeeping happens before the handler reaches the server; a
        // block is never observed after the fact.
        for event in events {
            self.events.malware_blocked(event);
        }
        handler
    }
}

pub fn intercept_requests(setups: Vec<SetupFn>, events: Arc<dyn InterceptEvents>) -> Interceptor {
    Interceptor { setups, events }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}
