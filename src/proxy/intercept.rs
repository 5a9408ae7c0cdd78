//! HTTP interception for TLS-terminated tunnels

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::relay::{DuplexRelay, RelayObserver, RelayStats};
use crate::error::Result;
use crate::http::{CapturedExchange, ExchangeTracker};
use crate::rules::RuleSet;
use crate::sink::{Dispatch, Dispatcher, Notification};

/// Relays a plaintext session unchanged while pairing its exchanges and
/// dispatching capture and notify side effects for matching ones.
#[derive(Debug, Clone)]
pub struct InterceptionPipeline {
    rules: Arc<RuleSet>,
    dispatcher: Dispatcher,
    max_body_bytes: usize,
}

impl InterceptionPipeline {
    pub fn new(rules: Arc<RuleSet>, dispatcher: Dispatcher, max_body_bytes: usize) -> Self {
        Self {
            rules,
            dispatcher,
            max_body_bytes,
        }
    }

    /// Run until both directions finish. `default_host` is recorded for
    /// requests without a `Host` header.
    pub async fn run<C, U>(&self, client: C, upstream: U, default_host: &str) -> Result<RelayStats>
    where
        C: AsyncRead + AsyncWrite + Send,
        U: AsyncRead + AsyncWrite + Send,
    {
        let mut observer = InterceptObserver {
            tracker: ExchangeTracker::new(self.max_body_bytes).with_default_host(default_host),
            rules: &self.rules,
            dispatcher: &self.dispatcher,
            completed: 0,
            dropped: 0,
        };

        let result = DuplexRelay::matched_pair(client, upstream)
            .run_observed(&mut observer)
            .await;

        let pending = observer.tracker.pending();
        if pending > 0 {
            tracing::debug!(host = %default_host, pending, "Dropping in-flight exchanges at close");
        }
        tracing::debug!(
            host = %default_host,
            completed = observer.completed,
            dropped = observer.dropped,
            "Intercepted session closed"
        );

        Ok(result?)
    }
}

struct InterceptObserver<'a> {
    tracker: ExchangeTracker,
    rules: &'a RuleSet,
    dispatcher: &'a Dispatcher,
    completed: usize,
    /// Exchanges whose side effects the dispatcher refused.
    dropped: usize,
}

impl InterceptObserver<'_> {
    fn finalize(&mut self, exchange: CapturedExchange) {
        self.completed += 1;
        let effects = self.rules.effects(&exchange);
        tracing::debug!(
            method = %exchange.method,
            host = %exchange.host,
            path = %exchange.path,
            status = exchange.status,
            capture = effects.capture,
            notify = effects.notify,
            "Exchange complete"
        );
        if effects.is_none() {
            return;
        }

        let notification = effects.notify.then(|| Notification::for_exchange(&exchange));
        let exchange = Arc::new(exchange);
        let queued = self.dispatcher.submit(Dispatch {
            exchange: exchange.clone(),
            capture: effects.capture,
            notification,
        });
        if !queued {
            self.dropped += 1;
            tracing::debug!(
                host = %exchange.host,
                path = %exchange.path,
                "Side effects not queued, exchange skipped"
            );
        }
    }
}

impl RelayObserver for InterceptObserver<'_> {
    fn on_client_data(&mut self, data: &[u8]) {
        self.tracker.observe_request(data);
    }

    fn on_upstream_data(&mut self, data: &[u8]) {
        for exchange in self.tracker.observe_response(data) {
            self.finalize(exchange);
        }
    }

    fn on_upstream_closed(&mut self) {
        for exchange in self.tracker.observe_response_eof() {
            self.finalize(exchange);
        }
    }
}
