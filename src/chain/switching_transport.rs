//! A JSON-RPC transport over multiple HTTP providers that fails over between them.

use std::{pin::Pin, sync::Arc, time::Instant};

use alloy::{
    rpc::json_rpc::{RequestPacket, ResponsePacket},
    transports::{RpcError, TransportErrorKind, http::Http, http::reqwest::Url},
};
use futures::Future;
use parking_lot::RwLock;
use tower_service::Service;

use super::options::ChainOptions;
use crate::{Error, Result};

/// JSON-RPC error code for HTTP 429 Too Many Requests.
const TOO_MANY_REQUESTS: i64 = 429;

/// An RPC transport with multiple remote (HTTP) providers.
///
/// This transport utilizes one RPC provider at a time, but if it detects that the provider is in a
/// failing state, it will automatically switch to the next provider in its list.
#[derive(Clone, Debug)]
pub struct SwitchingTransport {
    /// The transport currently in use
    current_transport: Arc<RwLock<SingleTransport>>,
    /// The configured HTTP URLs, in order of preference
    urls: Arc<Vec<Url>>,
    opt: Arc<ChainOptions>,
}

/// The state of the current provider being used by a [`SwitchingTransport`].
/// This is cloneable and returns a reference to the same underlying data.
#[derive(Debug, Clone)]
struct SingleTransport {
    generation: usize,
    client: Http<alloy::transports::http::Client>,
    status: Arc<RwLock<SingleTransportStatus>>,
    /// Time at which to revert back to the primary provider after a failover.
    revert_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct SingleTransportStatus {
    last_failure: Option<Instant>,
    consecutive_failures: usize,
    rate_limited_until: Option<Instant>,
    /// Set once we have decided to switch away from this transport.
    shutting_down: bool,
}

impl SwitchingTransport {
    /// Create a transport over the HTTP providers configured in `opt`.
    pub fn new(opt: ChainOptions) -> Result<Self> {
        let urls = opt.http_providers.clone();
        let Some(first_url) = urls.first() else {
            return Err(Error::internal().context("no RPC URLs provided"));
        };
        let first_transport = SingleTransport::new(first_url, 0, None);

        Ok(Self {
            current_transport: Arc::new(RwLock::new(first_transport)),
            urls: Arc::new(urls),
            opt: Arc::new(opt),
        })
    }

    fn switch_to(&self, next_gen: usize, current_transport: SingleTransport) -> SingleTransport {
        let next_index = next_gen % self.urls.len();
        let url = &self.urls[next_index];
        tracing::info!(%url, next_gen, "switch RPC transport");

        let revert_at = revert_time(
            next_gen,
            &current_transport,
            self.urls.len(),
            Instant::now() + self.opt.rpc_failover_revert,
        );
        let new_transport = SingleTransport::new(url, next_gen, revert_at);
        *self.current_transport.write() = new_transport.clone();
        new_transport
    }
}

/// When the transport of generation `next_gen` should revert to the primary provider.
fn revert_time(
    next_gen: usize,
    current: &SingleTransport,
    providers: usize,
    failover_deadline: Instant,
) -> Option<Instant> {
    if next_gen.is_multiple_of(providers) {
        // Back on the primary: nothing to revert.
        None
    } else if current.generation.is_multiple_of(providers) {
        // Failing over away from the primary: schedule the way back.
        Some(failover_deadline)
    } else {
        current.revert_at
    }
}

impl SingleTransport {
    fn new(url: &Url, generation: usize, revert_at: Option<Instant>) -> Self {
        Self {
            generation,
            client: Http::new(url.clone()),
            status: Default::default(),
            revert_at,
        }
    }
}

impl SingleTransportStatus {
    fn log_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failed call. Returns whether the transport should be switched to the next URL.
    fn log_failure(&mut self, opt: &ChainOptions) -> bool {
        self.consecutive_failures += 1;
        let should_switch = self.should_switch(opt);
        self.last_failure = Some(Instant::now());
        should_switch
    }

    fn should_switch(&mut self, opt: &ChainOptions) -> bool {
        // Someone else already decided to switch.
        if self.shutting_down {
            return false;
        }

        if self.consecutive_failures >= opt.rpc_consecutive_failure_tolerance {
            self.shutting_down = true;
            return true;
        }

        if let Some(prev) = self.last_failure {
            if Instant::now().saturating_duration_since(prev) < opt.rpc_frequent_failure_tolerance {
                self.shutting_down = true;
                return true;
            }
        }

        false
    }

    fn should_revert(&mut self, revert_at: Option<Instant>) -> bool {
        if self.shutting_down {
            return false;
        }
        let Some(revert_at) = revert_at else {
            return false;
        };
        if Instant::now() >= revert_at {
            self.shutting_down = true;
            return true;
        }
        false
    }
}

impl Service<RequestPacket> for SwitchingTransport {
    type Error = RpcError<TransportErrorKind>;
    type Response = ResponsePacket;
    type Future = Pin<
        Box<
            dyn Future<Output = std::result::Result<ResponsePacket, RpcError<TransportErrorKind>>>
                + Send,
        >,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.current_transport.read().clone().client.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let this = self.clone();

        Box::pin(async move {
            let mut current_transport = this.current_transport.read().clone();

            // Revert back to the primary transport if it's time.
            let should_revert = current_transport
                .status
                .write()
                .should_revert(current_transport.revert_at);
            if should_revert {
                // The next generation which maps to index 0.
                let n = this.urls.len();
                let next_gen = (current_transport.generation / n) * n + n;
                current_transport = this.switch_to(next_gen, current_transport);
            }

            // If we've been rate limited, back off until the limit (hopefully) expires.
            let rate_limit_until = current_transport.status.read().rate_limited_until;
            if let Some(t) = rate_limit_until {
                if t > Instant::now() {
                    return Err(RpcError::Transport(TransportErrorKind::Custom(
                        "Rate limit exceeded".into(),
                    )));
                }
                current_transport.status.write().rate_limited_until = None;
            }

            match current_transport.client.call(req).await {
                Ok(res) => {
                    current_transport.status.write().log_success();
                    Ok(res)
                }
                Err(err) => {
                    // Rate limiting does not cause failover, only a temporary back-off.
                    if let RpcError::ErrorResp(e) = &err {
                        if e.code == TOO_MANY_REQUESTS {
                            current_transport.status.write().rate_limited_until =
                                Some(Instant::now() + this.opt.rate_limit_delay());
                            return Err(err);
                        }
                    }

                    tracing::warn!(?err, "RPC client error");

                    // `log_failure` returns true at most once per transport, so only one caller
                    // performs the switch.
                    if current_transport.status.write().log_failure(&this.opt) {
                        tracing::info!("switching to next RPC provider due to failures");
                        this.switch_to(current_transport.generation + 1, current_transport);
                    }

                    Err(err)
                }
            }
        })
    }
}
