//! HTTP front door of the bridge.
//!
//! One listener serves both directions:
//!
//! - `POST /event` - notifications pushed by the phone.
//! - `/_matrix/app/v1/...` - the homeserver side of the application-service
//!   protocol (event transactions, user and room queries).
//! - `GET /healthz` - liveness.

mod appservice;
mod webhook;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::routing::{get, post, put};
use cona_config::BridgeConfig;
use cona_core::{Bridge, InboundRouter, OutboundRouter};
use cona_matrix::{ChatEventSender, ChatNetwork};
use cona_types::{AccessToken, GhostNaming};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Homeserver events waiting for the outbound router.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// How many recent transaction IDs are remembered for deduplication.
const SEEN_TXN_CAPACITY: usize = 128;

#[derive(Clone)]
pub struct AppState {
    inbound: Arc<InboundRouter>,
    events: ChatEventSender,
    network: Arc<dyn ChatNetwork>,
    naming: GhostNaming,
    hs_token: AccessToken,
    seen_txns: Arc<Mutex<SeenTransactions>>,
}

impl AppState {
    pub fn new(
        inbound: Arc<InboundRouter>,
        events: ChatEventSender,
        network: Arc<dyn ChatNetwork>,
        naming: GhostNaming,
        hs_token: AccessToken,
    ) -> Self {
        Self {
            inbound,
            events,
            network,
            naming,
            hs_token,
            seen_txns: Arc::new(Mutex::new(SeenTransactions::default())),
        }
    }

    /// State for a running [`Bridge`], with its outbound router draining
    /// the returned task.
    pub fn for_bridge(bridge: &Bridge, config: &BridgeConfig) -> (Self, JoinHandle<()>) {
        let (events, drain) = spawn_outbound_drain(Arc::clone(&bridge.outbound));
        let state = Self::new(
            Arc::clone(&bridge.inbound),
            events,
            Arc::clone(&bridge.network),
            config.ghost_naming(),
            config.hs_token.clone(),
        );
        (state, drain)
    }
}

/// Start the single task that feeds homeserver events to `router` in
/// receipt order. The task ends once every sender is dropped.
pub fn spawn_outbound_drain(router: Arc<OutboundRouter>) -> (ChatEventSender, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handle = tokio::spawn(async move { router.run(rx).await });
    (tx, handle)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/event", post(webhook::notification))
        .route("/healthz", get(webhook::healthz))
        .route(
            "/_matrix/app/v1/transactions/:txn_id",
            put(appservice::transaction),
        )
        .route("/transactions/:txn_id", put(appservice::transaction))
        .route("/_matrix/app/v1/users/:user_id", get(appservice::query_user))
        .route("/_matrix/app/v1/rooms/:alias", get(appservice::query_room))
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight requests are allowed to
/// finish; queued outbound events are not waited for.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Bridge listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bounded memory of processed transaction IDs, oldest evicted first, plus
/// the IDs currently being queued.
#[derive(Debug, Default)]
struct SeenTransactions {
    order: VecDeque<String>,
    ids: HashSet<String>,
    in_flight: HashSet<String>,
}

impl SeenTransactions {
    fn contains(&self, txn_id: &str) -> bool {
        self.ids.contains(txn_id)
    }

    /// Claim `txn_id` for processing. `false` when it was already processed
    /// or another request is still queueing it.
    fn begin(&mut self, txn_id: &str) -> bool {
        if self.contains(txn_id) || self.in_flight.contains(txn_id) {
            return false;
        }
        self.in_flight.insert(txn_id.to_string());
        true
    }

    /// Release a claim without recording the ID, so a redelivery is processed.
    fn abandon(&mut self, txn_id: &str) {
        self.in_flight.remove(txn_id);
    }

    /// Release a claim and remember the ID as processed.
    fn finish(&mut self, txn_id: String) {
        self.in_flight.remove(&txn_id);
        self.insert(txn_id);
    }

    fn insert(&mut self, txn_id: String) {
        if !self.ids.insert(txn_id.clone()) {
            return;
        }
        self.order.push_back(txn_id);
        if self.order.len() > SEEN_TXN_CAPACITY
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
    }
}
