//! Identity and routing core of the bridge.
//!
//! # Architecture
//!
//! - [`TitleStore`] - durable token → display name map, the only way back
//!   from a ghost to the name the phone uses.
//! - [`RoomResolver`] - token → room, creating ghost and room on first use.
//! - [`InboundRouter`] - phone notification → message from the sender's
//!   ghost.
//! - [`OutboundRouter`] - operator reply → phone reply endpoint.
//!
//! Both routers talk to Matrix only through
//! [`ChatNetwork`](cona_matrix::ChatNetwork) and to the phone only through
//! [`ReplySink`], so the whole core runs against in-memory fakes in tests.
//!
//! Nothing here returns an error to its caller once the bridge is running:
//! each router logs a failure and reports it in its outcome value.

mod inbound;
mod outbound;
mod reply;
mod resolver;
mod title_store;

#[cfg(test)]
mod testing;

pub use inbound::{InboundOutcome, InboundRouter};
pub use outbound::{OutboundOutcome, OutboundRouter};
pub use reply::{HttpReplySink, ReplyError, ReplyFut, ReplySink};
pub use resolver::{ResolveError, RoomResolver};
pub use title_store::{TitleStore, TitleStoreError};

use std::sync::Arc;

use cona_config::BridgeConfig;
use cona_matrix::ChatNetwork;

/// The two routers wired to one shared store, network and reply sink.
pub struct Bridge {
    pub inbound: Arc<InboundRouter>,
    pub outbound: Arc<OutboundRouter>,
    pub network: Arc<dyn ChatNetwork>,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        network: Arc<dyn ChatNetwork>,
        store: Arc<TitleStore>,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        let naming = config.ghost_naming();
        let resolver = Arc::new(RoomResolver::new(
            Arc::clone(&network),
            naming.clone(),
            config.room_name_prefix.clone(),
        ));
        let inbound = InboundRouter::new(
            config.source_filter.clone(),
            config.operator.clone(),
            Arc::clone(&store),
            resolver,
            Arc::clone(&network),
        );
        let outbound = OutboundRouter::new(
            config.operator.clone(),
            naming,
            store,
            Arc::clone(&network),
            replies,
        );
        Self {
            inbound: Arc::new(inbound),
            outbound: Arc::new(outbound),
            network,
        }
    }
}
