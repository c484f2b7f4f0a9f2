//! Decision publishing: subscription hub + WebSocket transport.

mod hub;
mod ws;

pub use hub::{SubscriptionFilter, SubscriptionHub};
pub use ws::websocket_handler;
