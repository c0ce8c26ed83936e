//! Plugin bus gateway.
//!
//! Fans hub events out to observers on `/ws/plugins` and serves the admin
//! API under `/api`.

pub mod api;
pub mod auth;
pub mod server;
pub mod session;
pub mod ws_protocol;
pub mod ws_server;

pub use server::{GatewayState, build_router, start_server};
pub use session::{FanoutGateway, Subscription, Subscriptions};
pub use ws_protocol::{ClientMessage, OutboundEvent, Topic};
