//! Real-time event distribution — hub, chat streaming, and the WebSocket
//! observer endpoint.

pub mod chat;
pub mod hub;
pub mod ws;

pub use chat::{ChatStreamer, StreamedMessage};
pub use hub::{EventHub, HubEvent, Subscription, SubscriptionTicket, ToolInvocation, Topic};
pub use ws::event_routes;
