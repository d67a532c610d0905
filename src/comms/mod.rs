pub mod webhook;

pub use webhook::{create_router, serve, InboundMessage, MessageHandler, WebhookState};
