//! Webhook Event Gateway
//!
//! Receives webhook events from external services (GitHub, Linear, Stripe,
//! anything that can POST), verifies and filters them, and injects a
//! compact formatted summary into a running agent session without flooding
//! its context. Subscriptions bind an inbound webhook URL to a target
//! session plus filtering and formatting policy; an optional cloudflared
//! tunnel gives the local endpoint a public URL.

pub mod config;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod http;
pub mod sessions;
pub mod store;
pub mod tunnel;
pub mod types;
pub mod verify;
