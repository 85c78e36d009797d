//! Upbit exchange integration: auth, price grid, typed payloads, REST client

pub mod auth;
pub mod client;
pub mod tick;
pub mod types;

pub use auth::Credentials;
pub use client::{ClientConfig, UpbitClient, DEFAULT_BASE_URL};
pub use tick::{round_to_tick, tick_size, TickRounding};

/// Smallest order notional the exchange accepts on KRW markets
pub const MIN_ORDER_NOTIONAL_KRW: f64 = 5_000.0;
