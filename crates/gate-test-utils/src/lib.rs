// gate-test-utils: WebSocket test client for the gateway integration suites.

pub mod client;

pub use client::{CloseInfo, TestClient};
