pub mod bus;
pub mod config;
pub mod control;
pub mod daemon;
pub mod direct;
pub mod error;
pub mod exchange;
pub mod hooks;
pub mod hub;
pub mod jar;
pub mod logging;
pub mod mirror;
pub mod omnibox;
pub mod quic_transport;
pub mod redirects;
pub mod scheduler;
pub mod seal;
pub mod shaping;
pub mod telemetry;
pub mod transform;
pub mod transport;
pub mod tunnel;
pub mod vault;
pub mod wire;
pub mod ws_transport;
