//! Process-level pieces of the broker binary.
//!
//! ## Structure
//!
//! - [`config`] - CLI/env configuration and its validation.
//! - [`router`] - Socket tasks between listeners and the broker's channels.
//! - [`service`] - Startup and graceful shutdown of a [`BrokerService`].
//! - [`telemetry`] - Logging, tracing and metrics setup.
//!
//! [`BrokerService`]: service::BrokerService

pub mod config;
pub mod router;
pub mod service;
pub mod telemetry;
