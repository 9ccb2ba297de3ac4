//! HTTP API: routers for the command and query services, plus their wiring.

pub mod app;
