//! Operator HTTP API for the import queue: routing and request/response
//! mapping.

pub mod app;
