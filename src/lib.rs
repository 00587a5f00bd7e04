//! Hostgate - a host-aware reverse proxy that provisions backends on demand
//!
//! This library provides:
//! - Routing of HTTP and upgraded connections by `Host` header to registered applications
//! - Per-hostname TLS policy enforcement and SNI certificate selection
//! - On-demand provisioning of backend processes, locally or through a process-manager peer
//! - Readiness probing with exponential backoff before traffic is sent to a new instance
//! - Automatic deregistration of instances whose process exits or stops answering

pub mod config;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod provision;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod tls;
