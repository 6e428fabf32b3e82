//! SAML broker between a relying service, an identity hub and a matching
//! service adapter.
//!
//! The [`broker::Broker`] generates signed (and optionally encrypted)
//! authentication requests for the hub and translates the matching service's
//! responses into [`broker::TranslatedResponseOutcome`]s. [`routes`] exposes
//! both operations and the health checks over HTTP.

pub mod broker;
pub mod config;
#[cfg(feature = "server")]
pub mod observability;
pub mod routes;
pub mod toolkit;

#[cfg(test)]
mod tests;
