//! draw-nexus: LLM chat proxy and real-time collaboration relay for an
//! AI-assisted diagram editor.
//!
//! Client side, a chat turn flows through [`quota::CredentialGate`] (may this
//! request go out at all), [`request::build_request_body`], the server's
//! `/api/chat` and [`sse::consume_stream`]. Server side, [`web`] proxies
//! chat and model listings to the provider picked by
//! [`config::ServerConfig::effective`] and hosts the [`collab`] relay;
//! [`coordinator`] keeps a collaborating client from echoing what it just
//! received.

pub mod cli;
pub mod client;
pub mod collab;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod page;
pub mod providers;
pub mod quota;
pub mod request;
pub mod sse;
pub mod state;
pub mod store;
pub mod web;

pub use error::{NexusError, Result};
