//! Janus gateway: routes each chat completion to a direct model call or a
//! sandboxed agent and streams the result back in one wire format.

use std::pin::Pin;

use futures::Stream;
use janus_agent_schema::InternalEvent;

pub mod agent;
pub mod artifacts;
pub mod capability;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fast_path;
pub mod multiplexer;
pub mod router;

/// Events from whichever producer serves a request. Ends with `Done`.
pub type EventStream = Pin<Box<dyn Stream<Item = InternalEvent> + Send>>;
