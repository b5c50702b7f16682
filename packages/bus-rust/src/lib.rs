//! Stellar bus: request/response, publish/subscribe and a middleware
//! pipeline over pluggable queue transports.
//!
//! A [`StellarNode`] owns one [`routing::QueueRouter`] and hands out the
//! three facades built on it: [`RequestClient`], [`RequestServer`] and
//! [`PubSub`]. Transports implement [`transport::Transport`];
//! [`transport::MemoryTransport`] runs everything in process.

pub mod config;
pub mod correlation;
pub mod error;
pub mod facade;
pub mod node;
pub mod pipeline;
pub mod registry;
pub mod routing;
pub mod telemetry;
pub mod transport;

pub use config::BusConfig;
pub use correlation::CorrelationEngine;
pub use error::{BusError, Failure};
pub use facade::{PubSub, RequestClient, RequestServer, Verb};
pub use node::StellarNode;
pub use pipeline::{CallOptions, Matcher, Middleware, Next, Pipeline, PipelineResult, Reply};
pub use registry::{EnvelopeHandler, Registry};
pub use routing::{HandlerRegistration, QueueRouter, Subscription};
pub use telemetry::{init_tracing, LogFormat};
pub use transport::{Ack, Consumer, MemoryTransport, Transport, Unsubscribe};
