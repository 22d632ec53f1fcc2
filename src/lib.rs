//! # exec-core
//!
//! Content-addressed execution cache and dispatch engine for generative
//! functions. A call names a function, passes arguments and optionally a
//! shape for the output. Identical calls are answered from the cache;
//! everything else is routed to a model, a code sandbox, a human or a
//! delegated agent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use exec_core::engine::Engine;
//! use exec_core::provider::OpenAIProvider;
//! use exec_core::store::MemoryStore;
//! use exec_core::types::Request;
//! use serde_json::json;
//!
//! # async fn demo() -> exec_core::error::ExecResult<()> {
//! let engine = Engine::builder()
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_provider(Arc::new(OpenAIProvider::from_env()?))
//!     .build()?;
//!
//! let request = Request::new("categorizeProduct")
//!     .with_args(json!({ "name": "Trail shoe", "price": 120 }))
//!     .with_shape(json!({ "category": "string", "confidence": "number" }));
//!
//! let first = engine.execute(request.clone()).await?;
//! let again = engine.execute(request).await?;
//! assert!(again.cached);
//! assert_eq!(first.output, again.output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Request pipeline: hash, lookup, classify, generate, validate, persist |
//! | [`hash`] | Canonical JSON and SHA-256 identities for requests, args and shapes |
//! | [`cache`] | TTL policy, concurrent record lookups, in-flight coalescing |
//! | [`dispatch`] | Picks the execution kind for a request |
//! | [`strategy`] | One handler per kind: object, text, lists, code, human, agent |
//! | [`schema`] | Shape descriptions, JSON Schema rendering and coercing validation |
//! | [`store`] | Record persistence trait with in-memory and JSONL file backends |
//! | [`scheduler`] | Bounded background queue for writes, events and deferred work |
//! | [`provider`] | Streaming model abstraction with an OpenAI-compatible client |
//! | [`sandbox`] | Isolated code execution with time and memory limits |
//! | [`human`] | Human feedback channels |
//! | [`agent`] | Delegated agents |
//! | [`notify`] | Webhook delivery of deferred results |
//! | [`execlog`] | Structured per-request logging |
//! | [`telemetry`] | Stage latencies |
//! | [`config`] | Engine defaults, environment overrides |
//! | [`error`] | Error types with thiserror |

pub mod agent;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod execlog;
pub mod hash;
pub mod human;
pub mod notify;
pub mod provider;
pub mod sandbox;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod types;

pub use engine::{Engine, EngineBuilder, Outcome};
pub use error::{ExecError, ExecResult};
pub use types::*;
