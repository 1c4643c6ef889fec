//! Cowrite - replicated text documents for real-time collaborative editing.
//!
//! Each replica holds a [`document::Document`]: a sequence CRDT of
//! characters with tombstones, an operation log, and a version vector.
//! Replicas exchange signed operations over a [`broker::Broker`] topic and
//! converge to the same text whatever order, or how many times, those
//! operations arrive in. A [`coordinator::Coordinator`] actor serializes
//! everything that touches one document and fans changes out to connected
//! clients.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Instant;
//! use cowrite::document::Document;
//! use cowrite::key::ReplicaKey;
//!
//! let mut alice = Document::new(ReplicaKey::generate(), 64);
//! let mut bob = Document::new(ReplicaKey::generate(), 64);
//!
//! let typed = alice.insert_str_local(0, "Hello!").unwrap();
//! let fixed = bob.insert_str_local(0, "Hi").unwrap();
//!
//! for op in typed {
//!     bob.apply_remote(op, Instant::now()).unwrap();
//! }
//! for op in fixed {
//!     alice.apply_remote(op, Instant::now()).unwrap();
//! }
//! assert_eq!(alice.materialize(), bob.materialize());
//! ```

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod crdt;
pub mod diff;
pub mod document;
pub mod error;
pub mod key;
pub mod log;
pub mod registry;
pub mod snapshot;

pub use error::Error;
pub use error::Result;
