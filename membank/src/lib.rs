#![allow(non_camel_case_types)]

//! `membank` is a distributed, namespaced, versioned memory bank: clients
//! write opaque documents (strings, numbers, booleans, sequences, or nested
//! mappings) tagged with a category, key, and namespace, and the store
//! guarantees eventual convergence across replicas via a CRDT-style
//! conflict resolver, fast point/range lookup through an in-memory index,
//! and pluggable persistence (an embedded ordered key-value store, or a
//! human-readable file tree).
//!
//! The lowest layer is a log-structured byte engine, adapted from a prior
//! single-node key-value project: key/value pairs are appended to a log
//! file and their positions tracked in an in-memory keydir, compacted on
//! demand. [`storage::tabular::TabularBackend`] builds namespace/category/key
//! semantics on top of it; [`storage::tree::TreeBackend`] is a parallel
//! implementation over a directory of markdown files.
//!
//! ## Getting started
//!
//! ```rust
//! use membank::config::ManagerConfig;
//! use membank::manager::{Manager, StoreRequest};
//! use membank::value::Value;
//!
//! # fn run() -> membank::error::CResult<()> {
//! let mut manager = Manager::new(ManagerConfig::in_memory("node-a"))?;
//!
//! let stored = manager.store(
//!     StoreRequest {
//!         value: Value::String("world".into()),
//!         category: Some("note".into()),
//!         key: Some("hello".into()),
//!         ..Default::default()
//!     },
//!     None,
//!     None,
//! )?;
//! let fetched = manager.get("note", "hello", None, None)?.unwrap();
//! assert_eq!(fetched.value, Value::String("world".into()));
//! assert_eq!(stored.id, fetched.id);
//! # Ok(())
//! # }
//! # run().unwrap();
//! ```

pub mod error;
pub mod value;
pub mod resolver;
pub mod storage;
pub mod codec;
pub mod cache;
pub mod indexer;
pub mod replication;
pub mod namespace;
pub mod events;
pub mod config;
pub mod manager;
