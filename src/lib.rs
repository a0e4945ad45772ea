//! revkv - A revisioned key-value store and the thin client facade over it
//!
//! revkv pairs a small, single-member MVCC store with a client that forwards
//! each logical operation to it in exactly one call. It focuses on clarity over
//! completeness.
//!
//! # Key Features
//!
//! - **Global revisions**: Every mutation advances one counter; reads can target any retained revision
//! - **Per-key history**: Create revision, mod revision and version on every record
//! - **Prefix and range reads**: Sorted, limited and paginated scans
//! - **Watches**: Ordered change events for a key or prefix, with explicit cancel
//! - **Leases**: Keys attached to a TTL are deleted by the store when it expires
//! - **Durable**: Optional write-ahead log and snapshots
//!
//! # Quick Start
//!
//! ```rust
//! use revkv::{Client, ClientConfig, Store};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), revkv::StoreError> {
//! let client = Client::local(Store::new(1), ClientConfig::default());
//! let kv = client.kv();
//!
//! let put = kv.put("fookey", "12").await?;
//! let got = kv.get("fookey").await?;
//! let record = got.kv().unwrap();
//! assert_eq!(record.value, b"12");
//! assert_eq!(record.mod_revision, put.revision());
//! client.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Every store mutation becomes a `StateOp` appended to a write-ahead log (WAL)
//! and then applied to the in-memory keyspace. Clients reach the store through
//! a [`transport::Transport`]: [`transport::HttpTransport`] talks to the API in
//! [`server`], [`transport::LocalTransport`] calls an embedded store directly.
//!
//! The core types you'll work with:
//! - [`Client`] - A session, created once and closed once
//! - [`Kv`] - Put, get, prefix get, historical get, delete
//! - [`Store`] - Thread-safe wrapper around the keyspace
//! - [`types::KeyValue`] - A key with its revision metadata
//!
//! # Non-goals
//!
//! revkv intentionally does NOT provide:
//! - Replication or consensus
//! - Transactions
//! - Authentication or access control

pub mod client;
pub mod error;
pub mod history;
pub mod kv;
pub mod ops;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;
pub mod wal;

pub use client::{Client, ClientConfig, Lease, WatchOptions, WatchStream, Watcher};
pub use error::{ConnectionError, StoreError};
pub use kv::{DeleteOptions, GetOptions, Kv, PutOptions};
pub use store::Store;
