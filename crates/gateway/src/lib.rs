//! Real-time resource gateway.
//!
//! Bridges WebSocket clients to a subject-based message bus. Clients
//! subscribe to hierarchical resources by name, receive an initial
//! snapshot, then a live stream of mutation events; they may also
//! invoke remote methods that route through the bus. Backend
//! subscriptions are deduplicated across clients, access is enforced
//! per client, and each client's view of its resource graph stays
//! consistent.
//!
//! ## Architecture
//!
//! ```text
//! bus: event.<rid>.<kind>, system.reset
//!         ↓
//! Cache (one event subscription per resource, worker pool)
//!         ↓ posts onto connection lanes
//! Conn (per-client subscription graph, transitive loader, GC)
//!         ↓
//! WebSocket clients
//! ```
//!
//! Two lanes of single-writer queues keep the core free of nested
//! locking: all tasks for one resource run serially on a cache worker,
//! and each connection serializes graph mutations and socket writes on
//! its own task.

pub mod cache;
pub mod codec;
pub mod conn;
pub mod error;
pub mod pattern;
pub mod protocol;
pub mod value;
pub mod ws_server;

pub use cache::{Cache, CacheConfig, CacheState, EventSubscription, ResourceEvent, ResourceView, Subscriber};
pub use codec::AccessResult;
pub use conn::{Conn, ConnHandle, ConnRegistry};
pub use error::{GatewayError, ResError, Result};
pub use pattern::Pattern;
pub use protocol::PROTOCOL_VERSION;
pub use value::{Collection, Model, Resource, Value};
pub use ws_server::{create_router, AppState};
