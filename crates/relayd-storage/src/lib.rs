//! Durable storage for relayd: the SQLite-backed job queue and the
//! filesystem spool holding in-flight message artifacts.

pub mod db;
pub mod models;
pub mod queue;
pub mod spool;

pub use db::DatabasePool;
pub use queue::JobStore;
pub use spool::Spool;
