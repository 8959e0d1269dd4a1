pub mod client;
pub mod config;
pub mod consumer;
pub mod edge;
pub mod fabric;
pub mod metrics;
pub mod storage;
pub mod types;

pub use client::{CircuitBreaker, ConnectionPool, LoadClientConfig};
pub use config::{BrokerConfig, BusConfig, ConsumerConfig, DbConfig};
pub use consumer::ConsumerService;
pub use edge::{BusBridge, EdgeApp, RoomMembership};
pub use fabric::{BrokerIngress, Ingress, IngressFactory};
pub use metrics::{ClientCounters, ConsumerCounters, EdgeCounters};
pub use storage::{MessageStore, Storage, StorageError};
pub use types::*;
