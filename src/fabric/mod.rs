//! Queue fabric: broker topology and the edge-side publisher.

pub mod publisher;
pub mod topology;

pub use publisher::{BrokerIngress, Ingress, IngressFactory, PublishError, RoomPublisher};
pub use topology::{
    connect_broker, declare_topology, queue_name, routing_key, DLQ_QUEUE, DLQ_ROUTING_KEY,
    DLX_EXCHANGE, EXCHANGE, MAX_QUEUE_LENGTH,
};
