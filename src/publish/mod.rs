//! Cluster state publication.
//!
//! The [`Publisher`] runs on the master; the [`ClusterStateApplier`] runs on
//! every node, the master included. They talk through a [`PublishTransport`].

pub mod applier;
pub mod publisher;
pub mod transport;

pub use applier::ClusterStateApplier;
pub use publisher::{Committed, PublicationRound, Publisher, RoundStatus};
pub use transport::{DeliveryStats, InMemoryTransport, PublishRequest, PublishResponse, PublishTransport};
