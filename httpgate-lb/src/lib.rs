//! Load balancers, backend health tracking and the per-upstream transport
//! pool (spec §4.10 "Load Balancers" and the transport-pool row of §2's
//! component table).

pub mod backend;
pub mod balancer;
pub mod outlier;
pub mod transport;

pub use backend::{Backend, BackendSet};
pub use balancer::{Balancer, Selection, SelectionContext};
pub use outlier::OutlierEjectingWrapper;
pub use transport::{BackendClient, TransportConfig, TransportPool};
