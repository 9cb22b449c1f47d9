pub mod balancer;
pub mod pool;
pub mod proxy;
pub mod topology;

pub use balancer::WeightedBalancer;
pub use pool::{ClientPool, PoolState, UpstreamEndpoint};
pub use proxy::ReverseProxy;
pub use topology::{NodeInfo, SharedTopology, TopologyProvider, TopologySnapshot};
