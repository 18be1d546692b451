//! Client contracts for the cloud services Corral drives.
//!
//! The conductor only ever talks to the identity service, the network
//! service, the load-balancer service, and the secret store through
//! these traits. Production deployments wire REST clients behind them;
//! the `memory` module provides functional in-process implementations
//! used by tests and by the conductor's dev mode.

pub mod identity;
pub mod loadbalancer;
pub mod memory;
pub mod network;
pub mod secrets;

pub use identity::IdentityClient;
pub use loadbalancer::{LoadBalancer, LoadBalancerClient, ProvisioningStatus};
pub use network::{FloatingIp, NetworkClient};
pub use secrets::SecretStore;
