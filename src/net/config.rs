use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use typed_builder::TypedBuilder;

use super::wire::DEFAULT_TTL;

/// Magic carried by every frame header of the default network.
pub const DEFAULT_NETWORK_MAGIC: u64 = 0xfe7c_80a1_fe7c_80a1;

/// Tunables for a node. Every field has a default, so
/// `NodeConfig::builder().build()` is a working configuration.
#[derive(Clone, Debug, TypedBuilder)]
pub struct NodeConfig {
    /// Frames whose header carries a different magic are rejected.
    #[builder(default = DEFAULT_NETWORK_MAGIC)]
    pub network_magic: u64,
    /// Interface the listeners bind to.
    #[builder(default = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_ip: IpAddr,
    /// How often persistent peers without a connection are dialled.
    #[builder(default = Duration::from_millis(2500))]
    pub maintenance_interval: Duration,
    /// How often timed out calls are swept and routing caches aged.
    #[builder(default = Duration::from_secs(10))]
    pub cleanup_interval: Duration,
    /// Deadline given to every outbound call.
    #[builder(default = Duration::from_secs(30))]
    pub call_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    /// How long a seen broadcast is remembered for echo suppression.
    #[builder(default = Duration::from_secs(600))]
    pub echo_cache_ttl: Duration,
    #[builder(default = DEFAULT_TTL)]
    pub default_ttl: u8,
    #[builder(default = 64 * 1024 * 1024)]
    pub max_frame_len: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
