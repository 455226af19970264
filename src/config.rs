//! Runtime configuration
//!
//! Plain data; command-line parsing is left to the embedding program.
//! Field names map 1:1 to the recognized option names (`smp`,
//! `network-stack`, `dhcp`, `host-ipv4-addr`, `gw-ipv4-addr`,
//! `netmask-ipv4-addr`, `udpv4-queue-size`, `tap-device`).

use std::net::Ipv4Addr;

/// Tasks executed per main-loop iteration before the reactor yields to
/// the OS. Bounds how long a ready-future chain can starve I/O.
pub const DEFAULT_TASK_QUOTA: usize = 256;

/// Default depth of a UDP channel's receive buffer.
pub const DEFAULT_UDPV4_QUEUE_SIZE: usize = 128;

#[derive(Debug, Clone)]
pub struct Config {
    /// Shard count (`smp`). Defaults to the number of logical CPUs.
    pub smp: Option<usize>,
    /// Network stack registry entry (`network-stack`). Defaults to the
    /// registry's default stack.
    pub network_stack: Option<String>,
    /// Run DHCP on stack start (`dhcp`). Consumed by stacks that manage
    /// their own addressing.
    pub dhcp: bool,
    /// Static address configuration, used when `dhcp` is false.
    pub host_ipv4_addr: Option<Ipv4Addr>,
    pub gw_ipv4_addr: Option<Ipv4Addr>,
    pub netmask_ipv4_addr: Option<Ipv4Addr>,
    /// Receive queue depth for UDP channels (`udpv4-queue-size`).
    pub udpv4_queue_size: usize,
    /// Host tap device name (`tap-device`), for stacks that use one.
    pub tap_device: Option<String>,
    /// Tasks drained per main-loop iteration.
    pub task_quota: usize,
    /// Route SIGINT/SIGTERM into a clean shutdown.
    pub handle_sigint: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smp: None,
            network_stack: None,
            dhcp: true,
            host_ipv4_addr: None,
            gw_ipv4_addr: None,
            netmask_ipv4_addr: None,
            udpv4_queue_size: DEFAULT_UDPV4_QUEUE_SIZE,
            tap_device: None,
            task_quota: DEFAULT_TASK_QUOTA,
            handle_sigint: true,
        }
    }
}
