//! Host address allocation.
//!
//! An address is available when it is a host of the configured pool and is
//! covered by neither a reserved prefix nor a prefix already granted to a
//! peer. Callers must serialize allocation with the mutation that claims
//! the result; this module performs pure set math.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// No unclaimed host address remains in the pool.
#[derive(Debug, Error)]
#[error("address pool {pool} is exhausted")]
pub struct PoolExhausted {
    pub pool: IpNet,
}

fn covered(nets: &[IpNet], addr: &IpAddr) -> bool {
    nets.iter().any(|net| net.contains(addr))
}

/// Pick an available host address from `pool`, skipping `reserved`
/// exclusions and `claimed` grants. Which member is returned is not part of
/// the contract; the current implementation scans in ascending order.
pub fn pick_available(
    pool: IpNet,
    reserved: &[IpNet],
    claimed: &[IpNet],
) -> Result<IpAddr, PoolExhausted> {
    pool.hosts()
        .find(|addr| !covered(reserved, addr) && !covered(claimed, addr))
        .ok_or(PoolExhausted { pool })
}
