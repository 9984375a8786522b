use std::{collections::BTreeSet, net::Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Peer address pool: every host of `subnet` except the server's own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    pub subnet: Ipv4Net,
    pub server_address: Ipv4Addr,
}

impl AddressPool {
    pub fn new(subnet: Ipv4Net, server_address: Ipv4Addr) -> Self {
        Self {
            subnet: subnet.trunc(),
            server_address,
        }
    }

    /// Candidate peer addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.subnet.hosts().filter(move |ip| *ip != self.server_address)
    }

    pub fn capacity(&self) -> usize {
        self.hosts().count()
    }

    /**
     * @brief Smallest pool address not present in `reserved`.
     * @param reserved Host addresses already routed to peers (taken from the server config).
     * @return The address as a /32, or `PoolExhausted`.
     */
    pub fn next_available(&self, reserved: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Net> {
        let ip = self
            .hosts()
            .find(|ip| !reserved.contains(ip))
            .ok_or_else(|| Error::PoolExhausted {
                subnet: self.subnet.to_string(),
            })?;
        Ok(Ipv4Net::from(ip))
    }
}
