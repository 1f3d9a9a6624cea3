use crate::fault::FatalFault;
use crate::hal::{Clock, LeaseEvent, LinkStatus, MacAddress, Millis, NetworkLink};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkStats {
    pub renewals: u32,
    pub rebinds: u32,
}

/// Network link and address lease health. Every failure is fatal.
#[derive(Debug)]
pub struct LinkSupervisor<N: NetworkLink> {
    link: N,
    retry_delay_ms: Millis,
    stats: LinkStats,
}

impl<N: NetworkLink> LinkSupervisor<N> {
    pub fn new(link: N, retry_delay_ms: Millis) -> Self {
        Self {
            link,
            retry_delay_ms,
            stats: LinkStats::default(),
        }
    }

    /// Acquire an address once per boot. On failure, wait so the network
    /// has a chance to come up before the restart.
    pub fn setup<K: Clock>(&mut self, mac: &MacAddress, clock: &mut K) -> Result<Ipv4Addr, FatalFault> {
        info!("DHCP...");
        match self.link.begin(mac) {
            Some(address) => {
                info!("IP: {}", address);
                Ok(address)
            }
            None => {
                error!("DHCP fail");
                clock.delay_ms(self.retry_delay_ms);
                Err(FatalFault::AddressAcquisitionFailed)
            }
        }
    }

    pub fn check_link(&self) -> Result<(), FatalFault> {
        match self.link.link_status() {
            LinkStatus::Up => Ok(()),
            LinkStatus::Down | LinkStatus::Unknown => {
                error!("Conn lost");
                Err(FatalFault::LinkDown)
            }
        }
    }

    pub fn handle_lease_maintenance(&mut self) -> Result<(), FatalFault> {
        match self.link.maintain() {
            LeaseEvent::Nothing => Ok(()),
            LeaseEvent::Renewed => {
                self.stats.renewals += 1;
                info!("IP: {}", self.link.local_ip());
                Ok(())
            }
            LeaseEvent::Rebound => {
                self.stats.rebinds += 1;
                info!("IP: {}", self.link.local_ip());
                Ok(())
            }
            LeaseEvent::RenewFailed => {
                error!("Renew fail");
                Err(FatalFault::RenewFailed)
            }
            LeaseEvent::RebindFailed => {
                error!("Rebind fail");
                Err(FatalFault::RebindFailed)
            }
        }
    }

    /// Link check followed by lease maintenance, as run every iteration.
    pub fn maintain(&mut self) -> Result<(), FatalFault> {
        self.check_link()?;
        self.handle_lease_maintenance()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn link(&self) -> &N {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut N {
        &mut self.link
    }
}
