//! Reverse-DNS sweep windows.
//!
//! Around every resolved address, a window of nearby addresses inside the
//! owning netblock gets reverse-resolved; hosts tend to cluster, so the
//! neighbourhood of one finding is dense with others.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

/// Addresses probed on each side of the target.
pub const SWEEP_RADIUS: u32 = 100;

/// The sweep window around `addr` within `net`: the target itself and up
/// to [`SWEEP_RADIUS`] neighbours each way, clipped to the network's usable
/// hosts (network and broadcast excluded for v4).
pub fn sweep_addresses(addr: IpAddr, net: &IpNetwork) -> Vec<IpAddr> {
    match (addr, net) {
        (IpAddr::V4(ip), IpNetwork::V4(net)) => {
            if !net.contains(ip) {
                return Vec::new();
            }
            let base = u32::from(ip);
            let (mut lo, mut hi) = (
                base.saturating_sub(SWEEP_RADIUS),
                base.saturating_add(SWEEP_RADIUS),
            );
            if net.prefix() < 31 {
                let network = u32::from(net.network());
                let broadcast = u32::from(net.broadcast());
                lo = lo.max(network + 1);
                hi = hi.min(broadcast - 1);
            } else {
                lo = lo.max(u32::from(net.network()));
                hi = hi.min(u32::from(net.broadcast()));
            }
            (lo..=hi).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect()
        }
        (IpAddr::V6(ip), IpNetwork::V6(net)) => {
            if !net.contains(ip) {
                return Vec::new();
            }
            let base = u128::from(ip);
            let mask = u128::from(net.mask());
            let network = u128::from(net.network());
            let last = network | !mask;
            let lo = base.saturating_sub(SWEEP_RADIUS as u128).max(network);
            let hi = base.saturating_add(SWEEP_RADIUS as u128).min(last);
            (lo..=hi).map(|ip| IpAddr::V6(Ipv6Addr::from(ip))).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_around_the_middle_of_a_slash24() {
        let net: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let window = sweep_addresses("10.0.0.100".parse().unwrap(), &net);
        // .0 is clipped as the network address; .200 is the upper edge.
        assert_eq!(window.len(), 200);
        assert_eq!(window.first().unwrap().to_string(), "10.0.0.1");
        assert_eq!(window.last().unwrap().to_string(), "10.0.0.200");
        assert!(window.contains(&"10.0.0.100".parse().unwrap()));
    }

    #[test]
    fn window_clips_at_the_broadcast_edge() {
        let net: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let window = sweep_addresses("10.0.0.250".parse().unwrap(), &net);
        assert_eq!(window.first().unwrap().to_string(), "10.0.0.150");
        assert_eq!(window.last().unwrap().to_string(), "10.0.0.254");
    }

    #[test]
    fn out_of_block_addresses_yield_nothing() {
        let net: IpNetwork = "10.0.0.0/24".parse().unwrap();
        assert!(sweep_addresses("10.0.1.5".parse().unwrap(), &net).is_empty());
    }

    #[test]
    fn v6_windows_stay_inside_the_prefix() {
        let net: IpNetwork = "2001:db8::/64".parse().unwrap();
        let window = sweep_addresses("2001:db8::50".parse().unwrap(), &net);
        assert!(!window.is_empty());
        assert!(window.iter().all(|ip| net.contains(*ip)));
    }
}
