//! Address selection for DISCOVER and adopted RENEW requests.
//!
//! Pool boundaries are sanitized into the server's subnet before any range
//! is walked. Matching reservations take priority, then the client's
//! requested address, then two passes over the dynamic pool: the first
//! prefers addresses no released client remembers, the second reuses
//! released ones (clearing the prior owner's address).

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::message::DhcpMessage;
use crate::reservation;
use crate::table::LeaseTable;

/// Picks an address for the client, or 0.0.0.0 when the pool is exhausted.
pub fn allocate(
    message: &DhcpMessage,
    table: &mut LeaseTable,
    config: &Config,
    now: DateTime<Utc>,
) -> Ipv4Addr {
    let hostname = message.hostname();

    if let Some(rule) = reservation::find_match(
        &config.reservations,
        message.hardware_address(),
        hostname,
    ) {
        let start = config.clamp_to_subnet(rule.pool_start);
        let end = config.clamp_to_subnet(rule.pool_end);
        for ip in range(start, end) {
            if is_free(ip, table, config, now, true) {
                return claim(ip, table);
            }
        }
        // Single-address reservations hand the address over even while a
        // stale record still holds it.
        if rule.preempt {
            return start;
        }
    }

    if let Some(requested) = message.requested_ip()
        && is_free(requested, table, config, now, true)
    {
        return claim(requested, table);
    }

    let (start, end) = config.pool_range();

    for ip in range(start, end) {
        if is_free(ip, table, config, now, false) {
            return ip;
        }
    }

    for ip in range(start, end) {
        if is_free(ip, table, config, now, true) {
            return claim(ip, table);
        }
    }

    Ipv4Addr::UNSPECIFIED
}

/// An address is free when it sits in the server's subnet, is not the
/// server's own, is not inside the decline-exclusion window, and no record
/// owns it (Released holders counting only when `reuse_released` is
/// false).
pub fn is_free(
    ip: Ipv4Addr,
    table: &LeaseTable,
    config: &Config,
    now: DateTime<Utc>,
    reuse_released: bool,
) -> bool {
    !ip.is_unspecified()
        && config.in_subnet(ip)
        && ip != config.server_ip
        && !table.is_excluded(ip, now, config.decline_hold())
        && !table.address_in_use(ip, reuse_released)
}

fn claim(ip: Ipv4Addr, table: &mut LeaseTable) -> Ipv4Addr {
    table.reclaim_released(ip);
    ip
}

fn range(start: Ipv4Addr, end: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let first = u32::from(start);
    let last = u32::from(end);
    (first..=last).map(Ipv4Addr::from)
}
