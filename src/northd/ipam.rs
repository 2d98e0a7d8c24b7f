//! Address management: per-switch IPv4 allocation bitmaps, EUI-64 IPv6
//! derivation, and the process-wide managed-MAC set.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::Ipv4Network;
use log::info;
use rand::Rng;
use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::utils::{LogLimiter, LportAddresses, MacAddr, V4Addr, V6Addr};
use crate::warn_rl;

use super::{Context, DaemonState, DpData};

const MAC_SUFFIX_SPACE: u32 = 0xff_ffff;

/// Managed MAC addresses: every MAC whose top 24 bits equal the process
/// prefix is tracked here for deduplication.
#[derive(Debug)]
pub struct Macam {
    prefix: u32,
    suffixes: BTreeSet<u32>,
}

impl Macam {
    pub fn new(prefix: u32) -> Self {
        Macam {
            prefix,
            suffixes: BTreeSet::new(),
        }
    }

    pub fn prefix(&self) -> u32 {
        self.prefix
    }

    pub fn is_managed(&self, mac: MacAddr) -> bool {
        mac.prefix() == self.prefix
    }

    /// Track a managed MAC; false means it was already in use
    pub fn claim(&mut self, mac: MacAddr) -> bool {
        self.suffixes.insert(mac.suffix())
    }

    pub fn contains(&self, mac: MacAddr) -> bool {
        self.suffixes.contains(&mac.suffix())
    }

    /// Allocate an unused MAC. The hint IPv4 seeds the starting suffix
    /// so MACs tend to track their port's address; suffixes 0 and
    /// 0xffffff are never produced.
    pub fn allocate(&mut self, hint: Option<Ipv4Addr>) -> Option<MacAddr> {
        let base = hint.map(|ip| u32::from(ip) & MAC_SUFFIX_SPACE).unwrap_or(0);
        for probe in 0..MAC_SUFFIX_SPACE - 1 {
            let suffix = ((base.wrapping_add(probe)) % (MAC_SUFFIX_SPACE - 1)) + 1;
            if self.suffixes.insert(suffix) {
                let value = (u64::from(self.prefix) << 24) | u64::from(suffix);
                return Some(MacAddr::from_u64(value));
            }
        }
        None
    }
}

/// Per-switch IPv4 allocation state
#[derive(Debug)]
pub struct Ipam {
    subnet: Ipv4Network,
    /// First usable host (network + 1); bitmap index 0
    start: u32,
    bitmap: crate::utils::Bitmap,
}

#[derive(Debug, PartialEq)]
pub enum Claim {
    Outside,
    Taken,
    Claimed,
}

impl Ipam {
    pub fn new(subnet: Ipv4Network) -> Self {
        let host_bits = 32 - u32::from(subnet.prefix());
        let total = (1usize << host_bits) - 2;
        let mut bitmap = crate::utils::Bitmap::new(total);
        // first usable address is reserved for the attached router
        bitmap.set(0);
        Ipam {
            subnet,
            start: u32::from(subnet.network()) + 1,
            bitmap,
        }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let value = u32::from(ip);
        if value < self.start || value >= self.start + self.bitmap.len() as u32 {
            return None;
        }
        Some((value - self.start) as usize)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).is_some()
    }

    pub fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).map(|i| self.bitmap.get(i)).unwrap_or(false)
    }

    pub fn claim(&mut self, ip: Ipv4Addr) -> Claim {
        match self.index_of(ip) {
            None => Claim::Outside,
            Some(index) => {
                if self.bitmap.set(index) {
                    Claim::Taken
                } else {
                    Claim::Claimed
                }
            }
        }
    }

    /// Mark an inclusive range as unavailable, clamped to the subnet
    pub fn exclude_range(&mut self, low: Ipv4Addr, high: Ipv4Addr) {
        let lo = u32::from(low).max(self.start);
        let hi = u32::from(high).min(self.start + self.bitmap.len() as u32 - 1);
        let mut value = lo;
        while value <= hi {
            if let Some(index) = self.index_of(Ipv4Addr::from(value)) {
                self.bitmap.set(index);
            }
            value += 1;
        }
    }

    /// Lowest free address, ascending
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let index = self.bitmap.first_clear()?;
        self.bitmap.set(index);
        Some(Ipv4Addr::from(self.start + index as u32))
    }
}

/// RFC 4291 modified EUI-64 interface identifier under a /64 prefix
pub fn eui64(mac: MacAddr, prefix: Ipv6Addr) -> Ipv6Addr {
    let o = mac.0;
    let iid: u64 = u64::from_be_bytes([
        o[0] ^ 0x02,
        o[1],
        o[2],
        0xff,
        0xfe,
        o[3],
        o[4],
        o[5],
    ]);
    let high = u128::from(prefix) & (u128::MAX << 64);
    Ipv6Addr::from(high | u128::from(iid))
}

/// Resolve the managed-MAC prefix: prefer persisted state, then the
/// northbound option, else draw one and persist it.
pub fn ensure_mac_prefix(nb: &mut NbDb, state: &mut DaemonState) -> u32 {
    if state.mac_prefix.is_none() {
        let global = nb.global_uuid();
        let configured = nb
            .global
            .get(&global)
            .and_then(|g| g.options.get("mac_prefix").cloned())
            .and_then(|text| parse_mac_prefix(&text));
        state.mac_prefix = Some(configured.unwrap_or_else(|| {
            let mut bytes: [u8; 3] = rand::thread_rng().gen();
            bytes[0] = (bytes[0] | 0x02) & 0xfe; // locally administered, unicast
            let prefix =
                (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);
            info!("generated managed MAC prefix {}", format_mac_prefix(prefix));
            prefix
        }));
    }
    let prefix = state.mac_prefix.expect("set above");
    let global = nb.global_uuid();
    nb.global.modify(&global, |g| {
        g.options
            .insert("mac_prefix".to_string(), format_mac_prefix(prefix));
    });
    prefix
}

pub fn parse_mac_prefix(text: &str) -> Option<u32> {
    let mut bytes = [0u8; 3];
    let mut count = 0;
    for part in text.split(':') {
        if count == 3 {
            return None;
        }
        bytes[count] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    if count != 3 {
        return None;
    }
    Some((u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]))
}

pub fn format_mac_prefix(prefix: u32) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}",
        (prefix >> 16) & 0xff,
        (prefix >> 8) & 0xff,
        prefix & 0xff
    )
}

/// What has to happen to one component of a port's dynamic addresses
#[derive(Debug, Clone, Copy, PartialEq)]
enum Update<T> {
    Keep(Option<T>),
    Static(T),
    Dynamic,
    Remove,
}

struct PendingUpdate {
    port: usize,
    switch: usize,
    mac: Update<MacAddr>,
    ip4: Update<Ipv4Addr>,
    ip6: Update<Ipv6Addr>,
}

/// The IPAM pass: initialize per-switch state, claim static and
/// peer-router addresses, then resolve every dynamic request in order.
pub fn run(nb: &mut NbDb, ctx: &mut Context) {
    init_switch_ipam(nb, ctx);
    claim_static_addresses(ctx);
    claim_router_port_addresses(ctx);

    let mut updates = Vec::new();
    for index in 0..ctx.ports.len() {
        if ctx.ports[index].dynamic.is_none() {
            continue;
        }
        if let Some(update) = plan_dynamic_update(nb, ctx, index) {
            updates.push(update);
        }
    }
    for update in updates {
        apply_dynamic_update(nb, ctx, update);
    }
}

fn init_switch_ipam(nb: &NbDb, ctx: &mut Context) {
    for dp in ctx.datapaths.iter_mut() {
        let switch = match &mut dp.data {
            DpData::Switch(s) => s,
            DpData::Router(_) => continue,
        };
        let subnet = match switch.subnet {
            Some(subnet) => subnet,
            None => continue,
        };
        let mut ipam = Ipam::new(subnet);
        if let Some(ls) = nb.switches.get(&switch.nb) {
            if let Some(text) = ls.other_config.get("exclude_ips") {
                parse_exclude_ips(&mut ipam, text, &switch.name, &mut ctx.warn);
            }
        }
        switch.ipam = Some(ipam);
    }
}

fn parse_exclude_ips(ipam: &mut Ipam, text: &str, switch: &str, warn: &mut LogLimiter) {
    for token in text.split_whitespace() {
        let (low, high) = if let Some(pos) = token.find("..") {
            (&token[..pos], &token[pos + 2..])
        } else {
            (token, token)
        };
        match (low.parse::<Ipv4Addr>(), high.parse::<Ipv4Addr>()) {
            (Ok(low), Ok(high)) if low <= high => ipam.exclude_range(low, high),
            _ => {
                warn_rl!(warn, "switch {}: bad exclude_ips token '{}'", switch, token);
            }
        }
    }
}

fn claim_static_addresses(ctx: &mut Context) {
    for index in 0..ctx.ports.len() {
        let dp = match ctx.ports[index].dp {
            Some(dp) => dp,
            None => continue,
        };
        if !ctx.ports[index].is_nb() || ctx.ports[index].derived {
            continue;
        }
        let addrs: Vec<LportAddresses> = ctx.ports[index].addrs.clone();
        let name = ctx.ports[index].name.clone();
        for entry in &addrs {
            if ctx.macam.is_managed(entry.ea) && !ctx.macam.claim(entry.ea) {
                warn_rl!(ctx.warn, "port {}: duplicate MAC {}", name, entry.ea);
            }
            let switch = match ctx.datapaths[dp].as_switch_mut() {
                Some(s) => s,
                None => continue,
            };
            if let Some(ipam) = switch.ipam.as_mut() {
                for v4 in &entry.ipv4 {
                    if ipam.claim(v4.addr) == Claim::Taken {
                        warn_rl!(ctx.warn, "port {}: duplicate IPv4 {}", name, v4.addr);
                    }
                }
            }
        }
        if let Some(networks) = ctx.ports[index].networks.clone() {
            if ctx.macam.is_managed(networks.ea) && !ctx.macam.claim(networks.ea) {
                warn_rl!(ctx.warn, "port {}: duplicate MAC {}", name, networks.ea);
            }
        }
    }
}

/// A router port facing a switch with a subnet owns its first IPv4
/// there; the subnet's first usable host is already reserved.
fn claim_router_port_addresses(ctx: &mut Context) {
    for dp_index in 0..ctx.datapaths.len() {
        let router_ports = match ctx.datapaths[dp_index].as_switch() {
            Some(s) if s.ipam.is_some() => s.router_ports.clone(),
            _ => continue,
        };
        for rp in router_ports {
            let first = ctx.ports[rp]
                .networks
                .as_ref()
                .and_then(|n| n.ipv4.first())
                .map(|v4| v4.addr);
            if let Some(addr) = first {
                let switch = ctx.datapaths[dp_index].as_switch_mut().expect("switch");
                let ipam = switch.ipam.as_mut().expect("ipam");
                if addr != ipam.start() {
                    ipam.claim(addr);
                }
            }
        }
    }
}

fn plan_dynamic_update(nb: &NbDb, ctx: &mut Context, index: usize) -> Option<PendingUpdate> {
    let dp_index = ctx.ports[index].dp?;
    let request = ctx.ports[index].dynamic.clone()?;
    let lsp_uuid = ctx.ports[index].lsp_uuid()?;
    let current_text = nb
        .switch_ports
        .get(&lsp_uuid)
        .and_then(|lsp| lsp.dynamic_addresses.clone());
    let current = current_text
        .as_deref()
        .and_then(|text| LportAddresses::from_entry(text).ok());
    let (has_subnet, ipv6_prefix) = match ctx.datapaths[dp_index].as_switch() {
        Some(s) => (s.ipam.is_some(), s.ipv6_prefix),
        None => return None,
    };

    let cur_mac = current.as_ref().map(|c| c.ea);
    let cur_ip4 = current.as_ref().and_then(|c| c.ipv4.first()).map(|v| v.addr);
    let cur_ip6 = current.as_ref().and_then(|c| c.ipv6.first()).map(|v| v.addr);

    let mac = match request.mac {
        Some(requested) => {
            if cur_mac == Some(requested) {
                Update::Keep(cur_mac)
            } else {
                Update::Static(requested)
            }
        }
        None => match cur_mac {
            Some(mac) if ctx.macam.is_managed(mac) => Update::Keep(cur_mac),
            _ => Update::Dynamic,
        },
    };

    let ip4 = if !has_subnet {
        if cur_ip4.is_some() {
            Update::Remove
        } else {
            Update::Keep(None)
        }
    } else {
        match request.ip4 {
            Some(requested) if cur_ip4 != Some(requested) => Update::Static(requested),
            _ => match cur_ip4 {
                None => Update::Dynamic,
                Some(addr) => {
                    let switch = ctx.datapaths[dp_index].as_switch_mut().expect("switch");
                    let ipam = switch.ipam.as_mut().expect("checked");
                    match ipam.claim(addr) {
                        Claim::Claimed => Update::Keep(cur_ip4),
                        // outside the subnet, or colliding with an
                        // exclusion or an earlier claim
                        Claim::Outside | Claim::Taken => Update::Dynamic,
                    }
                }
            },
        }
    };

    let ip6 = if ipv6_prefix.is_none() {
        if cur_ip6.is_some() {
            Update::Remove
        } else {
            Update::Keep(None)
        }
    } else {
        match request.ip6 {
            Some(requested) if cur_ip6 != Some(requested) => Update::Static(requested),
            _ => match cur_ip6 {
                None => Update::Dynamic,
                Some(addr) => {
                    let prefix = ipv6_prefix.expect("checked");
                    let same_prefix =
                        u128::from(addr) >> 64 == u128::from(prefix) >> 64;
                    if same_prefix {
                        Update::Keep(cur_ip6)
                    } else {
                        Update::Dynamic
                    }
                }
            },
        }
    };

    let unchanged = matches!(mac, Update::Keep(_))
        && matches!(ip4, Update::Keep(_))
        && matches!(ip6, Update::Keep(_));
    if unchanged {
        if let Some(current) = current {
            if ctx.macam.is_managed(current.ea) && !ctx.macam.claim(current.ea) {
                warn_rl!(
                    ctx.warn,
                    "port {}: duplicate dynamic MAC {}",
                    ctx.ports[index].name,
                    current.ea
                );
            }
            ctx.ports[index].addrs.push(current);
        }
        return None;
    }
    Some(PendingUpdate {
        port: index,
        switch: dp_index,
        mac,
        ip4,
        ip6,
    })
}

fn apply_dynamic_update(nb: &mut NbDb, ctx: &mut Context, update: PendingUpdate) {
    let name = ctx.ports[update.port].name.clone();
    let ip4 = match update.ip4 {
        Update::Keep(value) => value,
        Update::Remove => None,
        Update::Static(addr) => {
            let switch = ctx.datapaths[update.switch].as_switch_mut().expect("switch");
            let ipam = switch.ipam.as_mut().expect("subnet present");
            match ipam.claim(addr) {
                Claim::Claimed => Some(addr),
                Claim::Taken => {
                    warn_rl!(ctx.warn, "port {}: requested IPv4 {} in use", name, addr);
                    None
                }
                Claim::Outside => {
                    warn_rl!(
                        ctx.warn,
                        "port {}: requested IPv4 {} outside subnet",
                        name,
                        addr
                    );
                    None
                }
            }
        }
        Update::Dynamic => {
            let switch = ctx.datapaths[update.switch].as_switch_mut().expect("switch");
            let ipam = switch.ipam.as_mut().expect("subnet present");
            let allocated = ipam.allocate();
            if allocated.is_none() {
                warn_rl!(ctx.warn, "port {}: subnet exhausted", name);
            }
            allocated
        }
    };
    let mac = match update.mac {
        Update::Keep(value) => {
            if let Some(mac) = value {
                if ctx.macam.is_managed(mac) {
                    ctx.macam.claim(mac);
                }
            }
            value
        }
        Update::Remove => None,
        Update::Static(mac) => {
            if ctx.macam.is_managed(mac) && !ctx.macam.claim(mac) {
                warn_rl!(ctx.warn, "port {}: requested MAC {} in use", name, mac);
            }
            Some(mac)
        }
        Update::Dynamic => {
            let allocated = ctx.macam.allocate(ip4);
            if allocated.is_none() {
                warn_rl!(ctx.warn, "port {}: MAC space exhausted", name);
            }
            allocated
        }
    };
    let mac = match mac {
        Some(mac) => mac,
        // without a MAC the port cannot get addresses this pass
        None => return,
    };
    let ip6 = match update.ip6 {
        Update::Keep(value) => value,
        Update::Remove => None,
        Update::Static(addr) => Some(addr),
        Update::Dynamic => {
            let prefix = ctx.datapaths[update.switch]
                .as_switch()
                .and_then(|s| s.ipv6_prefix)
                .expect("prefix present");
            Some(eui64(mac, prefix))
        }
    };

    let mut resolved = LportAddresses::new(mac);
    if let Some(addr) = ip4 {
        resolved.ipv4.push(V4Addr::host(addr));
    }
    if let Some(addr) = ip6 {
        resolved.ipv6.push(V6Addr::host(addr));
    }
    let text = resolved.to_entry();
    if let Some(lsp_uuid) = ctx.ports[update.port].lsp_uuid() {
        nb.switch_ports.modify(&lsp_uuid, |lsp| {
            lsp.dynamic_addresses = Some(text.clone());
        });
    }
    ctx.ports[update.port].addrs.push(resolved);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipam_first_usable_reserved() {
        let mut ipam = Ipam::new("10.0.0.0/24".parse().unwrap());
        assert_eq!(ipam.start(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            ipam.allocate(),
            Some("10.0.0.2".parse::<Ipv4Addr>().unwrap())
        );
    }

    #[test]
    fn test_ipam_exclusions_and_claims() {
        let mut ipam = Ipam::new("10.0.0.0/24".parse().unwrap());
        ipam.exclude_range(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        );
        assert_eq!(
            ipam.allocate(),
            Some("10.0.0.4".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(ipam.claim("10.0.0.5".parse().unwrap()), Claim::Claimed);
        assert_eq!(ipam.claim("10.0.0.5".parse().unwrap()), Claim::Taken);
        assert_eq!(ipam.claim("10.9.0.5".parse().unwrap()), Claim::Outside);
        // broadcast is never allocatable
        assert!(!ipam.contains("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn test_macam_allocate_hint() {
        let mut macam = Macam::new(0x0a0020);
        let mac = macam
            .allocate(Some("10.0.0.2".parse().unwrap()))
            .unwrap();
        assert_eq!(mac.prefix(), 0x0a0020);
        assert!(mac.suffix() > 0 && mac.suffix() < 0xffffff);
        let again = macam
            .allocate(Some("10.0.0.2".parse().unwrap()))
            .unwrap();
        assert_ne!(mac, again);
    }

    #[test]
    fn test_macam_external_not_managed() {
        let macam = Macam::new(0x0a0020);
        let external: MacAddr = "ae:11:22:33:44:55".parse().unwrap();
        assert!(!macam.is_managed(external));
    }

    #[test]
    fn test_eui64() {
        let mac: MacAddr = "00:16:3e:12:34:56".parse().unwrap();
        let prefix: Ipv6Addr = "2001:db8::".parse().unwrap();
        assert_eq!(
            eui64(mac, prefix),
            "2001:db8::216:3eff:fe12:3456".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_mac_prefix_roundtrip() {
        assert_eq!(parse_mac_prefix("0a:00:20"), Some(0x0a0020));
        assert_eq!(format_mac_prefix(0x0a0020), "0a:00:20");
        assert_eq!(parse_mac_prefix("nope"), None);
        assert_eq!(parse_mac_prefix("0a:00"), None);
    }
}
