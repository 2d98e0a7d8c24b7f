//! Logical-router pipeline synthesis: admission, neighbor learning,
//! L3 input handling, the NAT stages (centralized and distributed),
//! load balancing, router advertisements, routing, policies, ARP
//! resolution, MTU checks, gateway redirection, and delivery.
//!
//! Flows are produced in two phases: first every router's northbound
//! rows are parsed into an owned, validated `RouterCtx` (malformed rows
//! are dropped with a rate-limited warning), then pure string
//! generation runs over the validated contexts.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::SbDb;
use crate::lflow;
use crate::utils::{MacAddr, V6Addr};
use crate::warn_rl;

use super::flow::{hint, LflowSet};
use super::lswitch::parse_vip;
use super::multicast::{McastGroups, MC_STATIC};
use super::stage::Stage::*;
use super::{Context, DpData};

const REGBIT_NAT_REDIRECT: &str = "reg9[0]";
const REGBIT_DISTRIBUTED_NAT: &str = "reg9[1]";
const REGBIT_PKT_LARGER: &str = "reg9[2]";
const REGBIT_ND_RA_OPTS: &str = "reg9[3]";
const REGBIT_LOOKUP_NEIGHBOR: &str = "reg9[4]";
const REGBIT_EGRESS_LOOPBACK: &str = "reg9[5]";

/// A northbound NAT row reduced to what the flow builders need; only
/// IPv4 rules are realized
#[derive(Debug, Clone)]
struct NatEntry {
    uuid: Uuid,
    nat_type: String,
    external_ip: Ipv4Addr,
    external_mac: Option<MacAddr>,
    logical_ip: Ipv4Addr,
    logical_plen: u8,
    logical_port: Option<String>,
    stateless: bool,
}

impl NatEntry {
    fn is_snat(&self) -> bool {
        self.nat_type == "snat" || self.nat_type == "dnat_and_snat"
    }

    fn is_dnat(&self) -> bool {
        self.nat_type == "dnat" || self.nat_type == "dnat_and_snat"
    }

    /// Handled on the chassis hosting the logical port rather than the
    /// gateway chassis
    fn is_distributed(&self) -> bool {
        self.nat_type == "dnat_and_snat"
            && self.external_mac.is_some()
            && self.logical_port.is_some()
    }

    fn logical_match(&self) -> String {
        if self.logical_plen == 32 {
            self.logical_ip.to_string()
        } else {
            format!("{}/{}", self.logical_ip, self.logical_plen)
        }
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    uuid: Uuid,
    prefix: IpNetwork,
    nexthop: Option<IpAddr>,
    is_src: bool,
    /// Resolved output port (name, mac, source address for the family)
    out_port: String,
    out_mac: MacAddr,
    src_ip: IpAddr,
}

#[derive(Debug, Clone)]
enum PolicyAction {
    Allow,
    Drop,
    Reroute {
        nexthop: IpAddr,
        out_port: String,
        out_mac: MacAddr,
    },
}

#[derive(Debug, Clone)]
struct PolicyEntry {
    uuid: Uuid,
    priority: u16,
    match_: String,
    action: PolicyAction,
}

#[derive(Debug, Clone)]
struct LbVip {
    uuid: Uuid,
    family: &'static str,
    vip: String,
    port: Option<u16>,
    protocol: String,
    backends: String,
}

/// One router's validated view for flow generation
struct RouterCtx {
    dp: usize,
    is_gateway: bool,
    relay: bool,
    flood_static: bool,
    /// Non-derived router ports
    ports: Vec<usize>,
    dgp: Option<usize>,
    redirect: Option<usize>,
    gateway_mtu: Option<u32>,
    nats: Vec<NatEntry>,
    routes: Vec<RouteEntry>,
    policies: Vec<PolicyEntry>,
    vips: Vec<LbVip>,
}

impl RouterCtx {
    fn dgp_name<'a>(&self, ctx: &'a Context) -> Option<&'a str> {
        self.dgp.map(|index| ctx.ports[index].name.as_str())
    }

    fn redirect_name<'a>(&self, ctx: &'a Context) -> Option<&'a str> {
        self.redirect.map(|index| ctx.ports[index].name.as_str())
    }
}

pub fn build_lrouter_flows(
    ctx: &mut Context,
    nb: &NbDb,
    sb: &SbDb,
    flows: &mut LflowSet,
    mcast: &McastGroups,
) {
    let routers = collect_routers(ctx, nb);
    for rc in &routers {
        build_admission(ctx, nb, rc, flows);
        build_neighbor_stages(rc, flows);
        build_ip_input(ctx, nb, rc, flows);
        build_defrag(rc, flows);
        build_unsnat(ctx, rc, flows);
        build_dnat(ctx, rc, flows);
        build_nd_ra(ctx, nb, rc, flows);
        build_routing(ctx, rc, mcast, flows);
        build_policies(rc, flows);
        build_arp_resolve(ctx, nb, sb, rc, flows);
        build_pkt_len(ctx, nb, rc, flows);
        build_gw_redirect(ctx, rc, flows);
        build_arp_request(rc, flows);
        build_undnat(ctx, rc, flows);
        build_snat(ctx, rc, flows);
        build_egr_loop(ctx, rc, flows);
        build_delivery(ctx, nb, rc, flows);
    }
}

fn collect_routers(ctx: &mut Context, nb: &NbDb) -> Vec<RouterCtx> {
    let mut routers = Vec::new();
    for dp in 0..ctx.datapaths.len() {
        let (nb_uuid, is_gateway, relay, flood_static, dgp, redirect) =
            match &ctx.datapaths[dp].data {
                DpData::Router(router) => (
                    router.nb,
                    router.chassis.is_some(),
                    router.mcast.relay,
                    router.mcast.flood_static,
                    router.l3dgw_port,
                    router.redirect_port,
                ),
                DpData::Switch(_) => continue,
            };
        let ports: Vec<usize> = ctx.datapaths[dp]
            .ports
            .iter()
            .copied()
            .filter(|&index| !ctx.ports[index].derived)
            .collect();
        let gateway_mtu = dgp
            .and_then(|index| ctx.ports[index].lrp_uuid())
            .and_then(|uuid| nb.router_ports.get(&uuid))
            .and_then(|lrp| lrp.options.get("gateway_mtu"))
            .and_then(|text| text.parse().ok());
        let nats = collect_nats(ctx, nb, nb_uuid);
        let routes = collect_routes(ctx, nb, nb_uuid, dp, &ports);
        let policies = collect_policies(ctx, nb, nb_uuid, dp, &ports);
        let vips = collect_vips(nb, nb_uuid);
        routers.push(RouterCtx {
            dp,
            is_gateway,
            relay,
            flood_static,
            ports,
            dgp,
            redirect,
            gateway_mtu,
            nats,
            routes,
            policies,
            vips,
        });
    }
    routers
}

fn collect_nats(ctx: &mut Context, nb: &NbDb, router_nb: Uuid) -> Vec<NatEntry> {
    let lr = match nb.routers.get(&router_nb) {
        Some(lr) => lr,
        None => return Vec::new(),
    };
    let mut entries = Vec::new();
    for nat_uuid in &lr.nat {
        let nat = match nb.nats.get(nat_uuid) {
            Some(nat) => nat,
            None => continue,
        };
        let is_dnat_like = nat.nat_type == "dnat" || nat.nat_type == "dnat_and_snat";
        let external_ip = match nat.external_ip.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                warn_rl!(
                    ctx.warn,
                    "router {}: NAT external_ip '{}' is not IPv4",
                    lr.name,
                    nat.external_ip
                );
                continue;
            }
        };
        let (logical_ip, logical_plen) = if let Ok(ip) = nat.logical_ip.parse::<Ipv4Addr>() {
            (ip, 32)
        } else if let Ok(net) = nat.logical_ip.parse::<Ipv4Network>() {
            (net.ip(), net.prefix())
        } else {
            warn_rl!(
                ctx.warn,
                "router {}: NAT logical_ip '{}' is not IPv4",
                lr.name,
                nat.logical_ip
            );
            continue;
        };
        if is_dnat_like && logical_plen != 32 {
            warn_rl!(
                ctx.warn,
                "router {}: DNAT logical_ip '{}' must be a host address",
                lr.name,
                nat.logical_ip
            );
            continue;
        }
        let external_mac = match &nat.external_mac {
            Some(text) => match text.parse::<MacAddr>() {
                Ok(mac) => Some(mac),
                Err(_) => {
                    warn_rl!(
                        ctx.warn,
                        "router {}: bad NAT external_mac '{}'",
                        lr.name,
                        text
                    );
                    continue;
                }
            },
            None => None,
        };
        entries.push(NatEntry {
            uuid: nat.uuid,
            nat_type: nat.nat_type.clone(),
            external_ip,
            external_mac,
            logical_ip,
            logical_plen,
            logical_port: nat.logical_port.clone(),
            stateless: nat.is_stateless(),
        });
    }
    entries.sort_by_key(|nat| nat.uuid);
    entries
}

/// Find the router port a next hop is reachable through
fn port_for_nexthop(ctx: &Context, ports: &[usize], nexthop: IpAddr) -> Option<usize> {
    for &index in ports {
        let networks = match &ctx.ports[index].networks {
            Some(networks) => networks,
            None => continue,
        };
        match nexthop {
            IpAddr::V4(v4) => {
                for net in &networks.ipv4 {
                    let prefix = Ipv4Network::new(net.addr, net.plen).ok()?;
                    if prefix.contains(v4) {
                        return Some(index);
                    }
                }
            }
            IpAddr::V6(v6) => {
                for net in &networks.ipv6 {
                    let masked = V6Addr { addr: v6, plen: net.plen };
                    if masked.network() == net.network() {
                        return Some(index);
                    }
                }
            }
        }
    }
    None
}

fn port_src_ip(ctx: &Context, index: usize, v6: bool) -> Option<IpAddr> {
    let networks = ctx.ports[index].networks.as_ref()?;
    if v6 {
        networks.ipv6.first().map(|net| IpAddr::V6(net.addr))
    } else {
        networks.ipv4.first().map(|net| IpAddr::V4(net.addr))
    }
}

fn collect_routes(
    ctx: &mut Context,
    nb: &NbDb,
    router_nb: Uuid,
    _dp: usize,
    ports: &[usize],
) -> Vec<RouteEntry> {
    let lr = match nb.routers.get(&router_nb) {
        Some(lr) => lr,
        None => return Vec::new(),
    };
    let mut entries = Vec::new();
    for route_uuid in &lr.static_routes {
        let route = match nb.static_routes.get(route_uuid) {
            Some(route) => route,
            None => continue,
        };
        let prefix: IpNetwork = match route.ip_prefix.parse() {
            Ok(prefix) => prefix,
            Err(_) => {
                warn_rl!(
                    ctx.warn,
                    "router {}: bad route prefix '{}'",
                    lr.name,
                    route.ip_prefix
                );
                continue;
            }
        };
        let nexthop: IpAddr = match route.nexthop.parse() {
            Ok(nexthop) => nexthop,
            Err(_) => {
                warn_rl!(
                    ctx.warn,
                    "router {}: bad route nexthop '{}'",
                    lr.name,
                    route.nexthop
                );
                continue;
            }
        };
        if prefix.is_ipv4() != nexthop.is_ipv4() {
            warn_rl!(
                ctx.warn,
                "router {}: route {} and nexthop {} mix families",
                lr.name,
                route.ip_prefix,
                route.nexthop
            );
            continue;
        }
        let out_index = match &route.output_port {
            Some(name) => ctx
                .port_by_name
                .get(name)
                .copied()
                .filter(|index| ports.contains(index)),
            None => port_for_nexthop(ctx, ports, nexthop),
        };
        let out_index = match out_index {
            Some(index) => index,
            None => {
                warn_rl!(
                    ctx.warn,
                    "router {}: no port can reach nexthop {}",
                    lr.name,
                    route.nexthop
                );
                continue;
            }
        };
        let (out_mac, src_ip) = match (
            ctx.ports[out_index].networks.as_ref().map(|n| n.ea),
            port_src_ip(ctx, out_index, nexthop.is_ipv6()),
        ) {
            (Some(mac), Some(src_ip)) => (mac, src_ip),
            _ => continue,
        };
        entries.push(RouteEntry {
            uuid: route.uuid,
            prefix,
            nexthop: Some(nexthop),
            is_src: route.policy.as_deref() == Some("src-ip"),
            out_port: ctx.ports[out_index].name.clone(),
            out_mac,
            src_ip,
        });
    }
    entries.sort_by_key(|entry| entry.uuid);
    entries
}

fn collect_policies(
    ctx: &mut Context,
    nb: &NbDb,
    router_nb: Uuid,
    _dp: usize,
    ports: &[usize],
) -> Vec<PolicyEntry> {
    let lr = match nb.routers.get(&router_nb) {
        Some(lr) => lr,
        None => return Vec::new(),
    };
    let mut entries = Vec::new();
    for policy_uuid in &lr.policies {
        let policy = match nb.policies.get(policy_uuid) {
            Some(policy) => policy,
            None => continue,
        };
        let action = match policy.action.as_str() {
            "allow" => PolicyAction::Allow,
            "drop" => PolicyAction::Drop,
            "reroute" => {
                let nexthop: IpAddr = match policy.nexthop.as_deref().and_then(|t| t.parse().ok())
                {
                    Some(nexthop) => nexthop,
                    None => {
                        warn_rl!(
                            ctx.warn,
                            "router {}: reroute policy without valid nexthop",
                            lr.name
                        );
                        continue;
                    }
                };
                let out_index = match port_for_nexthop(ctx, ports, nexthop) {
                    Some(index) => index,
                    None => {
                        warn_rl!(
                            ctx.warn,
                            "router {}: no port can reach reroute nexthop {}",
                            lr.name,
                            nexthop
                        );
                        continue;
                    }
                };
                let out_mac = match ctx.ports[out_index].networks.as_ref().map(|n| n.ea) {
                    Some(mac) => mac,
                    None => continue,
                };
                PolicyAction::Reroute {
                    nexthop,
                    out_port: ctx.ports[out_index].name.clone(),
                    out_mac,
                }
            }
            other => {
                warn_rl!(ctx.warn, "router {}: unknown policy action '{}'", lr.name, other);
                continue;
            }
        };
        entries.push(PolicyEntry {
            uuid: policy.uuid,
            priority: policy.priority,
            match_: policy.match_.clone(),
            action,
        });
    }
    entries.sort_by_key(|entry| entry.uuid);
    entries
}

fn collect_vips(nb: &NbDb, router_nb: Uuid) -> Vec<LbVip> {
    let lr = match nb.routers.get(&router_nb) {
        Some(lr) => lr,
        None => return Vec::new(),
    };
    let mut vips = Vec::new();
    for lb_uuid in &lr.load_balancer {
        let lb = match nb.load_balancers.get(lb_uuid) {
            Some(lb) => lb,
            None => continue,
        };
        let protocol = lb.protocol.clone().unwrap_or_else(|| "tcp".to_string());
        for (key, backends) in &lb.vips {
            if let Some((vip, port)) = parse_vip(key) {
                let family = if vip.contains(':') { "ip6" } else { "ip4" };
                vips.push(LbVip {
                    uuid: lb.uuid,
                    family,
                    vip,
                    port,
                    protocol: protocol.clone(),
                    backends: backends.clone(),
                });
            }
        }
    }
    vips.sort_by(|a, b| (a.uuid, &a.vip, a.port).cmp(&(b.uuid, &b.vip, b.port)));
    vips
}

/// Table 0: L2 admission
fn build_admission(ctx: &Context, nb: &NbDb, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInAdmission, 100, "vlan.present || eth.src[40]", "drop;");
    for &index in &rc.ports {
        let port = &ctx.ports[index];
        let lrp = match port.lrp_uuid().and_then(|uuid| nb.router_ports.get(&uuid)) {
            Some(lrp) => lrp,
            None => continue,
        };
        if !lrp.is_enabled() {
            continue;
        }
        let networks = match &port.networks {
            Some(networks) => networks,
            None => continue,
        };
        let tag = hint(lrp.uuid);
        lflow!(
            flows,
            rc.dp,
            RouterInAdmission,
            50,
            format!("eth.mcast && inport == \"{}\"", port.name),
            "next;",
            tag
        );
        let mut unicast = format!(
            "eth.dst == {} && inport == \"{}\"",
            networks.ea, port.name
        );
        if Some(index) == rc.dgp {
            if let Some(redirect) = rc.redirect_name(ctx) {
                unicast.push_str(&format!(" && is_chassis_resident(\"{}\")", redirect));
            }
        }
        lflow!(flows, rc.dp, RouterInAdmission, 50, unicast, "next;", tag);
    }
}

/// Tables 1-2: neighbor lookup and learning
fn build_neighbor_stages(rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(
        flows,
        rc.dp,
        RouterInLookupNeighbor,
        100,
        "arp.op == 2",
        format!("{} = lookup_arp(inport, arp.spa, arp.sha); next;", REGBIT_LOOKUP_NEIGHBOR)
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLookupNeighbor,
        100,
        "nd_na",
        format!("{} = lookup_nd(inport, nd.target, nd.tll); next;", REGBIT_LOOKUP_NEIGHBOR)
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLookupNeighbor,
        100,
        "nd_ns",
        format!("{} = lookup_nd(inport, ip6.src, nd.sll); next;", REGBIT_LOOKUP_NEIGHBOR)
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLookupNeighbor,
        0,
        "1",
        format!("{} = 1; next;", REGBIT_LOOKUP_NEIGHBOR)
    );

    lflow!(
        flows,
        rc.dp,
        RouterInLearnNeighbor,
        100,
        format!("{} == 1", REGBIT_LOOKUP_NEIGHBOR),
        "next;"
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLearnNeighbor,
        90,
        "arp",
        "put_arp(inport, arp.spa, arp.sha); next;"
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLearnNeighbor,
        90,
        "nd_na",
        "put_nd(inport, nd.target, nd.tll); next;"
    );
    lflow!(
        flows,
        rc.dp,
        RouterInLearnNeighbor,
        90,
        "nd_ns",
        "put_nd(inport, ip6.src, nd.sll); next;"
    );
    lflow!(flows, rc.dp, RouterInLearnNeighbor, 0, "1", "next;");
}

fn fmt_set(values: &[String]) -> String {
    if values.len() == 1 {
        values[0].clone()
    } else {
        format!("{{{}}}", values.join(", "))
    }
}

/// Table 3: L3 admission, router-owned addresses, NAT responders
fn build_ip_input(ctx: &Context, nb: &NbDb, rc: &RouterCtx, flows: &mut LflowSet) {
    // martians and broadcast
    lflow!(
        flows,
        rc.dp,
        RouterInIpInput,
        100,
        "ip4.src_mcast || ip4.src == 255.255.255.255 || ip4.src == 127.0.0.0/8 || \
         ip4.dst == 127.0.0.0/8 || ip4.src == 0.0.0.0/8 || ip4.dst == 0.0.0.0/8",
        "drop;"
    );
    lflow!(flows, rc.dp, RouterInIpInput, 100, "ip4.dst == 255.255.255.255", "drop;");
    if !rc.relay {
        lflow!(flows, rc.dp, RouterInIpInput, 100, "ip4.mcast || ip6.mcast", "drop;");
    }
    // RS/RA are consumed by the RA stages
    lflow!(flows, rc.dp, RouterInIpInput, 94, "nd_rs || nd_ra", "next;");
    // ARP/ND not answered above falls through to routing of no use
    lflow!(flows, rc.dp, RouterInIpInput, 85, "arp || nd", "drop;");
    lflow!(flows, rc.dp, RouterInIpInput, 30, "ip4 && ip.ttl == {0, 1}", "drop;");
    lflow!(flows, rc.dp, RouterInIpInput, 0, "1", "next;");

    let snat_ips: BTreeSet<Ipv4Addr> = rc
        .nats
        .iter()
        .filter(|nat| nat.is_snat())
        .map(|nat| nat.external_ip)
        .collect();

    for &index in &rc.ports {
        let port = &ctx.ports[index];
        let lrp = match port.lrp_uuid().and_then(|uuid| nb.router_ports.get(&uuid)) {
            Some(lrp) => lrp,
            None => continue,
        };
        if !lrp.is_enabled() {
            continue;
        }
        let networks = match &port.networks {
            Some(networks) => networks,
            None => continue,
        };
        let tag = hint(lrp.uuid);
        let resident = if Some(index) == rc.dgp {
            rc.redirect_name(ctx)
                .map(|name| format!(" && is_chassis_resident(\"{}\")", name))
                .unwrap_or_default()
        } else {
            String::new()
        };

        for net in &networks.ipv4 {
            // ARP for the port address, scoped to the attached network
            lflow!(
                flows,
                rc.dp,
                RouterInIpInput,
                90,
                format!(
                    "inport == \"{}\" && arp.spa == {} && arp.tpa == {} && arp.op == 1{}",
                    port.name,
                    net.network_str(),
                    net.addr,
                    resident
                ),
                format!(
                    "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
                     arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; arp.spa = {ip}; \
                     outport = inport; flags.loopback = 1; output;",
                    mac = networks.ea,
                    ip = net.addr
                ),
                tag
            );
            // ICMP time exceeded for expiring packets entering here
            lflow!(
                flows,
                rc.dp,
                RouterInIpInput,
                40,
                format!(
                    "inport == \"{}\" && ip4 && ip.ttl == {{0, 1}} && !ip.later_frag",
                    port.name
                ),
                format!(
                    "icmp4 {{ eth.dst <-> eth.src; icmp4.type = 11; icmp4.code = 0; \
                     ip4.dst = ip4.src; ip4.src = {}; ip.ttl = 255; next; }};",
                    net.addr
                ),
                tag
            );
        }

        let all_v4: Vec<String> = networks.ipv4.iter().map(|n| n.addr.to_string()).collect();
        if !all_v4.is_empty() {
            lflow!(
                flows,
                rc.dp,
                RouterInIpInput,
                90,
                format!(
                    "inport == \"{}\" && ip4.dst == {} && icmp4.type == 8 && icmp4.code == 0",
                    port.name,
                    fmt_set(&all_v4)
                ),
                "ip4.dst <-> ip4.src; ip.ttl = 255; icmp4.type = 0; \
                 flags.loopback = 1; next;",
                tag
            );
            if rc.is_gateway {
                lflow!(
                    flows,
                    rc.dp,
                    RouterInIpInput,
                    80,
                    format!(
                        "ip4 && ip4.dst == {} && !ip.later_frag && udp",
                        fmt_set(&all_v4)
                    ),
                    "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; ip.ttl = 255; \
                     icmp4.type = 3; icmp4.code = 3; next; };",
                    tag
                );
                lflow!(
                    flows,
                    rc.dp,
                    RouterInIpInput,
                    80,
                    format!(
                        "ip4 && ip4.dst == {} && !ip.later_frag && tcp",
                        fmt_set(&all_v4)
                    ),
                    "tcp_reset { eth.dst <-> eth.src; ip4.dst <-> ip4.src; next; };",
                    tag
                );
                lflow!(
                    flows,
                    rc.dp,
                    RouterInIpInput,
                    70,
                    format!("ip4 && ip4.dst == {} && !ip.later_frag", fmt_set(&all_v4)),
                    "icmp4 { eth.dst <-> eth.src; ip4.dst <-> ip4.src; ip.ttl = 255; \
                     icmp4.type = 3; icmp4.code = 2; next; };",
                    tag
                );
            }
            // anything else aimed at the router itself is dropped,
            // except addresses that are also SNAT externals
            let own: Vec<String> = networks
                .ipv4
                .iter()
                .filter(|n| !snat_ips.contains(&n.addr))
                .map(|n| n.addr.to_string())
                .collect();
            if !own.is_empty() {
                lflow!(
                    flows,
                    rc.dp,
                    RouterInIpInput,
                    60,
                    format!("ip4.dst == {}", fmt_set(&own)),
                    "drop;",
                    tag
                );
            }
        }

        for net in &networks.ipv6 {
            lflow!(
                flows,
                rc.dp,
                RouterInIpInput,
                90,
                format!(
                    "inport == \"{}\" && nd_ns && ip6.dst == {{{}, {}}} && nd.target == {}{}",
                    port.name,
                    net.addr,
                    net.solicited_node(),
                    net.addr,
                    resident
                ),
                format!(
                    "nd_na_router {{ eth.src = {mac}; ip6.src = {ip}; nd.target = {ip}; \
                     nd.tll = {mac}; outport = inport; flags.loopback = 1; output; }};",
                    mac = networks.ea,
                    ip = net.addr
                ),
                tag
            );
            lflow!(
                flows,
                rc.dp,
                RouterInIpInput,
                90,
                format!(
                    "inport == \"{}\" && ip6.dst == {} && icmp6.type == 128 && icmp6.code == 0",
                    port.name, net.addr
                ),
                "ip6.dst <-> ip6.src; ip.ttl = 255; icmp6.type = 129; \
                 flags.loopback = 1; next;",
                tag
            );
        }
    }

    // ARP/ND responders for NAT external addresses
    for nat in &rc.nats {
        let port_index = rc
            .dgp
            .or_else(|| {
                rc.ports.iter().copied().find(|&index| {
                    ctx.ports[index]
                        .networks
                        .as_ref()
                        .map(|networks| {
                            networks
                                .ipv4
                                .iter()
                                .any(|net| v4_in_net(net.addr, net.plen, nat.external_ip))
                        })
                        .unwrap_or(false)
                })
            })
            .or_else(|| rc.ports.first().copied());
        let port_index = match port_index {
            Some(index) => index,
            None => continue,
        };
        let port = &ctx.ports[port_index];
        let networks = match &port.networks {
            Some(networks) => networks,
            None => continue,
        };
        let (mac, resident) = if nat.is_distributed() {
            (
                nat.external_mac.expect("distributed implies mac"),
                nat.logical_port
                    .as_ref()
                    .map(|lport| format!(" && is_chassis_resident(\"{}\")", lport))
                    .unwrap_or_default(),
            )
        } else {
            let clause = if Some(port_index) == rc.dgp {
                rc.redirect_name(ctx)
                    .map(|name| format!(" && is_chassis_resident(\"{}\")", name))
                    .unwrap_or_default()
            } else {
                String::new()
            };
            (networks.ea, clause)
        };
        lflow!(
            flows,
            rc.dp,
            RouterInIpInput,
            90,
            format!(
                "inport == \"{}\" && arp.tpa == {} && arp.op == 1{}",
                port.name, nat.external_ip, resident
            ),
            format!(
                "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
                 arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; arp.spa = {ip}; \
                 outport = inport; flags.loopback = 1; output;",
                mac = mac,
                ip = nat.external_ip
            ),
            hint(nat.uuid)
        );
    }
}

fn v4_in_net(net: Ipv4Addr, plen: u8, addr: Ipv4Addr) -> bool {
    let mask = if plen == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(plen))
    };
    (u32::from(net) & mask) == (u32::from(addr) & mask)
}

/// Table 4: defrag for load-balanced destinations
fn build_defrag(rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInDefrag, 0, "1", "next;");
    for vip in &rc.vips {
        lflow!(
            flows,
            rc.dp,
            RouterInDefrag,
            100,
            format!("ip && {}.dst == {}", vip.family, vip.vip),
            "ct_next;",
            hint(vip.uuid)
        );
    }
}

/// Table 5: reverse SNAT
fn build_unsnat(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInUnsnat, 0, "1", "next;");
    for nat in rc.nats.iter().filter(|nat| nat.is_snat()) {
        let tag = hint(nat.uuid);
        if rc.is_gateway {
            let actions = if nat.stateless {
                format!("ip4.dst = {}; next;", nat.logical_ip)
            } else {
                "ct_snat;".to_string()
            };
            lflow!(
                flows,
                rc.dp,
                RouterInUnsnat,
                90,
                format!("ip && ip4.dst == {}", nat.external_ip),
                actions,
                tag
            );
        } else if let (Some(dgp), Some(redirect)) = (rc.dgp_name(ctx), rc.redirect_name(ctx)) {
            let actions = if nat.stateless {
                format!("ip4.dst = {}; next;", nat.logical_ip)
            } else {
                "ct_snat;".to_string()
            };
            lflow!(
                flows,
                rc.dp,
                RouterInUnsnat,
                100,
                format!(
                    "ip && ip4.dst == {} && inport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.external_ip, dgp, redirect
                ),
                actions,
                tag
            );
        }
    }
}

/// Table 6: DNAT and router load balancing
fn build_dnat(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInDnat, 0, "1", "next;");

    for nat in rc.nats.iter().filter(|nat| nat.is_dnat()) {
        let tag = hint(nat.uuid);
        if rc.is_gateway {
            let actions = if nat.stateless {
                format!("flags.loopback = 1; ip4.dst = {}; next;", nat.logical_ip)
            } else {
                format!("flags.loopback = 1; ct_dnat({});", nat.logical_ip)
            };
            lflow!(
                flows,
                rc.dp,
                RouterInDnat,
                100,
                format!("ip && ip4.dst == {}", nat.external_ip),
                actions,
                tag
            );
        } else if let (Some(dgp), Some(redirect)) = (rc.dgp_name(ctx), rc.redirect_name(ctx)) {
            let actions = if nat.stateless {
                format!("flags.loopback = 1; ip4.dst = {}; next;", nat.logical_ip)
            } else {
                format!("flags.loopback = 1; ct_dnat({});", nat.logical_ip)
            };
            lflow!(
                flows,
                rc.dp,
                RouterInDnat,
                100,
                format!(
                    "ip && ip4.dst == {} && inport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.external_ip, dgp, redirect
                ),
                actions,
                tag
            );
            // entering anywhere else, remember to redirect later
            lflow!(
                flows,
                rc.dp,
                RouterInDnat,
                50,
                format!("ip && ip4.dst == {}", nat.external_ip),
                format!("{} = 1; next;", REGBIT_NAT_REDIRECT),
                tag
            );
        }
    }

    if rc.is_gateway {
        for vip in &rc.vips {
            let tag = hint(vip.uuid);
            let selector = match vip.port {
                Some(port) => format!(
                    "ip && {}.dst == {} && {}.dst == {}",
                    vip.family, vip.vip, vip.protocol, port
                ),
                None => format!("ip && {}.dst == {}", vip.family, vip.vip),
            };
            lflow!(
                flows,
                rc.dp,
                RouterInDnat,
                120,
                format!("ct.new && {}", selector),
                format!("ct_lb({});", vip.backends),
                tag
            );
            lflow!(
                flows,
                rc.dp,
                RouterInDnat,
                120,
                format!("ct.est && {}", selector),
                "ct_dnat;",
                tag
            );
        }
    }
}

/// Tables 7-8: IPv6 router advertisements
fn build_nd_ra(ctx: &Context, nb: &NbDb, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInNdRaOptions, 0, "1", "next;");
    lflow!(flows, rc.dp, RouterInNdRaResponse, 0, "1", "next;");
    for &index in &rc.ports {
        let port = &ctx.ports[index];
        let lrp = match port.lrp_uuid().and_then(|uuid| nb.router_ports.get(&uuid)) {
            Some(lrp) => lrp,
            None => continue,
        };
        let address_mode = match lrp.ipv6_ra_configs.get("address_mode") {
            Some(mode) => mode,
            None => continue,
        };
        let networks = match &port.networks {
            Some(networks) if !networks.ipv6.is_empty() => networks,
            _ => continue,
        };
        let tag = hint(lrp.uuid);
        let link_local = networks
            .ipv6
            .iter()
            .find(|net| net.is_link_local())
            .map(|net| net.addr)
            .unwrap_or_else(|| super::ipam::eui64(networks.ea, "fe80::".parse().expect("const")));
        let mut opts = format!(
            "addr_mode = \"{}\", slla = {}",
            address_mode, networks.ea
        );
        if let Some(mtu) = lrp.ipv6_ra_configs.get("mtu") {
            opts.push_str(&format!(", mtu = {}", mtu));
        }
        for net in &networks.ipv6 {
            if !net.is_link_local() {
                opts.push_str(&format!(", prefix = {}", net.network_str()));
            }
        }
        let selector = format!(
            "inport == \"{}\" && ip6.dst == ff02::2 && nd_rs",
            port.name
        );
        lflow!(
            flows,
            rc.dp,
            RouterInNdRaOptions,
            50,
            selector.clone(),
            format!("{} = put_nd_ra_opts({}); next;", REGBIT_ND_RA_OPTS, opts),
            tag
        );
        lflow!(
            flows,
            rc.dp,
            RouterInNdRaResponse,
            50,
            format!("{} && {}", selector, REGBIT_ND_RA_OPTS),
            format!(
                "eth.dst = eth.src; eth.src = {mac}; ip6.dst = ip6.src; ip6.src = {ll}; \
                 outport = inport; flags.loopback = 1; output;",
                mac = networks.ea,
                ll = link_local
            ),
            tag
        );
    }
}

fn route_actions(
    next_hop_reg: &str,
    src_reg: &str,
    next_hop: Option<&str>,
    dst_field: &str,
    src_ip: &IpAddr,
    out_mac: MacAddr,
    out_port: &str,
) -> String {
    let gw = match next_hop {
        Some(gw) => gw.to_string(),
        None => dst_field.to_string(),
    };
    format!(
        "ip.ttl--; {nh_reg} = {gw}; {src_reg} = {src}; eth.src = {mac}; \
         outport = \"{port}\"; flags.loopback = 1; next;",
        nh_reg = next_hop_reg,
        gw = gw,
        src_reg = src_reg,
        src = src_ip,
        mac = out_mac,
        port = out_port
    )
}

/// Table 9: longest-prefix-match routing
fn build_routing(ctx: &Context, rc: &RouterCtx, mcast: &McastGroups, flows: &mut LflowSet) {
    // connected networks
    for &index in &rc.ports {
        let port = &ctx.ports[index];
        let networks = match &port.networks {
            Some(networks) => networks,
            None => continue,
        };
        for net in &networks.ipv4 {
            let priority = u16::from(net.plen) * 2 + 1;
            lflow!(
                flows,
                rc.dp,
                RouterInIpRouting,
                priority,
                format!("ip4.dst == {}", net.network_str()),
                route_actions(
                    "reg0",
                    "reg1",
                    None,
                    "ip4.dst",
                    &IpAddr::V4(net.addr),
                    networks.ea,
                    &port.name
                )
            );
        }
        for net in &networks.ipv6 {
            let priority = u16::from(net.plen) * 2 + 1;
            lflow!(
                flows,
                rc.dp,
                RouterInIpRouting,
                priority,
                format!("ip6.dst == {}", net.network_str()),
                route_actions(
                    "xxreg0",
                    "xxreg1",
                    None,
                    "ip6.dst",
                    &IpAddr::V6(net.addr),
                    networks.ea,
                    &port.name
                )
            );
        }
    }

    // static routes
    for route in &rc.routes {
        let v6 = route.prefix.is_ipv6();
        let (field, nh_reg, src_reg) = if v6 {
            ("ip6", "xxreg0", "xxreg1")
        } else {
            ("ip4", "reg0", "reg1")
        };
        let dir = if route.is_src { "src" } else { "dst" };
        let priority = u16::from(route.prefix.prefix()) * 2 + if route.is_src { 0 } else { 1 };
        let nexthop = route.nexthop.map(|nh| nh.to_string());
        lflow!(
            flows,
            rc.dp,
            RouterInIpRouting,
            priority,
            format!("{}.{} == {}", field, dir, route.prefix),
            route_actions(
                nh_reg,
                src_reg,
                nexthop.as_deref(),
                &format!("{}.dst", field),
                &route.src_ip,
                route.out_mac,
                &route.out_port
            ),
            hint(route.uuid)
        );
    }

    // multicast relay
    if rc.relay {
        for (address, _) in mcast.learned(rc.dp) {
            lflow!(
                flows,
                rc.dp,
                RouterInIpRouting,
                500,
                format!("ip4.mcast && ip4.dst == {}", address),
                format!("ip.ttl--; outport = \"{}\"; next;", address)
            );
        }
        if rc.flood_static && mcast.has(rc.dp, MC_STATIC) {
            lflow!(
                flows,
                rc.dp,
                RouterInIpRouting,
                450,
                "ip4.mcast",
                format!("ip.ttl--; outport = \"{}\"; next;", MC_STATIC)
            );
        }
    }

    // traffic sourced from a distributed NAT address routes straight
    // to the gateway port on the hosting chassis
    if let Some(dgp) = rc.dgp_name(ctx) {
        for nat in rc.nats.iter().filter(|nat| nat.is_distributed()) {
            let lport = nat.logical_port.as_ref().expect("distributed implies port");
            lflow!(
                flows,
                rc.dp,
                RouterInIpRouting,
                400,
                format!(
                    "ip4.src == {} && is_chassis_resident(\"{}\")",
                    nat.logical_ip, lport
                ),
                format!(
                    "ip.ttl--; {} = 1; reg0 = ip4.dst; reg1 = {}; eth.src = {}; \
                     outport = \"{}\"; flags.loopback = 1; next;",
                    REGBIT_DISTRIBUTED_NAT,
                    nat.external_ip,
                    nat.external_mac.expect("distributed implies mac"),
                    dgp
                ),
                hint(nat.uuid)
            );
        }
    }
}

/// Table 10: routing policies
fn build_policies(rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInPolicy, 0, "1", "next;");
    for policy in &rc.policies {
        let tag = hint(policy.uuid);
        match &policy.action {
            PolicyAction::Allow => {
                lflow!(flows, rc.dp, RouterInPolicy, policy.priority, policy.match_.clone(), "next;", tag);
            }
            PolicyAction::Drop => {
                lflow!(flows, rc.dp, RouterInPolicy, policy.priority, policy.match_.clone(), "drop;", tag);
            }
            PolicyAction::Reroute {
                nexthop,
                out_port,
                out_mac,
            } => {
                let reg = if nexthop.is_ipv6() { "xxreg0" } else { "reg0" };
                lflow!(
                    flows,
                    rc.dp,
                    RouterInPolicy,
                    policy.priority,
                    policy.match_.clone(),
                    format!(
                        "{} = {}; eth.src = {}; outport = \"{}\"; flags.loopback = 1; next;",
                        reg, nexthop, out_mac, out_port
                    ),
                    tag
                );
            }
        }
    }
}

/// Table 11: resolve next hop to a MAC
fn build_arp_resolve(
    ctx: &Context,
    nb: &NbDb,
    sb: &SbDb,
    rc: &RouterCtx,
    flows: &mut LflowSet,
) {
    lflow!(flows, rc.dp, RouterInArpResolve, 500, "ip4.mcast || ip6.mcast", "next;");
    lflow!(flows, rc.dp, RouterInArpResolve, 0, "ip4", "get_arp(outport, reg0); next;");
    lflow!(flows, rc.dp, RouterInArpResolve, 0, "ip6", "get_nd(outport, xxreg0); next;");

    for &index in &rc.ports {
        let port = &ctx.ports[index];
        // directly connected router on the other end
        if let Some(peer) = port.peer {
            if ctx.ports[peer].lrp_uuid().is_some() {
                if let Some(peer_networks) = &ctx.ports[peer].networks {
                    for net in &peer_networks.ipv4 {
                        lflow!(
                            flows,
                            rc.dp,
                            RouterInArpResolve,
                            100,
                            format!("outport == \"{}\" && reg0 == {}", port.name, net.addr),
                            format!("eth.dst = {}; next;", peer_networks.ea)
                        );
                    }
                    for net in &peer_networks.ipv6 {
                        lflow!(
                            flows,
                            rc.dp,
                            RouterInArpResolve,
                            100,
                            format!("outport == \"{}\" && xxreg0 == {}", port.name, net.addr),
                            format!("eth.dst = {}; next;", peer_networks.ea)
                        );
                    }
                }
                continue;
            }
            // switch on the other end: every known (MAC, IP) binding
            let switch_dp = match ctx.ports[peer].dp {
                Some(dp) => dp,
                None => continue,
            };
            for &sw_index in &ctx.datapaths[switch_dp].ports {
                let sw_port = &ctx.ports[sw_index];
                let lsp = match sw_port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
                    Some(lsp) => lsp,
                    None => continue,
                };
                if lsp.port_type == "virtual" {
                    // bound virtual ports resolve through their parent
                    let vip = lsp.options.get("virtual-ip");
                    let parent_mac = sw_port
                        .sb_uuid
                        .and_then(|uuid| sb.port_bindings.get(&uuid))
                        .and_then(|row| row.virtual_parent.clone())
                        .and_then(|parent| ctx.port_by_name.get(&parent).copied())
                        .and_then(|parent| ctx.ports[parent].addrs.first().map(|a| a.ea));
                    if let (Some(vip), Some(mac)) = (vip, parent_mac) {
                        if vip.parse::<Ipv4Addr>().is_ok() {
                            lflow!(
                                flows,
                                rc.dp,
                                RouterInArpResolve,
                                100,
                                format!("outport == \"{}\" && reg0 == {}", port.name, vip),
                                format!("eth.dst = {}; next;", mac)
                            );
                        }
                    }
                    continue;
                }
                for entry in &sw_port.addrs {
                    for v4 in &entry.ipv4 {
                        lflow!(
                            flows,
                            rc.dp,
                            RouterInArpResolve,
                            100,
                            format!("outport == \"{}\" && reg0 == {}", port.name, v4.addr),
                            format!("eth.dst = {}; next;", entry.ea)
                        );
                    }
                    for v6 in &entry.ipv6 {
                        lflow!(
                            flows,
                            rc.dp,
                            RouterInArpResolve,
                            100,
                            format!("outport == \"{}\" && xxreg0 == {}", port.name, v6.addr),
                            format!("eth.dst = {}; next;", entry.ea)
                        );
                    }
                }
            }
        }
    }
}

/// Tables 12-13: gateway MTU enforcement
fn build_pkt_len(ctx: &Context, nb: &NbDb, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInChkPktLen, 0, "1", "next;");
    lflow!(flows, rc.dp, RouterInLargerPkts, 0, "1", "next;");
    let (mtu, dgp) = match (rc.gateway_mtu, rc.dgp) {
        (Some(mtu), Some(dgp)) => (mtu, dgp),
        _ => return,
    };
    let dgp_name = &ctx.ports[dgp].name;
    let networks = match &ctx.ports[dgp].networks {
        Some(networks) => networks,
        None => return,
    };
    let lrp_uuid = ctx.ports[dgp].lrp_uuid();
    let tag = lrp_uuid
        .and_then(|uuid| nb.router_ports.get(&uuid))
        .map(|lrp| hint(lrp.uuid))
        .unwrap_or(0);
    lflow!(
        flows,
        rc.dp,
        RouterInChkPktLen,
        50,
        format!("outport == \"{}\"", dgp_name),
        format!("{} = check_pkt_larger({}); next;", REGBIT_PKT_LARGER, mtu),
        tag
    );
    if let Some(net) = networks.ipv4.first() {
        lflow!(
            flows,
            rc.dp,
            RouterInLargerPkts,
            50,
            format!(
                "outport == \"{}\" && {} == 1 && ip4 && !ip.later_frag",
                dgp_name, REGBIT_PKT_LARGER
            ),
            format!(
                "icmp4 {{ icmp4.type = 3; icmp4.code = 4; icmp4.frag_mtu = {frag}; \
                 eth.dst = eth.src; eth.src = {mac}; ip4.dst = ip4.src; ip4.src = {ip}; \
                 ip.ttl = 255; next; }};",
                frag = mtu.saturating_sub(18),
                mac = networks.ea,
                ip = net.addr
            ),
            tag
        );
    }
}

/// Table 14: pick the chassis-redirect port for centralized traffic
fn build_gw_redirect(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInGwRedirect, 0, "1", "next;");
    let (dgp, redirect) = match (rc.dgp_name(ctx), rc.redirect_name(ctx)) {
        (Some(dgp), Some(redirect)) => (dgp, redirect),
        _ => return,
    };
    lflow!(
        flows,
        rc.dp,
        RouterInGwRedirect,
        200,
        format!("{} == 1", REGBIT_NAT_REDIRECT),
        format!("outport = \"{}\"; next;", redirect)
    );
    // traffic from a locally-hosted floating IP stays local
    for nat in rc.nats.iter().filter(|nat| nat.is_distributed()) {
        let lport = nat.logical_port.as_ref().expect("distributed implies port");
        lflow!(
            flows,
            rc.dp,
            RouterInGwRedirect,
            100,
            format!(
                "ip4.src == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                nat.logical_ip, dgp, lport
            ),
            "next;",
            hint(nat.uuid)
        );
    }
    lflow!(
        flows,
        rc.dp,
        RouterInGwRedirect,
        150,
        format!(
            "outport == \"{}\" && eth.dst == 00:00:00:00:00:00",
            dgp
        ),
        format!("outport = \"{}\"; next;", redirect)
    );
    lflow!(
        flows,
        rc.dp,
        RouterInGwRedirect,
        50,
        format!("outport == \"{}\"", dgp),
        format!("outport = \"{}\"; next;", redirect)
    );
}

/// Table 15: originate ARP/NS for unresolved next hops
fn build_arp_request(rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterInArpRequest, 0, "1", "output;");
    lflow!(
        flows,
        rc.dp,
        RouterInArpRequest,
        100,
        "eth.dst == 00:00:00:00:00:00 && ip4",
        "arp { eth.dst = ff:ff:ff:ff:ff:ff; arp.spa = reg1; arp.tpa = reg0; \
         arp.op = 1; output; };"
    );
    lflow!(
        flows,
        rc.dp,
        RouterInArpRequest,
        100,
        "eth.dst == 00:00:00:00:00:00 && ip6",
        "nd_ns { nd.target = xxreg0; output; };"
    );
    for route in &rc.routes {
        if let Some(IpAddr::V6(nexthop)) = route.nexthop {
            let sn = crate::utils::ipv6_solicited_node(nexthop);
            lflow!(
                flows,
                rc.dp,
                RouterInArpRequest,
                200,
                format!("eth.dst == 00:00:00:00:00:00 && ip6 && xxreg0 == {}", nexthop),
                format!(
                    "nd_ns {{ ip6.dst = {}; nd.target = {}; output; }};",
                    sn, nexthop
                ),
                hint(route.uuid)
            );
        }
    }
}

/// Egress table 0: reverse DNAT
fn build_undnat(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterOutUndnat, 0, "1", "next;");
    for nat in rc.nats.iter().filter(|nat| nat.is_dnat()) {
        let tag = hint(nat.uuid);
        if rc.is_gateway {
            let actions = if nat.stateless {
                format!("ip4.src = {}; next;", nat.external_ip)
            } else {
                "ct_dnat;".to_string()
            };
            lflow!(
                flows,
                rc.dp,
                RouterOutUndnat,
                100,
                format!("ip && ip4.src == {}", nat.logical_ip),
                actions,
                tag
            );
            continue;
        }
        let dgp = match rc.dgp_name(ctx) {
            Some(dgp) => dgp,
            None => continue,
        };
        if nat.is_distributed() {
            let lport = nat.logical_port.as_ref().expect("distributed implies port");
            lflow!(
                flows,
                rc.dp,
                RouterOutUndnat,
                100,
                format!(
                    "ip && ip4.src == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.logical_ip, dgp, lport
                ),
                format!(
                    "eth.src = {}; ct_dnat;",
                    nat.external_mac.expect("distributed implies mac")
                ),
                tag
            );
        } else if let Some(redirect) = rc.redirect_name(ctx) {
            let actions = if nat.stateless {
                format!("ip4.src = {}; next;", nat.external_ip)
            } else {
                "ct_dnat;".to_string()
            };
            lflow!(
                flows,
                rc.dp,
                RouterOutUndnat,
                100,
                format!(
                    "ip && ip4.src == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.logical_ip, dgp, redirect
                ),
                actions,
                tag
            );
        }
    }
}

/// Egress table 1: SNAT, longest logical prefix wins
fn build_snat(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterOutSnat, 0, "1", "next;");
    for nat in rc.nats.iter().filter(|nat| nat.is_snat()) {
        let tag = hint(nat.uuid);
        let base_priority = u16::from(nat.logical_plen) + 1;
        if rc.is_gateway {
            let actions = if nat.stateless {
                format!("ip4.src = {}; next;", nat.external_ip)
            } else {
                format!("ct_snat({});", nat.external_ip)
            };
            lflow!(
                flows,
                rc.dp,
                RouterOutSnat,
                base_priority,
                format!("ip && ip4.src == {}", nat.logical_match()),
                actions,
                tag
            );
            continue;
        }
        let dgp = match rc.dgp_name(ctx) {
            Some(dgp) => dgp,
            None => continue,
        };
        // distributed variants outrank gateway-router rules
        let priority = base_priority + 128;
        if nat.is_distributed() {
            let lport = nat.logical_port.as_ref().expect("distributed implies port");
            lflow!(
                flows,
                rc.dp,
                RouterOutSnat,
                priority,
                format!(
                    "ip && ip4.src == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.logical_match(),
                    dgp,
                    lport
                ),
                format!(
                    "eth.src = {}; ct_snat({});",
                    nat.external_mac.expect("distributed implies mac"),
                    nat.external_ip
                ),
                tag
            );
        } else if let Some(redirect) = rc.redirect_name(ctx) {
            let actions = if nat.stateless {
                format!("ip4.src = {}; next;", nat.external_ip)
            } else {
                format!("ct_snat({});", nat.external_ip)
            };
            lflow!(
                flows,
                rc.dp,
                RouterOutSnat,
                priority,
                format!(
                    "ip && ip4.src == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                    nat.logical_match(),
                    dgp,
                    redirect
                ),
                actions,
                tag
            );
        }
    }
}

fn egress_loop_actions() -> String {
    format!(
        "clone {{ ct_clear; inport = outport; outport = \"\"; flags = 0; \
         flags.loopback = 1; reg0 = 0; reg1 = 0; reg2 = 0; reg3 = 0; reg4 = 0; \
         reg5 = 0; reg6 = 0; reg7 = 0; reg8 = 0; reg9 = 0; {} = 1; \
         next(pipeline=ingress, table=0); }};",
        REGBIT_EGRESS_LOOPBACK
    )
}

/// Egress table 2: hairpin traffic between floating IPs back into the
/// ingress pipeline
fn build_egr_loop(ctx: &Context, rc: &RouterCtx, flows: &mut LflowSet) {
    lflow!(flows, rc.dp, RouterOutEgrLoop, 0, "1", "next;");
    let dgp = match rc.dgp_name(ctx) {
        Some(dgp) => dgp,
        None => return,
    };
    lflow!(
        flows,
        rc.dp,
        RouterOutEgrLoop,
        200,
        format!("{} == 1", REGBIT_DISTRIBUTED_NAT),
        egress_loop_actions()
    );
    for nat in rc.nats.iter().filter(|nat| nat.is_distributed()) {
        let lport = nat.logical_port.as_ref().expect("distributed implies port");
        let tag = hint(nat.uuid);
        // destination hosted here: deliver without looping
        lflow!(
            flows,
            rc.dp,
            RouterOutEgrLoop,
            300,
            format!(
                "ip4.dst == {} && outport == \"{}\" && is_chassis_resident(\"{}\")",
                nat.external_ip, dgp, lport
            ),
            "next;",
            tag
        );
        lflow!(
            flows,
            rc.dp,
            RouterOutEgrLoop,
            100,
            format!("ip4.dst == {} && outport == \"{}\"", nat.external_ip, dgp),
            egress_loop_actions(),
            tag
        );
    }
}

/// Egress table 3: delivery
fn build_delivery(ctx: &Context, nb: &NbDb, rc: &RouterCtx, flows: &mut LflowSet) {
    for &index in &rc.ports {
        let port = &ctx.ports[index];
        let lrp = match port.lrp_uuid().and_then(|uuid| nb.router_ports.get(&uuid)) {
            Some(lrp) => lrp,
            None => continue,
        };
        if !lrp.is_enabled() {
            continue;
        }
        let tag = hint(lrp.uuid);
        if rc.relay {
            if let Some(networks) = &port.networks {
                lflow!(
                    flows,
                    rc.dp,
                    RouterOutDelivery,
                    110,
                    format!("ip4.mcast && outport == \"{}\"", port.name),
                    format!("eth.src = {}; output;", networks.ea),
                    tag
                );
            }
        }
        lflow!(
            flows,
            rc.dp,
            RouterOutDelivery,
            100,
            format!("outport == \"{}\"", port.name),
            "output;",
            tag
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_entry_flags() {
        let nat = NatEntry {
            uuid: Uuid::new_v4(),
            nat_type: "dnat_and_snat".to_string(),
            external_ip: "192.0.2.5".parse().unwrap(),
            external_mac: Some("aa:aa:aa:aa:aa:aa".parse().unwrap()),
            logical_ip: "10.0.0.5".parse().unwrap(),
            logical_plen: 32,
            logical_port: Some("p1".to_string()),
            stateless: false,
        };
        assert!(nat.is_snat());
        assert!(nat.is_dnat());
        assert!(nat.is_distributed());
        assert_eq!(nat.logical_match(), "10.0.0.5");
        let snat = NatEntry {
            nat_type: "snat".to_string(),
            external_mac: None,
            logical_port: None,
            logical_plen: 24,
            logical_ip: "10.0.0.0".parse().unwrap(),
            ..nat
        };
        assert!(snat.is_snat() && !snat.is_dnat() && !snat.is_distributed());
        assert_eq!(snat.logical_match(), "10.0.0.0/24");
    }

    #[test]
    fn test_v4_in_net() {
        let net: Ipv4Addr = "192.0.2.1".parse().unwrap();
        assert!(v4_in_net(net, 24, "192.0.2.77".parse().unwrap()));
        assert!(!v4_in_net(net, 24, "192.0.3.1".parse().unwrap()));
    }
}
