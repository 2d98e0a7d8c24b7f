//! Logical-switch pipeline synthesis: port security, conntrack
//! marking, ACLs, QoS, load balancing, ARP/ND and DHCP/DNS responders,
//! external-port filtering, and the destination lookup table.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;

use uuid::Uuid;

use crate::db::nb::{Acl, NbDb};
use crate::db::sb::SbDb;
use crate::lflow;
use crate::utils::{MacAddr, V4Addr, V6Addr};

use super::flow::{hint, LflowSet};
use super::ipam::eui64;
use super::multicast::{McastGroups, MC_FLOOD, MC_MROUTER_FLOOD, MC_STATIC, MC_UNKNOWN};
use super::stage::Stage::*;
use super::{Context, DpData};

/// Offset added to every northbound ACL priority
const ACL_PRI_OFFSET: u16 = 1000;

pub fn build_lswitch_flows(
    ctx: &Context,
    nb: &NbDb,
    sb: &SbDb,
    flows: &mut LflowSet,
    mcast: &McastGroups,
) {
    // ACLs attached through a port group apply to every switch the
    // group intersects
    let mut pg_acls: HashMap<usize, Vec<Uuid>> = HashMap::new();
    let port_by_lsp: HashMap<Uuid, usize> = ctx
        .ports
        .iter()
        .enumerate()
        .filter_map(|(index, port)| port.lsp_uuid().map(|uuid| (uuid, index)))
        .collect();
    for group in nb.port_groups.iter() {
        if group.acls.is_empty() {
            continue;
        }
        let mut seen: HashSet<usize> = HashSet::new();
        for member in &group.ports {
            if let Some(dp) = port_by_lsp
                .get(member)
                .and_then(|&index| ctx.ports[index].dp)
            {
                if seen.insert(dp) {
                    pg_acls.entry(dp).or_default().extend(group.acls.iter());
                }
            }
        }
    }

    for dp in 0..ctx.datapaths.len() {
        let switch = match &ctx.datapaths[dp].data {
            DpData::Switch(switch) => switch,
            DpData::Router(_) => continue,
        };
        let ls = match nb.switches.get(&switch.nb) {
            Some(ls) => ls,
            None => continue,
        };
        let mut acls: Vec<&Acl> = ls
            .acls
            .iter()
            .chain(pg_acls.get(&dp).map(|v| v.iter()).into_iter().flatten())
            .filter_map(|uuid| nb.acls.get(uuid))
            .collect();
        acls.sort_by_key(|acl| acl.uuid);
        let has_stateful = acls.iter().any(|acl| acl.action == "allow-related");
        let has_lb = ls
            .load_balancer
            .iter()
            .filter_map(|uuid| nb.load_balancers.get(uuid))
            .any(|lb| !lb.vips.is_empty());
        let has_dns = !ls.dns_records.is_empty();

        build_port_sec(ctx, nb, sb, dp, flows);
        build_pre_acls(ctx, dp, has_stateful, flows);
        build_pre_lb(dp, has_lb, flows);
        build_pre_stateful(dp, flows);
        build_acls(ctx, nb, dp, &acls, has_stateful, has_dns, flows);
        build_qos(nb, ls, dp, flows);
        build_lb(nb, ls, dp, has_lb, flows);
        build_stateful(dp, flows);
        build_arp_nd_rsp(ctx, nb, dp, flows);
        build_dhcp(ctx, nb, dp, flows);
        build_dns(dp, has_dns, flows);
        build_external_port(ctx, nb, dp, flows);
        build_l2_lkup(ctx, nb, dp, mcast, flows);
    }
}

fn fmt_v4_set(addrs: &[V4Addr]) -> String {
    if addrs.len() == 1 {
        addrs[0].addr.to_string()
    } else {
        format!(
            "{{{}}}",
            addrs
                .iter()
                .map(|a| a.addr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn fmt_v6_set(addrs: &[V6Addr]) -> String {
    if addrs.len() == 1 {
        addrs[0].addr.to_string()
    } else {
        format!(
            "{{{}}}",
            addrs
                .iter()
                .map(|a| a.addr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Ingress tables 0-2 and egress tables 8-9: L2/L3/ND admission by
/// port-security bindings
fn build_port_sec(ctx: &Context, nb: &NbDb, sb: &SbDb, dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInPortSecL2, 100, "vlan.present || eth.src[40]", "drop;");
    lflow!(flows, dp, SwitchOutPortSecL2, 100, "eth.mcast", "output;");
    lflow!(flows, dp, SwitchInPortSecIp, 0, "1", "next;");
    lflow!(flows, dp, SwitchInPortSecNd, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutPortSecIp, 0, "1", "next;");

    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let lsp = match port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
            Some(lsp) => lsp,
            None => continue,
        };
        let tag = hint(lsp.uuid);
        if !lsp.is_enabled() {
            lflow!(
                flows,
                dp,
                SwitchOutPortSecL2,
                150,
                format!("outport == \"{}\"", port.name),
                "drop;",
                tag
            );
            continue;
        }

        // L2: constrain the source MAC when port security is set
        let mut in_match = format!("inport == \"{}\"", port.name);
        if !port.ps_addrs.is_empty() {
            let macs = port
                .ps_addrs
                .iter()
                .map(|a| a.ea.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            in_match.push_str(&format!(" && eth.src == {{{}}}", macs));
        }
        let queue = port
            .sb_uuid
            .and_then(|uuid| sb.port_bindings.get(&uuid))
            .and_then(|row| row.options.get("qdisc_queue_id").cloned());
        let actions = match queue {
            Some(queue) => format!("set_queue({}); next;", queue),
            None => "next;".to_string(),
        };
        lflow!(flows, dp, SwitchInPortSecL2, 50, in_match, actions, tag);

        let mut out_match = format!("outport == \"{}\"", port.name);
        if !port.ps_addrs.is_empty() {
            let macs = port
                .ps_addrs
                .iter()
                .map(|a| a.ea.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            out_match.push_str(&format!(" && eth.dst == {{{}}}", macs));
        }
        lflow!(flows, dp, SwitchOutPortSecL2, 50, out_match, "output;", tag);

        // L3 + ND enforcement only when a binding carries addresses
        let has_l3 = port
            .ps_addrs
            .iter()
            .any(|a| !a.ipv4.is_empty() || !a.ipv6.is_empty());
        if !has_l3 {
            continue;
        }
        for entry in &port.ps_addrs {
            if !entry.ipv4.is_empty() {
                lflow!(
                    flows,
                    dp,
                    SwitchInPortSecIp,
                    90,
                    format!(
                        "inport == \"{}\" && eth.src == {} && ip4.src == 0.0.0.0 && \
                         ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67",
                        port.name, entry.ea
                    ),
                    "next;",
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchInPortSecIp,
                    90,
                    format!(
                        "inport == \"{}\" && eth.src == {} && ip4.src == {}",
                        port.name,
                        entry.ea,
                        fmt_v4_set(&entry.ipv4)
                    ),
                    "next;",
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchOutPortSecIp,
                    90,
                    format!(
                        "outport == \"{}\" && eth.dst == {} && \
                         ip4.dst == {{255.255.255.255, 224.0.0.0/4, {}}}",
                        port.name,
                        entry.ea,
                        fmt_v4_set(&entry.ipv4)
                    ),
                    "output;",
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchInPortSecNd,
                    90,
                    format!(
                        "inport == \"{}\" && eth.src == {} && arp.sha == {} && arp.spa == {}",
                        port.name,
                        entry.ea,
                        entry.ea,
                        fmt_v4_set(&entry.ipv4)
                    ),
                    "next;",
                    tag
                );
            }
            if !entry.ipv6.is_empty() {
                lflow!(
                    flows,
                    dp,
                    SwitchInPortSecIp,
                    90,
                    format!(
                        "inport == \"{}\" && eth.src == {} && ip6.src == {{::, {}}}",
                        port.name,
                        entry.ea,
                        entry
                            .ipv6
                            .iter()
                            .map(|a| a.addr.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    "next;",
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchOutPortSecIp,
                    90,
                    format!(
                        "outport == \"{}\" && eth.dst == {} && \
                         ip6.dst == {{ff00::/8, {}}}",
                        port.name,
                        entry.ea,
                        fmt_v6_set(&entry.ipv6)
                    ),
                    "output;",
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchInPortSecNd,
                    90,
                    format!(
                        "inport == \"{}\" && eth.src == {} && ip6 && nd && \
                         (nd.sll == 00:00:00:00:00:00 || nd.sll == {}) && \
                         (nd.tll == 00:00:00:00:00:00 || nd.tll == {})",
                        port.name, entry.ea, entry.ea, entry.ea
                    ),
                    "next;",
                    tag
                );
            }
        }
        lflow!(
            flows,
            dp,
            SwitchInPortSecNd,
            80,
            format!("inport == \"{}\" && (arp || nd)", port.name),
            "drop;",
            tag
        );
        lflow!(
            flows,
            dp,
            SwitchInPortSecIp,
            80,
            format!("inport == \"{}\" && ip", port.name),
            "drop;",
            tag
        );
        lflow!(
            flows,
            dp,
            SwitchOutPortSecIp,
            80,
            format!("outport == \"{}\" && ip", port.name),
            "drop;",
            tag
        );
    }
}

const CT_BYPASS: &str =
    "nd || nd_rs || nd_ra || icmp4.type == 3 || icmp6.type == 1 || (tcp && tcp.flags == 20)";

fn build_pre_acls(ctx: &Context, dp: usize, has_stateful: bool, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInPreAcl, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutPreAcl, 0, "1", "next;");
    if !has_stateful {
        return;
    }
    lflow!(flows, dp, SwitchInPreAcl, 110, CT_BYPASS, "next;");
    lflow!(flows, dp, SwitchOutPreAcl, 110, CT_BYPASS, "next;");
    // localnet traffic is handled by the fabric, not by conntrack
    if let Some(localnet) = ctx.datapaths[dp].as_switch().and_then(|s| s.localnet_port) {
        lflow!(
            flows,
            dp,
            SwitchInPreAcl,
            110,
            format!("ip && inport == \"{}\"", ctx.ports[localnet].name),
            "next;"
        );
        lflow!(
            flows,
            dp,
            SwitchOutPreAcl,
            110,
            format!("ip && outport == \"{}\"", ctx.ports[localnet].name),
            "next;"
        );
    }
    lflow!(flows, dp, SwitchInPreAcl, 100, "ip", "reg0[0] = 1; next;");
    lflow!(flows, dp, SwitchOutPreAcl, 100, "ip", "reg0[0] = 1; next;");
}

fn build_pre_lb(dp: usize, has_lb: bool, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInPreLb, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutPreLb, 0, "1", "next;");
    if has_lb {
        lflow!(flows, dp, SwitchInPreLb, 110, "nd || nd_rs || nd_ra", "next;");
        lflow!(flows, dp, SwitchOutPreLb, 110, "nd || nd_rs || nd_ra", "next;");
        lflow!(flows, dp, SwitchInPreLb, 100, "ip", "reg0[0] = 1; next;");
        lflow!(flows, dp, SwitchOutPreLb, 100, "ip", "reg0[0] = 1; next;");
    }
}

fn build_pre_stateful(dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInPreStateful, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutPreStateful, 0, "1", "next;");
    lflow!(flows, dp, SwitchInPreStateful, 100, "reg0[0] == 1", "ct_next;");
    lflow!(flows, dp, SwitchOutPreStateful, 100, "reg0[0] == 1", "ct_next;");
}

fn acl_log_prefix(acl: &Acl) -> String {
    if !acl.log {
        return String::new();
    }
    let mut prefix = String::from("log(");
    if let Some(name) = &acl.name {
        prefix.push_str(&format!("name=\"{}\", ", name));
    }
    let verdict = match acl.action.as_str() {
        "allow" | "allow-related" => "allow",
        "reject" => "reject",
        _ => "drop",
    };
    prefix.push_str(&format!("verdict={}", verdict));
    if let Some(severity) = &acl.severity {
        prefix.push_str(&format!(", severity={}", severity));
    }
    if let Some(meter) = &acl.meter {
        prefix.push_str(&format!(", meter=\"{}\"", meter));
    }
    prefix.push_str("); ");
    prefix
}

fn build_acls(
    ctx: &Context,
    nb: &NbDb,
    dp: usize,
    acls: &[&Acl],
    has_stateful: bool,
    has_dns: bool,
    flows: &mut LflowSet,
) {
    lflow!(flows, dp, SwitchInAcl, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutAcl, 0, "1", "next;");

    if has_stateful {
        // default-commit so reply traffic of allowed connections is
        // recognized even without an explicit allow-related hit
        for &stage in &[SwitchInAcl, SwitchOutAcl] {
            lflow!(
                flows,
                dp,
                stage,
                1,
                "ip && (!ct.est || (ct.est && ct_label.blocked == 1))",
                "reg0[1] = 1; next;"
            );
            lflow!(
                flows,
                dp,
                stage,
                65535,
                "ct.inv || (ct.est && ct.rpl && ct_label.blocked == 1)",
                "drop;"
            );
            lflow!(
                flows,
                dp,
                stage,
                65535,
                "ct.est && !ct.rel && !ct.new && !ct.inv && ct.rpl && ct_label.blocked == 0",
                "next;"
            );
            lflow!(
                flows,
                dp,
                stage,
                65535,
                "!ct.est && ct.rel && !ct.new && !ct.inv && ct_label.blocked == 0",
                "next;"
            );
            lflow!(flows, dp, stage, 65535, "nd || nd_rs || nd_ra", "next;");
        }
    }

    for acl in acls {
        consider_acl(dp, acl, has_stateful, flows);
    }

    // Locally generated DHCP replies and DNS answers always pass
    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let lsp = match port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
            Some(lsp) => lsp,
            None => continue,
        };
        if let Some(options) = lsp.dhcpv4_options.and_then(|uuid| nb.dhcp_options.get(&uuid)) {
            if let (Some(server_id), Some(server_mac)) = (
                options.options.get("server_id"),
                options.options.get("server_mac"),
            ) {
                lflow!(
                    flows,
                    dp,
                    SwitchOutAcl,
                    34000,
                    format!(
                        "outport == \"{}\" && eth.src == {} && ip4.src == {} && \
                         udp && udp.src == 67 && udp.dst == 68",
                        port.name, server_mac, server_id
                    ),
                    "next;",
                    hint(lsp.uuid)
                );
            }
        }
        if let Some(options) = lsp.dhcpv6_options.and_then(|uuid| nb.dhcp_options.get(&uuid)) {
            if let Some(server_mac) = options
                .options
                .get("server_id")
                .and_then(|text| text.parse::<MacAddr>().ok())
            {
                let link_local = eui64(server_mac, "fe80::".parse::<Ipv6Addr>().expect("const"));
                lflow!(
                    flows,
                    dp,
                    SwitchOutAcl,
                    34000,
                    format!(
                        "outport == \"{}\" && eth.src == {} && ip6.src == {} && \
                         udp && udp.src == 547 && udp.dst == 546",
                        port.name, server_mac, link_local
                    ),
                    "next;",
                    hint(lsp.uuid)
                );
            }
        }
    }
    if has_dns {
        lflow!(flows, dp, SwitchOutAcl, 34000, "udp.src == 53", "next;");
    }
}

fn consider_acl(dp: usize, acl: &Acl, has_stateful: bool, flows: &mut LflowSet) {
    let ingress = acl.direction == "from-lport";
    let stage = if ingress { SwitchInAcl } else { SwitchOutAcl };
    let priority = acl.priority.saturating_add(ACL_PRI_OFFSET);
    let log = acl_log_prefix(acl);
    let tag = hint(acl.uuid);
    match acl.action.as_str() {
        "allow" | "allow-related" => {
            if !has_stateful {
                lflow!(flows, dp, stage, priority, acl.match_.clone(), format!("{}next;", log), tag);
            } else {
                lflow!(
                    flows,
                    dp,
                    stage,
                    priority,
                    format!(
                        "((ct.new && !ct.est) || (ct.est && ct_label.blocked == 1)) && ({})",
                        acl.match_
                    ),
                    format!("{}reg0[1] = 1; next;", log),
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    stage,
                    priority,
                    format!(
                        "!ct.new && ct.est && !ct.rpl && ct_label.blocked == 0 && ({})",
                        acl.match_
                    ),
                    format!("{}next;", log),
                    tag
                );
            }
        }
        "reject" => {
            let next = if ingress { "next(pipeline=egress, table=9);" } else { "output;" };
            lflow!(
                flows,
                dp,
                stage,
                priority,
                format!("tcp && ({})", acl.match_),
                format!(
                    "{}reg0 = 0; eth.dst <-> eth.src; ip4.src <-> ip4.dst; \
                     tcp_reset {{ outport <-> inport; {} }};",
                    log, next
                ),
                tag
            );
            lflow!(
                flows,
                dp,
                stage,
                priority,
                format!("ip4 && !tcp && ({})", acl.match_),
                format!(
                    "{}icmp4 {{ eth.dst <-> eth.src; ip4.src <-> ip4.dst; \
                     icmp4.type = 3; icmp4.code = 1; outport <-> inport; {} }};",
                    log, next
                ),
                tag
            );
            lflow!(
                flows,
                dp,
                stage,
                priority,
                format!("ip6 && !tcp && ({})", acl.match_),
                format!(
                    "{}icmp6 {{ eth.dst <-> eth.src; ip6.src <-> ip6.dst; \
                     icmp6.type = 1; icmp6.code = 1; outport <-> inport; {} }};",
                    log, next
                ),
                tag
            );
        }
        _ => {
            // drop, and unknown actions degrade to drop
            if has_stateful {
                lflow!(
                    flows,
                    dp,
                    stage,
                    priority,
                    format!(
                        "(!ct.est || (ct.est && ct_label.blocked == 1)) && ({})",
                        acl.match_
                    ),
                    format!("{}drop;", log),
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    stage,
                    priority,
                    format!("ct.est && ct_label.blocked == 0 && ({})", acl.match_),
                    format!("{}ct_commit(ct_label=1/1);", log),
                    tag
                );
            } else {
                lflow!(flows, dp, stage, priority, acl.match_.clone(), format!("{}drop;", log), tag);
            }
        }
    }
}

fn build_qos(nb: &NbDb, ls: &crate::db::nb::LogicalSwitch, dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInQosMark, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutQosMark, 0, "1", "next;");
    lflow!(flows, dp, SwitchInQosMeter, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutQosMeter, 0, "1", "next;");
    for qos in ls.qos_rules.iter().filter_map(|uuid| nb.qos_rules.get(uuid)) {
        let ingress = qos.direction == "from-lport";
        let tag = hint(qos.uuid);
        if let Some(dscp) = qos.action.get("dscp") {
            let stage = if ingress { SwitchInQosMark } else { SwitchOutQosMark };
            lflow!(
                flows,
                dp,
                stage,
                qos.priority,
                qos.match_.clone(),
                format!("ip.dscp = {}; next;", dscp),
                tag
            );
        }
        if let Some(rate) = qos.bandwidth.get("rate") {
            let stage = if ingress { SwitchInQosMeter } else { SwitchOutQosMeter };
            let actions = match qos.bandwidth.get("burst") {
                Some(burst) => format!("set_meter({}, {}); next;", rate, burst),
                None => format!("set_meter({}); next;", rate),
            };
            lflow!(flows, dp, stage, qos.priority, qos.match_.clone(), actions, tag);
        }
    }
}

/// Split a VIP key into (address, optional port); IPv6 VIPs are
/// bracketed when they carry a port
pub(crate) fn parse_vip(key: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = key.strip_prefix('[') {
        let end = rest.find(']')?;
        let addr = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok());
        addr.parse::<Ipv6Addr>().ok()?;
        return Some((addr.to_string(), port));
    }
    if let Some(colon) = key.rfind(':') {
        // only IPv4 may carry a bare colon separator
        if key[..colon].parse::<std::net::Ipv4Addr>().is_ok() {
            let port = key[colon + 1..].parse().ok()?;
            return Some((key[..colon].to_string(), Some(port)));
        }
    }
    if key.parse::<std::net::Ipv4Addr>().is_ok() || key.parse::<Ipv6Addr>().is_ok() {
        return Some((key.to_string(), None));
    }
    None
}

fn build_lb(
    nb: &NbDb,
    ls: &crate::db::nb::LogicalSwitch,
    dp: usize,
    has_lb: bool,
    flows: &mut LflowSet,
) {
    lflow!(flows, dp, SwitchInLb, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutLb, 0, "1", "next;");
    if has_lb {
        lflow!(
            flows,
            dp,
            SwitchInLb,
            100,
            "ct.est && !ct.rel && !ct.new && !ct.inv",
            "reg0[2] = 1; next;"
        );
        lflow!(
            flows,
            dp,
            SwitchOutLb,
            100,
            "ct.est && !ct.rel && !ct.new && !ct.inv",
            "reg0[2] = 1; next;"
        );
    }
    for lb in ls
        .load_balancer
        .iter()
        .filter_map(|uuid| nb.load_balancers.get(uuid))
    {
        let protocol = lb.protocol.as_deref().unwrap_or("tcp");
        let tag = hint(lb.uuid);
        for (key, backends) in &lb.vips {
            let (vip, port) = match parse_vip(key) {
                Some(parsed) => parsed,
                None => continue,
            };
            let family = if vip.contains(':') { "ip6" } else { "ip4" };
            let actions = format!("ct_lb({});", backends);
            match port {
                Some(port) => {
                    lflow!(
                        flows,
                        dp,
                        SwitchInLb,
                        120,
                        format!(
                            "ct.new && {}.dst == {} && {}.dst == {}",
                            family, vip, protocol, port
                        ),
                        actions,
                        tag
                    );
                }
                None => {
                    lflow!(
                        flows,
                        dp,
                        SwitchInLb,
                        110,
                        format!("ct.new && {}.dst == {}", family, vip),
                        actions,
                        tag
                    );
                }
            }
        }
    }
}

fn build_stateful(dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInStateful, 0, "1", "next;");
    lflow!(flows, dp, SwitchOutStateful, 0, "1", "next;");
    lflow!(
        flows,
        dp,
        SwitchInStateful,
        100,
        "reg0[1] == 1",
        "ct_commit(ct_label=0/1); next;"
    );
    lflow!(
        flows,
        dp,
        SwitchOutStateful,
        100,
        "reg0[1] == 1",
        "ct_commit(ct_label=0/1); next;"
    );
    lflow!(flows, dp, SwitchInStateful, 100, "reg0[2] == 1", "ct_lb;");
    lflow!(flows, dp, SwitchOutStateful, 100, "reg0[2] == 1", "ct_lb;");
}

fn arp_reply_actions(mac: MacAddr, ip: &V4Addr) -> String {
    format!(
        "eth.dst = eth.src; eth.src = {mac}; arp.op = 2; /* ARP reply */ \
         arp.tha = arp.sha; arp.sha = {mac}; arp.tpa = arp.spa; arp.spa = {ip}; \
         outport = inport; flags.loopback = 1; output;",
        mac = mac,
        ip = ip.addr
    )
}

fn build_arp_nd_rsp(ctx: &Context, nb: &NbDb, dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInArpNdRsp, 0, "1", "next;");
    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let lsp = match port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
            Some(lsp) => lsp,
            None => continue,
        };
        if !lsp.is_enabled() {
            continue;
        }
        let tag = hint(lsp.uuid);

        // virtual ports bind to whichever parent answers for the VIP
        if lsp.port_type == "virtual" {
            let vip = lsp.options.get("virtual-ip");
            let parents = lsp.options.get("virtual-parents");
            if let (Some(vip), Some(parents)) = (vip, parents) {
                if vip.parse::<std::net::Ipv4Addr>().is_ok() {
                    for parent in parents.split(',') {
                        lflow!(
                            flows,
                            dp,
                            SwitchInArpNdRsp,
                            100,
                            format!(
                                "inport == \"{parent}\" && \
                                 ((arp.op == 1 && arp.spa == {vip} && arp.tpa == {vip}) || \
                                 (arp.op == 2 && arp.spa == {vip}))",
                                parent = parent,
                                vip = vip
                            ),
                            format!("bind_vport(\"{}\", inport); next;", port.name),
                            tag
                        );
                    }
                }
            }
            continue;
        }

        let responds = lsp.up || lsp.port_type == "router" || lsp.port_type == "localport";
        if !responds {
            continue;
        }
        for entry in &port.addrs {
            for v4 in &entry.ipv4 {
                lflow!(
                    flows,
                    dp,
                    SwitchInArpNdRsp,
                    50,
                    format!("arp.tpa == {} && arp.op == 1", v4.addr),
                    arp_reply_actions(entry.ea, v4),
                    tag
                );
                // the owner's own ARP announcements must pass through
                lflow!(
                    flows,
                    dp,
                    SwitchInArpNdRsp,
                    100,
                    format!(
                        "arp.tpa == {} && arp.op == 1 && inport == \"{}\"",
                        v4.addr, port.name
                    ),
                    "next;",
                    tag
                );
            }
            for v6 in &entry.ipv6 {
                lflow!(
                    flows,
                    dp,
                    SwitchInArpNdRsp,
                    50,
                    format!(
                        "nd_ns && ip6.dst == {{{}, {}}} && nd.target == {}",
                        v6.addr,
                        v6.solicited_node(),
                        v6.addr
                    ),
                    format!(
                        "nd_na {{ eth.src = {mac}; ip6.src = {ip}; nd.target = {ip}; \
                         nd.tll = {mac}; outport = inport; flags.loopback = 1; output; }};",
                        mac = entry.ea,
                        ip = v6.addr
                    ),
                    tag
                );
                lflow!(
                    flows,
                    dp,
                    SwitchInArpNdRsp,
                    100,
                    format!(
                        "nd_ns && ip6.dst == {{{}, {}}} && nd.target == {} && inport == \"{}\"",
                        v6.addr,
                        v6.solicited_node(),
                        v6.addr,
                        port.name
                    ),
                    "next;",
                    tag
                );
            }
        }
    }
}

fn build_dhcp(ctx: &Context, nb: &NbDb, dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInDhcpOptions, 0, "1", "next;");
    lflow!(flows, dp, SwitchInDhcpResponse, 0, "1", "next;");
    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let lsp = match port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
            Some(lsp) => lsp,
            None => continue,
        };
        if !lsp.is_enabled() {
            continue;
        }
        let tag = hint(lsp.uuid);

        if let Some(options) = lsp.dhcpv4_options.and_then(|uuid| nb.dhcp_options.get(&uuid)) {
            let cidr: Option<ipnetwork::Ipv4Network> = options.cidr.parse().ok();
            let server_id = options.options.get("server_id");
            let server_mac = options.options.get("server_mac");
            let lease_time = options.options.get("lease_time");
            if let (Some(cidr), Some(server_id), Some(server_mac), Some(lease_time)) =
                (cidr, server_id, server_mac, lease_time)
            {
                // offer the port's address inside the option cidr
                let offer = port
                    .addrs
                    .iter()
                    .flat_map(|entry| entry.ipv4.iter())
                    .find(|v4| cidr.contains(v4.addr))
                    .map(|v4| v4.addr);
                if let Some(offer) = offer {
                    for entry in port.addrs.iter() {
                        let opts = std::iter::once(format!("offerip = {}", offer))
                            .chain(std::iter::once(format!(
                                "netmask = {}",
                                cidr.mask()
                            )))
                            .chain(std::iter::once(format!("lease_time = {}", lease_time)))
                            .chain(std::iter::once(format!("server_id = {}", server_id)))
                            .chain(
                                options
                                    .options
                                    .iter()
                                    .filter(|(key, _)| {
                                        !matches!(
                                            key.as_str(),
                                            "server_id" | "server_mac" | "lease_time"
                                        )
                                    })
                                    .map(|(key, value)| format!("{} = {}", key, value)),
                            )
                            .collect::<Vec<_>>()
                            .join(", ");
                        let discover = format!(
                            "inport == \"{}\" && eth.src == {} && ip4.src == 0.0.0.0 && \
                             ip4.dst == 255.255.255.255 && udp.src == 68 && udp.dst == 67",
                            port.name, entry.ea
                        );
                        let request = format!(
                            "inport == \"{}\" && eth.src == {} && ip4.src == {} && \
                             ip4.dst == {{{}, 255.255.255.255}} && udp.src == 68 && udp.dst == 67",
                            port.name, entry.ea, offer, server_id
                        );
                        let put = format!("reg0[3] = put_dhcp_opts({}); next;", opts);
                        lflow!(flows, dp, SwitchInDhcpOptions, 100, discover.clone(), put.clone(), tag);
                        lflow!(flows, dp, SwitchInDhcpOptions, 100, request.clone(), put, tag);
                        let reply = format!(
                            "eth.dst = eth.src; eth.src = {}; ip4.src = {}; udp.src = 67; \
                             udp.dst = 68; outport = inport; flags.loopback = 1; output;",
                            server_mac, server_id
                        );
                        lflow!(
                            flows,
                            dp,
                            SwitchInDhcpResponse,
                            100,
                            format!("{} && reg0[3]", discover),
                            reply.clone(),
                            tag
                        );
                        lflow!(
                            flows,
                            dp,
                            SwitchInDhcpResponse,
                            100,
                            format!("{} && reg0[3]", request),
                            reply,
                            tag
                        );
                    }
                }
            }
        }

        if let Some(options) = lsp.dhcpv6_options.and_then(|uuid| nb.dhcp_options.get(&uuid)) {
            let server_mac = options
                .options
                .get("server_id")
                .and_then(|text| text.parse::<MacAddr>().ok());
            if let Some(server_mac) = server_mac {
                let link_local = eui64(server_mac, "fe80::".parse::<Ipv6Addr>().expect("const"));
                let offer = port
                    .addrs
                    .iter()
                    .flat_map(|entry| entry.ipv6.iter())
                    .next()
                    .map(|v6| v6.addr);
                if let Some(offer) = offer {
                    for entry in port.addrs.iter() {
                        let request = format!(
                            "inport == \"{}\" && eth.src == {} && \
                             ip6.dst == ff02::1:2 && udp.src == 546 && udp.dst == 547",
                            port.name, entry.ea
                        );
                        lflow!(
                            flows,
                            dp,
                            SwitchInDhcpOptions,
                            100,
                            request.clone(),
                            format!(
                                "reg0[3] = put_dhcpv6_opts(ia_addr = {}, server_id = {}); next;",
                                offer, server_mac
                            ),
                            tag
                        );
                        lflow!(
                            flows,
                            dp,
                            SwitchInDhcpResponse,
                            100,
                            format!("{} && reg0[3]", request),
                            format!(
                                "eth.dst = eth.src; eth.src = {}; ip6.dst = ip6.src; \
                                 ip6.src = {}; udp.src = 547; udp.dst = 546; \
                                 outport = inport; flags.loopback = 1; output;",
                                server_mac, link_local
                            ),
                            tag
                        );
                    }
                }
            }
        }
    }
}

fn build_dns(dp: usize, has_dns: bool, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInDnsLookup, 0, "1", "next;");
    lflow!(flows, dp, SwitchInDnsResponse, 0, "1", "next;");
    if !has_dns {
        return;
    }
    lflow!(
        flows,
        dp,
        SwitchInDnsLookup,
        100,
        "udp.dst == 53",
        "reg0[4] = dns_lookup(); next;"
    );
    lflow!(
        flows,
        dp,
        SwitchInDnsResponse,
        100,
        "udp.dst == 53 && reg0[4] == 1",
        "eth.dst <-> eth.src; ip4.src <-> ip4.dst; udp.dst = udp.src; udp.src = 53; \
         flags.loopback = 1; output;"
    );
}

/// ARP/ND for the attached routers' addresses must not leave through an
/// external port bound elsewhere
fn build_external_port(ctx: &Context, nb: &NbDb, dp: usize, flows: &mut LflowSet) {
    lflow!(flows, dp, SwitchInExternalPort, 0, "1", "next;");
    let router_ports = match ctx.datapaths[dp].as_switch() {
        Some(switch) => &switch.router_ports,
        None => return,
    };
    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let is_external = port
            .lsp_uuid()
            .and_then(|uuid| nb.switch_ports.get(&uuid))
            .map(|lsp| lsp.port_type == "external")
            .unwrap_or(false);
        if !is_external {
            continue;
        }
        for &rp in router_ports.iter() {
            let networks = match &ctx.ports[rp].networks {
                Some(networks) => networks,
                None => continue,
            };
            for v4 in &networks.ipv4 {
                lflow!(
                    flows,
                    dp,
                    SwitchInExternalPort,
                    100,
                    format!(
                        "inport == \"{port}\" && arp.tpa == {ip} && arp.op == 1 && \
                         !is_chassis_resident(\"{port}\")",
                        port = port.name,
                        ip = v4.addr
                    ),
                    "drop;"
                );
            }
            for v6 in &networks.ipv6 {
                lflow!(
                    flows,
                    dp,
                    SwitchInExternalPort,
                    100,
                    format!(
                        "inport == \"{port}\" && nd_ns && nd.target == {ip} && \
                         !is_chassis_resident(\"{port}\")",
                        port = port.name,
                        ip = v6.addr
                    ),
                    "drop;"
                );
            }
        }
    }
}

fn build_l2_lkup(
    ctx: &Context,
    nb: &NbDb,
    dp: usize,
    mcast: &McastGroups,
    flows: &mut LflowSet,
) {
    let switch = ctx.datapaths[dp].as_switch().expect("switch datapath");

    lflow!(
        flows,
        dp,
        SwitchInL2Lkup,
        70,
        "eth.mcast",
        format!("outport = \"{}\"; output;", MC_FLOOD)
    );

    if switch.mcast.enabled {
        lflow!(flows, dp, SwitchInL2Lkup, 100, "eth.mcast && igmp", "igmp;");
        // link-local multicast always floods
        lflow!(
            flows,
            dp,
            SwitchInL2Lkup,
            85,
            "ip4.mcast && ip4.dst == 224.0.0.0/24",
            format!("outport = \"{}\"; output;", MC_FLOOD)
        );
        let mut actions = String::new();
        if switch.flood_relay && mcast.has(dp, MC_MROUTER_FLOOD) {
            actions.push_str(&format!(
                "clone {{ outport = \"{}\"; output; }}; ",
                MC_MROUTER_FLOOD
            ));
        }
        if switch.mcast.flood_unregistered {
            actions.push_str(&format!("outport = \"{}\"; output;", MC_FLOOD));
        } else if mcast.has(dp, MC_STATIC) {
            actions.push_str(&format!("outport = \"{}\"; output;", MC_STATIC));
        } else {
            actions.push_str("drop;");
        }
        lflow!(flows, dp, SwitchInL2Lkup, 80, "ip4.mcast", actions);

        for (address, _) in mcast.learned(dp) {
            lflow!(
                flows,
                dp,
                SwitchInL2Lkup,
                90,
                format!("eth.mcast && ip4 && ip4.dst == {}", address),
                format!("outport = \"{}\"; output;", address)
            );
        }
    }

    for &index in &ctx.datapaths[dp].ports {
        let port = &ctx.ports[index];
        let lsp = match port.lsp_uuid().and_then(|uuid| nb.switch_ports.get(&uuid)) {
            Some(lsp) => lsp,
            None => continue,
        };
        if !lsp.is_enabled() {
            continue;
        }
        for entry in &port.addrs {
            lflow!(
                flows,
                dp,
                SwitchInL2Lkup,
                50,
                format!("eth.dst == {}", entry.ea),
                format!("outport = \"{}\"; output;", port.name),
                hint(lsp.uuid)
            );
        }
    }

    if switch.has_unknown && mcast.has(dp, MC_UNKNOWN) {
        lflow!(
            flows,
            dp,
            SwitchInL2Lkup,
            0,
            "1",
            format!("outport = \"{}\"; output;", MC_UNKNOWN)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vip() {
        assert_eq!(
            parse_vip("10.0.0.10:80"),
            Some(("10.0.0.10".to_string(), Some(80)))
        );
        assert_eq!(parse_vip("10.0.0.10"), Some(("10.0.0.10".to_string(), None)));
        assert_eq!(
            parse_vip("[fd00::10]:8080"),
            Some(("fd00::10".to_string(), Some(8080)))
        );
        assert_eq!(parse_vip("fd00::10"), Some(("fd00::10".to_string(), None)));
        assert_eq!(parse_vip("not-an-ip"), None);
    }

    #[test]
    fn test_arp_reply_shape() {
        let mac: MacAddr = "0a:00:00:00:00:01".parse().unwrap();
        let ip = V4Addr::host("10.0.0.5".parse().unwrap());
        let actions = arp_reply_actions(mac, &ip);
        assert!(actions.contains("arp.op = 2"));
        assert!(actions.contains("arp.spa = 10.0.0.5"));
        assert!(actions.ends_with("output;"));
    }
}
