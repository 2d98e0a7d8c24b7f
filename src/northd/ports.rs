//! Port join: build the per-pass port arena from both databases,
//! resolve peering by name in a second sweep, allocate container VLAN
//! tags and port tunnel keys, and converge southbound Port_Binding rows.

use std::collections::HashMap;

use log::info;
use uuid::Uuid;

use crate::db::nb::{LogicalSwitchPort, NbDb};
use crate::db::sb::{PortBinding, SbDb};
use crate::db::StrMap;
use crate::utils::{Bitmap, LspAddress, LportAddresses};
use crate::warn_rl;

use super::{Context, DpData, DynamicRequest, Port, PortNb};

pub fn join_ports(nb: &mut NbDb, sb: &SbDb, ctx: &mut Context) {
    // Southbound pass: every existing binding becomes an in-memory
    // port, initially southbound-only
    for pb in sb.port_bindings.iter() {
        if ctx.port_by_name.contains_key(&pb.logical_port) {
            // duplicate binding for the same name; the write-back pass
            // deletes whichever row was not adopted
            continue;
        }
        let mut port = Port::new(pb.logical_port.clone());
        port.sb_uuid = Some(pb.uuid);
        port.tunnel_key = pb.tunnel_key;
        port.dp = ctx.dp_by_sb.get(&pb.datapath).copied();
        if let Some(dp) = port.dp {
            ctx.datapaths[dp].port_keys.claim(pb.tunnel_key);
        }
        ctx.add_port(port);
        // queue ids already handed out stay stable
        if let (Some(chassis), Some(queue)) = (
            pb.chassis,
            pb.options
                .get("qdisc_queue_id")
                .and_then(|v| v.parse::<u32>().ok()),
        ) {
            ctx.queues.claim(chassis, queue);
        }
    }

    join_switch_ports(nb, ctx);
    join_router_ports(nb, ctx);
    resolve_peers(nb, ctx);
    allocate_tags(nb, ctx);

    // Fresh tunnel keys for northbound-only ports
    for index in 0..ctx.ports.len() {
        if ctx.ports[index].tunnel_key != 0 || !ctx.ports[index].is_nb() {
            continue;
        }
        let dp = match ctx.ports[index].dp {
            Some(dp) => dp,
            None => continue,
        };
        match ctx.datapaths[dp].port_keys.allocate() {
            Some(key) => ctx.ports[index].tunnel_key = key,
            None => {
                warn_rl!(
                    ctx.warn,
                    "port tunnel keys exhausted on {}; {} gets none this pass",
                    ctx.datapaths[dp].name(),
                    ctx.ports[index].name
                );
            }
        }
    }
}

fn join_switch_ports(nb: &NbDb, ctx: &mut Context) {
    for ls in nb.switches.iter() {
        let dp_index = match ctx.switch_by_nb.get(&ls.uuid) {
            Some(&index) => index,
            None => continue,
        };
        for lsp_uuid in &ls.ports {
            let lsp = match nb.switch_ports.get(lsp_uuid) {
                Some(lsp) => lsp,
                None => continue,
            };
            let index = match ctx.port_by_name.get(&lsp.name) {
                Some(&index) if ctx.ports[index].is_nb() => {
                    warn_rl!(ctx.warn, "duplicate logical port name {}", lsp.name);
                    continue;
                }
                Some(&index) => index,
                None => ctx.add_port(Port::new(lsp.name.clone())),
            };
            {
                let port = &mut ctx.ports[index];
                port.nb = PortNb::Switch(lsp.uuid);
                port.dp = Some(dp_index);
            }
            ctx.datapaths[dp_index].ports.push(index);
            parse_switch_port(lsp, ctx, index, dp_index);
        }
    }
}

fn parse_switch_port(lsp: &LogicalSwitchPort, ctx: &mut Context, index: usize, dp_index: usize) {
    for entry in &lsp.addresses {
        match LspAddress::parse(entry) {
            Ok(LspAddress::Unknown) => {
                ctx.ports[index].has_unknown = true;
                if let Some(switch) = ctx.datapaths[dp_index].as_switch_mut() {
                    switch.has_unknown = true;
                }
            }
            Ok(LspAddress::Router) => ctx.ports[index].wants_router_addrs = true,
            Ok(LspAddress::Dynamic { mac, ip4, ip6 }) => {
                if ctx.ports[index].dynamic.is_some() {
                    warn_rl!(
                        ctx.warn,
                        "port {}: only one dynamic address entry is honored",
                        lsp.name
                    );
                } else {
                    ctx.ports[index].dynamic = Some(DynamicRequest { mac, ip4, ip6 });
                }
            }
            Ok(LspAddress::Static(addrs)) => ctx.ports[index].addrs.push(addrs),
            Err(err) => {
                warn_rl!(ctx.warn, "port {}: {}", lsp.name, err);
            }
        }
    }
    for entry in &lsp.port_security {
        match LportAddresses::from_entry(entry) {
            Ok(addrs) => ctx.ports[index].ps_addrs.push(addrs),
            Err(err) => {
                warn_rl!(ctx.warn, "port {} port_security: {}", lsp.name, err);
            }
        }
    }
    if lsp.port_type == "localnet" {
        if let Some(switch) = ctx.datapaths[dp_index].as_switch_mut() {
            switch.localnet_port = Some(index);
        }
    }
}

fn join_router_ports(nb: &NbDb, ctx: &mut Context) {
    for lr in nb.routers.iter() {
        let dp_index = match ctx.router_by_nb.get(&lr.uuid) {
            Some(&index) => index,
            None => continue,
        };
        for lrp_uuid in &lr.ports {
            let lrp = match nb.router_ports.get(lrp_uuid) {
                Some(lrp) => lrp,
                None => continue,
            };
            let networks = match LportAddresses::from_networks(&lrp.mac, &lrp.networks) {
                Ok(networks) => networks,
                Err(err) => {
                    warn_rl!(ctx.warn, "router port {}: {}", lrp.name, err);
                    continue;
                }
            };
            let index = match ctx.port_by_name.get(&lrp.name) {
                Some(&index) if ctx.ports[index].is_nb() => {
                    warn_rl!(ctx.warn, "duplicate logical port name {}", lrp.name);
                    continue;
                }
                Some(&index) => index,
                None => ctx.add_port(Port::new(lrp.name.clone())),
            };
            {
                let port = &mut ctx.ports[index];
                port.nb = PortNb::Router(lrp.uuid);
                port.dp = Some(dp_index);
                port.networks = Some(networks);
            }
            ctx.datapaths[dp_index].ports.push(index);

            let wants_redirect = lrp.ha_chassis_group.is_some()
                || !lrp.gateway_chassis.is_empty()
                || lrp.options.contains_key("redirect-chassis");
            if !wants_redirect {
                continue;
            }
            if ctx.datapaths[dp_index].is_gateway_router() {
                warn_rl!(
                    ctx.warn,
                    "router port {}: redirect configuration ignored on a gateway router",
                    lrp.name
                );
                continue;
            }
            if ctx.datapaths[dp_index]
                .as_router()
                .map(|r| r.l3dgw_port.is_some())
                .unwrap_or(false)
            {
                warn_rl!(
                    ctx.warn,
                    "router {}: at most one distributed gateway port; ignoring {}",
                    ctx.datapaths[dp_index].name(),
                    lrp.name
                );
                continue;
            }
            let cr_name = format!("cr-{}", lrp.name);
            let cr_index = match ctx.port_by_name.get(&cr_name) {
                Some(&existing) if ctx.ports[existing].is_nb() => {
                    warn_rl!(ctx.warn, "name {} is already a logical port", cr_name);
                    continue;
                }
                Some(&existing) => existing,
                None => ctx.add_port(Port::new(cr_name)),
            };
            let networks = ctx.ports[index].networks.clone();
            {
                let cr = &mut ctx.ports[cr_index];
                cr.nb = PortNb::Router(lrp.uuid);
                cr.dp = Some(dp_index);
                cr.derived = true;
                cr.networks = networks;
            }
            ctx.datapaths[dp_index].ports.push(cr_index);
            let router = ctx.datapaths[dp_index].as_router_mut().expect("router");
            router.l3dgw_port = Some(index);
            router.redirect_port = Some(cr_index);
        }
    }
}

fn resolve_peers(nb: &NbDb, ctx: &mut Context) {
    // Switch "router" ports pair with the named router port
    let mut pairs: Vec<(usize, String)> = Vec::new();
    for (index, port) in ctx.ports.iter().enumerate() {
        if let Some(lsp_uuid) = port.lsp_uuid() {
            if let Some(lsp) = nb.switch_ports.get(&lsp_uuid) {
                if lsp.port_type == "router" {
                    if let Some(name) = lsp.options.get("router-port") {
                        pairs.push((index, name.clone()));
                    }
                }
            }
        }
    }
    for (index, name) in pairs {
        let peer = match ctx.port_by_name.get(&name) {
            Some(&peer) if ctx.ports[peer].lrp_uuid().is_some() && !ctx.ports[peer].derived => {
                peer
            }
            _ => continue,
        };
        ctx.ports[index].peer = Some(peer);
        ctx.ports[peer].peer = Some(index);
        let switch_dp = ctx.ports[index].dp;
        let router_dp = ctx.ports[peer].dp;
        let relay = router_dp
            .and_then(|dp| ctx.datapaths[dp].as_router())
            .map(|r| r.mcast.relay)
            .unwrap_or(false);
        if let Some(dp) = switch_dp {
            if let Some(switch) = ctx.datapaths[dp].as_switch_mut() {
                switch.router_ports.push(peer);
                if relay {
                    switch.flood_relay = true;
                }
            }
        }
        if ctx.ports[index].wants_router_addrs {
            if let Some(networks) = ctx.ports[peer].networks.clone() {
                ctx.ports[index].addrs.push(networks);
            }
        }
    }

    // Router ports directly peered with another router port
    let mut router_pairs: Vec<(usize, String)> = Vec::new();
    for (index, port) in ctx.ports.iter().enumerate() {
        if port.derived {
            continue;
        }
        if let Some(lrp_uuid) = port.lrp_uuid() {
            if let Some(lrp) = nb.router_ports.get(&lrp_uuid) {
                if let Some(peer) = &lrp.peer {
                    router_pairs.push((index, peer.clone()));
                }
            }
        }
    }
    for (index, name) in router_pairs {
        match ctx.port_by_name.get(&name) {
            Some(&peer) if ctx.ports[peer].lrp_uuid().is_some() && !ctx.ports[peer].derived => {
                ctx.ports[index].peer = Some(peer);
                ctx.ports[peer].peer = Some(index);
            }
            Some(_) => {
                warn_rl!(
                    ctx.warn,
                    "router port {} peers with {}, which is not a router port",
                    ctx.ports[index].name,
                    name
                );
            }
            None => (),
        }
    }
}

/// Per-parent VLAN tag allocation for nested container ports. Bit 0 is
/// reserved; explicit nonzero requests are copied verbatim.
fn allocate_tags(nb: &mut NbDb, ctx: &mut Context) {
    let mut used: HashMap<String, Bitmap> = HashMap::new();
    let mut pending: Vec<(Uuid, String)> = Vec::new();
    for port in &ctx.ports {
        let lsp_uuid = match port.lsp_uuid() {
            Some(uuid) => uuid,
            None => continue,
        };
        let lsp = match nb.switch_ports.get(&lsp_uuid) {
            Some(lsp) => lsp,
            None => continue,
        };
        let parent = match &lsp.parent_name {
            Some(parent) => parent.clone(),
            None => continue,
        };
        let tags = used.entry(parent.clone()).or_insert_with(|| {
            let mut bitmap = Bitmap::new(4096);
            bitmap.set(0);
            bitmap
        });
        match (lsp.tag_request, lsp.tag) {
            (Some(0), Some(tag)) | (None, Some(tag)) if (tag as usize) < 4096 => {
                tags.set(tag as usize);
            }
            (Some(0), None) => pending.push((lsp_uuid, parent)),
            (Some(request), _) if request > 0 && (request as usize) < 4096 => {
                tags.set(request as usize);
                if lsp.tag != Some(request) {
                    pending.push((lsp_uuid, format!("={}", request)));
                }
            }
            _ => (),
        }
    }
    for (lsp_uuid, parent) in pending {
        if let Some(explicit) = parent.strip_prefix('=') {
            let tag: u16 = explicit.parse().expect("validated above");
            nb.switch_ports.modify(&lsp_uuid, |lsp| lsp.tag = Some(tag));
            continue;
        }
        let tags = used.get_mut(&parent).expect("bitmap exists");
        match tags.first_clear() {
            Some(tag) => {
                tags.set(tag);
                nb.switch_ports
                    .modify(&lsp_uuid, |lsp| lsp.tag = Some(tag as u16));
            }
            None => {
                warn_rl!(ctx.warn, "no VLAN tags left under parent {}", parent);
            }
        }
    }
}

/// Converge southbound Port_Binding rows to the in-memory port set
pub fn update_port_bindings(nb: &NbDb, sb: &mut SbDb, ctx: &mut Context) {
    // Deletions: rows not adopted by a live northbound port
    for uuid in sb.port_bindings.uuids() {
        let row = sb.port_bindings.get(&uuid).expect("binding row").clone();
        let keep = ctx
            .port_by_name
            .get(&row.logical_port)
            .map(|&index| {
                let port = &ctx.ports[index];
                port.is_nb()
                    && port.dp.is_some()
                    && port.tunnel_key != 0
                    && port.sb_uuid == Some(uuid)
            })
            .unwrap_or(false);
        if !keep {
            info!("deleting Port_Binding {}", row.logical_port);
            sb.port_bindings.remove(&uuid);
        }
    }

    // Per-chassis qdisc queues for ports carrying a QoS rate; ids
    // already present on a binding stay stable
    let mut queue_for_port: HashMap<usize, u32> = HashMap::new();
    for index in 0..ctx.ports.len() {
        let wants_queue = ctx.ports[index]
            .lsp_uuid()
            .and_then(|uuid| nb.switch_ports.get(&uuid))
            .map(|lsp| lsp.options.contains_key("qos_max_rate"))
            .unwrap_or(false);
        if !wants_queue {
            continue;
        }
        let row = ctx.ports[index]
            .sb_uuid
            .and_then(|uuid| sb.port_bindings.get(&uuid));
        let chassis = match row.and_then(|r| r.chassis) {
            Some(chassis) => chassis,
            None => continue,
        };
        let existing = row
            .and_then(|r| r.options.get("qdisc_queue_id"))
            .and_then(|v| v.parse::<u32>().ok());
        let queue = match existing {
            Some(queue) => Some(queue),
            None => ctx.queues.allocate(chassis),
        };
        match queue {
            Some(queue) => {
                queue_for_port.insert(index, queue);
            }
            None => {
                warn_rl!(
                    ctx.warn,
                    "qdisc queue ids exhausted for port {}",
                    ctx.ports[index].name
                );
            }
        }
    }

    for index in 0..ctx.ports.len() {
        let port = &ctx.ports[index];
        if !port.is_nb() || port.tunnel_key == 0 {
            continue;
        }
        let dp = match port.dp {
            Some(dp) => dp,
            None => continue,
        };
        let dp_uuid = match ctx.datapaths[dp].sb_uuid {
            Some(uuid) => uuid,
            None => continue,
        };
        let desired = match &ctx.ports[index].nb {
            PortNb::Switch(lsp_uuid) => {
                desired_switch_binding(nb, ctx, index, *lsp_uuid, &queue_for_port)
            }
            PortNb::Router(lrp_uuid) => desired_router_binding(nb, ctx, index, *lrp_uuid),
            PortNb::None => continue,
        };
        let desired = match desired {
            Some(desired) => desired,
            None => continue,
        };
        match ctx.ports[index].sb_uuid {
            Some(sb_uuid) if sb.port_bindings.contains(&sb_uuid) => {
                sb.port_bindings.modify(&sb_uuid, |row| {
                    row.datapath = dp_uuid;
                    row.tunnel_key = desired.tunnel_key;
                    row.port_type = desired.port_type.clone();
                    row.options = desired.options.clone();
                    row.mac = desired.mac.clone();
                    row.nat_addresses = desired.nat_addresses.clone();
                    row.parent_port = desired.parent_port.clone();
                    row.tag = desired.tag;
                    row.virtual_parent = desired.virtual_parent.clone();
                    row.external_ids = desired.external_ids.clone();
                    row.ha_chassis_group = desired.ha_chassis_group;
                    // the chassis column belongs to the agents
                });
            }
            _ => {
                let uuid = sb.port_bindings.insert(PortBinding {
                    uuid: Uuid::new_v4(),
                    logical_port: ctx.ports[index].name.clone(),
                    datapath: dp_uuid,
                    chassis: None,
                    gateway_chassis: Vec::new(),
                    ..desired
                });
                ctx.ports[index].sb_uuid = Some(uuid);
            }
        }
    }
}

fn desired_switch_binding(
    nb: &NbDb,
    ctx: &Context,
    index: usize,
    lsp_uuid: Uuid,
    queue_for_port: &HashMap<usize, u32>,
) -> Option<PortBinding> {
    let port = &ctx.ports[index];
    let lsp = nb.switch_ports.get(&lsp_uuid)?;
    let mut options = lsp.options.clone();
    let mut port_type = lsp.port_type.clone();
    if lsp.port_type == "router" {
        let peer_router_dp = port
            .peer
            .and_then(|peer| ctx.ports[peer].dp)
            .map(|dp| &ctx.datapaths[dp]);
        let gateway_chassis = peer_router_dp
            .and_then(|dp| dp.as_router())
            .and_then(|r| r.chassis.clone());
        port_type = match gateway_chassis {
            Some(chassis) => {
                options.insert("l3gateway-chassis".to_string(), chassis);
                "l3gateway".to_string()
            }
            None => "patch".to_string(),
        };
        if let Some(peer) = port.peer {
            options.insert("peer".to_string(), ctx.ports[peer].name.clone());
        }
    }
    if let Some(queue) = queue_for_port.get(&index) {
        options.insert("qdisc_queue_id".to_string(), queue.to_string());
    }

    let mut mac: Vec<String> = port.addrs.iter().map(|a| a.to_entry()).collect();
    if port.has_unknown {
        mac.push("unknown".to_string());
    }
    let nat_addresses = match (port_type.as_str(), port.peer) {
        ("l3gateway", Some(peer)) | ("patch", Some(peer)) => nat_addresses_for(nb, ctx, peer),
        _ => Vec::new(),
    };
    Some(PortBinding {
        uuid: Uuid::nil(),
        logical_port: port.name.clone(),
        port_type,
        datapath: Uuid::nil(),
        tunnel_key: port.tunnel_key,
        parent_port: lsp.parent_name.clone(),
        tag: lsp.tag,
        virtual_parent: None,
        mac,
        nat_addresses,
        options,
        external_ids: lsp.external_ids.clone(),
        chassis: None,
        gateway_chassis: Vec::new(),
        ha_chassis_group: ctx.ha_group_for_port.get(&index).copied(),
    })
}

fn desired_router_binding(
    nb: &NbDb,
    ctx: &Context,
    index: usize,
    lrp_uuid: Uuid,
) -> Option<PortBinding> {
    let port = &ctx.ports[index];
    let lrp = nb.router_ports.get(&lrp_uuid)?;
    let dp = &ctx.datapaths[port.dp?];
    let mut options = StrMap::new();
    let port_type;
    if port.derived {
        port_type = "chassisredirect".to_string();
        let original = dp.as_router().and_then(|r| r.l3dgw_port)?;
        options.insert(
            "distributed-port".to_string(),
            ctx.ports[original].name.clone(),
        );
        if let Some(redirect_type) = lrp.options.get("redirect-type") {
            options.insert("redirect-type".to_string(), redirect_type.clone());
        }
    } else if dp.is_gateway_router() {
        port_type = "l3gateway".to_string();
        if let Some(chassis) = dp.as_router().and_then(|r| r.chassis.clone()) {
            options.insert("l3gateway-chassis".to_string(), chassis);
        }
        if let Some(peer) = port.peer {
            options.insert("peer".to_string(), ctx.ports[peer].name.clone());
        }
    } else {
        port_type = "patch".to_string();
        if let Some(peer) = port.peer {
            options.insert("peer".to_string(), ctx.ports[peer].name.clone());
        }
    }
    let mac = port
        .networks
        .as_ref()
        .map(|n| vec![n.to_entry()])
        .unwrap_or_default();
    Some(PortBinding {
        uuid: Uuid::nil(),
        logical_port: port.name.clone(),
        port_type,
        datapath: Uuid::nil(),
        tunnel_key: port.tunnel_key,
        parent_port: None,
        tag: None,
        virtual_parent: None,
        mac,
        nat_addresses: Vec::new(),
        options,
        external_ids: lrp.external_ids.clone(),
        chassis: None,
        gateway_chassis: Vec::new(),
        ha_chassis_group: ctx.ha_group_for_port.get(&index).copied(),
    })
}

/// GARP advertisement addresses for the router port behind a switch's
/// router-type port: the router MAC plus every NAT external address.
/// On a distributed gateway router the redirect port's residence clause
/// is appended exactly once.
pub fn nat_addresses_for(nb: &NbDb, ctx: &Context, router_port: usize) -> Vec<String> {
    let port = &ctx.ports[router_port];
    let dp_index = match port.dp {
        Some(dp) => dp,
        None => return Vec::new(),
    };
    let dp = &ctx.datapaths[dp_index];
    let router = match dp.as_router() {
        Some(router) => router,
        None => return Vec::new(),
    };
    let networks = match &port.networks {
        Some(networks) => networks,
        None => return Vec::new(),
    };
    let is_gateway = dp.is_gateway_router();
    let has_redirect = router.redirect_port.is_some();
    if !is_gateway && !has_redirect {
        return Vec::new();
    }
    let lr = match nb.routers.get(&router.nb) {
        Some(lr) => lr,
        None => return Vec::new(),
    };
    let mut addresses: Vec<String> = Vec::new();
    for nat_uuid in &lr.nat {
        if let Some(nat) = nb.nats.get(nat_uuid) {
            if !nat.external_ip.is_empty() {
                addresses.push(nat.external_ip.clone());
            }
        }
    }
    if addresses.is_empty() {
        return Vec::new();
    }
    let mut entry = networks.ea.to_string();
    for address in addresses {
        entry.push(' ');
        entry.push_str(&address);
    }
    if let Some(redirect) = router.redirect_port {
        entry.push_str(&format!(
            " is_chassis_resident(\"{}\")",
            ctx.ports[redirect].name
        ));
    }
    vec![entry]
}
