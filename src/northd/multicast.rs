//! Multicast groups: the five well-known per-switch groups, dynamic
//! groups learned from southbound IGMP reports, and relay propagation
//! into peered routers.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::{MulticastGroup, SbDb};
use crate::warn_rl;

use super::keys::{
    MCAST_FLOOD_KEY, MCAST_MROUTER_FLOOD_KEY, MCAST_MROUTER_STATIC_KEY, MCAST_STATIC_KEY,
    MCAST_UNKNOWN_KEY,
};
use super::Context;

pub const MC_FLOOD: &str = "_MC_flood";
pub const MC_UNKNOWN: &str = "_MC_unknown";
pub const MC_MROUTER_FLOOD: &str = "_MC_mrouter_flood";
pub const MC_MROUTER_STATIC: &str = "_MC_mrouter_static";
pub const MC_STATIC: &str = "_MC_static";

pub fn static_key(name: &str) -> Option<u32> {
    match name {
        MC_FLOOD => Some(MCAST_FLOOD_KEY),
        MC_UNKNOWN => Some(MCAST_UNKNOWN_KEY),
        MC_MROUTER_FLOOD => Some(MCAST_MROUTER_FLOOD_KEY),
        MC_MROUTER_STATIC => Some(MCAST_MROUTER_STATIC_KEY),
        MC_STATIC => Some(MCAST_STATIC_KEY),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct McastGroup {
    pub key: u32,
    pub ports: Vec<usize>,
}

/// All synthesized multicast groups for this pass, keyed by
/// (datapath index, group name)
#[derive(Debug, Default)]
pub struct McastGroups {
    groups: BTreeMap<(usize, String), McastGroup>,
}

impl McastGroups {
    fn add(&mut self, dp: usize, name: &str, key: u32, port: usize) {
        let group = self
            .groups
            .entry((dp, name.to_string()))
            .or_insert(McastGroup {
                key,
                ports: Vec::new(),
            });
        if !group.ports.contains(&port) {
            group.ports.push(port);
        }
    }

    pub fn get(&self, dp: usize, name: &str) -> Option<&McastGroup> {
        self.groups.get(&(dp, name.to_string()))
    }

    pub fn has(&self, dp: usize, name: &str) -> bool {
        self.get(dp, name).is_some()
    }

    /// Dynamic (IGMP-learned) groups of one datapath; the well-known
    /// groups all start with an underscore
    pub fn learned(&self, dp: usize) -> impl Iterator<Item = (&str, &McastGroup)> {
        self.groups
            .iter()
            .filter(move |((index, name), _)| *index == dp && !name.starts_with('_'))
            .map(|((_, name), group)| (name.as_str(), group))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str, &McastGroup)> {
        self.groups
            .iter()
            .map(|((dp, name), group)| (*dp, name.as_str(), group))
    }
}

pub fn build_mcast_groups(nb: &NbDb, sb: &mut SbDb, ctx: &mut Context) -> McastGroups {
    let mut mcast = McastGroups::default();

    for index in 0..ctx.ports.len() {
        let port = &ctx.ports[index];
        if !port.is_nb() || port.tunnel_key == 0 {
            continue;
        }
        let dp = match port.dp {
            Some(dp) => dp,
            None => continue,
        };
        if let Some(lsp_uuid) = port.lsp_uuid() {
            let lsp = match nb.switch_ports.get(&lsp_uuid) {
                Some(lsp) => lsp,
                None => continue,
            };
            if !lsp.is_enabled() {
                continue;
            }
            mcast.add(dp, MC_FLOOD, MCAST_FLOOD_KEY, index);
            if port.has_unknown {
                mcast.add(dp, MC_UNKNOWN, MCAST_UNKNOWN_KEY, index);
            }
            if lsp.options.get("mcast_flood").map(|v| v == "true") == Some(true) {
                mcast.add(dp, MC_STATIC, MCAST_STATIC_KEY, index);
            }
            if lsp.options.get("mcast_flood_reports").map(|v| v == "true") == Some(true) {
                mcast.add(dp, MC_MROUTER_STATIC, MCAST_MROUTER_STATIC_KEY, index);
            }
            // router attachments with relay enabled behave as mrouters
            let peer_relay = port
                .peer
                .and_then(|peer| ctx.ports[peer].dp)
                .and_then(|rdp| ctx.datapaths[rdp].as_router())
                .map(|r| r.mcast.relay)
                .unwrap_or(false);
            if peer_relay {
                mcast.add(dp, MC_MROUTER_FLOOD, MCAST_MROUTER_FLOOD_KEY, index);
            }
        } else if port.lrp_uuid().is_some() && !port.derived {
            let relay = ctx.datapaths[dp]
                .as_router()
                .map(|r| r.mcast.relay)
                .unwrap_or(false);
            if relay {
                mcast.add(dp, MC_FLOOD, MCAST_FLOOD_KEY, index);
            }
        }
    }

    aggregate_igmp(sb, ctx, &mut mcast);
    mcast
}

/// Fold live southbound IGMP reports into per-(datapath, address)
/// groups, dropping stale rows and propagating learned groups into
/// relay routers.
fn aggregate_igmp(sb: &mut SbDb, ctx: &mut Context, mcast: &mut McastGroups) {
    let port_by_sb: HashMap<Uuid, usize> = ctx
        .ports
        .iter()
        .enumerate()
        .filter_map(|(index, port)| port.sb_uuid.map(|uuid| (uuid, index)))
        .collect();

    let mut aggregated: BTreeMap<(usize, String), Vec<usize>> = BTreeMap::new();
    for uuid in sb.igmp_groups.uuids() {
        let row = sb.igmp_groups.get(&uuid).expect("igmp row").clone();
        let dp = match (row.chassis, row.datapath) {
            (Some(_), Some(datapath)) => ctx.dp_by_sb.get(&datapath).copied(),
            _ => None,
        };
        let dp = match dp {
            Some(dp) => dp,
            None => {
                sb.igmp_groups.remove(&uuid);
                continue;
            }
        };
        let entry = aggregated.entry((dp, row.address.clone())).or_default();
        for pb_uuid in &row.ports {
            match port_by_sb.get(pb_uuid) {
                Some(&port) => {
                    if !entry.contains(&port) {
                        entry.push(port);
                    }
                }
                None => {
                    warn_rl!(
                        ctx.warn,
                        "IGMP group {} references unknown port binding {}",
                        row.address,
                        pb_uuid
                    );
                }
            }
        }
    }

    for ((dp, address), mut ports) in aggregated {
        // ports already flooded to, or facing a relay router, add
        // nothing beyond their flood membership
        ports.retain(|&port| {
            let in_static = mcast
                .get(dp, MC_STATIC)
                .map(|g| g.ports.contains(&port))
                .unwrap_or(false);
            let in_mrouter = mcast
                .get(dp, MC_MROUTER_FLOOD)
                .map(|g| g.ports.contains(&port))
                .unwrap_or(false);
            !in_static && !in_mrouter
        });
        if ports.is_empty() {
            continue;
        }
        let key = match ctx.datapaths[dp].mcast_keys.allocate() {
            Some(key) => key,
            None => {
                warn_rl!(
                    ctx.warn,
                    "multicast keys exhausted on {}; group {} skipped",
                    ctx.datapaths[dp].name(),
                    address
                );
                continue;
            }
        };
        ports.sort_by(|&a, &b| ctx.ports[a].name.cmp(&ctx.ports[b].name));
        for port in &ports {
            mcast.add(dp, &address, key, *port);
        }

        // relay routers learn the group through their attachment port
        let router_ports = ctx.datapaths[dp]
            .as_switch()
            .map(|s| s.router_ports.clone())
            .unwrap_or_default();
        for lrp in router_ports {
            let router_dp = match ctx.ports[lrp].dp {
                Some(router_dp) => router_dp,
                None => continue,
            };
            let relay = ctx.datapaths[router_dp]
                .as_router()
                .map(|r| r.mcast.relay)
                .unwrap_or(false);
            if !relay {
                continue;
            }
            if mcast.get(router_dp, &address).is_none() {
                let key = match ctx.datapaths[router_dp].mcast_keys.allocate() {
                    Some(key) => key,
                    None => continue,
                };
                mcast.add(router_dp, &address, key, lrp);
            } else {
                mcast.add(router_dp, &address, 0, lrp);
            }
        }
    }
}

/// Converge southbound Multicast_Group rows to the synthesized set
pub fn sync_mcast_groups(sb: &mut SbDb, ctx: &Context, mcast: &mut McastGroups) {
    let mut target: HashMap<(Uuid, String), (u32, Vec<Uuid>)> = HashMap::new();
    for (dp, name, group) in mcast.iter() {
        let dp_uuid = match ctx.datapaths[dp].sb_uuid {
            Some(uuid) => uuid,
            None => continue,
        };
        let mut ports: Vec<Uuid> = group
            .ports
            .iter()
            .filter_map(|&port| ctx.ports[port].sb_uuid)
            .collect();
        ports.sort();
        if ports.is_empty() {
            continue;
        }
        target.insert((dp_uuid, name.to_string()), (group.key, ports));
    }

    for uuid in sb.multicast_groups.uuids() {
        let row = sb.multicast_groups.get(&uuid).expect("mcast row").clone();
        match target.remove(&(row.datapath, row.name.clone())) {
            Some((key, ports)) => {
                sb.multicast_groups.modify(&uuid, |row| {
                    row.tunnel_key = key;
                    row.ports = ports.clone();
                });
            }
            None => {
                sb.multicast_groups.remove(&uuid);
            }
        }
    }
    for ((datapath, name), (key, ports)) in target {
        sb.multicast_groups.insert(MulticastGroup {
            uuid: Uuid::new_v4(),
            datapath,
            name,
            tunnel_key: key,
            ports,
        });
    }
}
