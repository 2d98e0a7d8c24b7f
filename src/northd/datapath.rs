//! Datapath join: reconcile northbound switches/routers against
//! southbound Datapath_Binding rows, reusing tunnel keys for rows
//! present on both sides and assigning fresh keys to new ones.

use log::info;
use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::{DatapathBinding, SbDb, EXTID_LOGICAL_ROUTER, EXTID_LOGICAL_SWITCH};
use crate::db::StrMap;
use crate::warn_rl;

use super::keys::{KeySpace, DATAPATH_KEY_MAX, DATAPATH_KEY_MIN};
use super::{
    Context, DaemonState, Datapath, DpData, McastRouterConfig, McastSwitchConfig, RouterData,
    SwitchData,
};

pub fn join_datapaths(nb: &NbDb, sb: &mut SbDb, state: &mut DaemonState, ctx: &mut Context) {
    // Northbound switches
    for ls in nb.switches.iter() {
        let subnet = match ls.other_config.get("subnet") {
            Some(text) => match text.parse::<ipnetwork::Ipv4Network>() {
                Ok(net) if net.prefix() < 31 => Some(net),
                Ok(_) => {
                    warn_rl!(
                        ctx.warn,
                        "switch {}: subnet {} has no allocatable hosts",
                        ls.name,
                        text
                    );
                    None
                }
                Err(_) => {
                    warn_rl!(ctx.warn, "switch {}: invalid subnet '{}'", ls.name, text);
                    None
                }
            },
            None => None,
        };
        let ipv6_prefix = match ls.other_config.get("ipv6_prefix") {
            Some(text) => match text.parse::<std::net::Ipv6Addr>() {
                Ok(prefix) => Some(prefix),
                Err(_) => {
                    warn_rl!(
                        ctx.warn,
                        "switch {}: invalid ipv6_prefix '{}'",
                        ls.name,
                        text
                    );
                    None
                }
            },
            None => None,
        };
        let index = ctx.datapaths.len();
        ctx.datapaths.push(Datapath::new(DpData::Switch(SwitchData {
            nb: ls.uuid,
            name: ls.name.clone(),
            subnet,
            ipv6_prefix,
            ipam: None,
            router_ports: Vec::new(),
            localnet_port: None,
            mcast: McastSwitchConfig::from_config(&ls.other_config),
            flood_relay: false,
            has_unknown: false,
        })));
        ctx.switch_by_nb.insert(ls.uuid, index);
    }

    // Northbound routers; disabled routers are not represented at all,
    // so their southbound state falls out with the sb-only purge below
    for lr in nb.routers.iter() {
        if !lr.is_enabled() {
            continue;
        }
        let index = ctx.datapaths.len();
        ctx.datapaths.push(Datapath::new(DpData::Router(RouterData {
            nb: lr.uuid,
            name: lr.name.clone(),
            chassis: lr.chassis().map(|c| c.to_string()),
            l3dgw_port: None,
            redirect_port: None,
            mcast: McastRouterConfig::from_options(&lr.options),
        })));
        ctx.router_by_nb.insert(lr.uuid, index);
    }

    // Southbound sweep: adopt rows with a live northbound identity,
    // delete malformed rows, duplicates, and orphans
    let mut dp_keys = KeySpace::new(DATAPATH_KEY_MIN, DATAPATH_KEY_MAX);
    dp_keys.set_hint(state.dp_key_hint);
    for uuid in sb.datapaths.uuids() {
        let row = sb.datapaths.get(&uuid).expect("datapath row").clone();
        let identity = match row.nb_identity() {
            Some(identity) => identity,
            None => {
                info!("deleting malformed Datapath_Binding {}", uuid);
                sb.datapaths.remove(&uuid);
                continue;
            }
        };
        let index = match identity {
            (true, nb_uuid) => ctx.switch_by_nb.get(&nb_uuid),
            (false, nb_uuid) => ctx.router_by_nb.get(&nb_uuid),
        };
        match index {
            Some(&index) => {
                if ctx.datapaths[index].sb_uuid.is_some() {
                    info!(
                        "deleting duplicate Datapath_Binding {} for {}",
                        uuid,
                        ctx.datapaths[index].name()
                    );
                    sb.datapaths.remove(&uuid);
                    continue;
                }
                let dp = &mut ctx.datapaths[index];
                dp.sb_uuid = Some(uuid);
                dp.tunnel_key = row.tunnel_key;
                dp_keys.claim(row.tunnel_key);
                ctx.dp_by_sb.insert(uuid, index);
            }
            None => {
                sb.datapaths.remove(&uuid);
            }
        }
    }

    // Refresh external-ids on surviving rows and create rows plus fresh
    // keys for northbound-only datapaths
    for index in 0..ctx.datapaths.len() {
        let external_ids = external_ids_for(nb, &ctx.datapaths[index]);
        match ctx.datapaths[index].sb_uuid {
            Some(sb_uuid) => {
                sb.datapaths.modify(&sb_uuid, |row| {
                    row.external_ids = external_ids.clone();
                });
            }
            None => {
                let key = match dp_keys.allocate() {
                    Some(key) => key,
                    None => {
                        warn_rl!(
                            ctx.warn,
                            "datapath tunnel keys exhausted; {} gets none this pass",
                            ctx.datapaths[index].name()
                        );
                        continue;
                    }
                };
                let sb_uuid = sb.datapaths.insert(DatapathBinding {
                    uuid: Uuid::new_v4(),
                    tunnel_key: key,
                    external_ids,
                });
                let dp = &mut ctx.datapaths[index];
                dp.tunnel_key = key;
                dp.sb_uuid = Some(sb_uuid);
                ctx.dp_by_sb.insert(sb_uuid, index);
            }
        }
    }
    state.dp_key_hint = dp_keys.hint();
}

fn external_ids_for(nb: &NbDb, dp: &Datapath) -> StrMap {
    let mut ids = StrMap::new();
    match &dp.data {
        DpData::Switch(s) => {
            ids.insert(EXTID_LOGICAL_SWITCH.to_string(), s.nb.to_string());
            ids.insert("name".to_string(), s.name.clone());
            if let Some(ls) = nb.switches.get(&s.nb) {
                if let Some(name2) = ls.external_ids.get("name2") {
                    ids.insert("name2".to_string(), name2.clone());
                }
            }
        }
        DpData::Router(r) => {
            ids.insert(EXTID_LOGICAL_ROUTER.to_string(), r.nb.to_string());
            ids.insert("name".to_string(), r.name.clone());
            if let Some(lr) = nb.routers.get(&r.nb) {
                if let Some(name2) = lr.external_ids.get("name2") {
                    ids.insert("name2".to_string(), name2.clone());
                }
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nb::LogicalSwitch;

    fn switch(name: &str) -> LogicalSwitch {
        LogicalSwitch {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_nb_only_gets_row_and_key() {
        let mut nb = NbDb::default();
        let mut sb = SbDb::default();
        let mut state = DaemonState::default();
        let ls = switch("sw0");
        nb.switches.insert(ls.clone());
        let mut ctx = Context::new(0x0a0020);
        join_datapaths(&nb, &mut sb, &mut state, &mut ctx);
        assert_eq!(sb.datapaths.len(), 1);
        let row = sb.datapaths.iter().next().unwrap();
        assert_eq!(
            row.external_ids.get(EXTID_LOGICAL_SWITCH),
            Some(&ls.uuid.to_string())
        );
        assert!(row.tunnel_key >= DATAPATH_KEY_MIN);
    }

    #[test]
    fn test_key_reused_when_both() {
        let mut nb = NbDb::default();
        let mut sb = SbDb::default();
        let mut state = DaemonState::default();
        let ls = switch("sw0");
        nb.switches.insert(ls.clone());
        let mut ids = StrMap::new();
        ids.insert(EXTID_LOGICAL_SWITCH.to_string(), ls.uuid.to_string());
        sb.datapaths.insert(DatapathBinding {
            uuid: Uuid::new_v4(),
            tunnel_key: 42,
            external_ids: ids,
        });
        let mut ctx = Context::new(0x0a0020);
        join_datapaths(&nb, &mut sb, &mut state, &mut ctx);
        let index = ctx.switch_by_nb[&ls.uuid];
        assert_eq!(ctx.datapaths[index].tunnel_key, 42);
        assert_eq!(sb.datapaths.len(), 1);
    }

    #[test]
    fn test_orphan_and_malformed_deleted() {
        let nb = NbDb::default();
        let mut sb = SbDb::default();
        let mut state = DaemonState::default();
        // orphan: valid ids pointing at a switch that no longer exists
        let mut ids = StrMap::new();
        ids.insert(EXTID_LOGICAL_SWITCH.to_string(), Uuid::new_v4().to_string());
        sb.datapaths.insert(DatapathBinding {
            uuid: Uuid::new_v4(),
            tunnel_key: 1,
            external_ids: ids,
        });
        // malformed: no identity at all
        sb.datapaths.insert(DatapathBinding {
            uuid: Uuid::new_v4(),
            tunnel_key: 2,
            external_ids: StrMap::new(),
        });
        let mut ctx = Context::new(0x0a0020);
        join_datapaths(&nb, &mut sb, &mut state, &mut ctx);
        assert!(sb.datapaths.is_empty());
    }

    #[test]
    fn test_disabled_router_not_represented() {
        let mut nb = NbDb::default();
        let mut sb = SbDb::default();
        let mut state = DaemonState::default();
        nb.routers.insert(crate::db::nb::LogicalRouter {
            uuid: Uuid::new_v4(),
            name: "lr0".to_string(),
            enabled: Some(false),
            ..Default::default()
        });
        let mut ctx = Context::new(0x0a0020);
        join_datapaths(&nb, &mut sb, &mut state, &mut ctx);
        assert!(ctx.datapaths.is_empty());
        assert!(sb.datapaths.is_empty());
    }
}
