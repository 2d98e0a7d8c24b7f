//! Southbound HA_Chassis_Group synthesis. A distributed gateway port
//! names its failover chassis three possible ways (an HA group, a
//! legacy gateway-chassis list, or a bare redirect-chassis option);
//! each becomes one southbound group whose members carry (chassis-name,
//! priority).

use std::collections::HashSet;

use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::{SbDb, SbHaChassis, SbHaChassisGroup};
use crate::db::StrMap;

use super::Context;

pub fn sync_ha_chassis_groups(nb: &NbDb, sb: &mut SbDb, ctx: &mut Context) {
    let mut referenced: HashSet<Uuid> = HashSet::new();

    for dp_index in 0..ctx.datapaths.len() {
        let (l3dgw, redirect) = match ctx.datapaths[dp_index].as_router() {
            Some(router) => match (router.l3dgw_port, router.redirect_port) {
                (Some(l3dgw), Some(redirect)) => (l3dgw, redirect),
                _ => continue,
            },
            None => continue,
        };
        let lrp_uuid = match ctx.ports[l3dgw].lrp_uuid() {
            Some(uuid) => uuid,
            None => continue,
        };
        let lrp = match nb.router_ports.get(&lrp_uuid) {
            Some(lrp) => lrp,
            None => continue,
        };
        let desired = if let Some(group_uuid) = lrp.ha_chassis_group {
            nb.ha_chassis_groups.get(&group_uuid).map(|group| {
                let members = group
                    .ha_chassis
                    .iter()
                    .filter_map(|uuid| nb.ha_chassis.get(uuid))
                    .map(|member| (member.chassis_name.clone(), member.priority))
                    .collect();
                (group.name.clone(), members)
            })
        } else if !lrp.gateway_chassis.is_empty() {
            let members = lrp
                .gateway_chassis
                .iter()
                .filter_map(|uuid| nb.gateway_chassis.get(uuid))
                .map(|gc| (gc.chassis_name.clone(), gc.priority))
                .collect();
            Some((lrp.name.clone(), members))
        } else {
            lrp.options
                .get("redirect-chassis")
                .map(|chassis| (format!("{}_{}", lrp.name, chassis), vec![(chassis.clone(), 0)]))
        };
        if let Some((name, mut members)) = desired {
            // highest priority first, name-ordered within a tier
            members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let sb_uuid = upsert_group(sb, &name, &members);
            referenced.insert(sb_uuid);
            ctx.ha_group_for_port.insert(redirect, sb_uuid);
        }
    }

    // External switch ports schedule through an HA group the same way
    for index in 0..ctx.ports.len() {
        let lsp = match ctx.ports[index]
            .lsp_uuid()
            .and_then(|uuid| nb.switch_ports.get(&uuid))
        {
            Some(lsp) => lsp,
            None => continue,
        };
        if lsp.port_type != "external" {
            continue;
        }
        let group = match lsp.ha_chassis_group.and_then(|u| nb.ha_chassis_groups.get(&u)) {
            Some(group) => group,
            None => continue,
        };
        let mut members: Vec<(String, i64)> = group
            .ha_chassis
            .iter()
            .filter_map(|uuid| nb.ha_chassis.get(uuid))
            .map(|member| (member.chassis_name.clone(), member.priority))
            .collect();
        members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let sb_uuid = upsert_group(sb, &group.name, &members);
        referenced.insert(sb_uuid);
        ctx.ha_group_for_port.insert(index, sb_uuid);
    }

    // Groups nothing points at any more are gone
    for uuid in sb.ha_chassis_groups.uuids() {
        if referenced.contains(&uuid) {
            continue;
        }
        if let Some(group) = sb.ha_chassis_groups.remove(&uuid) {
            for member in group.ha_chassis {
                sb.ha_chassis.remove(&member);
            }
        }
    }
}

fn upsert_group(sb: &mut SbDb, name: &str, members: &[(String, i64)]) -> Uuid {
    if let Some(existing) = sb.ha_chassis_groups.find(|g| g.name == name).cloned() {
        let current: Vec<(String, i64)> = existing
            .ha_chassis
            .iter()
            .filter_map(|uuid| sb.ha_chassis.get(uuid))
            .map(|member| (member.chassis_name.clone(), member.priority))
            .collect();
        if current == members {
            return existing.uuid;
        }
        for member in &existing.ha_chassis {
            sb.ha_chassis.remove(member);
        }
        let refs = insert_members(sb, members);
        sb.ha_chassis_groups
            .modify(&existing.uuid, |group| group.ha_chassis = refs.clone());
        return existing.uuid;
    }
    let refs = insert_members(sb, members);
    sb.ha_chassis_groups.insert(SbHaChassisGroup {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        ha_chassis: refs,
        external_ids: StrMap::new(),
    })
}

fn insert_members(sb: &mut SbDb, members: &[(String, i64)]) -> Vec<Uuid> {
    members
        .iter()
        .map(|(chassis_name, priority)| {
            let mut external_ids = StrMap::new();
            // an agent arriving after the Chassis row can still match
            external_ids.insert("chassis-name".to_string(), chassis_name.clone());
            sb.ha_chassis.insert(SbHaChassis {
                uuid: Uuid::new_v4(),
                chassis_name: chassis_name.clone(),
                priority: *priority,
                external_ids,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_is_stable() {
        let mut sb = SbDb::default();
        let members = vec![("hv1".to_string(), 20), ("hv2".to_string(), 10)];
        let first = upsert_group(&mut sb, "lrp0", &members);
        crate::db::Snapshot::clear_stats(&mut sb);
        let second = upsert_group(&mut sb, "lrp0", &members);
        assert_eq!(first, second);
        assert_eq!(crate::db::Snapshot::stats(&sb).total(), 0);
    }

    #[test]
    fn test_membership_change_rewrites() {
        let mut sb = SbDb::default();
        let uuid = upsert_group(&mut sb, "lrp0", &[("hv1".to_string(), 20)]);
        upsert_group(
            &mut sb,
            "lrp0",
            &[("hv1".to_string(), 20), ("hv2".to_string(), 10)],
        );
        let group = sb.ha_chassis_groups.get(&uuid).unwrap();
        assert_eq!(group.ha_chassis.len(), 2);
        assert_eq!(sb.ha_chassis.len(), 2);
    }
}
