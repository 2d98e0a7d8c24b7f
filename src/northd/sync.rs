//! Mirrored southbound tables that are not flows: address sets (plus
//! the per-port-group derived IPv4/IPv6 sets), port groups, meters,
//! DNS, the supported DHCP option catalogs, RBAC rows, IP_Multicast
//! config, MAC_Binding pruning, and the nb/sb config counters.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::{
    DhcpOptionsCatalog, Dhcpv6OptionsCatalog, IpMulticast, RbacPermission, RbacRole, SbAddressSet,
    SbDb, SbDns, SbMeter, SbMeterBand, SbPortGroup,
};
use crate::db::StrMap;

use super::{Context, DpData};

pub fn sync_address_sets(nb: &NbDb, sb: &mut SbDb, ctx: &Context) {
    let mut target: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for set in nb.address_sets.iter() {
        let mut addresses = set.addresses.clone();
        addresses.sort();
        addresses.dedup();
        target.insert(set.name.clone(), addresses);
    }

    // Each port group derives one IPv4 and one IPv6 set from the union
    // of its member ports' addresses
    let port_by_lsp: HashMap<Uuid, usize> = ctx
        .ports
        .iter()
        .enumerate()
        .filter_map(|(index, port)| port.lsp_uuid().map(|uuid| (uuid, index)))
        .collect();
    for group in nb.port_groups.iter() {
        let mut v4: Vec<String> = Vec::new();
        let mut v6: Vec<String> = Vec::new();
        for member in &group.ports {
            let port = match port_by_lsp.get(member) {
                Some(&index) => &ctx.ports[index],
                None => continue,
            };
            for entry in &port.addrs {
                v4.extend(entry.ipv4.iter().map(|a| a.addr.to_string()));
                v6.extend(entry.ipv6.iter().map(|a| a.addr.to_string()));
            }
        }
        v4.sort();
        v4.dedup();
        v6.sort();
        v6.dedup();
        target.insert(format!("{}_ip4", group.name), v4);
        target.insert(format!("{}_ip6", group.name), v6);
    }

    for uuid in sb.address_sets.uuids() {
        let name = sb.address_sets.get(&uuid).expect("set row").name.clone();
        match target.remove(&name) {
            Some(addresses) => {
                sb.address_sets.modify(&uuid, |row| row.addresses = addresses.clone());
            }
            None => {
                sb.address_sets.remove(&uuid);
            }
        }
    }
    for (name, addresses) in target {
        sb.address_sets.insert(SbAddressSet {
            uuid: Uuid::new_v4(),
            name,
            addresses,
        });
    }
}

pub fn sync_port_groups(nb: &NbDb, sb: &mut SbDb, ctx: &Context) {
    let mut target: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let port_by_lsp: HashMap<Uuid, &str> = ctx
        .ports
        .iter()
        .filter_map(|port| port.lsp_uuid().map(|uuid| (uuid, port.name.as_str())))
        .collect();
    for group in nb.port_groups.iter() {
        let ports: Vec<String> = group
            .ports
            .iter()
            .filter_map(|uuid| port_by_lsp.get(uuid).map(|name| name.to_string()))
            .sorted()
            .collect();
        target.insert(group.name.clone(), ports);
    }
    for uuid in sb.port_groups.uuids() {
        let name = sb.port_groups.get(&uuid).expect("group row").name.clone();
        match target.remove(&name) {
            Some(ports) => {
                sb.port_groups.modify(&uuid, |row| row.ports = ports.clone());
            }
            None => {
                sb.port_groups.remove(&uuid);
            }
        }
    }
    for (name, ports) in target {
        sb.port_groups.insert(SbPortGroup {
            uuid: Uuid::new_v4(),
            name,
            ports,
        });
    }
}

pub fn sync_meters(nb: &NbDb, sb: &mut SbDb) {
    let mut target: BTreeMap<String, (String, Vec<(String, i64, i64)>)> = BTreeMap::new();
    for meter in nb.meters.iter() {
        let bands: Vec<(String, i64, i64)> = meter
            .bands
            .iter()
            .filter_map(|uuid| nb.meter_bands.get(uuid))
            .map(|band| (band.action.clone(), band.rate, band.burst_size))
            .sorted()
            .collect();
        target.insert(meter.name.clone(), (meter.unit.clone(), bands));
    }
    for uuid in sb.meters.uuids() {
        let row = sb.meters.get(&uuid).expect("meter row").clone();
        match target.remove(&row.name) {
            Some((unit, bands)) => {
                let current: Vec<(String, i64, i64)> = row
                    .bands
                    .iter()
                    .filter_map(|uuid| sb.meter_bands.get(uuid))
                    .map(|band| (band.action.clone(), band.rate, band.burst_size))
                    .collect();
                if row.unit == unit && current == bands {
                    continue;
                }
                for band in &row.bands {
                    sb.meter_bands.remove(band);
                }
                let refs = insert_bands(sb, &bands);
                sb.meters.modify(&uuid, |row| {
                    row.unit = unit.clone();
                    row.bands = refs.clone();
                });
            }
            None => {
                for band in &row.bands {
                    sb.meter_bands.remove(band);
                }
                sb.meters.remove(&uuid);
            }
        }
    }
    for (name, (unit, bands)) in target {
        let refs = insert_bands(sb, &bands);
        sb.meters.insert(SbMeter {
            uuid: Uuid::new_v4(),
            name,
            unit,
            bands: refs,
        });
    }
}

fn insert_bands(sb: &mut SbDb, bands: &[(String, i64, i64)]) -> Vec<Uuid> {
    bands
        .iter()
        .map(|(action, rate, burst_size)| {
            sb.meter_bands.insert(SbMeterBand {
                uuid: Uuid::new_v4(),
                action: action.clone(),
                rate: *rate,
                burst_size: *burst_size,
            })
        })
        .collect()
}

pub fn sync_dns(nb: &NbDb, sb: &mut SbDb, ctx: &Context) {
    // nb DNS row uuid → (records, referencing switch datapaths)
    let mut target: BTreeMap<Uuid, (StrMap, Vec<Uuid>)> = BTreeMap::new();
    for ls in nb.switches.iter() {
        let dp_uuid = match ctx
            .switch_by_nb
            .get(&ls.uuid)
            .and_then(|&index| ctx.datapaths[index].sb_uuid)
        {
            Some(uuid) => uuid,
            None => continue,
        };
        for dns_uuid in &ls.dns_records {
            if let Some(dns) = nb.dns.get(dns_uuid) {
                let entry = target
                    .entry(dns.uuid)
                    .or_insert_with(|| (dns.records.clone(), Vec::new()));
                entry.1.push(dp_uuid);
            }
        }
    }
    for (_, (_, datapaths)) in target.iter_mut() {
        datapaths.sort();
        datapaths.dedup();
    }

    for uuid in sb.dns.uuids() {
        let nb_ref = sb
            .dns
            .get(&uuid)
            .expect("dns row")
            .external_ids
            .get("dns_id")
            .and_then(|text| text.parse::<Uuid>().ok());
        match nb_ref.and_then(|nb_uuid| target.remove(&nb_uuid).map(|t| (nb_uuid, t))) {
            Some((_, (records, datapaths))) => {
                sb.dns.modify(&uuid, |row| {
                    row.records = records.clone();
                    row.datapaths = datapaths.clone();
                });
            }
            None => {
                sb.dns.remove(&uuid);
            }
        }
    }
    for (nb_uuid, (records, datapaths)) in target {
        let mut external_ids = StrMap::new();
        external_ids.insert("dns_id".to_string(), nb_uuid.to_string());
        sb.dns.insert(SbDns {
            uuid: Uuid::new_v4(),
            datapaths,
            records,
            external_ids,
        });
    }
}

/// Supported DHCPv4 options; the agents expand these into wire options
const DHCPV4_OPTIONS: &[(&str, u8, &str)] = &[
    ("offerip", 0, "ipv4"),
    ("netmask", 1, "ipv4"),
    ("router", 3, "ipv4"),
    ("dns_server", 6, "ipv4"),
    ("log_server", 7, "ipv4"),
    ("lpr_server", 9, "ipv4"),
    ("hostname", 12, "str"),
    ("domain_name", 15, "str"),
    ("swap_server", 16, "ipv4"),
    ("policy_filter", 21, "ipv4"),
    ("default_ttl", 23, "uint8"),
    ("mtu", 26, "uint16"),
    ("router_discovery", 31, "bool"),
    ("router_solicitation", 32, "ipv4"),
    ("ethernet_encap", 36, "bool"),
    ("tcp_ttl", 37, "uint8"),
    ("nis_server", 41, "ipv4"),
    ("ntp_server", 42, "ipv4"),
    ("lease_time", 51, "uint32"),
    ("T1", 58, "uint32"),
    ("T2", 59, "uint32"),
    ("bootfile_name", 67, "str"),
    ("classless_static_route", 121, "static_routes"),
    ("ip_forward_enable", 19, "bool"),
    ("wpad", 252, "str"),
];

const DHCPV6_OPTIONS: &[(&str, u8, &str)] = &[
    ("server_id", 2, "mac"),
    ("ia_addr", 5, "ipv6"),
    ("dns_server", 23, "ipv6"),
    ("domain_search", 24, "str"),
];

pub fn sync_dhcp_catalogs(sb: &mut SbDb) {
    for &(name, code, option_type) in DHCPV4_OPTIONS {
        match sb
            .dhcp_catalog
            .find(|row| row.name == name)
            .map(|row| row.uuid)
        {
            Some(uuid) => {
                sb.dhcp_catalog.modify(&uuid, |row| {
                    row.code = code;
                    row.option_type = option_type.to_string();
                });
            }
            None => {
                sb.dhcp_catalog.insert(DhcpOptionsCatalog {
                    uuid: Uuid::new_v4(),
                    name: name.to_string(),
                    code,
                    option_type: option_type.to_string(),
                });
            }
        }
    }
    for &(name, code, option_type) in DHCPV6_OPTIONS {
        match sb
            .dhcpv6_catalog
            .find(|row| row.name == name)
            .map(|row| row.uuid)
        {
            Some(uuid) => {
                sb.dhcpv6_catalog.modify(&uuid, |row| {
                    row.code = code;
                    row.option_type = option_type.to_string();
                });
            }
            None => {
                sb.dhcpv6_catalog.insert(Dhcpv6OptionsCatalog {
                    uuid: Uuid::new_v4(),
                    name: name.to_string(),
                    code,
                    option_type: option_type.to_string(),
                });
            }
        }
    }
}

/// The agent role and the four tables it may touch
const RBAC_ROLE_NAME: &str = "ovn-controller";

struct RbacSpec {
    table: &'static str,
    authorization: &'static [&'static str],
    insert_delete: bool,
    update: &'static [&'static str],
}

const RBAC_PERMISSIONS: &[RbacSpec] = &[
    RbacSpec {
        table: "Chassis",
        authorization: &["name"],
        insert_delete: true,
        update: &["nb_cfg", "external_ids", "encaps", "vtep_logical_switches"],
    },
    RbacSpec {
        table: "Encap",
        authorization: &["chassis_name"],
        insert_delete: true,
        update: &["type", "options", "ip"],
    },
    RbacSpec {
        table: "Port_Binding",
        authorization: &[""],
        insert_delete: false,
        update: &["chassis"],
    },
    RbacSpec {
        table: "MAC_Binding",
        authorization: &[""],
        insert_delete: true,
        update: &["logical_port", "ip", "mac", "datapath"],
    },
];

pub fn check_and_update_rbac(sb: &mut SbDb) {
    let mut permission_refs: BTreeMap<String, Uuid> = BTreeMap::new();
    for spec in RBAC_PERMISSIONS {
        let authorization: Vec<String> =
            spec.authorization.iter().map(|s| s.to_string()).collect();
        let update: Vec<String> = spec.update.iter().map(|s| s.to_string()).collect();
        let uuid = match sb
            .rbac_permissions
            .find(|row| row.table == spec.table)
            .map(|row| row.uuid)
        {
            Some(uuid) => {
                sb.rbac_permissions.modify(&uuid, |row| {
                    row.authorization = authorization.clone();
                    row.insert_delete = spec.insert_delete;
                    row.update = update.clone();
                });
                uuid
            }
            None => sb.rbac_permissions.insert(RbacPermission {
                uuid: Uuid::new_v4(),
                table: spec.table.to_string(),
                authorization,
                insert_delete: spec.insert_delete,
                update,
            }),
        };
        permission_refs.insert(spec.table.to_string(), uuid);
    }
    match sb
        .rbac_roles
        .find(|row| row.name == RBAC_ROLE_NAME)
        .map(|row| row.uuid)
    {
        Some(uuid) => {
            sb.rbac_roles.modify(&uuid, |row| {
                row.permissions = permission_refs.clone();
            });
        }
        None => {
            sb.rbac_roles.insert(RbacRole {
                uuid: Uuid::new_v4(),
                name: RBAC_ROLE_NAME.to_string(),
                permissions: permission_refs,
            });
        }
    }
}

/// One IP_Multicast config row per switch datapath
pub fn sync_ip_multicast(sb: &mut SbDb, ctx: &Context) {
    let mut target: BTreeMap<Uuid, IpMulticast> = BTreeMap::new();
    for dp in &ctx.datapaths {
        let (switch, dp_uuid) = match (&dp.data, dp.sb_uuid) {
            (DpData::Switch(switch), Some(uuid)) => (switch, uuid),
            _ => continue,
        };
        target.insert(
            dp_uuid,
            IpMulticast {
                uuid: Uuid::nil(),
                datapath: dp_uuid,
                enabled: switch.mcast.enabled,
                querier: switch.mcast.querier,
                eth_src: switch.mcast.eth_src.clone(),
                ip4_src: switch.mcast.ip4_src.clone(),
                table_size: switch.mcast.table_size,
                idle_timeout: switch.mcast.idle_timeout,
                query_interval: switch.mcast.query_interval,
                query_max_resp: switch.mcast.query_max_resp,
            },
        );
    }
    for uuid in sb.ip_multicast.uuids() {
        let datapath = sb.ip_multicast.get(&uuid).expect("row").datapath;
        match target.remove(&datapath) {
            Some(desired) => {
                sb.ip_multicast.modify(&uuid, |row| {
                    row.enabled = desired.enabled;
                    row.querier = desired.querier;
                    row.eth_src = desired.eth_src.clone();
                    row.ip4_src = desired.ip4_src.clone();
                    row.table_size = desired.table_size;
                    row.idle_timeout = desired.idle_timeout;
                    row.query_interval = desired.query_interval;
                    row.query_max_resp = desired.query_max_resp;
                });
            }
            None => {
                sb.ip_multicast.remove(&uuid);
            }
        }
    }
    for (datapath, desired) in target {
        sb.ip_multicast.insert(IpMulticast {
            uuid: Uuid::new_v4(),
            datapath,
            ..desired
        });
    }
}

/// MAC bindings referencing a deleted datapath or port are stale
pub fn prune_mac_bindings(sb: &mut SbDb, ctx: &Context) {
    let live_ports: std::collections::HashSet<&str> = ctx
        .ports
        .iter()
        .filter(|port| port.is_nb())
        .map(|port| port.name.as_str())
        .collect();
    let mut stale: Vec<Uuid> = Vec::new();
    for row in sb.mac_bindings.iter() {
        if !ctx.dp_by_sb.contains_key(&row.datapath)
            || !live_ports.contains(row.logical_port.as_str())
        {
            stale.push(row.uuid);
        }
    }
    for uuid in stale {
        sb.mac_bindings.remove(&uuid);
    }
}

/// Mirror the configuration sequence numbers: nb_cfg flows into the
/// southbound, and the slowest chassis bounds hv_cfg.
pub fn mirror_config(nb: &mut NbDb, sb: &mut SbDb) {
    let nb_global = nb.global_uuid();
    let nb_cfg = nb.global.get(&nb_global).map(|g| g.nb_cfg).unwrap_or(0);
    let sb_global = sb.global_uuid();
    sb.global.modify(&sb_global, |row| row.nb_cfg = nb_cfg);
    let sb_cfg = sb.global.get(&sb_global).map(|g| g.nb_cfg).unwrap_or(0);
    let hv_cfg = sb
        .chassis
        .iter()
        .map(|chassis| chassis.nb_cfg)
        .min()
        .unwrap_or(nb_cfg);
    nb.global.modify(&nb_global, |row| {
        row.sb_cfg = sb_cfg;
        row.hv_cfg = hv_cfg;
    });
}
