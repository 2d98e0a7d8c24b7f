//! Southbound schema subset: everything the translator owns in the
//! southbound database, plus the chassis-reported tables it reads
//! (Chassis, IGMP_Group) and prunes (MAC_Binding).

use uuid::Uuid;

use super::nb::sum_stats;
use super::{impl_row, CommitStats, Snapshot, StrMap, Table};

pub const EXTID_LOGICAL_SWITCH: &str = "logical-switch";
pub const EXTID_LOGICAL_ROUTER: &str = "logical-router";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbGlobal {
    pub uuid: Uuid,
    pub nb_cfg: i64,
    pub options: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chassis {
    pub uuid: Uuid,
    pub name: String,
    pub encaps: Vec<String>,
    pub vtep_logical_switches: Vec<String>,
    pub nb_cfg: i64,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatapathBinding {
    pub uuid: Uuid,
    pub tunnel_key: u32,
    pub external_ids: StrMap,
}

impl DatapathBinding {
    /// The northbound identity this binding mirrors, if well-formed
    pub fn nb_identity(&self) -> Option<(bool, Uuid)> {
        if let Some(ls) = self.external_ids.get(EXTID_LOGICAL_SWITCH) {
            return ls.parse().ok().map(|u| (true, u));
        }
        if let Some(lr) = self.external_ids.get(EXTID_LOGICAL_ROUTER) {
            return lr.parse().ok().map(|u| (false, u));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PortBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    /// "", "router", "localnet", "localport", "l2gateway", "vtep",
    /// "external", "patch", "l3gateway", "chassisredirect", "virtual"
    pub port_type: String,
    pub datapath: Uuid,
    pub tunnel_key: u32,
    pub parent_port: Option<String>,
    pub tag: Option<u16>,
    pub virtual_parent: Option<String>,
    pub mac: Vec<String>,
    pub nat_addresses: Vec<String>,
    pub options: StrMap,
    pub external_ids: StrMap,
    /// Set by the hypervisor agent that claims the port
    pub chassis: Option<Uuid>,
    pub gateway_chassis: Vec<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalFlow {
    pub uuid: Uuid,
    pub logical_datapath: Uuid,
    pub pipeline: String,
    pub table_id: u8,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MulticastGroup {
    pub uuid: Uuid,
    pub datapath: Uuid,
    pub name: String,
    pub tunnel_key: u32,
    pub ports: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacBinding {
    pub uuid: Uuid,
    pub logical_port: String,
    pub ip: String,
    pub mac: String,
    pub datapath: Uuid,
}

/// One supported DHCPv4 option (the southbound DHCP_Options catalog)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DhcpOptionsCatalog {
    pub uuid: Uuid,
    pub name: String,
    pub code: u8,
    pub option_type: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dhcpv6OptionsCatalog {
    pub uuid: Uuid,
    pub name: String,
    pub code: u8,
    pub option_type: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbAddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbPortGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbDns {
    pub uuid: Uuid,
    pub datapaths: Vec<Uuid>,
    pub records: StrMap,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbMeter {
    pub uuid: Uuid,
    pub name: String,
    pub unit: String,
    pub bands: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbMeterBand {
    pub uuid: Uuid,
    pub action: String,
    pub rate: i64,
    pub burst_size: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbHaChassisGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ha_chassis: Vec<Uuid>,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SbHaChassis {
    pub uuid: Uuid,
    pub chassis_name: String,
    pub priority: i64,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IgmpGroup {
    pub uuid: Uuid,
    pub address: String,
    pub datapath: Option<Uuid>,
    pub chassis: Option<Uuid>,
    pub ports: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IpMulticast {
    pub uuid: Uuid,
    pub datapath: Uuid,
    pub enabled: bool,
    pub querier: bool,
    pub eth_src: String,
    pub ip4_src: String,
    pub table_size: i64,
    pub idle_timeout: i64,
    pub query_interval: i64,
    pub query_max_resp: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RbacRole {
    pub uuid: Uuid,
    pub name: String,
    /// table name → RBAC_Permission row
    pub permissions: std::collections::BTreeMap<String, Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RbacPermission {
    pub uuid: Uuid,
    pub table: String,
    pub authorization: Vec<String>,
    pub insert_delete: bool,
    pub update: Vec<String>,
}

impl_row!(
    SbGlobal,
    Chassis,
    DatapathBinding,
    PortBinding,
    LogicalFlow,
    MulticastGroup,
    MacBinding,
    DhcpOptionsCatalog,
    Dhcpv6OptionsCatalog,
    SbAddressSet,
    SbPortGroup,
    SbDns,
    SbMeter,
    SbMeterBand,
    SbHaChassisGroup,
    SbHaChassis,
    IgmpGroup,
    IpMulticast,
    RbacRole,
    RbacPermission,
);

#[derive(Debug, Clone, Default)]
pub struct SbDb {
    pub global: Table<SbGlobal>,
    pub chassis: Table<Chassis>,
    pub datapaths: Table<DatapathBinding>,
    pub port_bindings: Table<PortBinding>,
    pub logical_flows: Table<LogicalFlow>,
    pub multicast_groups: Table<MulticastGroup>,
    pub mac_bindings: Table<MacBinding>,
    pub dhcp_catalog: Table<DhcpOptionsCatalog>,
    pub dhcpv6_catalog: Table<Dhcpv6OptionsCatalog>,
    pub address_sets: Table<SbAddressSet>,
    pub port_groups: Table<SbPortGroup>,
    pub dns: Table<SbDns>,
    pub meters: Table<SbMeter>,
    pub meter_bands: Table<SbMeterBand>,
    pub ha_chassis_groups: Table<SbHaChassisGroup>,
    pub ha_chassis: Table<SbHaChassis>,
    pub igmp_groups: Table<IgmpGroup>,
    pub ip_multicast: Table<IpMulticast>,
    pub rbac_roles: Table<RbacRole>,
    pub rbac_permissions: Table<RbacPermission>,
}

impl SbDb {
    pub fn global_uuid(&mut self) -> Uuid {
        if let Some(row) = self.global.iter().next() {
            return row.uuid;
        }
        self.global.insert(SbGlobal {
            uuid: Uuid::new_v4(),
            ..Default::default()
        })
    }

    pub fn port_binding_by_name(&self, name: &str) -> Option<&PortBinding> {
        self.port_bindings.find(|p| p.logical_port == name)
    }

    pub fn chassis_by_name(&self, name: &str) -> Option<&Chassis> {
        self.chassis.find(|c| c.name == name)
    }
}

impl Snapshot for SbDb {
    fn clear_stats(&mut self) {
        self.global.clear_stats();
        self.chassis.clear_stats();
        self.datapaths.clear_stats();
        self.port_bindings.clear_stats();
        self.logical_flows.clear_stats();
        self.multicast_groups.clear_stats();
        self.mac_bindings.clear_stats();
        self.dhcp_catalog.clear_stats();
        self.dhcpv6_catalog.clear_stats();
        self.address_sets.clear_stats();
        self.port_groups.clear_stats();
        self.dns.clear_stats();
        self.meters.clear_stats();
        self.meter_bands.clear_stats();
        self.ha_chassis_groups.clear_stats();
        self.ha_chassis.clear_stats();
        self.igmp_groups.clear_stats();
        self.ip_multicast.clear_stats();
        self.rbac_roles.clear_stats();
        self.rbac_permissions.clear_stats();
    }

    fn stats(&self) -> CommitStats {
        sum_stats!(
            self,
            global,
            chassis,
            datapaths,
            port_bindings,
            logical_flows,
            multicast_groups,
            mac_bindings,
            dhcp_catalog,
            dhcpv6_catalog,
            address_sets,
            port_groups,
            dns,
            meters,
            meter_bands,
            ha_chassis_groups,
            ha_chassis,
            igmp_groups,
            ip_multicast,
            rbac_roles,
            rbac_permissions,
        )
    }
}
