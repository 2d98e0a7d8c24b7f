//! Northbound schema subset: the tables and columns the translator
//! reads, plus the few columns it writes back (`dynamic_addresses`,
//! container `tag`, and the NB_Global options/config mirrors).

use uuid::Uuid;

use super::{impl_row, CommitStats, Snapshot, StrMap, Table};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NbGlobal {
    pub uuid: Uuid,
    pub nb_cfg: i64,
    pub sb_cfg: i64,
    pub hv_cfg: i64,
    pub options: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalSwitch {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub acls: Vec<Uuid>,
    pub qos_rules: Vec<Uuid>,
    pub dns_records: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub other_config: StrMap,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalSwitchPort {
    pub uuid: Uuid,
    pub name: String,
    /// "", "router", "localnet", "localport", "l2gateway", "vtep",
    /// "external", "virtual"
    pub port_type: String,
    pub options: StrMap,
    pub parent_name: Option<String>,
    pub tag_request: Option<u16>,
    pub tag: Option<u16>,
    pub addresses: Vec<String>,
    pub dynamic_addresses: Option<String>,
    pub port_security: Vec<String>,
    pub up: bool,
    pub enabled: Option<bool>,
    pub dhcpv4_options: Option<Uuid>,
    pub dhcpv6_options: Option<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
    pub external_ids: StrMap,
}

impl LogicalSwitchPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalRouter {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub static_routes: Vec<Uuid>,
    pub policies: Vec<Uuid>,
    pub nat: Vec<Uuid>,
    pub load_balancer: Vec<Uuid>,
    pub enabled: Option<bool>,
    pub options: StrMap,
    pub external_ids: StrMap,
}

impl LogicalRouter {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Set when the whole router is bound to one chassis (a gateway
    /// router)
    pub fn chassis(&self) -> Option<&str> {
        self.options.get("chassis").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogicalRouterPort {
    pub uuid: Uuid,
    pub name: String,
    pub mac: String,
    pub networks: Vec<String>,
    pub peer: Option<String>,
    pub enabled: Option<bool>,
    pub ipv6_ra_configs: StrMap,
    pub options: StrMap,
    pub gateway_chassis: Vec<Uuid>,
    pub ha_chassis_group: Option<Uuid>,
    pub external_ids: StrMap,
}

impl LogicalRouterPort {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StaticRoute {
    pub uuid: Uuid,
    pub ip_prefix: String,
    pub nexthop: String,
    pub output_port: Option<String>,
    /// "dst-ip" (default) or "src-ip"
    pub policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouterPolicy {
    pub uuid: Uuid,
    pub priority: u16,
    pub match_: String,
    /// "allow", "drop", "reroute"
    pub action: String,
    pub nexthop: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Nat {
    pub uuid: Uuid,
    /// "snat", "dnat", "dnat_and_snat"
    pub nat_type: String,
    pub external_ip: String,
    pub external_mac: Option<String>,
    pub logical_ip: String,
    pub logical_port: Option<String>,
    pub options: StrMap,
}

impl Nat {
    pub fn is_stateless(&self) -> bool {
        self.options.get("stateless").map(|v| v == "true").unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadBalancer {
    pub uuid: Uuid,
    pub name: String,
    /// "VIP[:port]" → comma-separated backends
    pub vips: StrMap,
    pub protocol: Option<String>,
    pub options: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Acl {
    pub uuid: Uuid,
    pub priority: u16,
    /// "from-lport" or "to-lport"
    pub direction: String,
    pub match_: String,
    /// "allow", "allow-related", "drop", "reject"
    pub action: String,
    pub log: bool,
    pub meter: Option<String>,
    pub severity: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QosRule {
    pub uuid: Uuid,
    pub priority: u16,
    pub direction: String,
    pub match_: String,
    /// "dscp" → value
    pub action: std::collections::BTreeMap<String, i64>,
    /// "rate" / "burst" in kbps
    pub bandwidth: std::collections::BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PortGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ports: Vec<Uuid>,
    pub acls: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddressSet {
    pub uuid: Uuid,
    pub name: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Meter {
    pub uuid: Uuid,
    pub name: String,
    /// "kbps" or "pktps"
    pub unit: String,
    pub bands: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeterBand {
    pub uuid: Uuid,
    pub action: String,
    pub rate: i64,
    pub burst_size: i64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dns {
    pub uuid: Uuid,
    pub records: StrMap,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DhcpOptions {
    pub uuid: Uuid,
    pub cidr: String,
    pub options: StrMap,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GatewayChassis {
    pub uuid: Uuid,
    pub name: String,
    pub chassis_name: String,
    pub priority: i64,
    pub options: StrMap,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HaChassisGroup {
    pub uuid: Uuid,
    pub name: String,
    pub ha_chassis: Vec<Uuid>,
    pub external_ids: StrMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HaChassis {
    pub uuid: Uuid,
    pub chassis_name: String,
    pub priority: i64,
    pub external_ids: StrMap,
}

impl_row!(
    NbGlobal,
    LogicalSwitch,
    LogicalSwitchPort,
    LogicalRouter,
    LogicalRouterPort,
    StaticRoute,
    RouterPolicy,
    Nat,
    LoadBalancer,
    Acl,
    QosRule,
    PortGroup,
    AddressSet,
    Meter,
    MeterBand,
    Dns,
    DhcpOptions,
    GatewayChassis,
    HaChassisGroup,
    HaChassis,
);

#[derive(Debug, Clone, Default)]
pub struct NbDb {
    pub global: Table<NbGlobal>,
    pub switches: Table<LogicalSwitch>,
    pub switch_ports: Table<LogicalSwitchPort>,
    pub routers: Table<LogicalRouter>,
    pub router_ports: Table<LogicalRouterPort>,
    pub static_routes: Table<StaticRoute>,
    pub policies: Table<RouterPolicy>,
    pub nats: Table<Nat>,
    pub load_balancers: Table<LoadBalancer>,
    pub acls: Table<Acl>,
    pub qos_rules: Table<QosRule>,
    pub port_groups: Table<PortGroup>,
    pub address_sets: Table<AddressSet>,
    pub meters: Table<Meter>,
    pub meter_bands: Table<MeterBand>,
    pub dns: Table<Dns>,
    pub dhcp_options: Table<DhcpOptions>,
    pub gateway_chassis: Table<GatewayChassis>,
    pub ha_chassis_groups: Table<HaChassisGroup>,
    pub ha_chassis: Table<HaChassis>,
}

impl NbDb {
    /// The singleton NB_Global row, created on first use
    pub fn global_uuid(&mut self) -> Uuid {
        if let Some(row) = self.global.iter().next() {
            return row.uuid;
        }
        self.global.insert(NbGlobal {
            uuid: Uuid::new_v4(),
            ..Default::default()
        })
    }

    pub fn switch_port_by_name(&self, name: &str) -> Option<&LogicalSwitchPort> {
        self.switch_ports.find(|p| p.name == name)
    }

    pub fn router_port_by_name(&self, name: &str) -> Option<&LogicalRouterPort> {
        self.router_ports.find(|p| p.name == name)
    }

    /// Switch owning a given port row
    pub fn switch_of_port(&self, port: Uuid) -> Option<&LogicalSwitch> {
        self.switches.find(|s| s.ports.contains(&port))
    }

    /// Router owning a given port row
    pub fn router_of_port(&self, port: Uuid) -> Option<&LogicalRouter> {
        self.routers.find(|r| r.ports.contains(&port))
    }
}

macro_rules! sum_stats {
    ($self:ident, $($field:ident),+ $(,)?) => {{
        let mut total = CommitStats::default();
        $(
            let s = $self.$field.stats();
            total.inserts += s.inserts;
            total.updates += s.updates;
            total.deletes += s.deletes;
        )+
        total
    }};
}
pub(crate) use sum_stats;

impl Snapshot for NbDb {
    fn clear_stats(&mut self) {
        self.global.clear_stats();
        self.switches.clear_stats();
        self.switch_ports.clear_stats();
        self.routers.clear_stats();
        self.router_ports.clear_stats();
        self.static_routes.clear_stats();
        self.policies.clear_stats();
        self.nats.clear_stats();
        self.load_balancers.clear_stats();
        self.acls.clear_stats();
        self.qos_rules.clear_stats();
        self.port_groups.clear_stats();
        self.address_sets.clear_stats();
        self.meters.clear_stats();
        self.meter_bands.clear_stats();
        self.dns.clear_stats();
        self.dhcp_options.clear_stats();
        self.gateway_chassis.clear_stats();
        self.ha_chassis_groups.clear_stats();
        self.ha_chassis.clear_stats();
    }

    fn stats(&self) -> CommitStats {
        sum_stats!(
            self,
            global,
            switches,
            switch_ports,
            routers,
            router_ports,
            static_routes,
            policies,
            nats,
            load_balancers,
            acls,
            qos_rules,
            port_groups,
            address_sets,
            meters,
            meter_bands,
            dns,
            dhcp_options,
            gateway_chassis,
            ha_chassis_groups,
            ha_chassis,
        )
    }
}
