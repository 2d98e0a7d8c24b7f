//! The translator core. Each reconciliation pass builds an in-memory
//! graph of datapaths and ports from northbound/southbound snapshots,
//! synthesizes the southbound target state, and diffs it into the
//! southbound tables.

pub mod datapath;
pub mod flow;
pub mod ha;
pub mod ipam;
pub mod keys;
pub mod lrouter;
pub mod lswitch;
pub mod multicast;
pub mod ports;
pub mod stage;
pub mod sync;

use std::collections::HashMap;
use std::net::Ipv6Addr;

use ipnetwork::Ipv4Network;
use uuid::Uuid;

use crate::db::nb::NbDb;
use crate::db::sb::SbDb;
use crate::db::StrMap;
use crate::utils::{LogLimiter, LportAddresses, MacAddr};
use keys::{KeySpace, QueueIdMap, MCAST_KEY_MAX, MCAST_KEY_MIN, PORT_KEY_MAX, PORT_KEY_MIN};
use stage::DpKind;

/// State that survives across reconciliation passes. Everything else is
/// rebuilt from the database snapshots every time.
#[derive(Debug)]
pub struct DaemonState {
    /// 24-bit prefix for managed MAC addresses, mirrored into
    /// NB_Global options:mac_prefix
    pub mac_prefix: Option<u32>,
    /// Datapath tunnel-key cursor
    pub dp_key_hint: u32,
}

impl Default for DaemonState {
    fn default() -> Self {
        DaemonState {
            mac_prefix: None,
            dp_key_hint: 0,
        }
    }
}

/// Multicast snooping configuration of a logical switch
#[derive(Debug, Clone)]
pub struct McastSwitchConfig {
    pub enabled: bool,
    pub querier: bool,
    pub flood_unregistered: bool,
    pub eth_src: String,
    pub ip4_src: String,
    pub table_size: i64,
    pub idle_timeout: i64,
    pub query_interval: i64,
    pub query_max_resp: i64,
}

impl McastSwitchConfig {
    pub fn from_config(config: &StrMap) -> Self {
        let flag = |key: &str, default: bool| {
            config
                .get(key)
                .map(|v| v == "true")
                .unwrap_or(default)
        };
        let num = |key: &str, default: i64| {
            config
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let idle_timeout = num("mcast_idle_timeout", 300);
        McastSwitchConfig {
            enabled: flag("mcast_snoop", false),
            querier: flag("mcast_querier", true),
            flood_unregistered: flag("mcast_flood_unregistered", false),
            eth_src: config.get("mcast_eth_src").cloned().unwrap_or_default(),
            ip4_src: config.get("mcast_ip4_src").cloned().unwrap_or_default(),
            table_size: num("mcast_table_size", 2048),
            idle_timeout,
            query_interval: num("mcast_query_interval", idle_timeout / 2),
            query_max_resp: num("mcast_query_max_response", 1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McastRouterConfig {
    pub relay: bool,
    pub flood_static: bool,
}

impl McastRouterConfig {
    pub fn from_options(options: &StrMap) -> Self {
        McastRouterConfig {
            relay: options.get("mcast_relay").map(|v| v == "true").unwrap_or(false),
            flood_static: options
                .get("mcast_flood_static")
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

#[derive(Debug)]
pub struct SwitchData {
    pub nb: Uuid,
    pub name: String,
    pub subnet: Option<Ipv4Network>,
    pub ipv6_prefix: Option<Ipv6Addr>,
    pub ipam: Option<ipam::Ipam>,
    /// Router ports peered with this switch's router-type ports
    pub router_ports: Vec<usize>,
    pub localnet_port: Option<usize>,
    pub mcast: McastSwitchConfig,
    /// A peered router has multicast relay enabled
    pub flood_relay: bool,
    pub has_unknown: bool,
}

#[derive(Debug)]
pub struct RouterData {
    pub nb: Uuid,
    pub name: String,
    /// options:chassis — the whole router is bound to one chassis
    pub chassis: Option<String>,
    pub l3dgw_port: Option<usize>,
    pub redirect_port: Option<usize>,
    pub mcast: McastRouterConfig,
}

#[derive(Debug)]
pub enum DpData {
    Switch(SwitchData),
    Router(RouterData),
}

/// A logical datapath: one logical switch or logical router
#[derive(Debug)]
pub struct Datapath {
    pub sb_uuid: Option<Uuid>,
    pub tunnel_key: u32,
    pub ports: Vec<usize>,
    pub port_keys: KeySpace,
    pub mcast_keys: KeySpace,
    pub data: DpData,
}

impl Datapath {
    pub fn new(data: DpData) -> Self {
        Datapath {
            sb_uuid: None,
            tunnel_key: 0,
            ports: Vec::new(),
            port_keys: KeySpace::new(PORT_KEY_MIN, PORT_KEY_MAX),
            mcast_keys: KeySpace::new(MCAST_KEY_MIN, MCAST_KEY_MAX),
            data,
        }
    }

    pub fn kind(&self) -> DpKind {
        match self.data {
            DpData::Switch(_) => DpKind::Switch,
            DpData::Router(_) => DpKind::Router,
        }
    }

    pub fn nb_uuid(&self) -> Uuid {
        match &self.data {
            DpData::Switch(s) => s.nb,
            DpData::Router(r) => r.nb,
        }
    }

    pub fn name(&self) -> &str {
        match &self.data {
            DpData::Switch(s) => &s.name,
            DpData::Router(r) => &r.name,
        }
    }

    pub fn as_switch(&self) -> Option<&SwitchData> {
        match &self.data {
            DpData::Switch(s) => Some(s),
            DpData::Router(_) => None,
        }
    }

    pub fn as_switch_mut(&mut self) -> Option<&mut SwitchData> {
        match &mut self.data {
            DpData::Switch(s) => Some(s),
            DpData::Router(_) => None,
        }
    }

    pub fn as_router(&self) -> Option<&RouterData> {
        match &self.data {
            DpData::Switch(_) => None,
            DpData::Router(r) => Some(r),
        }
    }

    pub fn as_router_mut(&mut self) -> Option<&mut RouterData> {
        match &mut self.data {
            DpData::Switch(_) => None,
            DpData::Router(r) => Some(r),
        }
    }

    /// A gateway router is bound whole to one chassis
    pub fn is_gateway_router(&self) -> bool {
        self.as_router()
            .map(|r| r.chassis.is_some())
            .unwrap_or(false)
    }
}

/// Which northbound row a port mirrors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PortNb {
    None,
    Switch(Uuid),
    Router(Uuid),
}

/// Pending dynamic-address request parsed out of a switch port's
/// addresses column
#[derive(Debug, Clone)]
pub struct DynamicRequest {
    pub mac: Option<MacAddr>,
    pub ip4: Option<std::net::Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
}

#[derive(Debug)]
pub struct Port {
    pub name: String,
    pub dp: Option<usize>,
    pub sb_uuid: Option<Uuid>,
    pub tunnel_key: u32,
    pub derived: bool,
    pub peer: Option<usize>,
    pub nb: PortNb,
    /// Effective addresses: parsed statics, resolved dynamics, and (for
    /// router-type switch ports) the peer's networks
    pub addrs: Vec<LportAddresses>,
    pub ps_addrs: Vec<LportAddresses>,
    /// Router-port networks (mac column + networks column)
    pub networks: Option<LportAddresses>,
    pub has_unknown: bool,
    /// "router" appeared in the addresses column
    pub wants_router_addrs: bool,
    pub dynamic: Option<DynamicRequest>,
}

impl Port {
    pub fn new(name: String) -> Self {
        Port {
            name,
            dp: None,
            sb_uuid: None,
            tunnel_key: 0,
            derived: false,
            peer: None,
            nb: PortNb::None,
            addrs: Vec::new(),
            ps_addrs: Vec::new(),
            networks: None,
            has_unknown: false,
            wants_router_addrs: false,
            dynamic: None,
        }
    }

    pub fn lsp_uuid(&self) -> Option<Uuid> {
        match self.nb {
            PortNb::Switch(u) => Some(u),
            _ => None,
        }
    }

    pub fn lrp_uuid(&self) -> Option<Uuid> {
        match self.nb {
            PortNb::Router(u) => Some(u),
            _ => None,
        }
    }

    pub fn is_nb(&self) -> bool {
        self.nb != PortNb::None
    }
}

/// Per-pass working state
pub struct Context {
    pub datapaths: Vec<Datapath>,
    pub switch_by_nb: HashMap<Uuid, usize>,
    pub router_by_nb: HashMap<Uuid, usize>,
    /// Southbound Datapath_Binding uuid → datapath index
    pub dp_by_sb: HashMap<Uuid, usize>,
    pub ports: Vec<Port>,
    pub port_by_name: HashMap<String, usize>,
    pub queues: QueueIdMap,
    pub macam: ipam::Macam,
    /// Chassis-redirect port index → southbound HA_Chassis_Group row
    pub ha_group_for_port: HashMap<usize, Uuid>,
    pub warn: LogLimiter,
}

impl Context {
    pub fn new(mac_prefix: u32) -> Self {
        Context {
            datapaths: Vec::new(),
            switch_by_nb: HashMap::new(),
            router_by_nb: HashMap::new(),
            dp_by_sb: HashMap::new(),
            ports: Vec::new(),
            port_by_name: HashMap::new(),
            queues: QueueIdMap::default(),
            macam: ipam::Macam::new(mac_prefix),
            ha_group_for_port: HashMap::new(),
            warn: LogLimiter::default(),
        }
    }

    pub fn add_port(&mut self, port: Port) -> usize {
        let index = self.ports.len();
        self.port_by_name.insert(port.name.clone(), index);
        self.ports.push(port);
        index
    }
}

/// One full reconciliation: joins, address management, synthesis, and
/// the southbound diff. Mutates both snapshots in place; the caller
/// commits them.
pub fn build_all(nb: &mut NbDb, sb: &mut SbDb, state: &mut DaemonState) {
    let prefix = ipam::ensure_mac_prefix(nb, state);
    let mut ctx = Context::new(prefix);

    datapath::join_datapaths(nb, sb, state, &mut ctx);
    ports::join_ports(nb, sb, &mut ctx);
    ha::sync_ha_chassis_groups(nb, sb, &mut ctx);
    ipam::run(nb, &mut ctx);
    ports::update_port_bindings(nb, sb, &mut ctx);

    sync::sync_address_sets(nb, sb, &ctx);
    sync::sync_port_groups(nb, sb, &ctx);
    sync::sync_meters(nb, sb);
    sync::sync_dns(nb, sb, &ctx);
    sync::sync_dhcp_catalogs(sb);
    sync::check_and_update_rbac(sb);
    sync::sync_ip_multicast(sb, &ctx);

    let mut mcast = multicast::build_mcast_groups(nb, sb, &mut ctx);

    let mut flows = flow::LflowSet::new();
    lswitch::build_lswitch_flows(&ctx, nb, sb, &mut flows, &mcast);
    lrouter::build_lrouter_flows(&mut ctx, nb, sb, &mut flows, &mcast);

    flow::sync_flows(sb, &ctx, flows);
    multicast::sync_mcast_groups(sb, &ctx, &mut mcast);
    sync::prune_mac_bindings(sb, &ctx);
    sync::mirror_config(nb, sb);
}
