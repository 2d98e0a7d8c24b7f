//! End-to-end reconciliation scenarios driven through the in-memory
//! stores, covering idempotence, address management, flow synthesis,
//! purge behavior, and failover.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use northd::db::nb::{
    Acl, LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort, Nat, NbDb,
};
use northd::db::sb::{
    DatapathBinding, LogicalFlow, PortBinding, SbDb, EXTID_LOGICAL_SWITCH,
};
use northd::db::{AdvisoryLock, CommitStats, Store};
use northd::northd::stage::{DpKind, Stage};
use northd::{Daemon, DaemonConfig, LOCK_NAME};

struct Harness {
    nb: Store<NbDb>,
    sb: Store<SbDb>,
    daemon: Daemon,
}

impl Harness {
    fn new() -> Self {
        let nb = Store::new(NbDb::default());
        let sb = Store::new(SbDb::default());
        let lock = AdvisoryLock::new(LOCK_NAME);
        let daemon = Daemon::new(DaemonConfig::default(), nb.clone(), sb.clone(), lock);
        Harness { nb, sb, daemon }
    }

    fn run(&mut self) -> (CommitStats, CommitStats) {
        self.daemon.run_once().expect("replica is active")
    }
}

fn add_switch(nb: &mut NbDb, name: &str) -> Uuid {
    nb.switches.insert(LogicalSwitch {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        ..Default::default()
    })
}

fn add_lsp(nb: &mut NbDb, switch: Uuid, name: &str, addresses: &[&str]) -> Uuid {
    let uuid = nb.switch_ports.insert(LogicalSwitchPort {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
        up: true,
        ..Default::default()
    });
    nb.switches.modify(&switch, |ls| ls.ports.push(uuid));
    uuid
}

fn add_router(nb: &mut NbDb, name: &str) -> Uuid {
    nb.routers.insert(LogicalRouter {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        ..Default::default()
    })
}

fn add_lrp(nb: &mut NbDb, router: Uuid, name: &str, mac: &str, networks: &[&str]) -> Uuid {
    let uuid = nb.router_ports.insert(LogicalRouterPort {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        mac: mac.to_string(),
        networks: networks.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    });
    nb.routers.modify(&router, |lr| lr.ports.push(uuid));
    uuid
}

/// A topology touching most builders: two switches joined by a router,
/// static and dynamic addressing, an ACL, and NAT.
fn build_rich_topology(nb: &mut NbDb) {
    let ls0 = add_switch(nb, "sw0");
    nb.switches.modify(&ls0, |ls| {
        ls.other_config
            .insert("subnet".to_string(), "10.0.0.0/24".to_string());
    });
    add_lsp(nb, ls0, "vm0", &["0a:00:00:00:01:01 10.0.0.11"]);
    add_lsp(nb, ls0, "vm1", &["dynamic"]);
    add_lsp(nb, ls0, "vm-unknown", &["unknown"]);
    let acl = nb.acls.insert(Acl {
        uuid: Uuid::new_v4(),
        priority: 2000,
        direction: "from-lport".to_string(),
        match_: "ip4.src == 10.0.0.11".to_string(),
        action: "allow-related".to_string(),
        ..Default::default()
    });
    nb.switches.modify(&ls0, |ls| ls.acls.push(acl));

    let ls1 = add_switch(nb, "sw1");
    add_lsp(nb, ls1, "vm2", &["0a:00:00:00:02:01 192.168.1.11"]);

    let lr = add_router(nb, "lr0");
    add_lrp(nb, lr, "lrp-sw0", "00:00:20:00:00:01", &["10.0.0.1/24"]);
    add_lrp(nb, lr, "lrp-sw1", "00:00:20:00:00:02", &["192.168.1.1/24"]);
    let rp0 = nb.switch_ports.insert(LogicalSwitchPort {
        uuid: Uuid::new_v4(),
        name: "sw0-lr0".to_string(),
        port_type: "router".to_string(),
        addresses: vec!["router".to_string()],
        options: vec![("router-port".to_string(), "lrp-sw0".to_string())]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
        up: true,
        ..Default::default()
    });
    nb.switches.modify(&ls0, |ls| ls.ports.push(rp0));
    let rp1 = nb.switch_ports.insert(LogicalSwitchPort {
        uuid: Uuid::new_v4(),
        name: "sw1-lr0".to_string(),
        port_type: "router".to_string(),
        addresses: vec!["router".to_string()],
        options: vec![("router-port".to_string(), "lrp-sw1".to_string())]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
        up: true,
        ..Default::default()
    });
    nb.switches.modify(&ls1, |ls| ls.ports.push(rp1));
}

#[test]
fn test_idempotence() {
    let mut harness = Harness::new();
    harness.nb.apply(build_rich_topology);
    let (nb_first, sb_first) = harness.run();
    assert!(sb_first.inserts > 0, "first pass populates the southbound");
    assert!(nb_first.total() > 0, "first pass writes dynamic addresses");
    let (nb_second, sb_second) = harness.run();
    assert_eq!(nb_second.total(), 0, "second pass northbound: {}", nb_second);
    assert_eq!(sb_second.total(), 0, "second pass southbound: {}", sb_second);
    // and a third, for luck
    let (nb_third, sb_third) = harness.run();
    assert_eq!(nb_third.total() + sb_third.total(), 0);
}

#[test]
fn test_stage_validity_and_flow_uniqueness() {
    let mut harness = Harness::new();
    harness.nb.apply(build_rich_topology);
    harness.run();
    harness.sb.read(|sb| {
        let mut kinds: HashMap<Uuid, DpKind> = HashMap::new();
        for dp in sb.datapaths.iter() {
            let kind = if dp.external_ids.contains_key(EXTID_LOGICAL_SWITCH) {
                DpKind::Switch
            } else {
                DpKind::Router
            };
            kinds.insert(dp.uuid, kind);
        }
        let mut seen = HashSet::new();
        for flow in sb.logical_flows.iter() {
            let kind = kinds
                .get(&flow.logical_datapath)
                .expect("flow references a live datapath");
            let stage = Stage::ALL.iter().find(|s| {
                s.dp_kind() == *kind
                    && s.pipeline().as_str() == flow.pipeline
                    && s.table() == flow.table_id
            });
            assert!(
                stage.is_some(),
                "no stage for kind {:?} pipeline {} table {}",
                kind,
                flow.pipeline,
                flow.table_id
            );
            assert!(
                seen.insert((
                    flow.logical_datapath,
                    flow.pipeline.clone(),
                    flow.table_id,
                    flow.priority,
                    flow.match_.clone(),
                    flow.actions.clone(),
                )),
                "duplicate flow {} / {}",
                flow.match_,
                flow.actions
            );
        }
    });
}

#[test]
fn test_dynamic_ip_assignment() {
    let mut harness = Harness::new();
    harness.nb.apply(|nb| {
        let ls = add_switch(nb, "sw0");
        nb.switches.modify(&ls, |row| {
            row.other_config
                .insert("subnet".to_string(), "10.0.0.0/24".to_string());
            row.other_config
                .insert("exclude_ips".to_string(), "10.0.0.4..10.0.0.6".to_string());
        });
        add_lsp(nb, ls, "p1", &["dynamic"]);
        add_lsp(nb, ls, "p2", &["dynamic"]);
        add_lsp(nb, ls, "p3", &["dynamic"]);
    });
    harness.run();
    harness.nb.read(|nb| {
        let prefix = nb
            .global
            .iter()
            .next()
            .and_then(|g| g.options.get("mac_prefix").cloned())
            .expect("mac prefix persisted");
        let addr_of = |name: &str| {
            nb.switch_port_by_name(name)
                .and_then(|p| p.dynamic_addresses.clone())
                .unwrap_or_else(|| panic!("{} got dynamic addresses", name))
        };
        // .1 is reserved for the router, .4-.6 are excluded
        let p1 = addr_of("p1");
        assert!(p1.starts_with(&prefix), "{} starts with {}", p1, prefix);
        assert!(p1.ends_with(" 10.0.0.2"), "p1 = {}", p1);
        assert!(addr_of("p2").ends_with(" 10.0.0.3"));
        assert!(addr_of("p3").ends_with(" 10.0.0.7"));
    });
}

#[test]
fn test_prepopulated_dynamic_unchanged() {
    let mut harness = Harness::new();
    harness.nb.apply(|nb| {
        let global = nb.global_uuid();
        nb.global.modify(&global, |g| {
            g.options
                .insert("mac_prefix".to_string(), "0a:00:20".to_string());
        });
        let ls = add_switch(nb, "sw0");
        nb.switches.modify(&ls, |row| {
            row.other_config
                .insert("subnet".to_string(), "10.0.0.0/24".to_string());
        });
        let lsp = add_lsp(nb, ls, "p1", &["dynamic"]);
        nb.switch_ports.modify(&lsp, |row| {
            row.dynamic_addresses = Some("0a:00:20:33:44:55 10.0.0.2".to_string());
        });
    });
    let (nb_stats, _) = harness.run();
    assert_eq!(nb_stats.total(), 0, "no northbound write: {}", nb_stats);
    harness.nb.read(|nb| {
        assert_eq!(
            nb.switch_port_by_name("p1").unwrap().dynamic_addresses,
            Some("0a:00:20:33:44:55 10.0.0.2".to_string())
        );
    });
}

#[test]
fn test_acl_translation() {
    let mut harness = Harness::new();
    let acl_match = "ip4.src == 10.0.0.10";
    harness.nb.apply(move |nb| {
        let ls = add_switch(nb, "sw0");
        add_lsp(nb, ls, "p1", &["0a:00:00:00:01:01 10.0.0.10"]);
        let acl = nb.acls.insert(Acl {
            uuid: Uuid::new_v4(),
            priority: 2000,
            direction: "from-lport".to_string(),
            match_: acl_match.to_string(),
            action: "allow-related".to_string(),
            ..Default::default()
        });
        nb.switches.modify(&ls, |row| row.acls.push(acl));
    });
    harness.run();
    harness.sb.read(|sb| {
        let acl_stage: Vec<&LogicalFlow> = sb
            .logical_flows
            .iter()
            .filter(|f| f.pipeline == "ingress" && f.table_id == 6)
            .collect();
        let commit_form = format!(
            "((ct.new && !ct.est) || (ct.est && ct_label.blocked == 1)) && ({})",
            acl_match
        );
        let est_form = format!(
            "!ct.new && ct.est && !ct.rpl && ct_label.blocked == 0 && ({})",
            acl_match
        );
        assert!(acl_stage
            .iter()
            .any(|f| f.priority == 3000
                && f.match_ == commit_form
                && f.actions == "reg0[1] = 1; next;"));
        assert!(acl_stage
            .iter()
            .any(|f| f.priority == 3000 && f.match_ == est_form && f.actions == "next;"));
        let max_priority = acl_stage.iter().filter(|f| f.priority == 65535).count();
        assert_eq!(max_priority, 4, "fixed conntrack guards are present");
    });
}

#[test]
fn test_distributed_nat() {
    let mut harness = Harness::new();
    harness.nb.apply(|nb| {
        let lr = add_router(nb, "r0");
        let lrp = add_lrp(nb, lr, "LRP", "00:00:20:00:00:01", &["192.0.2.1/24"]);
        nb.router_ports.modify(&lrp, |row| {
            row.options
                .insert("redirect-chassis".to_string(), "c1".to_string());
        });
        let nat = nb.nats.insert(Nat {
            uuid: Uuid::new_v4(),
            nat_type: "dnat_and_snat".to_string(),
            external_ip: "192.0.2.5".to_string(),
            external_mac: Some("aa:aa:aa:aa:aa:aa".to_string()),
            logical_ip: "10.0.0.5".to_string(),
            logical_port: Some("P".to_string()),
            ..Default::default()
        });
        nb.routers.modify(&lr, |row| row.nat.push(nat));
    });
    harness.run();
    harness.sb.read(|sb| {
        let cr = sb
            .port_binding_by_name("cr-LRP")
            .expect("chassis-redirect binding exists");
        assert_eq!(cr.port_type, "chassisredirect");
        assert_eq!(cr.options.get("distributed-port").map(String::as_str), Some("LRP"));
        assert!(cr.ha_chassis_group.is_some());
        let group = sb
            .ha_chassis_groups
            .get(&cr.ha_chassis_group.unwrap())
            .expect("group row");
        assert_eq!(group.name, "LRP_c1");

        // pre-route on the hosting chassis
        assert!(sb.logical_flows.iter().any(|f| {
            f.pipeline == "ingress"
                && f.table_id == 9
                && f.priority == 400
                && f.match_ == "ip4.src == 10.0.0.5 && is_chassis_resident(\"P\")"
                && f.actions.contains("reg9[1] = 1")
                && f.actions.contains("outport = \"LRP\"")
        }));
        // reverse DNAT on the egress side
        assert!(sb.logical_flows.iter().any(|f| {
            f.pipeline == "egress"
                && f.table_id == 0
                && f.priority == 100
                && f.match_
                    == "ip && ip4.src == 10.0.0.5 && outport == \"LRP\" && \
                        is_chassis_resident(\"P\")"
                && f.actions == "eth.src = aa:aa:aa:aa:aa:aa; ct_dnat;"
        }));
    });
}

#[test]
fn test_southbound_purge() {
    let mut harness = Harness::new();
    let stale_dp = Uuid::new_v4();
    harness.sb.apply(|sb| {
        let dp = sb.datapaths.insert(DatapathBinding {
            uuid: stale_dp,
            tunnel_key: 5,
            external_ids: vec![(
                EXTID_LOGICAL_SWITCH.to_string(),
                Uuid::new_v4().to_string(),
            )]
            .into_iter()
            .collect(),
        });
        sb.port_bindings.insert(PortBinding {
            uuid: Uuid::new_v4(),
            logical_port: "stale-port".to_string(),
            datapath: dp,
            tunnel_key: 1,
            ..Default::default()
        });
        sb.logical_flows.insert(LogicalFlow {
            uuid: Uuid::new_v4(),
            logical_datapath: dp,
            pipeline: "ingress".to_string(),
            table_id: 0,
            priority: 50,
            match_: "inport == \"stale-port\"".to_string(),
            actions: "next;".to_string(),
            ..Default::default()
        });
    });
    harness.run();
    harness.sb.read(|sb| {
        assert!(sb.datapaths.is_empty());
        assert!(sb.port_bindings.is_empty());
        assert!(sb.logical_flows.is_empty());
    });
}

#[test]
fn test_leader_failover() {
    let nb = Store::new(NbDb::default());
    let sb = Store::new(SbDb::default());
    let lock = AdvisoryLock::new(LOCK_NAME);
    nb.apply(build_rich_topology);
    let mut a = Daemon::new(DaemonConfig::default(), nb.clone(), sb.clone(), lock.clone());
    let mut b = Daemon::new(DaemonConfig::default(), nb.clone(), sb.clone(), lock.clone());

    assert!(a.run_once().is_some(), "A acquires and commits");
    assert!(b.run_once().is_none(), "B must not commit while A holds");
    lock.release(a.client_id());
    let stats = b.run_once().expect("B takes over after A exits");
    // A converged the databases, so B's first pass is a no-op commit
    assert_eq!(stats.1.total(), 0);
    assert!(a.run_once().is_none(), "A cannot commit after losing the lock");
}

#[test]
fn test_key_stability() {
    let mut harness = Harness::new();
    harness.nb.apply(build_rich_topology);
    harness.run();
    let datapath_keys: HashMap<String, u32> = harness.sb.read(|sb| {
        sb.datapaths
            .iter()
            .map(|dp| (dp.external_ids.get("name").cloned().unwrap_or_default(), dp.tunnel_key))
            .collect()
    });
    let port_keys: HashMap<String, u32> = harness.sb.read(|sb| {
        sb.port_bindings
            .iter()
            .map(|pb| (pb.logical_port.clone(), pb.tunnel_key))
            .collect()
    });
    // grow the topology and reconcile again
    harness.nb.apply(|nb| {
        let ls = nb.switches.find(|s| s.name == "sw0").unwrap().uuid;
        add_lsp(nb, ls, "vm-new", &["0a:00:00:00:01:99 10.0.0.99"]);
    });
    harness.run();
    harness.sb.read(|sb| {
        for dp in sb.datapaths.iter() {
            let name = dp.external_ids.get("name").cloned().unwrap_or_default();
            assert_eq!(datapath_keys[&name], dp.tunnel_key, "datapath {}", name);
        }
        for pb in sb.port_bindings.iter() {
            if let Some(&key) = port_keys.get(&pb.logical_port) {
                assert_eq!(key, pb.tunnel_key, "port {}", pb.logical_port);
            }
        }
    });
}

#[test]
fn test_peer_symmetry_in_bindings() {
    let mut harness = Harness::new();
    harness.nb.apply(build_rich_topology);
    harness.run();
    harness.sb.read(|sb| {
        let pairs = [("sw0-lr0", "lrp-sw0"), ("sw1-lr0", "lrp-sw1")];
        for (switch_side, router_side) in pairs {
            let sw = sb.port_binding_by_name(switch_side).expect("switch side");
            let rt = sb.port_binding_by_name(router_side).expect("router side");
            assert_eq!(sw.port_type, "patch");
            assert_eq!(rt.port_type, "patch");
            assert_eq!(sw.options.get("peer").map(String::as_str), Some(router_side));
            assert_eq!(rt.options.get("peer").map(String::as_str), Some(switch_side));
        }
    });
}

#[test]
fn test_snat_priority_ordering() {
    let mut harness = Harness::new();
    harness.nb.apply(|nb| {
        let lr = add_router(nb, "gw");
        nb.routers.modify(&lr, |row| {
            row.options
                .insert("chassis".to_string(), "hv1".to_string());
        });
        add_lrp(nb, lr, "lrp-ext", "00:00:20:00:00:09", &["203.0.113.1/24"]);
        for (logical, external) in [("10.1.0.0/24", "203.0.113.10"), ("10.0.0.0/16", "203.0.113.11")]
        {
            let nat = nb.nats.insert(Nat {
                uuid: Uuid::new_v4(),
                nat_type: "snat".to_string(),
                external_ip: external.to_string(),
                logical_ip: logical.to_string(),
                ..Default::default()
            });
            nb.routers.modify(&lr, |row| row.nat.push(nat));
        }
    });
    harness.run();
    harness.sb.read(|sb| {
        let priority_of = |logical: &str| {
            sb.logical_flows
                .iter()
                .find(|f| {
                    f.pipeline == "egress"
                        && f.table_id == 1
                        && f.match_ == format!("ip && ip4.src == {}", logical)
                })
                .map(|f| f.priority)
                .unwrap_or_else(|| panic!("snat flow for {}", logical))
        };
        assert_eq!(priority_of("10.1.0.0/24"), 25);
        assert_eq!(priority_of("10.0.0.0/16"), 17);
        assert!(priority_of("10.1.0.0/24") > priority_of("10.0.0.0/16"));
    });
}

#[test]
fn test_multicast_flood_group() {
    let mut harness = Harness::new();
    harness.nb.apply(build_rich_topology);
    harness.run();
    harness.sb.read(|sb| {
        let sw0 = sb
            .datapaths
            .find(|dp| dp.external_ids.get("name").map(String::as_str) == Some("sw0"))
            .expect("sw0 datapath")
            .uuid;
        let flood = sb
            .multicast_groups
            .find(|g| g.datapath == sw0 && g.name == "_MC_flood")
            .expect("flood group");
        assert_eq!(flood.tunnel_key, 65535);
        // vm0, vm1, vm-unknown, and the router attachment
        assert_eq!(flood.ports.len(), 4);
        let unknown = sb
            .multicast_groups
            .find(|g| g.datapath == sw0 && g.name == "_MC_unknown")
            .expect("unknown group");
        assert_eq!(unknown.tunnel_key, 65534);
        assert_eq!(unknown.ports.len(), 1);
    });
}

#[test]
fn test_rbac_rows() {
    let mut harness = Harness::new();
    harness.run();
    harness.sb.read(|sb| {
        let role = sb
            .rbac_roles
            .find(|r| r.name == "ovn-controller")
            .expect("agent role");
        assert_eq!(role.permissions.len(), 4);
        for table in ["Chassis", "Encap", "Port_Binding", "MAC_Binding"] {
            let perm_uuid = role.permissions.get(table).expect(table);
            let perm = sb.rbac_permissions.get(perm_uuid).expect("permission row");
            assert_eq!(perm.table, table);
        }
        let pb = sb
            .rbac_permissions
            .find(|p| p.table == "Port_Binding")
            .unwrap();
        assert!(!pb.insert_delete);
        assert_eq!(pb.update, vec!["chassis".to_string()]);
    });
}
