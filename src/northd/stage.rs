use std::fmt;

/// Which kind of datapath a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpKind {
    Switch,
    Router,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    Ingress,
    Egress,
}

impl Pipeline {
    pub fn as_str(self) -> &'static str {
        match self {
            Pipeline::Ingress => "ingress",
            Pipeline::Egress => "egress",
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Southbound readers interpret (pipeline, table) positionally, so the
// catalog below is part of the wire contract. Encoding: bit 9 datapath
// kind (0 = switch), bit 8 pipeline (0 = ingress), bits 7..0 table.
macro_rules! stages {
    ($(($variant:ident, $kind:ident, $pipe:ident, $table:expr, $name:expr),)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Stage {
            $($variant,)+
        }

        impl Stage {
            pub const ALL: &'static [Stage] = &[$(Stage::$variant,)+];

            pub fn dp_kind(self) -> DpKind {
                match self {
                    $(Stage::$variant => DpKind::$kind,)+
                }
            }

            pub fn pipeline(self) -> Pipeline {
                match self {
                    $(Stage::$variant => Pipeline::$pipe,)+
                }
            }

            pub fn table(self) -> u8 {
                match self {
                    $(Stage::$variant => $table,)+
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Stage::$variant => $name,)+
                }
            }
        }
    };
}

stages! {
    // Logical switch, ingress
    (SwitchInPortSecL2, Switch, Ingress, 0, "ls_in_port_sec_l2"),
    (SwitchInPortSecIp, Switch, Ingress, 1, "ls_in_port_sec_ip"),
    (SwitchInPortSecNd, Switch, Ingress, 2, "ls_in_port_sec_nd"),
    (SwitchInPreAcl, Switch, Ingress, 3, "ls_in_pre_acl"),
    (SwitchInPreLb, Switch, Ingress, 4, "ls_in_pre_lb"),
    (SwitchInPreStateful, Switch, Ingress, 5, "ls_in_pre_stateful"),
    (SwitchInAcl, Switch, Ingress, 6, "ls_in_acl"),
    (SwitchInQosMark, Switch, Ingress, 7, "ls_in_qos_mark"),
    (SwitchInQosMeter, Switch, Ingress, 8, "ls_in_qos_meter"),
    (SwitchInLb, Switch, Ingress, 9, "ls_in_lb"),
    (SwitchInStateful, Switch, Ingress, 10, "ls_in_stateful"),
    (SwitchInArpNdRsp, Switch, Ingress, 11, "ls_in_arp_rsp"),
    (SwitchInDhcpOptions, Switch, Ingress, 12, "ls_in_dhcp_options"),
    (SwitchInDhcpResponse, Switch, Ingress, 13, "ls_in_dhcp_response"),
    (SwitchInDnsLookup, Switch, Ingress, 14, "ls_in_dns_lookup"),
    (SwitchInDnsResponse, Switch, Ingress, 15, "ls_in_dns_response"),
    (SwitchInExternalPort, Switch, Ingress, 16, "ls_in_external_port"),
    (SwitchInL2Lkup, Switch, Ingress, 17, "ls_in_l2_lkup"),
    // Logical switch, egress
    (SwitchOutPreLb, Switch, Egress, 0, "ls_out_pre_lb"),
    (SwitchOutPreAcl, Switch, Egress, 1, "ls_out_pre_acl"),
    (SwitchOutPreStateful, Switch, Egress, 2, "ls_out_pre_stateful"),
    (SwitchOutLb, Switch, Egress, 3, "ls_out_lb"),
    (SwitchOutAcl, Switch, Egress, 4, "ls_out_acl"),
    (SwitchOutQosMark, Switch, Egress, 5, "ls_out_qos_mark"),
    (SwitchOutQosMeter, Switch, Egress, 6, "ls_out_qos_meter"),
    (SwitchOutStateful, Switch, Egress, 7, "ls_out_stateful"),
    (SwitchOutPortSecIp, Switch, Egress, 8, "ls_out_port_sec_ip"),
    (SwitchOutPortSecL2, Switch, Egress, 9, "ls_out_port_sec_l2"),
    // Logical router, ingress
    (RouterInAdmission, Router, Ingress, 0, "lr_in_admission"),
    (RouterInLookupNeighbor, Router, Ingress, 1, "lr_in_lookup_neighbor"),
    (RouterInLearnNeighbor, Router, Ingress, 2, "lr_in_learn_neighbor"),
    (RouterInIpInput, Router, Ingress, 3, "lr_in_ip_input"),
    (RouterInDefrag, Router, Ingress, 4, "lr_in_defrag"),
    (RouterInUnsnat, Router, Ingress, 5, "lr_in_unsnat"),
    (RouterInDnat, Router, Ingress, 6, "lr_in_dnat"),
    (RouterInNdRaOptions, Router, Ingress, 7, "lr_in_nd_ra_options"),
    (RouterInNdRaResponse, Router, Ingress, 8, "lr_in_nd_ra_response"),
    (RouterInIpRouting, Router, Ingress, 9, "lr_in_ip_routing"),
    (RouterInPolicy, Router, Ingress, 10, "lr_in_policy"),
    (RouterInArpResolve, Router, Ingress, 11, "lr_in_arp_resolve"),
    (RouterInChkPktLen, Router, Ingress, 12, "lr_in_chk_pkt_len"),
    (RouterInLargerPkts, Router, Ingress, 13, "lr_in_larger_pkts"),
    (RouterInGwRedirect, Router, Ingress, 14, "lr_in_gw_redirect"),
    (RouterInArpRequest, Router, Ingress, 15, "lr_in_arp_request"),
    // Logical router, egress
    (RouterOutUndnat, Router, Egress, 0, "lr_out_undnat"),
    (RouterOutSnat, Router, Egress, 1, "lr_out_snat"),
    (RouterOutEgrLoop, Router, Egress, 2, "lr_out_egr_loop"),
    (RouterOutDelivery, Router, Egress, 3, "lr_out_delivery"),
}

impl Stage {
    pub fn encode(self) -> u16 {
        let kind = match self.dp_kind() {
            DpKind::Switch => 0u16,
            DpKind::Router => 1u16,
        };
        let pipe = match self.pipeline() {
            Pipeline::Ingress => 0u16,
            Pipeline::Egress => 1u16,
        };
        (kind << 9) | (pipe << 8) | u16::from(self.table())
    }

    pub fn decode(value: u16) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.encode() == value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::decode(stage.encode()), Some(*stage));
        }
    }

    #[test]
    fn test_table_order_is_dense() {
        // Tables within each (kind, pipeline) must be 0..n with no gaps
        use std::collections::BTreeMap;
        let mut groups: BTreeMap<(u16, u16), Vec<u8>> = BTreeMap::new();
        for stage in Stage::ALL {
            let kind = (stage.encode() >> 9) & 1;
            let pipe = (stage.encode() >> 8) & 1;
            groups.entry((kind, pipe)).or_default().push(stage.table());
        }
        for ((_, _), mut tables) in groups {
            tables.sort_unstable();
            for (i, t) in tables.iter().enumerate() {
                assert_eq!(*t as usize, i);
            }
        }
    }

    #[test]
    fn test_known_positions() {
        assert_eq!(Stage::SwitchInL2Lkup.table(), 17);
        assert_eq!(Stage::SwitchInAcl.table(), 6);
        assert_eq!(Stage::RouterInIpRouting.table(), 9);
        assert_eq!(Stage::RouterOutDelivery.table(), 3);
        assert_eq!(Stage::SwitchOutPortSecL2.table(), 9);
    }
}
