//! Logical-flow accumulation and the southbound diff. Flows are
//! identified by (datapath, stage, priority, match, actions); duplicate
//! emissions coalesce silently, so builders can emit without checking.

use std::collections::{HashMap, HashSet};
use std::convert::TryInto;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::db::sb::{LogicalFlow, SbDb};
use crate::db::StrMap;

use super::stage::Stage;
use super::Context;

#[derive(Debug, Clone)]
pub struct Lflow {
    pub dp: usize,
    pub stage: Stage,
    pub priority: u16,
    pub match_: String,
    pub actions: String,
    /// First 32 bits of the originating northbound row, for tracing
    pub stage_hint: Option<u32>,
    pub source: &'static str,
}

impl PartialEq for Lflow {
    fn eq(&self, other: &Self) -> bool {
        self.dp == other.dp
            && self.stage == other.stage
            && self.priority == other.priority
            && self.match_ == other.match_
            && self.actions == other.actions
    }
}

impl Eq for Lflow {}

impl Hash for Lflow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dp.hash(state);
        self.stage.hash(state);
        self.priority.hash(state);
        self.match_.hash(state);
        self.actions.hash(state);
    }
}

#[derive(Debug, Default)]
pub struct LflowSet(HashSet<Lflow>);

impl LflowSet {
    pub fn new() -> Self {
        LflowSet(HashSet::with_capacity(1024))
    }

    pub fn add(&mut self, flow: Lflow) {
        self.0.insert(flow);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lflow> {
        self.0.iter()
    }

    pub fn into_inner(self) -> HashSet<Lflow> {
        self.0
    }
}

/// Emit one logical flow; call-site location is recorded for the
/// southbound external-ids.
#[macro_export]
macro_rules! lflow {
    ($set:expr, $dp:expr, $stage:expr, $prio:expr, $match_:expr, $actions:expr) => {
        $set.add($crate::northd::flow::Lflow {
            dp: $dp,
            stage: $stage,
            priority: $prio,
            match_: $match_.into(),
            actions: $actions.into(),
            stage_hint: None,
            source: concat!(file!(), ":", line!()),
        })
    };
    ($set:expr, $dp:expr, $stage:expr, $prio:expr, $match_:expr, $actions:expr, $hint:expr) => {
        $set.add($crate::northd::flow::Lflow {
            dp: $dp,
            stage: $stage,
            priority: $prio,
            match_: $match_.into(),
            actions: $actions.into(),
            stage_hint: Some($hint),
            source: concat!(file!(), ":", line!()),
        })
    };
}

/// Hint tag from a northbound row UUID (its leading 32 bits)
pub fn hint(uuid: Uuid) -> u32 {
    u32::from_be_bytes(uuid.as_bytes()[0..4].try_into().expect("uuid prefix"))
}

/// Converge southbound Logical_Flow rows to the synthesized set:
/// matching rows stay untouched, unmatched southbound rows are deleted,
/// and leftover in-memory flows become inserts.
pub fn sync_flows(sb: &mut SbDb, ctx: &Context, flows: LflowSet) {
    let mut target: HashMap<(Uuid, &'static str, u8, u16, String, String), Lflow> = flows
        .into_inner()
        .into_iter()
        .filter_map(|f| {
            let dp_uuid = ctx.datapaths[f.dp].sb_uuid?;
            let key = (
                dp_uuid,
                f.stage.pipeline().as_str(),
                f.stage.table(),
                f.priority,
                f.match_.clone(),
                f.actions.clone(),
            );
            Some((key, f))
        })
        .collect();

    for uuid in sb.logical_flows.uuids() {
        let row = sb.logical_flows.get(&uuid).expect("flow row").clone();
        let key = (
            row.logical_datapath,
            if row.pipeline == "egress" { "egress" } else { "ingress" },
            row.table_id,
            row.priority,
            row.match_.clone(),
            row.actions.clone(),
        );
        if target.remove(&key).is_none() {
            sb.logical_flows.remove(&uuid);
        }
    }

    for (_, flow) in target {
        let dp_uuid = ctx.datapaths[flow.dp].sb_uuid.expect("filtered above");
        let mut external_ids = StrMap::new();
        external_ids.insert("stage-name".to_string(), flow.stage.name().to_string());
        external_ids.insert("source".to_string(), flow.source.to_string());
        if let Some(hint) = flow.stage_hint {
            external_ids.insert("stage-hint".to_string(), format!("{:x}", hint));
        }
        sb.logical_flows.insert(LogicalFlow {
            uuid: Uuid::new_v4(),
            logical_datapath: dp_uuid,
            pipeline: flow.stage.pipeline().as_str().to_string(),
            table_id: flow.stage.table(),
            priority: flow.priority,
            match_: flow.match_,
            actions: flow.actions,
            external_ids,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::northd::stage::Stage;

    fn probe(match_: &str, priority: u16) -> Lflow {
        Lflow {
            dp: 0,
            stage: Stage::SwitchInAcl,
            priority,
            match_: match_.to_string(),
            actions: "next;".to_string(),
            stage_hint: None,
            source: "test",
        }
    }

    #[test]
    fn test_duplicates_coalesce() {
        let mut set = LflowSet::new();
        set.add(probe("ip4", 100));
        set.add(probe("ip4", 100));
        set.add(probe("ip4", 200));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_identity_ignores_metadata() {
        let mut set = LflowSet::new();
        let mut a = probe("ip4", 100);
        a.source = "a";
        let mut b = probe("ip4", 100);
        b.source = "b";
        b.stage_hint = Some(7);
        set.add(a);
        set.add(b);
        assert_eq!(set.len(), 1);
    }
}
