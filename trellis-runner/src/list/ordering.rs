// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{SpecId, SpecList};
use crate::tree::{NodeId, NodeKind, TreeNode};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::collections::HashMap;

/// A schedulable group of specs.
///
/// A unit is either a single spec or every spec of one Ordered group, in declaration order. Units
/// are claimed whole by parallel processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionUnit {
    specs: Vec<SpecId>,
    serial: bool,
    ordered: Option<NodeId>,
}

impl ExecutionUnit {
    /// Returns the specs in the unit, in execution order.
    pub fn specs(&self) -> &[SpecId] {
        &self.specs
    }

    /// Returns true if any spec in the unit is Serial.
    pub fn is_serial(&self) -> bool {
        self.serial
    }

    /// Returns the Ordered container this unit was formed from, if any.
    pub fn ordered_group(&self) -> Option<NodeId> {
        self.ordered
    }
}

/// Computes the execution order for a suite.
///
/// Top-level children are shuffled with `seed`. With `randomize_all`, the children of every
/// container are shuffled as well. Ordered and Serial containers always keep declaration order,
/// and whole subtrees move together, so containers stay contiguous. The same seed always produces
/// the same order.
pub fn order_units(list: &SpecList<'_>, seed: u64, randomize_all: bool) -> Vec<ExecutionUnit> {
    let mut rng = StdRng::seed_from_u64(seed);
    let leaf_ids: HashMap<NodeId, SpecId> =
        list.iter().map(|spec| (spec.leaf().id, spec.id())).collect();
    let order = Shuffler {
        rng: &mut rng,
        randomize_all,
        leaf_ids: &leaf_ids,
    }
    .collect(list.root(), true, false);

    let mut units: Vec<ExecutionUnit> = Vec::new();
    for id in order {
        let Some(spec) = list.get(id) else { continue };
        let group = spec.ordered_group();
        if let Some(last) = units.last_mut()
            && group.is_some()
            && last.ordered == group
        {
            last.specs.push(id);
            last.serial |= spec.is_serial();
            continue;
        }
        units.push(ExecutionUnit {
            specs: vec![id],
            serial: spec.is_serial(),
            ordered: group,
        });
    }
    units
}

struct Shuffler<'a> {
    rng: &'a mut StdRng,
    randomize_all: bool,
    leaf_ids: &'a HashMap<NodeId, SpecId>,
}

impl Shuffler<'_> {
    fn collect(&mut self, node: &TreeNode, top_level: bool, fixed: bool) -> Vec<SpecId> {
        let NodeKind::Container { children, .. } = &node.kind else {
            return self.leaf_ids.get(&node.id).copied().into_iter().collect();
        };

        let fixed = fixed || node.decorators.is_ordered() || node.decorators.is_serial();
        let mut groups: Vec<Vec<SpecId>> = children
            .iter()
            .map(|child| self.collect(child, false, fixed))
            .filter(|group| !group.is_empty())
            .collect();
        if !fixed && (top_level || self.randomize_all) {
            groups.shuffle(self.rng);
        }
        groups.concat()
    }
}
