use std::collections::HashMap;

use botblocks_common::NodeId;
use serde::Serialize;

/// Stateful opcode families. Each one has its own dense slot space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StatefulFamily {
    Pid,
    Smooth,
    Schmitt,
    Edge,
}

/// Slot operands travel in a signed 16-bit instruction field.
pub const MAX_SLOTS: usize = i16::MAX as usize + 1;

/// Slot ids past the operand range saturate; the compiler rejects such
/// programs by their counts.
fn slot_id(n: usize) -> u16 {
    n.min(MAX_SLOTS - 1) as u16
}

impl StatefulFamily {
    fn index(self) -> usize {
        self as usize
    }
}

/// Exact sizes of the runtime's static arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotCounts {
    pub variables: usize,
    pub pid: usize,
    pub smooth: usize,
    pub schmitt: usize,
    pub edge: usize,
}

impl SlotCounts {
    /// The largest count of any slot space.
    pub fn largest(&self) -> usize {
        [self.variables, self.pid, self.smooth, self.schmitt, self.edge]
            .into_iter()
            .max()
            .unwrap_or(0)
    }

    /// Length of a static array backing `count` slots. C forbids zero-length arrays.
    pub fn array_len(count: usize) -> usize {
        count.max(1)
    }
}

/// Assigns dense integer slots to variables and stateful blocks.
///
/// Allocation never fails: an unseen name or block simply mints the next slot.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    /// Slot index -> variable name. Anonymous slots carry a `$`-prefixed label.
    variables: Vec<String>,
    by_name: HashMap<String, u16>,
    stateful: HashMap<(StatefulFamily, NodeId), u16>,
    family_counts: [usize; 4],
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot of a user variable, allocated on first sight.
    pub fn slot_for(&mut self, name: &str) -> u16 {
        if let Some(&slot) = self.by_name.get(name) {
            return slot;
        }
        let slot = slot_id(self.variables.len());
        self.variables.push(name.to_string());
        self.by_name.insert(name.to_string(), slot);
        slot
    }

    /// A fresh compiler-owned variable slot (loop counters, bounds, temporaries).
    pub fn anonymous(&mut self, purpose: &str) -> u16 {
        let slot = slot_id(self.variables.len());
        self.variables.push(format!("${purpose}{slot}"));
        slot
    }

    /// Slot of one stateful block within its family, allocated on first sight.
    pub fn slot_for_stateful(&mut self, family: StatefulFamily, node: NodeId) -> u16 {
        let counter = &mut self.family_counts[family.index()];
        *self.stateful.entry((family, node)).or_insert_with(|| {
            let slot = slot_id(*counter);
            *counter += 1;
            slot
        })
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variables
    }

    pub fn counts(&self) -> SlotCounts {
        SlotCounts {
            variables: self.variables.len(),
            pid: self.family_counts[StatefulFamily::Pid.index()],
            smooth: self.family_counts[StatefulFamily::Smooth.index()],
            schmitt: self.family_counts[StatefulFamily::Schmitt.index()],
            edge: self.family_counts[StatefulFamily::Edge.index()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_slots_are_dense_and_idempotent() {
        let mut slots = SlotAllocator::new();
        assert_eq!(slots.slot_for("speed"), 0);
        assert_eq!(slots.slot_for("count"), 1);
        assert_eq!(slots.slot_for("speed"), 0);
        assert_eq!(slots.anonymous("repeat"), 2);
        assert_eq!(slots.slot_for("other"), 3);
        assert_eq!(slots.counts().variables, 4);
        assert_eq!(slots.variable_names()[2], "$repeat2");
    }

    #[test]
    fn test_stateful_families_are_independent() {
        let mut slots = SlotAllocator::new();
        assert_eq!(slots.slot_for_stateful(StatefulFamily::Pid, NodeId(7)), 0);
        assert_eq!(slots.slot_for_stateful(StatefulFamily::Smooth, NodeId(9)), 0);
        assert_eq!(slots.slot_for_stateful(StatefulFamily::Pid, NodeId(3)), 1);
        assert_eq!(slots.slot_for_stateful(StatefulFamily::Pid, NodeId(7)), 0);

        let counts = slots.counts();
        assert_eq!(counts.pid, 2);
        assert_eq!(counts.smooth, 1);
        assert_eq!(counts.schmitt, 0);
        assert_eq!(counts.edge, 0);
        assert_eq!(SlotCounts::array_len(counts.schmitt), 1);
    }

    #[test]
    fn test_slot_ids_saturate_past_operand_range() {
        let mut slots = SlotAllocator::new();
        for i in 0..MAX_SLOTS + 10 {
            slots.anonymous(&format!("t{i}"));
        }
        assert_eq!(slots.slot_for("late"), (MAX_SLOTS - 1) as u16);
        assert_eq!(slots.counts().variables, MAX_SLOTS + 11);
        assert_eq!(slots.counts().largest(), MAX_SLOTS + 11);
    }
}
