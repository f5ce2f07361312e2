//! Per-unit state remembered across messages of one program leg.

use std::collections::{HashMap, HashSet};

use crate::messages::{AttackKind, UnitAttack, Waypoint, WaypointEntry, WaypointGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
struct AcceptedPath {
    teleport_id: u8,
    waypoints: Vec<Waypoint>,
}

/// Remembers the last forwarded path of every unit.
#[derive(Debug, Default)]
pub struct MovementTracker {
    units: HashMap<u32, AcceptedPath>,
}

impl MovementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry is redundant when the unit is still walking the path already
    /// forwarded: same teleport id, and the remaining waypoints (everything
    /// after the current position) are the tail of the accepted list.
    /// A bare position is never redundant, it means the unit stopped.
    pub fn is_redundant(&self, entry: &WaypointEntry) -> bool {
        let Some(accepted) = self.units.get(&entry.unit_net_id) else {
            return false;
        };
        if accepted.teleport_id != entry.teleport_id {
            return false;
        }
        let remaining = match entry.waypoints.split_first() {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => return false,
        };
        entry.waypoints.len() <= accepted.waypoints.len() && accepted.waypoints.ends_with(remaining)
    }

    /// Drop redundant entries and record the survivors. Returns `None` when
    /// nothing new is left.
    pub fn filter(&mut self, mut group: WaypointGroup) -> Option<WaypointGroup> {
        group.entries.retain(|entry| !self.is_redundant(entry));
        if group.entries.is_empty() {
            return None;
        }
        for entry in &group.entries {
            self.units.insert(
                entry.unit_net_id,
                AcceptedPath {
                    teleport_id: entry.teleport_id,
                    waypoints: entry.waypoints.clone(),
                },
            );
        }
        Some(group)
    }

    pub fn tracked_units(&self) -> usize {
        self.units.len()
    }
}

/// Tracks which units are currently attacking.
#[derive(Debug, Default)]
pub struct AttackTracker {
    attacking: HashSet<u32>,
}

impl AttackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `attack` should reach the remote. A stop is only meaningful
    /// for a unit known to be attacking.
    pub fn allow(&mut self, attack: &UnitAttack) -> bool {
        match attack.kind {
            AttackKind::Start => {
                self.attacking.insert(attack.unit_net_id);
                true
            }
            AttackKind::Stop => self.attacking.remove(&attack.unit_net_id),
        }
    }

    pub fn is_attacking(&self, unit_net_id: u32) -> bool {
        self.attacking.contains(&unit_net_id)
    }
}
