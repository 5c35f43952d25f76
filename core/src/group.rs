//! Connection groups and round-robin routing
//!
//! A group is an ordered list of connections sharing the same channels.
//! Outbound group sends rotate through the members with a cursor;
//! inbound channel messages are only reported by the group's first
//! member so the host sees each message once.

use crate::{ConnectionId, GroupId};
use std::collections::{BTreeMap, HashMap};

/// One group: insertion-ordered members plus the round-robin cursor.
#[derive(Debug, Default)]
struct Group {
    members: Vec<ConnectionId>,
    cursor: usize,
}

/// All groups, plus the reverse connection -> group assignment.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: BTreeMap<GroupId, Group>,
    assigned: HashMap<ConnectionId, GroupId>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty group under the smallest unused positive id.
    pub fn create(&mut self) -> GroupId {
        let mut id = GroupId(1);
        for existing in self.groups.keys() {
            if *existing != id {
                break;
            }
            id.0 += 1;
        }
        self.groups.insert(id, Group::default());
        id
    }

    /// Destroy a group, clearing its members' assignments.
    pub fn destroy(&mut self, id: GroupId) -> bool {
        match self.groups.remove(&id) {
            Some(group) => {
                for member in group.members {
                    self.assigned.remove(&member);
                }
                true
            }
            None => false,
        }
    }

    /// Append a connection to a group. A connection belongs to at most
    /// one group; re-adding an existing member is rejected.
    pub fn add(&mut self, id: GroupId, connection: ConnectionId) -> bool {
        let Some(group) = self.groups.get_mut(&id) else {
            return false;
        };
        if group.members.contains(&connection) {
            return false;
        }
        group.members.push(connection);
        self.assigned.insert(connection, id);
        true
    }

    /// Remove a connection from a group, keeping the cursor pointed at
    /// the member that would have been selected next.
    pub fn remove(&mut self, id: GroupId, connection: ConnectionId) -> bool {
        let Some(group) = self.groups.get_mut(&id) else {
            return false;
        };
        let Some(index) = group.members.iter().position(|m| *m == connection) else {
            return false;
        };
        group.members.remove(index);
        if index < group.cursor {
            group.cursor -= 1;
        }
        if group.cursor >= group.members.len() {
            group.cursor = 0;
        }
        self.assigned.remove(&connection);
        true
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.groups.contains_key(&id)
    }

    /// Round-robin selection: the member under the cursor, advancing
    /// with wraparound. `None` for a missing or empty group.
    pub fn select(&mut self, id: GroupId) -> Option<ConnectionId> {
        let group = self.groups.get_mut(&id)?;
        if group.members.is_empty() {
            return None;
        }
        let selected = group.members[group.cursor];
        group.cursor = (group.cursor + 1) % group.members.len();
        Some(selected)
    }

    /// Whether a connection is the one that reports channel traffic for
    /// its group. Ungrouped connections always report.
    pub fn is_designated_observer(&self, connection: ConnectionId) -> bool {
        let Some(group_id) = self.assigned.get(&connection) else {
            return true;
        };
        match self.groups.get(group_id).and_then(|g| g.members.first()) {
            Some(first) => *first == connection,
            None => true,
        }
    }

    /// The group a connection currently belongs to.
    pub fn group_of(&self, connection: ConnectionId) -> Option<GroupId> {
        self.assigned.get(&connection).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u32) -> ConnectionId {
        ConnectionId(n)
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut table = GroupTable::new();
        let group = table.create();
        table.add(group, conn(1));
        table.add(group, conn(2));
        table.add(group, conn(3));

        let picks: Vec<u32> = (0..5).map(|_| table.select(group).unwrap().0).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_select_empty_or_missing_group() {
        let mut table = GroupTable::new();
        let group = table.create();
        assert_eq!(table.select(group), None);
        assert_eq!(table.select(GroupId(99)), None);
    }

    #[test]
    fn test_smallest_unused_id() {
        let mut table = GroupTable::new();
        let first = table.create();
        let second = table.create();
        assert_eq!(first, GroupId(1));
        assert_eq!(second, GroupId(2));
        table.destroy(first);
        assert_eq!(table.create(), GroupId(1));
    }

    #[test]
    fn test_designated_observer() {
        let mut table = GroupTable::new();
        let group = table.create();
        table.add(group, conn(4));
        table.add(group, conn(7));

        assert!(table.is_designated_observer(conn(4)));
        assert!(!table.is_designated_observer(conn(7)));
        // Ungrouped connections always observe.
        assert!(table.is_designated_observer(conn(9)));

        table.remove(group, conn(4));
        assert!(table.is_designated_observer(conn(7)));
    }

    #[test]
    fn test_remove_keeps_rotation_consistent() {
        let mut table = GroupTable::new();
        let group = table.create();
        for n in 1..=3 {
            table.add(group, conn(n));
        }
        assert_eq!(table.select(group), Some(conn(1)));
        // Cursor points at member 2; removing member 1 must not skip it.
        table.remove(group, conn(1));
        assert_eq!(table.select(group), Some(conn(2)));
        assert_eq!(table.select(group), Some(conn(3)));
        assert_eq!(table.select(group), Some(conn(2)));
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut table = GroupTable::new();
        let group = table.create();
        assert!(table.add(group, conn(1)));
        assert!(!table.add(group, conn(1)));
        assert_eq!(table.group_of(conn(1)), Some(group));
    }
}
