// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NetGroup membership, ordered by measured round-trip time.

use std::net::SocketAddr;

use crate::crypto::PeerId;

/// How many members a join answer advertises at most.
pub const BEST_PEER_COUNT: usize = 6;

/// One group member, a snapshot of the owning session's peer.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub session_id: u32,
    pub peer_id: PeerId,
    pub address: SocketAddr,
    /// Round-trip time in milliseconds; orders the member list.
    pub ping: u32,
}

/// A group: an opaque id and its members sorted by ascending RTT.
#[derive(Debug)]
pub struct Group {
    pub id: Vec<u8>,
    members: Vec<GroupMember>,
}

impl Group {
    fn new(id: Vec<u8>) -> Self {
        Self {
            id,
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, session_id: u32) -> bool {
        self.members.iter().any(|m| m.session_id == session_id)
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.members.iter().any(|m| &m.peer_id == peer_id)
    }

    /// Insert keeping ascending RTT order; duplicates by session id are
    /// ignored.
    pub fn insert(&mut self, member: GroupMember) {
        if self.contains(member.session_id) {
            return;
        }
        let at = self
            .members
            .iter()
            .position(|m| m.ping > member.ping)
            .unwrap_or(self.members.len());
        self.members.insert(at, member);
    }

    pub fn remove(&mut self, session_id: u32) {
        self.members.retain(|m| m.session_id != session_id);
    }

    /// Reinsert a member whose RTT changed so the order stays correct.
    pub fn update_ping(&mut self, session_id: u32, ping: u32) {
        if let Some(at) = self.members.iter().position(|m| m.session_id == session_id) {
            let mut member = self.members.remove(at);
            member.ping = ping;
            self.insert(member);
        }
    }

    /// The closest members excluding `asker`, preferring peers with a
    /// routable (non-loopback) address.
    pub fn best(&self, asker: u32) -> Vec<&GroupMember> {
        let mut picked: Vec<&GroupMember> = self
            .members
            .iter()
            .filter(|m| m.session_id != asker && !m.address.ip().is_loopback())
            .collect();
        picked.extend(
            self.members
                .iter()
                .filter(|m| m.session_id != asker && m.address.ip().is_loopback()),
        );
        picked.truncate(BEST_PEER_COUNT);
        picked
    }
}

/// All live groups, owned by the server.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Vec<Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a group by id, creating it if absent. Empty groups are pruned
    /// on the way, so abandoned ids do not accumulate.
    pub fn get_or_create(&mut self, id: &[u8]) -> &mut Group {
        if let Some(at) = self.groups.iter().position(|g| g.id == id) {
            return &mut self.groups[at];
        }
        self.groups.retain(|g| !g.is_empty());
        self.groups.push(Group::new(id.to_vec()));
        self.groups.last_mut().expect("just pushed")
    }

    pub fn get(&self, id: &[u8]) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// First group containing the given peer identity.
    pub fn find_with_peer(&self, peer_id: &PeerId) -> Option<&Group> {
        self.groups.iter().find(|g| g.has_peer(peer_id))
    }

    /// Drop `session_id` from every group named in `group_ids`.
    pub fn remove_member(&mut self, group_ids: &[Vec<u8>], session_id: u32) {
        for gid in group_ids {
            if let Some(group) = self.groups.iter_mut().find(|g| &g.id == gid) {
                group.remove(session_id);
            }
        }
    }

    /// Propagate an RTT change into every group the session's peer is in.
    pub fn update_ping(&mut self, group_ids: &[Vec<u8>], session_id: u32, ping: u32) {
        for gid in group_ids {
            if let Some(group) = self.groups.iter_mut().find(|g| &g.id == gid) {
                group.update_ping(session_id, ping);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(session_id: u32, ping: u32, addr: &str) -> GroupMember {
        GroupMember {
            session_id,
            peer_id: [session_id as u8; 32],
            address: addr.parse().unwrap(),
            ping,
        }
    }

    #[test]
    fn members_stay_sorted_by_ping() {
        let mut reg = GroupRegistry::new();
        let group = reg.get_or_create(b"g1");
        group.insert(member(1, 30, "1.1.1.1:1000"));
        group.insert(member(2, 10, "1.1.1.2:1000"));
        group.insert(member(3, 20, "1.1.1.3:1000"));
        let order: Vec<u32> = group.best(99).iter().map(|m| m.session_id).collect();
        assert_eq!(order, [2, 3, 1]);
    }

    #[test]
    fn ping_update_reorders() {
        let mut reg = GroupRegistry::new();
        let group = reg.get_or_create(b"g1");
        group.insert(member(1, 10, "1.1.1.1:1000"));
        group.insert(member(2, 20, "1.1.1.2:1000"));
        group.update_ping(1, 50);
        let order: Vec<u32> = group.best(99).iter().map(|m| m.session_id).collect();
        assert_eq!(order, [2, 1]);
    }

    #[test]
    fn best_excludes_asker_and_defers_loopback() {
        let mut reg = GroupRegistry::new();
        let group = reg.get_or_create(b"g1");
        group.insert(member(1, 5, "127.0.0.1:1000"));
        group.insert(member(2, 10, "9.9.9.9:1000"));
        group.insert(member(3, 20, "8.8.8.8:1000"));
        let order: Vec<u32> = group.best(3).iter().map(|m| m.session_id).collect();
        assert_eq!(order, [2, 1]);
    }

    #[test]
    fn best_caps_at_limit() {
        let mut reg = GroupRegistry::new();
        let group = reg.get_or_create(b"g1");
        for i in 0..10u32 {
            group.insert(member(i, i, &format!("1.1.1.{i}:1000")));
        }
        assert_eq!(group.best(100).len(), BEST_PEER_COUNT);
    }

    #[test]
    fn empty_groups_are_pruned_on_create() {
        let mut reg = GroupRegistry::new();
        reg.get_or_create(b"dead");
        reg.get_or_create(b"live").insert(member(1, 1, "1.1.1.1:1"));
        reg.get_or_create(b"new");
        assert!(reg.get(b"dead").is_none());
        assert!(reg.get(b"live").is_some());
    }
}
