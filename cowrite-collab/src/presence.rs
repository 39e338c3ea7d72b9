//! Session roster with best-effort cursor and selection presence.
//!
//! Presence never touches the state counter. Positions are char offsets into
//! the local document and are shifted through every applied remote edit so
//! they keep pointing at the same text.

use std::collections::HashMap;

use cowrite_core::Operation;
use uuid::Uuid;

use crate::protocol::PeerInfo;

/// Half-open char range selected by a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn adjust(&self, op: &Operation) -> Self {
        Self {
            start: op.adjust_index(self.start),
            end: op.adjust_index(self.end),
        }
    }
}

/// One remote member as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberPresence {
    pub info: PeerInfo,
    pub active: bool,
    pub cursor: Option<usize>,
    pub selection: Option<Selection>,
}

impl MemberPresence {
    fn new(info: PeerInfo) -> Self {
        Self {
            info,
            active: true,
            cursor: None,
            selection: None,
        }
    }
}

/// Everyone this client knows about in the session, itself excluded.
#[derive(Debug, Clone)]
pub struct Roster {
    local_id: Uuid,
    members: HashMap<Uuid, MemberPresence>,
    cursor: usize,
    selection: Option<Selection>,
}

impl Roster {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            members: HashMap::new(),
            cursor: 0,
            selection: None,
        }
    }

    /// Replace the roster with the server's list of active members. Anyone
    /// not listed is dropped, placeholders included.
    pub fn set_active_members(&mut self, members: &[PeerInfo]) {
        self.members
            .retain(|id, _| members.iter().any(|info| info.peer_id == *id));
        for info in members {
            self.join(info.clone());
        }
    }

    pub fn join(&mut self, info: PeerInfo) {
        if info.peer_id == self.local_id {
            return;
        }
        self.members
            .entry(info.peer_id)
            .and_modify(|presence| {
                presence.info = info.clone();
                presence.active = true;
            })
            .or_insert_with(|| MemberPresence::new(info));
    }

    /// Mark a member inactive. Returns false for an unknown member.
    pub fn leave(&mut self, member: &Uuid) -> bool {
        match self.members.get_mut(member) {
            Some(presence) => {
                presence.active = false;
                presence.cursor = None;
                presence.selection = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_inactive(&mut self) {
        for presence in self.members.values_mut() {
            presence.active = false;
        }
    }

    pub fn set_cursor(&mut self, member: Uuid, position: usize) {
        if member == self.local_id {
            return;
        }
        self.entry(member).cursor = Some(position);
    }

    pub fn set_selection(&mut self, member: Uuid, selection: Selection) {
        if member == self.local_id {
            return;
        }
        self.entry(member).selection = Some(selection);
    }

    // Presence can outrun the roster; keep a placeholder until the member
    // announces itself.
    fn entry(&mut self, member: Uuid) -> &mut MemberPresence {
        self.members
            .entry(member)
            .or_insert_with(|| MemberPresence::new(PeerInfo::with_id(member, "Anonymous")))
    }

    /// Shift every tracked position through an applied remote edit.
    pub fn adjust(&mut self, op: &Operation) {
        self.cursor = op.adjust_index(self.cursor);
        self.selection = self.selection.map(|s| s.adjust(op));
        for presence in self.members.values_mut() {
            presence.cursor = presence.cursor.map(|c| op.adjust_index(c));
            presence.selection = presence.selection.map(|s| s.adjust(op));
        }
    }

    pub fn local_cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_local_cursor(&mut self, position: usize) {
        self.cursor = position;
    }

    pub fn local_selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn set_local_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection;
    }

    pub fn get(&self, member: &Uuid) -> Option<&MemberPresence> {
        self.members.get(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberPresence> {
        self.members.values()
    }

    pub fn active_members(&self) -> impl Iterator<Item = &MemberPresence> {
        self.members.values().filter(|presence| presence.active)
    }

    pub fn active_count(&self) -> usize {
        self.active_members().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leave() {
        let me = Uuid::new_v4();
        let alice = PeerInfo::new("Alice");
        let mut roster = Roster::new(me);

        roster.join(alice.clone());
        roster.join(PeerInfo::with_id(me, "Me"));
        assert_eq!(roster.active_count(), 1);

        assert!(roster.leave(&alice.peer_id));
        assert_eq!(roster.active_count(), 0);
        assert!(!roster.get(&alice.peer_id).unwrap().active);
        assert!(!roster.leave(&Uuid::new_v4()));

        roster.join(alice.clone());
        assert!(roster.get(&alice.peer_id).unwrap().active);
    }

    #[test]
    fn test_set_active_members_replaces_roster() {
        let mut roster = Roster::new(Uuid::new_v4());
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        roster.join(alice.clone());

        roster.set_cursor(bob.peer_id, 4);
        roster.set_active_members(&[bob.clone()]);
        assert!(roster.get(&alice.peer_id).is_none());
        let presence = roster.get(&bob.peer_id).unwrap();
        assert!(presence.active);
        assert_eq!(presence.info.name, "Bob");
        assert_eq!(presence.cursor, Some(4));
        assert_eq!(roster.members().count(), 1);
    }

    #[test]
    fn test_rebaseline_drops_departed_and_anonymous_members() {
        let mut roster = Roster::new(Uuid::new_v4());
        let alice = PeerInfo::new("Alice");
        roster.join(alice.clone());
        roster.leave(&alice.peer_id);
        for _ in 0..10 {
            roster.set_cursor(Uuid::new_v4(), 1);
        }
        assert_eq!(roster.members().count(), 11);

        roster.set_active_members(&[]);
        assert_eq!(roster.members().count(), 0);

        roster.set_active_members(&[alice.clone()]);
        assert_eq!(roster.members().count(), 1);
        assert_eq!(roster.active_count(), 1);
    }

    #[test]
    fn test_cursor_for_unknown_member_creates_placeholder() {
        let mut roster = Roster::new(Uuid::new_v4());
        let stranger = Uuid::new_v4();
        roster.set_cursor(stranger, 12);
        let presence = roster.get(&stranger).unwrap();
        assert_eq!(presence.cursor, Some(12));
        assert_eq!(presence.info.name, "Anonymous");
    }

    #[test]
    fn test_adjust_shifts_cursors_and_selections() {
        let mut roster = Roster::new(Uuid::new_v4());
        let alice = PeerInfo::new("Alice");
        roster.join(alice.clone());
        roster.set_cursor(alice.peer_id, 20);
        roster.set_selection(alice.peer_id, Selection::new(8, 14));
        roster.set_local_cursor(5);
        roster.set_local_selection(Some(Selection::new(2, 30)));

        roster.adjust(&Operation::remove(10, 5));

        let presence = roster.get(&alice.peer_id).unwrap();
        assert_eq!(presence.cursor, Some(15));
        assert_eq!(presence.selection, Some(Selection::new(8, 10)));
        assert_eq!(roster.local_cursor(), 5);
        assert_eq!(roster.local_selection(), Some(Selection::new(2, 25)));

        roster.adjust(&Operation::insert(0, "abc"));
        assert_eq!(roster.local_cursor(), 8);
    }

    #[test]
    fn test_own_presence_is_ignored() {
        let me = Uuid::new_v4();
        let mut roster = Roster::new(me);
        roster.set_cursor(me, 3);
        roster.set_selection(me, Selection::new(0, 1));
        assert!(roster.get(&me).is_none());
    }
}
