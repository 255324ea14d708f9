use shared::protocol::Friend;

use crate::events::PresenceSnapshot;

/// Online/offline partition of the friend list, keyed by email (presence
/// payloads from the backend identify friends by email).
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: Vec<Friend>,
    offline: Vec<Friend>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> &[Friend] {
        &self.online
    }

    pub fn offline(&self) -> &[Friend] {
        &self.offline
    }

    pub fn is_online(&self, email: &str) -> bool {
        self.online.iter().any(|friend| friend.email == email)
    }

    /// Rebuilds the partition from an authoritative snapshot: online is the
    /// snapshot, offline is every friend not in it.
    pub fn apply_snapshot(&mut self, friends: &[Friend], online: Vec<Friend>) {
        self.offline = friends
            .iter()
            .filter(|friend| !online.iter().any(|on| on.email == friend.email))
            .cloned()
            .collect();
        self.online = online;
    }

    /// Returns `false` if the friend was already online.
    pub fn friend_online(&mut self, friend: Friend) -> bool {
        self.offline.retain(|f| f.email != friend.email);
        if self.is_online(&friend.email) {
            return false;
        }
        self.online.push(friend);
        true
    }

    /// Returns `false` if the friend was already offline.
    pub fn friend_offline(&mut self, friend: Friend) -> bool {
        let was_online = self.is_online(&friend.email);
        self.online.retain(|f| f.email != friend.email);
        if self.offline.iter().any(|f| f.email == friend.email) {
            return was_online;
        }
        self.offline.push(friend);
        true
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.offline.clear();
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            online: self.online.clone(),
            offline: self.offline.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn friend(name: &str) -> Friend {
        Friend {
            id: None,
            name: name.to_string(),
            email: format!("{name}@example.com"),
        }
    }

    fn emails(friends: &[Friend]) -> Vec<&str> {
        friends.iter().map(|f| f.email.as_str()).collect()
    }

    #[test]
    fn snapshot_partitions_friend_set() {
        let mut tracker = PresenceTracker::new();
        let all = [friend("a"), friend("b"), friend("c")];

        tracker.apply_snapshot(&all, vec![friend("a")]);

        assert_eq!(emails(tracker.online()), ["a@example.com"]);
        assert_eq!(emails(tracker.offline()), ["b@example.com", "c@example.com"]);
    }

    #[test]
    fn friend_online_is_idempotent() {
        let mut tracker = PresenceTracker::new();
        let all = [friend("a"), friend("b"), friend("c")];
        tracker.apply_snapshot(&all, vec![friend("a")]);

        assert!(tracker.friend_online(friend("b")));
        assert!(!tracker.friend_online(friend("b")));

        assert_eq!(emails(tracker.online()), ["a@example.com", "b@example.com"]);
        assert_eq!(emails(tracker.offline()), ["c@example.com"]);
    }

    #[test]
    fn friend_offline_is_idempotent() {
        let mut tracker = PresenceTracker::new();
        let all = [friend("a"), friend("b")];
        tracker.apply_snapshot(&all, vec![friend("a"), friend("b")]);

        assert!(tracker.friend_offline(friend("a")));
        assert!(!tracker.friend_offline(friend("a")));

        assert_eq!(emails(tracker.online()), ["b@example.com"]);
        assert_eq!(emails(tracker.offline()), ["a@example.com"]);
    }

    #[test]
    fn each_friend_is_in_exactly_one_partition() {
        let mut tracker = PresenceTracker::new();
        let all = [friend("a"), friend("b"), friend("c")];
        tracker.apply_snapshot(&all, Vec::new());

        tracker.friend_online(friend("a"));
        tracker.friend_offline(friend("a"));
        tracker.friend_online(friend("c"));
        tracker.friend_online(friend("a"));

        for f in &all {
            let on = tracker.online().iter().filter(|x| x.email == f.email).count();
            let off = tracker.offline().iter().filter(|x| x.email == f.email).count();
            assert_eq!(on + off, 1, "{} must be in exactly one partition", f.email);
        }
    }

    #[test]
    fn clear_drops_both_partitions() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_snapshot(&[friend("a")], vec![friend("a")]);
        tracker.clear();
        assert_eq!(tracker.snapshot(), PresenceSnapshot::default());
    }
}
