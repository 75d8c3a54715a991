use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::ChatError;

/// Friend, pending-request and block relations, keyed by identity name.
///
/// `pending[target]` holds the names waiting for `target` to accept them.
/// `blocks[blocker]` holds the names whose relays `blocker` refuses.
#[derive(Debug, Default)]
pub struct SocialGraph {
    friends: HashMap<String, HashSet<String>>,
    pending: HashMap<String, HashSet<String>>,
    blocks: HashMap<String, HashSet<String>>,
}

fn related(map: &HashMap<String, HashSet<String>>, key: &str, name: &str) -> bool {
    map.get(key).is_some_and(|set| set.contains(name))
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut names: Vec<String> = set.into_iter().flatten().cloned().collect();
    names.sort();
    names
}

/// Moves `old`'s entry to `new` and rewrites `old` wherever it is a member.
/// Whatever was left under `new` beforehand is discarded.
fn migrate(map: &mut HashMap<String, HashSet<String>>, old: &str, new: &str) {
    match map.remove(old) {
        Some(set) => {
            map.insert(new.to_string(), set);
        }
        None => {
            map.remove(new);
        }
    }
    for set in map.values_mut() {
        let stale = set.remove(new);
        if set.remove(old) {
            set.insert(new.to_string());
        } else if stale {
            debug!("Dropped stale relation to {new}");
        }
    }
}

impl SocialGraph {
    pub fn request(&mut self, from: &str, to: &str) -> Result<(), ChatError> {
        if from == to {
            return Err(ChatError::SelfTarget);
        }
        if self.are_friends(from, to)
            || related(&self.pending, to, from)
            || related(&self.pending, from, to)
        {
            return Err(ChatError::AlreadyRelated);
        }
        self.pending
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        Ok(())
    }

    pub fn accept(&mut self, accepter: &str, requester: &str) -> Result<(), ChatError> {
        let removed = self
            .pending
            .get_mut(accepter)
            .is_some_and(|set| set.remove(requester));
        if !removed {
            return Err(ChatError::NoPendingRequest);
        }
        self.friends
            .entry(accepter.to_string())
            .or_default()
            .insert(requester.to_string());
        self.friends
            .entry(requester.to_string())
            .or_default()
            .insert(accepter.to_string());
        Ok(())
    }

    pub fn unfriend(&mut self, name: &str, other: &str) {
        if let Some(set) = self.friends.get_mut(name) {
            set.remove(other);
        }
        if let Some(set) = self.friends.get_mut(other) {
            set.remove(name);
        }
    }

    /// Returns whether `target` is blocked afterwards.
    pub fn toggle_block(&mut self, blocker: &str, target: &str) -> bool {
        let set = self.blocks.entry(blocker.to_string()).or_default();
        if set.remove(target) {
            false
        } else {
            set.insert(target.to_string());
            true
        }
    }

    pub fn is_blocking(&self, blocker: &str, sender: &str) -> bool {
        related(&self.blocks, blocker, sender)
    }

    pub fn are_friends(&self, a: &str, b: &str) -> bool {
        related(&self.friends, a, b)
    }

    pub fn friends_of(&self, name: &str) -> Vec<String> {
        sorted(self.friends.get(name))
    }

    /// Carries every relation of `old` over to `new`; `old` is left with none.
    pub fn rename(&mut self, old: &str, new: &str) {
        migrate(&mut self.friends, old, new);
        migrate(&mut self.pending, old, new);
        migrate(&mut self.blocks, old, new);
    }
}

#[cfg(test)]
impl SocialGraph {
    pub fn pending_for(&self, name: &str) -> Vec<String> {
        sorted(self.pending.get(name))
    }

    pub fn blocked_by(&self, name: &str) -> Vec<String> {
        sorted(self.blocks.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_makes_friendship_symmetric() {
        let mut graph = SocialGraph::default();
        graph.request("alice", "bob").unwrap();
        assert_eq!(graph.pending_for("bob"), vec!["alice".to_string()]);

        assert_eq!(graph.accept("alice", "bob"), Err(ChatError::NoPendingRequest));
        graph.accept("bob", "alice").unwrap();
        assert!(graph.are_friends("alice", "bob"));
        assert!(graph.are_friends("bob", "alice"));
        assert!(graph.pending_for("bob").is_empty());
    }

    #[test]
    fn duplicate_requests_are_rejected_both_ways() {
        let mut graph = SocialGraph::default();
        graph.request("alice", "bob").unwrap();
        assert_eq!(graph.request("alice", "bob"), Err(ChatError::AlreadyRelated));
        assert_eq!(graph.request("bob", "alice"), Err(ChatError::AlreadyRelated));
        graph.accept("bob", "alice").unwrap();
        assert_eq!(graph.request("bob", "alice"), Err(ChatError::AlreadyRelated));
        assert_eq!(graph.request("bob", "bob"), Err(ChatError::SelfTarget));
    }

    #[test]
    fn unfriend_and_block_are_idempotent() {
        let mut graph = SocialGraph::default();
        graph.request("alice", "bob").unwrap();
        graph.accept("bob", "alice").unwrap();
        graph.unfriend("alice", "bob");
        graph.unfriend("alice", "bob");
        assert!(graph.friends_of("alice").is_empty());
        assert!(graph.friends_of("bob").is_empty());

        assert!(graph.toggle_block("bob", "alice"));
        assert!(graph.is_blocking("bob", "alice"));
        assert!(!graph.is_blocking("alice", "bob"));
        assert!(!graph.toggle_block("bob", "alice"));
        assert!(!graph.is_blocking("bob", "alice"));
    }

    #[test]
    fn rename_moves_every_relation() {
        let mut graph = SocialGraph::default();
        graph.request("alice", "bob").unwrap();
        graph.accept("bob", "alice").unwrap();
        graph.request("carol", "alice").unwrap();
        graph.toggle_block("alice", "mallory");
        graph.toggle_block("dave", "alice");

        graph.rename("alice", "alicia");

        assert_eq!(graph.friends_of("alicia"), vec!["bob".to_string()]);
        assert_eq!(graph.friends_of("bob"), vec!["alicia".to_string()]);
        assert_eq!(graph.pending_for("alicia"), vec!["carol".to_string()]);
        assert!(graph.is_blocking("alicia", "mallory"));
        assert!(graph.is_blocking("dave", "alicia"));

        assert!(graph.friends_of("alice").is_empty());
        assert!(graph.pending_for("alice").is_empty());
        assert!(graph.blocked_by("alice").is_empty());
        assert!(!graph.is_blocking("dave", "alice"));
    }

    #[test]
    fn rename_replaces_relations_left_under_the_new_name() {
        let mut graph = SocialGraph::default();
        // A previous holder of "alicia" left relations behind.
        graph.request("alicia", "eve").unwrap();
        graph.accept("eve", "alicia").unwrap();
        graph.request("frank", "alicia").unwrap();
        graph.toggle_block("alicia", "bob");
        graph.request("alice", "bob").unwrap();

        graph.rename("alice", "alicia");

        assert!(graph.friends_of("alicia").is_empty());
        assert!(graph.friends_of("eve").is_empty());
        assert!(graph.pending_for("alicia").is_empty());
        assert!(graph.blocked_by("alicia").is_empty());
        assert_eq!(graph.pending_for("bob"), vec!["alicia".to_string()]);
    }
}
