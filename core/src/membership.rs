//! Per-connection channel membership tracking
//!
//! Maps nickname -> (channel -> privilege mode). Entries exist only for
//! users with at least one channel; a user whose last channel is
//! removed disappears from the store entirely.

use std::collections::BTreeMap;

/// Channel membership for every user visible to one connection.
#[derive(Debug, Default)]
pub struct MembershipStore {
    users: BTreeMap<String, BTreeMap<String, String>>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge one (user, channel, mode) membership.
    pub fn insert(&mut self, user: &str, channel: &str, mode: &str) {
        self.users
            .entry(user.to_string())
            .or_default()
            .insert(channel.to_string(), mode.to_string());
    }

    /// Remove a user from every channel (QUIT).
    pub fn remove_user(&mut self, user: &str) {
        self.users.remove(user);
    }

    /// Remove one (user, channel) membership, pruning the user when no
    /// channels remain (PART/KICK of another user).
    pub fn remove_membership(&mut self, user: &str, channel: &str) {
        if let Some(channels) = self.users.get_mut(user) {
            channels.remove(channel);
            if channels.is_empty() {
                self.users.remove(user);
            }
        }
    }

    /// Remove a channel from every user, pruning users left with no
    /// channels (the bot itself parting or being kicked).
    pub fn remove_channel(&mut self, channel: &str) {
        self.users.retain(|_, channels| {
            channels.remove(channel);
            !channels.is_empty()
        });
    }

    /// Rekey a user's memberships under a new nickname (NICK).
    pub fn rename_user(&mut self, old: &str, new: &str) {
        if let Some(channels) = self.users.remove(old) {
            self.users.insert(new.to_string(), channels);
        }
    }

    /// Whether a user is currently on a channel.
    pub fn is_user_on(&self, user: &str, channel: &str) -> bool {
        self.users
            .get(user)
            .map(|channels| channels.contains_key(channel))
            .unwrap_or(false)
    }

    /// A user's privilege mode on a channel, or "-" if untracked or
    /// unprivileged.
    pub fn mode_of(&self, user: &str, channel: &str) -> String {
        let mode = self
            .users
            .get(user)
            .and_then(|channels| channels.get(channel))
            .cloned()
            .unwrap_or_default();
        if mode.is_empty() {
            "-".to_string()
        } else {
            mode
        }
    }

    /// Space-joined "modeNickname" tokens for everyone on a channel, or
    /// "None" when nobody is tracked there.
    pub fn channel_user_list(&self, channel: &str) -> String {
        let tokens: Vec<String> = self
            .users
            .iter()
            .filter_map(|(user, channels)| {
                channels
                    .get(channel)
                    .map(|mode| format!("{}{}", mode, user))
            })
            .collect();
        if tokens.is_empty() {
            "None".to_string()
        } else {
            tokens.join(" ")
        }
    }

    /// Forget everything (connection teardown).
    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// True when no users at all are tracked.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Every tracked nickname has at least one channel. Mutating
    /// operations uphold this; tests assert it after each step.
    #[cfg(test)]
    pub fn no_empty_users(&self) -> bool {
        self.users.values().all(|channels| !channels.is_empty())
    }
}
