//! Per-user, per-command cooldowns with read-time pruning.

use std::time::Duration;

use scc::hash_map::Entry;
use tokio::time::Instant;

#[derive(Default)]
pub(crate) struct CooldownTable {
    entries: scc::HashMap<(String, i64), Instant>,
}

impl CooldownTable {
    pub(crate) fn set(&self, command: &str, user_id: i64, duration: Duration) {
        let expiry = Instant::now() + duration;
        match self.entries.entry_sync((command.to_string(), user_id)) {
            Entry::Occupied(mut entry) => *entry.get_mut() = expiry,
            Entry::Vacant(entry) => {
                entry.insert_entry(expiry);
            }
        }
    }

    /// Remaining cooldown, or zero. An expired entry is removed on read.
    pub(crate) fn check(&self, command: &str, user_id: i64) -> Duration {
        let key = (command.to_string(), user_id);
        let Some(expiry) = self.entries.get_sync(&key).map(|entry| *entry.get()) else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        if expiry > now {
            expiry - now
        } else {
            self.entries.remove_sync(&key);
            Duration::ZERO
        }
    }

    pub(crate) fn clear_command(&self, command: &str) {
        self.entries.retain_sync(|(name, _), _| name != command);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires_and_prunes() {
        let table = CooldownTable::default();
        table.set("ping", 7, Duration::from_millis(5000));

        let remaining = table.check("ping", 7);
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= Duration::from_millis(5000));
        assert_eq!(table.check("ping", 8), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(table.check("ping", 7), Duration::ZERO);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_expiry() {
        let table = CooldownTable::default();
        table.set("ping", 1, Duration::from_secs(1));
        table.set("ping", 1, Duration::from_secs(10));
        assert_eq!(table.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.check("ping", 1) > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_clear_command() {
        let table = CooldownTable::default();
        table.set("a", 1, Duration::from_secs(5));
        table.set("a", 2, Duration::from_secs(5));
        table.set("b", 1, Duration::from_secs(5));
        table.clear_command("a");
        assert_eq!(table.len(), 1);
    }
}
