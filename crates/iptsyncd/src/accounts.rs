//! Owner name resolution against the system account database.

use nix::unistd::{Group, User};
use tracing::debug;

use iptsync_rules::AccountLookup;

/// Resolves user and group names through `getpwnam`/`getgrnam`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

impl AccountLookup for SystemAccounts {
    fn uid(&self, name: &str) -> Option<u32> {
        match User::from_name(name) {
            Ok(user) => user.map(|u| u.uid.as_raw()),
            Err(e) => {
                debug!(user = %name, error = %e, "User lookup failed");
                None
            }
        }
    }

    fn gid(&self, name: &str) -> Option<u32> {
        match Group::from_name(name) {
            Ok(group) => group.map(|g| g.gid.as_raw()),
            Err(e) => {
                debug!(group = %name, error = %e, "Group lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_resolves() {
        assert_eq!(SystemAccounts.uid("root"), Some(0));
        assert_eq!(SystemAccounts.uid("no-such-user-iptsync"), None);
        assert_eq!(SystemAccounts.gid("no-such-group-iptsync"), None);
    }
}
