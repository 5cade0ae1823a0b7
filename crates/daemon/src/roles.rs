// Static username -> role table, sourced from the host account database

use std::collections::HashMap;

use users::os::unix::UserExt;
use tracing::debug;

use tundev_common::error::{ManagerError, Result};
use tundev_common::types::Role;

/// Login-shell basenames that identify the two device roles. Accounts for
/// tunnelling devices are provisioned with one of these as their shell.
const MASTER_SHELL: &str = "masterdev_shell";
const ONSITE_SHELL: &str = "onsitedev_shell";

/// Resolves a username to its device role: configured overrides first, then
/// the account's login shell.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    overrides: HashMap<String, Role>,
}

impl RoleTable {
    pub fn new(overrides: HashMap<String, Role>) -> Self {
        RoleTable { overrides }
    }

    pub fn resolve(&self, username: &str) -> Result<Role> {
        if let Some(role) = self.overrides.get(username) {
            debug!(username, role = %role, "Role resolved from override table");
            return Ok(*role);
        }

        let user = users::get_user_by_name(username)
            .ok_or_else(|| ManagerError::UnknownTundevAccount(username.to_string()))?;
        let shell = user.shell().to_path_buf();
        let basename = shell
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        match basename {
            MASTER_SHELL => Ok(Role::Master),
            ONSITE_SHELL => Ok(Role::Onsite),
            _ => Err(ManagerError::UnknownTundevAccount(username.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoleTable {
        let mut overrides = HashMap::new();
        overrides.insert("onsite_a".to_string(), Role::Onsite);
        overrides.insert("master_a".to_string(), Role::Master);
        RoleTable::new(overrides)
    }

    #[test]
    fn overrides_win_over_the_account_database() {
        let table = table();
        assert_eq!(table.resolve("onsite_a").unwrap(), Role::Onsite);
        assert_eq!(table.resolve("master_a").unwrap(), Role::Master);
    }

    #[test]
    fn unknown_account_is_rejected() {
        let err = table()
            .resolve("no-such-account-on-this-host")
            .unwrap_err();
        assert_eq!(err.code(), "UnknownTundevAccount");
    }
}
