use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

/// Access level of a client. Ordered so `role >= Role::Calibrator` reads as
/// "calibrator or above".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Operator,
    Calibrator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Calibrator => "calibrator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operator" => Ok(Role::Operator),
            "calibrator" => Ok(Role::Calibrator),
            "admin" => Ok(Role::Admin),
            other => bail!("unknown role '{other}'"),
        }
    }
}

/// Resolves a host-authenticated identity to its role. `Ok(None)` means the
/// identity has no role assigned.
#[async_trait]
pub trait RoleLookup: Send + Sync {
    async fn lookup_role(&self, identity: &str) -> Result<Option<Role>>;
}

/// Creates user accounts on behalf of admins. Owns username uniqueness.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    async fn provision_user(&self, username: &str, password: &str, role: Role) -> Result<()>;
}

/// In-memory user registry seeded from configuration.
///
/// Passwords are accepted for interface compatibility but never stored;
/// authentication happens in front of this process.
#[derive(Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<String, Role>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = (String, Role)>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().collect()),
        }
    }

    pub fn role_of(&self, identity: &str) -> Option<Role> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .copied()
    }
}

#[async_trait]
impl RoleLookup for UserDirectory {
    async fn lookup_role(&self, identity: &str) -> Result<Option<Role>> {
        Ok(self.role_of(identity))
    }
}

#[async_trait]
impl UserProvisioner for UserDirectory {
    async fn provision_user(&self, username: &str, password: &str, role: Role) -> Result<()> {
        let username = username.trim();
        if username.is_empty() {
            bail!("Username must not be empty");
        }
        if password.is_empty() {
            bail!("Password must not be empty");
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            bail!("Username already exists");
        }
        users.insert(username.to_string(), role);
        info!("User {username} created with role {role}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_ordered() {
        assert!(Role::Operator < Role::Calibrator);
        assert!(Role::Calibrator < Role::Admin);
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
    }

    #[tokio::test]
    async fn provisioning_rejects_duplicates() {
        let directory = UserDirectory::with_users([("alice".to_string(), Role::Admin)]);

        directory
            .provision_user("bob", "secret", Role::Calibrator)
            .await
            .unwrap();
        assert_eq!(directory.lookup_role("bob").await.unwrap(), Some(Role::Calibrator));

        let err = directory
            .provision_user("alice", "secret", Role::Operator)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Username already exists");
        assert_eq!(directory.role_of("alice"), Some(Role::Admin));
        assert_eq!(directory.lookup_role("carol").await.unwrap(), None);
    }
}
