//! Users and privilege levels.
//!
//! Every routed envelope carries the [`User`] it originated from. Levels are
//! ordered, and a user "satisfies" a level when its own level is at least as
//! high.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered privilege levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserLevel {
    None = 1,
    Remote,
    Local,
    Admin,
    System,
    Root,
}

impl UserLevel {
    /// Returns the upper-case display name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserLevel::None => "NONE",
            UserLevel::Remote => "REMOTE",
            UserLevel::Local => "LOCAL",
            UserLevel::Admin => "ADMIN",
            UserLevel::System => "SYSTEM",
            UserLevel::Root => "ROOT",
        }
    }
}

impl fmt::Display for UserLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(UserLevel::None),
            "REMOTE" => Ok(UserLevel::Remote),
            "LOCAL" => Ok(UserLevel::Local),
            "ADMIN" => Ok(UserLevel::Admin),
            "SYSTEM" => Ok(UserLevel::System),
            "ROOT" => Ok(UserLevel::Root),
            other => Err(format!("unknown user level: {}", other)),
        }
    }
}

/// A named identity with a privilege level.
///
/// Clones share the same [`User::id`], so provenance checks survive renames
/// and copies into envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    id: Uuid,
    name: String,
    level: UserLevel,
}

impl User {
    /// Creates a new user with a fresh identity.
    pub fn new(name: impl Into<String>, level: UserLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            level,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn level(&self) -> UserLevel {
        self.level
    }

    /// Display form used in front of echoed lines, e.g. `[ADMIN]Admin`.
    pub fn prompt(&self) -> String {
        format!("[{}]{}", self.level, self.name)
    }

    /// Returns true iff this user's level is at least `level`.
    pub fn satisfy(&self, level: UserLevel) -> bool {
        self.level >= level
    }

    /// Raises (or sets) the level. Succeeds only if `granted_by` itself
    /// satisfies the target level.
    pub fn upgrade(&mut self, to: UserLevel, granted_by: &User) -> bool {
        if !granted_by.satisfy(to) {
            return false;
        }
        self.level = to;
        true
    }

    /// Lowers the level. Succeeds only if this user already satisfies it.
    pub fn downgrade(&mut self, to: UserLevel) -> bool {
        if !self.satisfy(to) {
            return false;
        }
        self.level = to;
        true
    }

    /// Returns whether both values denote the same identity.
    pub fn same_as(&self, other: &User) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prompt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(UserLevel::None < UserLevel::Remote);
        assert!(UserLevel::Remote < UserLevel::Local);
        assert!(UserLevel::Local < UserLevel::Admin);
        assert!(UserLevel::Admin < UserLevel::System);
        assert!(UserLevel::System < UserLevel::Root);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("admin".parse::<UserLevel>().unwrap(), UserLevel::Admin);
        assert_eq!("ROOT".parse::<UserLevel>().unwrap(), UserLevel::Root);
        assert!("superuser".parse::<UserLevel>().is_err());
    }

    #[test]
    fn test_prompt() {
        let user = User::new("Admin", UserLevel::Admin);
        assert_eq!(user.prompt(), "[ADMIN]Admin");
        assert_eq!(user.to_string(), "[ADMIN]Admin");
    }

    #[test]
    fn test_satisfy() {
        let user = User::new("alice", UserLevel::Local);
        assert!(user.satisfy(UserLevel::None));
        assert!(user.satisfy(UserLevel::Local));
        assert!(!user.satisfy(UserLevel::Admin));
    }

    #[test]
    fn test_upgrade_checks_granter() {
        let admin = User::new("root-ish", UserLevel::Admin);
        let mut user = User::new("bob", UserLevel::Remote);

        assert!(user.upgrade(UserLevel::Local, &admin));
        assert_eq!(user.level(), UserLevel::Local);

        // The granter cannot hand out a level it does not hold.
        assert!(!user.upgrade(UserLevel::System, &admin));
        assert_eq!(user.level(), UserLevel::Local);

        // Only the granter's level matters, not the subject's.
        let weak = User::new("weak", UserLevel::None);
        assert!(!user.upgrade(UserLevel::Admin, &weak));
    }

    #[test]
    fn test_downgrade_checks_subject() {
        let mut user = User::new("carol", UserLevel::Admin);
        assert!(user.downgrade(UserLevel::Remote));
        assert_eq!(user.level(), UserLevel::Remote);

        assert!(!user.downgrade(UserLevel::Admin));
        assert_eq!(user.level(), UserLevel::Remote);
    }

    #[test]
    fn test_identity_survives_clone_and_rename() {
        let mut user = User::new("RemoteUser", UserLevel::Remote);
        let copy = user.clone();
        user.set_name("Client");
        assert!(user.same_as(&copy));
        assert!(!user.same_as(&User::new("Client", UserLevel::Remote)));
    }
}
