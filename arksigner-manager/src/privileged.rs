//! Privilege checks and the identity of the user behind pkexec/sudo.

use crate::error::ManagerError;
use nix::unistd::{Uid, User, geteuid};
use std::path::PathBuf;

pub fn require_root() -> Result<(), ManagerError> {
    if geteuid().is_root() {
        Ok(())
    } else {
        Err(ManagerError::NotRoot)
    }
}

/// The desktop user who asked for elevation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokingUser {
    pub name: String,
    pub home: Option<PathBuf>,
}

/// Environment values consulted when working out the invoking user.
#[derive(Debug, Clone, Default)]
pub struct IdentityHints {
    pub pkexec_uid: Option<String>,
    pub sudo_user: Option<String>,
    pub user: Option<String>,
}

impl IdentityHints {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            pkexec_uid: var("PKEXEC_UID"),
            sudo_user: var("SUDO_USER"),
            user: var("USER"),
        }
    }
}

/// `PKEXEC_UID` first, then `SUDO_USER`, then `USER`, then root.
pub fn invoking_user(hints: &IdentityHints) -> InvokingUser {
    if let Some(user) = hints
        .pkexec_uid
        .as_deref()
        .and_then(|uid| uid.trim().parse::<u32>().ok())
        .and_then(|uid| User::from_uid(Uid::from_raw(uid)).ok().flatten())
    {
        return InvokingUser {
            name: user.name,
            home: Some(user.dir),
        };
    }

    let name = hints
        .sudo_user
        .clone()
        .or_else(|| hints.user.clone())
        .unwrap_or_else(|| "root".to_string());
    let home = home_of(&name);
    InvokingUser { name, home }
}

/// Home directory from the passwd database.
pub fn home_of(name: &str) -> Option<PathBuf> {
    User::from_name(name).ok().flatten().map(|user| user.dir)
}

/// Home directory for `user`, falling back to the current user's.
pub fn home_for(user: &InvokingUser) -> PathBuf {
    user.home
        .clone()
        .or_else(|| directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("/root"))
}

/// Name of the user running this process, for log lines.
pub fn current_user() -> String {
    whoami::username()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_user_beats_user() {
        let hints = IdentityHints {
            pkexec_uid: None,
            sudo_user: Some("alice".into()),
            user: Some("root".into()),
        };
        assert_eq!(invoking_user(&hints).name, "alice");
    }

    #[test]
    fn falls_back_to_root() {
        let user = invoking_user(&IdentityHints::default());
        assert_eq!(user.name, "root");
    }

    #[test]
    fn pkexec_uid_zero_is_root() {
        let hints = IdentityHints {
            pkexec_uid: Some("0".into()),
            sudo_user: Some("alice".into()),
            user: None,
        };
        let user = invoking_user(&hints);
        assert_eq!(user.name, "root");
        assert!(user.home.is_some());
    }

    #[test]
    fn garbage_pkexec_uid_is_ignored() {
        let hints = IdentityHints {
            pkexec_uid: Some("not-a-uid".into()),
            sudo_user: None,
            user: Some("bob".into()),
        };
        assert_eq!(invoking_user(&hints).name, "bob");
    }

    #[test]
    fn home_for_prefers_known_home() {
        let user = InvokingUser {
            name: "alice".into(),
            home: Some(PathBuf::from("/home/alice")),
        };
        assert_eq!(home_for(&user), PathBuf::from("/home/alice"));
    }
}
