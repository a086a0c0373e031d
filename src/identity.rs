use anyhow::Result;
use libc::{getpwuid, uid_t};
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::fmt;

use crate::config::AccessConfig;
use crate::error::InferenceError;

/// Name of the invoking OS user, preferring the one behind `sudo`.
pub fn current_user_id() -> Result<String> {
    let euid = unsafe { libc::geteuid() };
    if let Some(user) = sudo_user(euid, std::env::var("SUDO_USER").ok()) {
        return Ok(user);
    }
    unsafe {
        let pwd = getpwuid(euid as uid_t);
        if pwd.is_null() {
            return Err(anyhow::anyhow!("failed to resolve current user"));
        }
        let name = CStr::from_ptr((*pwd).pw_name);
        Ok(name.to_string_lossy().into_owned())
    }
}

/// `SUDO_USER` is only meaningful when sudo actually elevated us; otherwise
/// any caller could set it.
fn sudo_user(euid: uid_t, var: Option<String>) -> Option<String> {
    if euid != 0 {
        return None;
    }
    var.filter(|u| !u.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    RunInference,
    UploadMedia,
    ManageEmployees,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RunInference => "run inference",
            Self::UploadMedia => "upload media",
            Self::ManageEmployees => "manage employees",
        })
    }
}

/// Identity/access collaborator: answers whether an actor may do something.
pub trait AccessPolicy: Send + Sync {
    fn allows(&self, actor: &str, capability: Capability) -> bool;

    fn authorize(&self, actor: &str, capability: Capability) -> Result<(), InferenceError> {
        if self.allows(actor, capability) {
            Ok(())
        } else {
            Err(InferenceError::AccessDenied {
                actor: actor.to_string(),
                capability: capability.to_string(),
            })
        }
    }
}

/// Grants every capability to the configured admin users.
#[derive(Debug, Clone)]
pub struct AdminList {
    admins: BTreeSet<String>,
}

impl AdminList {
    pub fn from_config(cfg: &AccessConfig) -> Self {
        Self {
            admins: cfg.admins.iter().cloned().collect(),
        }
    }
}

impl AccessPolicy for AdminList {
    fn allows(&self, actor: &str, _capability: Capability) -> bool {
        self.admins.contains(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_list() {
        let policy = AdminList::from_config(&AccessConfig {
            admins: vec!["hr-admin".into()],
        });
        assert!(policy.authorize("hr-admin", Capability::RunInference).is_ok());
        let err = policy
            .authorize("intern", Capability::UploadMedia)
            .unwrap_err();
        assert!(matches!(err, InferenceError::AccessDenied { .. }));
        assert_eq!(err.to_string(), "intern is not allowed to upload media");
    }

    #[test]
    fn test_sudo_user_ignored_without_root() {
        assert_eq!(sudo_user(1000, Some("root".into())), None);
        assert_eq!(sudo_user(0, Some("alice".into())), Some("alice".into()));
        assert_eq!(sudo_user(0, Some(String::new())), None);
        assert_eq!(sudo_user(0, None), None);
    }
}
