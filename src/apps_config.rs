//! The apps-config document: `appkey -> role -> {secret, permissions}`.
//!
//! Loaded once at startup into an immutable snapshot and shared read-only
//! via `Arc` with every connection — there is no lock on the hot path
//! because nothing ever mutates it after [`AppsConfig::load`] returns.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// The fixed permission vocabulary. An apps-config entry naming anything
/// else is a startup error, not a silently-ignored typo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Publish,
    Subscribe,
    Read,
    Write,
    Delete,
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Publish => "publish",
            Permission::Subscribe => "subscribe",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Admin => "admin",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Permission {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(Permission::Publish),
            "subscribe" => Ok(Permission::Subscribe),
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "delete" => Ok(Permission::Delete),
            "admin" => Ok(Permission::Admin),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RoleEntry {
    secret: String,
    permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Deserialize)]
struct AppEntry {
    roles: HashMap<String, RoleEntry>,
}

#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub secret: String,
    pub permissions: HashSet<Permission>,
}

/// Read-only, process-lifetime snapshot of the apps-config document.
#[derive(Debug, Clone)]
pub struct AppsConfig {
    apps: HashMap<String, HashMap<String, RoleConfig>>,
}

impl AppsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading apps config at {}", path.display()))?;
        let raw: HashMap<String, AppEntry> = serde_json::from_str(&text)
            .with_context(|| format!("parsing apps config at {}", path.display()))?;

        if raw.is_empty() {
            bail!("apps config at {} defines no apps", path.display());
        }

        let mut apps = HashMap::with_capacity(raw.len());
        for (appkey, entry) in raw {
            let mut roles = HashMap::with_capacity(entry.roles.len());
            for (role, role_entry) in entry.roles {
                if role_entry.secret.is_empty() {
                    bail!("app {appkey:?} role {role:?} has an empty secret");
                }
                roles.insert(
                    role,
                    RoleConfig {
                        secret: role_entry.secret,
                        permissions: role_entry.permissions.into_iter().collect(),
                    },
                );
            }
            apps.insert(appkey, roles);
        }

        Ok(Self { apps })
    }

    pub fn role(&self, appkey: &str, role: &str) -> Option<&RoleConfig> {
        self.apps.get(appkey)?.get(role)
    }
}
