//! Privilege escalation configuration.
//!
//! Each host in a cluster spec can declare how commands escalate privileges
//! (`sudo`, `doas`), inheriting from spec-level defaults when unspecified.
//! Connectors consult the resolved method when building remote command
//! lines.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::error::KubeforgeError;

/// Privilege escalation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PrivilegeMethod {
    /// Escalate with `sudo`.
    Sudo,
    /// Escalate with `doas`.
    Doas,
}

/// Default privilege settings for the cluster spec.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrivilegeDefaults {
    /// The default privilege escalation method.
    pub method: PrivilegeMethod,
}

/// Per-host privilege escalation setting.
///
/// Accepted YAML forms:
/// - absent or `null` → `Inherit` (use defaults if available)
/// - `privilege: true` → `UseDefault` (require defaults, error if missing)
/// - `privilege: false` → `Disabled` (no privilege escalation)
/// - `privilege: { method: sudo }` → `Method(Sudo)` (explicit method)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Privilege {
    /// Not specified — follow the spec defaults if any.
    #[default]
    Inherit,
    /// Use the default method; the spec must configure one.
    UseDefault,
    /// Never escalate on this host.
    Disabled,
    /// Use this method regardless of defaults.
    Method(PrivilegeMethod),
}

/// Wire shape of an explicit privilege map.
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ExplicitPrivilege {
    method: PrivilegeMethod,
}

/// The non-null YAML forms, in the same closed-variant style the cluster
/// spec uses for its other discriminators.
#[derive(Deserialize)]
#[serde(untagged)]
enum PrivilegeRepr {
    Toggle(bool),
    Explicit(ExplicitPrivilege),
}

impl Privilege {
    /// Resolves this setting against the spec defaults.
    ///
    /// Returns `Some(method)` if commands on the host should escalate, or
    /// `None` to run as the connecting user.
    ///
    /// # Errors
    ///
    /// Returns `KubeforgeError::Spec` for `UseDefault` when the spec
    /// configures no defaults.
    pub fn resolve(
        &self,
        defaults: Option<&PrivilegeDefaults>,
    ) -> Result<Option<PrivilegeMethod>, KubeforgeError> {
        let default_method = defaults.map(|d| d.method);
        match self {
            Self::Disabled => Ok(None),
            Self::Method(method) => Ok(Some(*method)),
            Self::Inherit => Ok(default_method),
            Self::UseDefault => default_method.map(Some).ok_or_else(|| {
                KubeforgeError::Spec(
                    "privilege: true requires defaults.privilege.method to be configured"
                        .to_string(),
                )
            }),
        }
    }
}

impl<'de> Deserialize<'de> for Privilege {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let setting = match Option::<PrivilegeRepr>::deserialize(deserializer)? {
            None => Privilege::Inherit,
            Some(PrivilegeRepr::Toggle(true)) => Privilege::UseDefault,
            Some(PrivilegeRepr::Toggle(false)) => Privilege::Disabled,
            Some(PrivilegeRepr::Explicit(explicit)) => Privilege::Method(explicit.method),
        };
        Ok(setting)
    }
}

impl Serialize for Privilege {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match *self {
            Self::Inherit => serializer.serialize_none(),
            Self::UseDefault => serializer.serialize_bool(true),
            Self::Disabled => serializer.serialize_bool(false),
            Self::Method(method) => ExplicitPrivilege { method }.serialize(serializer),
        }
    }
}
