// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extension manifest shape and runtime/profile compatibility evaluation,
//! per spec §3 ("Agent Extension Module") and §4.2.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Either an exact version a manifest requires, or a semver range.
///
/// Manifests author one or the other (`coreApiVersion` or
/// `coreApiVersionRange`, `profiles[].version` or `profiles[].versionRange`);
/// this type models that "exact or range" choice directly rather than as
/// two separate optional fields callers must reconcile themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionConstraint {
    /// An exact version string (`"1.4.0"`).
    Exact(String),
    /// A semver range expression (`">=1.0.0, <2.0.0"`).
    Range(String),
}

impl VersionConstraint {
    /// Returns `true` if `actual` satisfies this constraint.
    ///
    /// An exact constraint matches only the identical version. A range
    /// constraint is parsed as a [`VersionReq`] and matched normally.
    /// Malformed version/range strings never match (compatibility checks
    /// fail closed).
    #[must_use]
    pub fn matches(&self, actual: &str) -> bool {
        let Ok(actual_version) = Version::parse(actual) else {
            return false;
        };
        match self {
            Self::Exact(want) => Version::parse(want).is_ok_and(|v| v == actual_version),
            Self::Range(expr) => VersionReq::parse(expr).is_ok_and(|r| r.matches(&actual_version)),
        }
    }
}

/// One runtime profile a manifest declares compatibility for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRequirement {
    /// Profile name (e.g. `"codex"`, `"claude-code"`).
    pub name: String,
    /// Exact version required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Version range required, as an alternative to `version`.
    #[serde(rename = "versionRange", skip_serializing_if = "Option::is_none")]
    pub version_range: Option<String>,
}

impl ProfileRequirement {
    fn constraint(&self) -> Option<VersionConstraint> {
        if let Some(v) = &self.version {
            Some(VersionConstraint::Exact(v.clone()))
        } else {
            self.version_range.clone().map(VersionConstraint::Range)
        }
    }
}

/// The `runtime` block of a manifest: what core API and host profiles a
/// module declares compatibility with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeRequirement {
    /// Exact core API version required.
    #[serde(rename = "coreApiVersion", skip_serializing_if = "Option::is_none")]
    pub core_api_version: Option<String>,
    /// Core API version range, as an alternative to `coreApiVersion`.
    #[serde(rename = "coreApiVersionRange", skip_serializing_if = "Option::is_none")]
    pub core_api_version_range: Option<String>,
    /// Host profiles this module declares compatibility with. Empty means
    /// "no profile constraint" (compatible with every profile).
    #[serde(default)]
    pub profiles: Vec<ProfileRequirement>,
}

impl RuntimeRequirement {
    fn core_constraint(&self) -> Option<VersionConstraint> {
        if let Some(v) = &self.core_api_version {
            Some(VersionConstraint::Exact(v.clone()))
        } else {
            self.core_api_version_range
                .clone()
                .map(VersionConstraint::Range)
        }
    }
}

/// Declared entrypoints a manifest resolves file paths (relative to the
/// module's own directory) for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entrypoints {
    /// Path to the events-registration entrypoint, relative to the module
    /// directory. Defaults to a conventional filename when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
}

/// Declared capabilities: the event types a module may subscribe to and
/// the action types it may attempt, per the trust gate (§4.2.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Event type names the module is allowed to subscribe to. `"*"`
    /// matches any event type.
    #[serde(default)]
    pub events: Vec<String>,
    /// Action type names the module is allowed to attempt. `"*"` matches
    /// any action type.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Capabilities {
    /// Returns `true` if `event_type` is declared (exactly or via `"*"`).
    #[must_use]
    pub fn declares_event(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event_type)
    }

    /// Returns `true` if `action_type` is declared (exactly or via `"*"`).
    #[must_use]
    pub fn declares_action(&self, action_type: &str) -> bool {
        self.actions.iter().any(|a| a == "*" || a == action_type)
    }
}

/// `extension.manifest.json`, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    /// The extension's declared name (should match its directory name).
    pub name: String,
    /// The extension's own version.
    pub version: String,
    /// Stable identifier for the agent this extension backs, if any.
    #[serde(rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Human-facing display name.
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Runtime/profile compatibility requirements.
    #[serde(default)]
    pub runtime: RuntimeRequirement,
    /// Entrypoint overrides.
    #[serde(default)]
    pub entrypoints: Entrypoints,
    /// Declared event/action capabilities.
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// This core's identity, compared against a manifest's `runtime` block.
#[derive(Debug, Clone)]
pub struct RuntimeIdentity {
    /// This core's own API version.
    pub core_version: String,
    /// The active host profile's name, if any.
    pub profile_id: Option<String>,
    /// The active host profile's version, if any.
    pub profile_version: Option<String>,
}

/// Structured outcome of comparing a manifest's `runtime` block against the
/// host's [`RuntimeIdentity`], per spec §4.2 ("a structured
/// `CompatibilitySummary`, not just a boolean").
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilitySummary {
    /// Whether every declared constraint is satisfied.
    pub compatible: bool,
    /// Human-readable reasons, populated whenever `compatible` is `false`
    /// (and left empty on a clean pass).
    pub reasons: Vec<String>,
}

impl CompatibilitySummary {
    /// No constraints were declared (or none applied), so the module is
    /// trivially compatible. Distinct from `Default` so a missing manifest
    /// reads as "nothing to check" rather than an implicit failure.
    #[must_use]
    pub fn unconstrained() -> Self {
        Self {
            compatible: true,
            reasons: Vec::new(),
        }
    }
}

/// Evaluate `manifest.runtime` against `identity`.
///
/// A manifest with no `coreApiVersion(Range)` and no `profiles` is always
/// compatible (no constraint declared). Each declared constraint that fails
/// contributes one human-readable reason; the summary is compatible only if
/// every declared constraint passes.
#[must_use]
pub fn evaluate_compatibility(
    manifest: &ExtensionManifest,
    identity: &RuntimeIdentity,
) -> CompatibilitySummary {
    let mut reasons = Vec::new();

    if let Some(constraint) = manifest.runtime.core_constraint() {
        if !constraint.matches(&identity.core_version) {
            reasons.push(format!(
                "core API version {} does not satisfy {constraint:?}",
                identity.core_version
            ));
        }
    }

    if !manifest.runtime.profiles.is_empty() {
        let satisfied = manifest.runtime.profiles.iter().any(|req| {
            let Some(profile_id) = &identity.profile_id else {
                return false;
            };
            if &req.name != profile_id {
                return false;
            }
            match (&identity.profile_version, req.constraint()) {
                (Some(actual), Some(constraint)) => constraint.matches(actual),
                // A profile requirement with no version constraint matches
                // any version of that named profile.
                (_, None) => true,
                (None, Some(_)) => false,
            }
        });
        if !satisfied {
            let names: Vec<&str> = manifest
                .runtime
                .profiles
                .iter()
                .map(|p| p.name.as_str())
                .collect();
            reasons.push(format!(
                "no declared profile ({}) matches host profile {:?} {:?}",
                names.join(", "),
                identity.profile_id,
                identity.profile_version
            ));
        }
    }

    CompatibilitySummary {
        compatible: reasons.is_empty(),
        reasons,
    }
}
