//! Owner-reference classification. "Owner reference with controller=true" is
//! the single source of truth for ownership; this module maps it to a
//! tagged in-memory value and the reconcilers branch on that instead of
//! re-deriving it inline.
//!
//! Walks `metadata.owner_references` by hand into one of three buckets
//! rather than reaching for a generic helper.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No controller owner reference present.
    None,
    /// Controlled by the UID we're asking about.
    ControlledBy(String),
    /// Controlled by a different UID.
    ForeignController(String),
}

impl Ownership {
    pub fn is_owned_by(&self, uid: &str) -> bool {
        matches!(self, Ownership::ControlledBy(u) if u == uid)
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Ownership::ForeignController(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Ownership::None)
    }
}

/// Classify `owner_references` (as found on a pod's `ObjectMeta`) relative
/// to `expected_uid`, the UID of the controller asking.
pub fn classify(owner_references: Option<&Vec<OwnerReference>>, expected_uid: &str) -> Ownership {
    let controller_ref = owner_references
        .into_iter()
        .flatten()
        .find(|r| r.controller == Some(true));

    match controller_ref {
        None => Ownership::None,
        Some(r) if r.uid == expected_uid => Ownership::ControlledBy(r.uid.clone()),
        Some(r) => Ownership::ForeignController(r.uid.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_ref(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "agents.x-k8s.io/v1alpha1".to_string(),
            kind: "Sandbox".to_string(),
            name: "s".to_string(),
            uid: uid.to_string(),
            controller: Some(controller),
            ..Default::default()
        }
    }

    #[test]
    fn no_owner_references_is_none() {
        assert_eq!(classify(None, "uid-1"), Ownership::None);
    }

    #[test]
    fn no_controller_ref_is_none() {
        let refs = vec![owner_ref("uid-1", false)];
        assert_eq!(classify(Some(&refs), "uid-1"), Ownership::None);
    }

    #[test]
    fn matching_controller_uid_is_controlled_by() {
        let refs = vec![owner_ref("uid-1", true)];
        assert!(classify(Some(&refs), "uid-1").is_owned_by("uid-1"));
    }

    #[test]
    fn mismatched_controller_uid_is_foreign() {
        let refs = vec![owner_ref("uid-2", true)];
        let c = classify(Some(&refs), "uid-1");
        assert!(c.is_foreign());
        assert!(!c.is_owned_by("uid-1"));
    }

    #[test]
    fn non_controller_refs_are_ignored_when_controller_ref_present() {
        let refs = vec![owner_ref("uid-other", false), owner_ref("uid-1", true)];
        assert!(classify(Some(&refs), "uid-1").is_owned_by("uid-1"));
    }
}
