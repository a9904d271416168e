//! Platform label schema.
//!
//! Every container and volume the platform creates carries a prefixed label
//! set; the full set is the ownership marker. Orphan-container GC trusts
//! nothing that lacks any required label or that names a different instance.

use std::collections::HashMap;

use crate::CreateContext;

pub const MANAGED: &str = "managed";
pub const OWNER: &str = "owner";
pub const SANDBOX_ID: &str = "sandbox_id";
pub const SESSION_ID: &str = "session_id";
pub const CARGO_ID: &str = "cargo_id";
pub const PROFILE_ID: &str = "profile_id";
pub const INSTANCE_ID: &str = "instance_id";
pub const RUNTIME_PORT: &str = "runtime_port";

const REQUIRED_CONTAINER_LABELS: [&str; 7] = [
    MANAGED,
    OWNER,
    SANDBOX_ID,
    SESSION_ID,
    CARGO_ID,
    PROFILE_ID,
    INSTANCE_ID,
];

/// Outcome of strict-mode ownership verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelVerdict {
    /// Fully labeled, same instance: safe to reason about.
    Owned { session_id: String },
    /// Missing labels or foreign instance id; must never be touched.
    Untrusted { reason: String },
}

#[derive(Debug, Clone)]
pub struct LabelSchema {
    prefix: String,
}

impl LabelSchema {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}.{name}", self.prefix)
    }

    pub fn container_labels(
        &self,
        ctx: &CreateContext,
        runtime_port: u16,
    ) -> HashMap<String, String> {
        HashMap::from([
            (self.key(MANAGED), "true".to_string()),
            (self.key(OWNER), ctx.owner.clone()),
            (self.key(SANDBOX_ID), ctx.sandbox_id.clone()),
            (self.key(SESSION_ID), ctx.session_id.clone()),
            (self.key(CARGO_ID), ctx.cargo_id.clone()),
            (self.key(PROFILE_ID), ctx.profile_id.clone()),
            (self.key(INSTANCE_ID), ctx.instance_id.clone()),
            (self.key(RUNTIME_PORT), runtime_port.to_string()),
        ])
    }

    pub fn volume_labels(&self, owner: &str, cargo_id: &str) -> HashMap<String, String> {
        HashMap::from([
            (self.key(MANAGED), "true".to_string()),
            (self.key(OWNER), owner.to_string()),
            (self.key(CARGO_ID), cargo_id.to_string()),
        ])
    }

    /// The broad filter GC lists with: platform-marked containers only.
    pub fn managed_filter(&self) -> HashMap<String, String> {
        HashMap::from([(self.key(MANAGED), "true".to_string())])
    }

    pub fn get<'a>(&self, labels: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
        labels.get(&self.key(name)).map(String::as_str)
    }

    /// Strict-mode verification: full label set present, `managed=true`,
    /// and the instance id matches this deployment.
    pub fn verify_container(
        &self,
        labels: &HashMap<String, String>,
        instance_id: &str,
    ) -> LabelVerdict {
        for name in REQUIRED_CONTAINER_LABELS {
            if !labels.contains_key(&self.key(name)) {
                return LabelVerdict::Untrusted {
                    reason: format!("missing label {}", self.key(name)),
                };
            }
        }
        if self.get(labels, MANAGED) != Some("true") {
            return LabelVerdict::Untrusted {
                reason: "managed label is not \"true\"".into(),
            };
        }
        match self.get(labels, INSTANCE_ID) {
            Some(id) if id == instance_id => {}
            Some(other) => {
                return LabelVerdict::Untrusted {
                    reason: format!("foreign instance_id {other:?}"),
                };
            }
            None => {
                return LabelVerdict::Untrusted {
                    reason: "missing instance_id".into(),
                };
            }
        }
        // Required set is verified above; session_id is present.
        let session_id = self.get(labels, SESSION_ID).unwrap_or_default().to_string();
        LabelVerdict::Owned { session_id }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ctx() -> CreateContext {
        CreateContext {
            owner: "o1".into(),
            sandbox_id: "sb_1".into(),
            session_id: "sess_1".into(),
            cargo_id: "cg_1".into(),
            profile_id: "python-default".into(),
            instance_id: "unit".into(),
        }
    }

    #[test]
    fn container_labels_carry_the_full_marker_set() {
        let schema = LabelSchema::new("bay");
        let labels = schema.container_labels(&ctx(), 8000);
        assert_eq!(labels.get("bay.managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("bay.session_id").map(String::as_str), Some("sess_1"));
        assert_eq!(labels.get("bay.runtime_port").map(String::as_str), Some("8000"));
        assert_eq!(
            schema.verify_container(&labels, "unit"),
            LabelVerdict::Owned {
                session_id: "sess_1".into()
            }
        );
    }

    #[test]
    fn missing_label_is_untrusted() {
        let schema = LabelSchema::new("bay");
        let mut labels = schema.container_labels(&ctx(), 8000);
        labels.remove("bay.cargo_id");
        match schema.verify_container(&labels, "unit") {
            LabelVerdict::Untrusted { reason } => assert!(reason.contains("bay.cargo_id")),
            other => panic!("expected untrusted, got {other:?}"),
        }
    }

    #[test]
    fn foreign_instance_is_untrusted_even_with_full_labels() {
        let schema = LabelSchema::new("bay");
        let labels = schema.container_labels(&ctx(), 8000);
        match schema.verify_container(&labels, "another-instance") {
            LabelVerdict::Untrusted { reason } => assert!(reason.contains("foreign instance_id")),
            other => panic!("expected untrusted, got {other:?}"),
        }
    }

    #[test]
    fn managed_false_is_untrusted() {
        let schema = LabelSchema::new("bay");
        let mut labels = schema.container_labels(&ctx(), 8000);
        labels.insert("bay.managed".into(), "false".into());
        assert!(matches!(
            schema.verify_container(&labels, "unit"),
            LabelVerdict::Untrusted { .. }
        ));
    }
}
