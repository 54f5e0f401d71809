//! Carrier kinds and namespaced session ids
//!
//! The same client may reach the tool protocol over two carriers. Session
//! identity is always `(carrier kind, bare id)`, so the same bare id on two
//! carriers names two independent sessions.
//!
//! [`normalize_id`] strips every leading carrier namespace before applying the
//! target kind. Ids arriving already namespaced (`push:abc`) or namespaced
//! more than once (`request:push:abc`) all reduce to the bare id `abc`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two transports for the tool protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierKind {
    /// Long-lived connection; the server pushes framed messages
    Push,
    /// Independent request/response exchanges correlated by a client-echoed id
    Request,
}

impl CarrierKind {
    /// Every carrier kind
    pub const ALL: [Self; 2] = [Self::Push, Self::Request];

    /// Namespace segment for this kind
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Request => "request",
        }
    }

    /// The other carrier
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Push => Self::Request,
            Self::Request => Self::Push,
        }
    }
}

impl fmt::Display for CarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Session id qualified by its carrier kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedId {
    kind: CarrierKind,
    bare: String,
}

impl NamespacedId {
    /// Carrier kind
    #[must_use]
    pub fn kind(&self) -> CarrierKind {
        self.kind
    }

    /// Bare id; the only form that may cross the external boundary
    #[must_use]
    pub fn bare(&self) -> &str {
        &self.bare
    }
}

impl fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.bare)
    }
}

fn strip_one_namespace(id: &str) -> Option<&str> {
    CarrierKind::ALL.iter().find_map(|kind| {
        id.strip_prefix(kind.prefix())
            .and_then(|rest| rest.strip_prefix(':'))
    })
}

/// Reduce `raw` to its bare id
#[must_use]
pub fn bare_id(raw: &str) -> &str {
    let mut bare = raw;
    while let Some(rest) = strip_one_namespace(bare) {
        bare = rest;
    }
    bare
}

/// Strip every leading carrier namespace from `raw`, then qualify with `kind`
#[must_use]
pub fn normalize_id(raw: &str, kind: CarrierKind) -> NamespacedId {
    NamespacedId {
        kind,
        bare: bare_id(raw).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plain_id_is_prefixed() {
        assert_eq!(normalize_id("abc", CarrierKind::Push).to_string(), "push:abc");
        assert_eq!(normalize_id("abc", CarrierKind::Request).to_string(), "request:abc");
    }

    #[test]
    fn test_existing_namespaces_are_stripped() {
        let id = normalize_id("push:abc", CarrierKind::Request);
        assert_eq!(id.bare(), "abc");
        assert_eq!(id.to_string(), "request:abc");

        let nested = normalize_id("request:push:request:abc", CarrierKind::Push);
        assert_eq!(nested.to_string(), "push:abc");
    }

    #[test]
    fn test_foreign_colons_are_kept() {
        let id = normalize_id("push:tenant:42", CarrierKind::Push);
        assert_eq!(id.bare(), "tenant:42");
        assert_eq!(normalize_id("pushy:abc", CarrierKind::Push).bare(), "pushy:abc");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = normalize_id("push:abc", CarrierKind::Push);
        let twice = normalize_id(&once.to_string(), CarrierKind::Push);
        assert_eq!(once, twice);
    }

    fn namespaced_input() -> impl Strategy<Value = String> {
        (
            proptest::collection::vec(prop_oneof![Just("push:"), Just("request:")], 0..4),
            "[a-zA-Z0-9:_-]{0,16}",
        )
            .prop_map(|(prefixes, bare)| format!("{}{}", prefixes.concat(), bare))
    }

    proptest! {
        #[test]
        fn prop_carriers_never_collide(raw in namespaced_input()) {
            let push = normalize_id(&raw, CarrierKind::Push);
            let request = normalize_id(&raw, CarrierKind::Request);
            prop_assert_ne!(&push, &request);
            prop_assert_ne!(push.to_string(), request.to_string());
            prop_assert_eq!(push.bare(), request.bare());
        }

        #[test]
        fn prop_renormalizing_across_carriers_keeps_bare(raw in namespaced_input()) {
            let push = normalize_id(&raw, CarrierKind::Push);
            let moved = normalize_id(&push.to_string(), CarrierKind::Request);
            prop_assert_eq!(moved.bare(), push.bare());
            prop_assert_eq!(moved.kind(), CarrierKind::Request);
        }
    }
}
