use std::fmt;

/// Derive a stable-ish node identifier.
///
/// Prefers the `KEYLOCK_NODE_ID` environment variable, then
/// `EC2_INSTANCE_ID` (set via user-data or IMDSv2 on EC2 instances).  Falls
/// back to `<hostname>-<random-8-chars>` so that every process gets a unique
/// id even on the same host.
pub fn node_id() -> String {
    std::env::var("KEYLOCK_NODE_ID")
        .or_else(|_| std::env::var("EC2_INSTANCE_ID"))
        .unwrap_or_else(|_| {
            let hostname = gethostname::gethostname().to_string_lossy().into_owned();
            let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
            format!("{hostname}-{suffix}")
        })
}

/// Proof of one specific lock grant.
///
/// The value is `<node_id>:<uuid-v4>`.  The node id only helps an operator
/// see who holds a key; uniqueness and unpredictability come from the random
/// UUID, which is generated fresh for every acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn generate(node_id: &str) -> Self {
        Self(format!("{node_id}:{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wrap a token value received from elsewhere (e.g. a CLI argument).
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
