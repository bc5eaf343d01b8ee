// Pool and device tree models

use serde::Serialize;

/// One node in a pool's redundancy tree. Parent/child relations are
/// indices into the owning pool's `devs` list, which keeps the tree
/// acyclic to the borrow checker and trivial to serialise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dev {
    pub name: String,
    /// Opaque health token as reported by the pool tool, e.g. `ONLINE`.
    pub state: String,
    /// Error counters; -1 means the column was not reported.
    pub read: i64,
    pub write: i64,
    pub cksum: i64,
    /// Trailing diagnostic tokens after the counter columns.
    pub rest: String,
    pub sub_devs: Vec<usize>,
    pub parent_dev: Option<usize>,
}

impl Dev {
    /// A node with children is a container (mirror/raidz group); only
    /// leaves trigger change notifications and LED updates.
    pub fn is_container(&self) -> bool {
        !self.sub_devs.is_empty()
    }
}

/// One pool as reported by the status command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,
    pub state: String,
    pub status: String,
    pub action: String,
    pub see: String,
    pub scan: String,
    pub errors: String,
    pub devs: Vec<Dev>,
    /// Verbatim status section for this pool, attached alongside
    /// notifications as an operator-readable dump.
    pub raw_text: String,
}

/// Pool name rules: a leading letter, then alphanumerics plus
/// `_ - . :` and space; `mirror`, `raidz`, `spare`, `log` and `c<digit>`
/// are reserved.
pub fn legal_pool_name(name: &str) -> bool {
    if name.is_empty() || matches!(name, "mirror" | "raidz" | "spare" | "log") {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes.len() == 2 && bytes[0] == b'c' && bytes[1].is_ascii_digit() {
        return false;
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | ' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_detection_uses_children() {
        let leaf = Dev {
            name: "sda".into(),
            state: "ONLINE".into(),
            read: 0,
            write: 0,
            cksum: 0,
            rest: String::new(),
            sub_devs: vec![],
            parent_dev: Some(0),
        };
        assert!(!leaf.is_container());
        let group = Dev { sub_devs: vec![1, 2], ..leaf.clone() };
        assert!(group.is_container());
    }

    #[test]
    fn pool_name_validation() {
        assert!(legal_pool_name("tank"));
        assert!(legal_pool_name("backup-pool.2:a b"));
        assert!(!legal_pool_name(""));
        assert!(!legal_pool_name("2tank"));
        assert!(!legal_pool_name("mirror"));
        assert!(!legal_pool_name("c0"));
        assert!(legal_pool_name("c0x"));
        assert!(!legal_pool_name("tank/evil"));
    }
}
