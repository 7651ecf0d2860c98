use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

use serde_json::{Map, Value};

use tessera_core::error::{Result, TesseraError};

/// Handle to one scope of a [`ContextTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

#[derive(Debug)]
struct Scope {
    name: String,
    /// Nearest first.
    parents: Vec<ScopeId>,
    bindings: Map<String, Value>,
    sealed: bool,
}

/// Scoped key/value bindings for one run.
///
/// Every container node gets its own scope whose parents are the scopes of
/// its dependency nodes (or the root scope for nodes without dependencies).
/// Reads walk the scope, then its ancestors nearest-first. Writes only ever
/// target the caller's own scope, and a scope is sealed once its node
/// completes, so concurrent nodes only share read access to ancestors.
#[derive(Debug)]
pub struct ContextTree {
    scopes: RwLock<Vec<Scope>>,
}

impl ContextTree {
    /// A tree whose root scope holds `root` and is already sealed.
    pub fn new(root: Map<String, Value>) -> Self {
        Self {
            scopes: RwLock::new(vec![Scope {
                name: "root".into(),
                parents: vec![],
                bindings: root,
                sealed: true,
            }]),
        }
    }

    fn lock_err() -> TesseraError {
        TesseraError::Context("context tree lock poisoned".into())
    }

    pub fn open_scope(&self, name: impl Into<String>, parents: &[ScopeId]) -> Result<ScopeId> {
        let mut scopes = self.scopes.write().map_err(|_| Self::lock_err())?;
        if let Some(bad) = parents.iter().find(|p| p.0 >= scopes.len()) {
            return Err(TesseraError::Context(format!("unknown parent scope {}", bad.0)));
        }
        let parents = if parents.is_empty() {
            vec![ScopeId::ROOT]
        } else {
            parents.to_vec()
        };
        scopes.push(Scope {
            name: name.into(),
            parents,
            bindings: Map::new(),
            sealed: false,
        });
        Ok(ScopeId(scopes.len() - 1))
    }

    /// Bind `key` in `scope`. Fails once the scope is sealed.
    pub fn set(&self, scope: ScopeId, key: impl Into<String>, value: Value) -> Result<()> {
        let mut scopes = self.scopes.write().map_err(|_| Self::lock_err())?;
        let target = scopes
            .get_mut(scope.0)
            .ok_or_else(|| TesseraError::Context(format!("unknown scope {}", scope.0)))?;
        if target.sealed {
            return Err(TesseraError::Context(format!(
                "scope '{}' is sealed and cannot be written",
                target.name
            )));
        }
        target.bindings.insert(key.into(), value);
        Ok(())
    }

    /// Nearest binding of `key` visible from `scope`.
    pub fn get(&self, scope: ScopeId, key: &str) -> Option<Value> {
        let scopes = self.scopes.read().ok()?;
        let mut found = None;
        walk(&scopes, scope, |s| {
            if let Some(v) = s.bindings.get(key) {
                found = Some(v.clone());
                true
            } else {
                false
            }
        });
        found
    }

    /// Everything visible from `scope`; nearer bindings hide farther ones.
    pub fn visible(&self, scope: ScopeId) -> Map<String, Value> {
        let mut out = Map::new();
        if let Ok(scopes) = self.scopes.read() {
            walk(&scopes, scope, |s| {
                for (k, v) in &s.bindings {
                    if !out.contains_key(k) {
                        out.insert(k.clone(), v.clone());
                    }
                }
                false
            });
        }
        out
    }

    /// Bindings written directly into `scope`.
    pub fn own(&self, scope: ScopeId) -> Map<String, Value> {
        self.scopes
            .read()
            .ok()
            .and_then(|s| s.get(scope.0).map(|s| s.bindings.clone()))
            .unwrap_or_default()
    }

    pub fn seal(&self, scope: ScopeId) -> Result<()> {
        let mut scopes = self.scopes.write().map_err(|_| Self::lock_err())?;
        if let Some(s) = scopes.get_mut(scope.0) {
            s.sealed = true;
        }
        Ok(())
    }

    pub fn is_sealed(&self, scope: ScopeId) -> bool {
        self.scopes
            .read()
            .ok()
            .and_then(|s| s.get(scope.0).map(|s| s.sealed))
            .unwrap_or(true)
    }
}

/// Breadth-first from `start` so nearer scopes are visited first. Stops
/// when `visit` returns `true`.
fn walk(scopes: &[Scope], start: ScopeId, mut visit: impl FnMut(&Scope) -> bool) {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(scope) = scopes.get(id.0) else {
            continue;
        };
        if visit(scope) {
            return;
        }
        queue.extend(scope.parents.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> ContextTree {
        let mut m = Map::new();
        m.insert("input".into(), json!("x"));
        m.insert("shared".into(), json!("root"));
        ContextTree::new(m)
    }

    #[test]
    fn test_child_reads_ancestors_nearest_first() {
        let tree = root();
        let a = tree.open_scope("a", &[]).unwrap();
        tree.set(a, "shared", json!("a")).unwrap();
        tree.seal(a).unwrap();
        let b = tree.open_scope("b", &[a]).unwrap();

        assert_eq!(tree.get(b, "input"), Some(json!("x")));
        assert_eq!(tree.get(b, "shared"), Some(json!("a")));
        assert_eq!(tree.get(ScopeId::ROOT, "shared"), Some(json!("root")));
        assert_eq!(tree.get(b, "missing"), None);

        let visible = tree.visible(b);
        assert_eq!(visible["shared"], "a");
        assert_eq!(visible["input"], "x");
        assert!(tree.own(b).is_empty());
    }

    #[test]
    fn test_sealed_scopes_reject_writes() {
        let tree = root();
        assert!(tree.set(ScopeId::ROOT, "k", json!(1)).is_err());
        let a = tree.open_scope("a", &[]).unwrap();
        tree.set(a, "k", json!(1)).unwrap();
        tree.seal(a).unwrap();
        assert!(tree.is_sealed(a));
        assert!(matches!(tree.set(a, "k", json!(2)), Err(TesseraError::Context(_))));
    }

    #[test]
    fn test_parent_order_breaks_ties() {
        let tree = root();
        let l = tree.open_scope("l", &[]).unwrap();
        let r = tree.open_scope("r", &[]).unwrap();
        tree.set(l, "k", json!("left")).unwrap();
        tree.set(r, "k", json!("right")).unwrap();
        let join = tree.open_scope("join", &[l, r]).unwrap();
        assert_eq!(tree.get(join, "k"), Some(json!("left")));
    }

    #[test]
    fn test_siblings_are_isolated() {
        let tree = root();
        let a = tree.open_scope("a", &[]).unwrap();
        let b = tree.open_scope("b", &[]).unwrap();
        tree.set(a, "only_a", json!(true)).unwrap();
        assert_eq!(tree.get(b, "only_a"), None);
    }

    #[test]
    fn test_unknown_parent() {
        let tree = root();
        assert!(tree.open_scope("x", &[ScopeId(42)]).is_err());
    }
}
