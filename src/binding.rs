//! Caller-provided mutable row buffer scans read from and write into.

use crate::atom::AtomId;

/// 32-bit FNV-1a, used uniformly by the parser and executor to identify
/// variables by the hash of their lexical form.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub type VariableHash = u32;

/// Hash basis for a synthesized (not source-spelled) variable or blank
/// node: property-path sequence expansion's fresh intermediate variables
/// and quoted-triple reification's fresh reifier are
/// identified by a small id rather than a name, but still need a stable
/// `VariableHash` to flow through `BindingTable` like any other variable.
pub fn generated_hash(id: u32) -> VariableHash {
    fnv1a_32(format!("__gen{id}").as_bytes())
}

/// A bound value: either an atom already interned in the store, or an
/// inline value produced mid-query (e.g. by BIND or an aggregate) that has
/// not been interned.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Atom(AtomId),
    Inline(String),
    Number(f64),
    Bool(bool),
}

impl Value {
    pub fn as_str<'a>(&'a self, resolve: impl FnOnce(AtomId) -> &'a str) -> std::borrow::Cow<'a, str> {
        match self {
            Value::Atom(id) => std::borrow::Cow::Borrowed(resolve(*id)),
            Value::Inline(s) => std::borrow::Cow::Borrowed(s.as_str()),
            Value::Number(n) => std::borrow::Cow::Owned(n.to_string()),
            Value::Bool(b) => std::borrow::Cow::Borrowed(if *b { "true" } else { "false" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    variable: VariableHash,
    value: Value,
}

/// A row of variable -> value mappings. Scans append/overwrite bindings by
/// hash; nothing here allocates per row beyond growing the backing `Vec`
/// the caller already owns.
#[derive(Debug, Default, Clone)]
pub struct BindingTable {
    bindings: Vec<Binding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn set(&mut self, variable: VariableHash, value: Value) {
        if let Some(existing) = self.bindings.iter_mut().find(|b| b.variable == variable) {
            existing.value = value;
        } else {
            self.bindings.push(Binding { variable, value });
        }
    }

    pub fn get(&self, variable: VariableHash) -> Option<&Value> {
        self.bindings
            .iter()
            .find(|b| b.variable == variable)
            .map(|b| &b.value)
    }

    pub fn is_bound(&self, variable: VariableHash) -> bool {
        self.get(variable).is_some()
    }

    pub fn unset(&mut self, variable: VariableHash) {
        self.bindings.retain(|b| b.variable != variable);
    }

    pub fn variables(&self) -> impl Iterator<Item = VariableHash> + '_ {
        self.bindings.iter().map(|b| b.variable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VariableHash, &Value)> {
        self.bindings.iter().map(|b| (b.variable, &b.value))
    }

    /// Shares every binding in `other` that isn't already present here,
    /// used by `OptionalScan`/`MinusScan` to test whether two rows agree on
    /// their shared variables.
    pub fn agrees_with(&self, other: &BindingTable) -> bool {
        self.bindings.iter().all(|b| match other.get(b.variable) {
            Some(v) => *v == b.value,
            None => true,
        })
    }

    /// Like `agrees_with`, but also requires the two rows to actually share
    /// at least one bound variable. `agrees_with` alone is vacuously true
    /// for two rows with disjoint domains, which is the right behavior for
    /// an OPTIONAL join but wrong for MINUS: SPARQL only excludes a left
    /// solution when it is compatible with a right solution *and* their
    /// domains intersect.
    pub fn shares_and_agrees_with(&self, other: &BindingTable) -> bool {
        self.bindings.iter().any(|b| other.is_bound(b.variable)) && self.agrees_with(other)
    }

    pub fn merge_from(&mut self, other: &BindingTable) {
        for (variable, value) in other.iter() {
            self.set(variable, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut table = BindingTable::new();
        let v = fnv1a_32(b"x");
        table.set(v, Value::Atom(7));
        assert_eq!(table.get(v), Some(&Value::Atom(7)));
    }

    #[test]
    fn set_overwrites_existing_binding() {
        let mut table = BindingTable::new();
        let v = fnv1a_32(b"x");
        table.set(v, Value::Atom(1));
        table.set(v, Value::Atom(2));
        assert_eq!(table.get(v), Some(&Value::Atom(2)));
    }

    #[test]
    fn agrees_with_checks_only_shared_variables() {
        let mut a = BindingTable::new();
        let mut b = BindingTable::new();
        let x = fnv1a_32(b"x");
        let y = fnv1a_32(b"y");
        a.set(x, Value::Atom(1));
        b.set(x, Value::Atom(1));
        b.set(y, Value::Atom(99));
        assert!(a.agrees_with(&b));
        a.set(x, Value::Atom(2));
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn shares_and_agrees_with_requires_domain_overlap() {
        let mut a = BindingTable::new();
        let mut b = BindingTable::new();
        let x = fnv1a_32(b"x");
        let y = fnv1a_32(b"y");
        a.set(x, Value::Atom(1));
        b.set(y, Value::Atom(99));
        assert!(a.agrees_with(&b));
        assert!(!a.shares_and_agrees_with(&b));
        b.set(x, Value::Atom(1));
        assert!(a.shares_and_agrees_with(&b));
    }

    #[test]
    fn fnv1a_32_is_deterministic() {
        assert_eq!(fnv1a_32(b"hello"), fnv1a_32(b"hello"));
        assert_ne!(fnv1a_32(b"hello"), fnv1a_32(b"world"));
    }
}
