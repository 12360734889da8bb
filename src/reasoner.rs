//! Forward-chaining RDFS/OWL closure over a `QuadStore`.
//!
//! Grounded on `lib/oxowl/src/reasoner/mod.rs`'s naive fixed-point
//! materialization loop (a `changed` flag checked against
//! `iterations < max_iterations`), adapted from that crate's typed
//! `OwlClass`/`Individual`/`Axiom` model down to raw `AtomId` triples read
//! straight off one `QuadStore` — this store has no separate ontology
//! representation to classify against, so schema and instance facts are
//! both just quads.

use crate::atom::{AtomId, AtomKind};
use crate::error::Result;
use crate::store::index::FOREVER;
use crate::store::{now_ticks, QuadStore};
use crate::wal::Op;
use std::collections::{HashMap, HashSet};

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
const RDFS_SUBCLASS_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subClassOf";
const RDFS_SUBPROPERTY_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subPropertyOf";
const RDFS_DOMAIN: &str = "http://www.w3.org/2000/01/rdf-schema#domain";
const RDFS_RANGE: &str = "http://www.w3.org/2000/01/rdf-schema#range";
const OWL_TRANSITIVE_PROPERTY: &str = "http://www.w3.org/2002/07/owl#TransitiveProperty";
const OWL_SYMMETRIC_PROPERTY: &str = "http://www.w3.org/2002/07/owl#SymmetricProperty";
const OWL_INVERSE_OF: &str = "http://www.w3.org/2002/07/owl#inverseOf";
const OWL_SAME_AS: &str = "http://www.w3.org/2002/07/owl#sameAs";
const OWL_EQUIVALENT_CLASS: &str = "http://www.w3.org/2002/07/owl#equivalentClass";
const OWL_EQUIVALENT_PROPERTY: &str = "http://www.w3.org/2002/07/owl#equivalentProperty";

/// Bitmask selecting which entailment rules `materialize` applies. Hand-rolled
/// rather than via a crate since nothing in this codebase's dependency stack
/// pulls one in for this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSet(u16);

impl RuleSet {
    pub const RDFS_SUB_CLASS: RuleSet = RuleSet(1 << 0);
    pub const RDFS_SUB_PROPERTY: RuleSet = RuleSet(1 << 1);
    pub const RDFS_DOMAIN: RuleSet = RuleSet(1 << 2);
    pub const RDFS_RANGE: RuleSet = RuleSet(1 << 3);
    pub const OWL_TRANSITIVE: RuleSet = RuleSet(1 << 4);
    pub const OWL_SYMMETRIC: RuleSet = RuleSet(1 << 5);
    pub const OWL_INVERSE: RuleSet = RuleSet(1 << 6);
    pub const OWL_SAME_AS: RuleSet = RuleSet(1 << 7);
    pub const OWL_EQUIVALENT_CLASS: RuleSet = RuleSet(1 << 8);
    pub const OWL_EQUIVALENT_PROPERTY: RuleSet = RuleSet(1 << 9);

    pub const fn empty() -> RuleSet {
        RuleSet(0)
    }

    pub const fn all() -> RuleSet {
        RuleSet(
            Self::RDFS_SUB_CLASS.0
                | Self::RDFS_SUB_PROPERTY.0
                | Self::RDFS_DOMAIN.0
                | Self::RDFS_RANGE.0
                | Self::OWL_TRANSITIVE.0
                | Self::OWL_SYMMETRIC.0
                | Self::OWL_INVERSE.0
                | Self::OWL_SAME_AS.0
                | Self::OWL_EQUIVALENT_CLASS.0
                | Self::OWL_EQUIVALENT_PROPERTY.0,
        )
    }

    pub const fn contains(self, rule: RuleSet) -> bool {
        self.0 & rule.0 == rule.0
    }

    pub const fn insert(self, rule: RuleSet) -> RuleSet {
        RuleSet(self.0 | rule.0)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet::all()
    }
}

impl std::ops::BitOr for RuleSet {
    type Output = RuleSet;
    fn bitor(self, rhs: RuleSet) -> RuleSet {
        self.insert(rhs)
    }
}

/// Resolved ids for the vocabulary terms `materialize` looks for. An id of
/// `0` means the term was never interned, so no quad can possibly use it —
/// the rule that depends on it is then a guaranteed no-op rather than a
/// special case.
struct Vocabulary {
    rdf_type: AtomId,
    subclass_of: AtomId,
    subproperty_of: AtomId,
    domain: AtomId,
    range: AtomId,
    transitive_property: AtomId,
    symmetric_property: AtomId,
    inverse_of: AtomId,
    same_as: AtomId,
    equivalent_class: AtomId,
    equivalent_property: AtomId,
}

impl Vocabulary {
    fn resolve(store: &QuadStore) -> Result<Self> {
        let atoms = store.atoms();
        let iri = |s: &str| atoms.get_id(s.as_bytes(), AtomKind::Iri);
        Ok(Self {
            rdf_type: iri(RDF_TYPE)?,
            subclass_of: iri(RDFS_SUBCLASS_OF)?,
            subproperty_of: iri(RDFS_SUBPROPERTY_OF)?,
            domain: iri(RDFS_DOMAIN)?,
            range: iri(RDFS_RANGE)?,
            transitive_property: iri(OWL_TRANSITIVE_PROPERTY)?,
            symmetric_property: iri(OWL_SYMMETRIC_PROPERTY)?,
            inverse_of: iri(OWL_INVERSE_OF)?,
            same_as: iri(OWL_SAME_AS)?,
            equivalent_class: iri(OWL_EQUIVALENT_CLASS)?,
            equivalent_property: iri(OWL_EQUIVALENT_PROPERTY)?,
        })
    }
}

/// The schema-level maps rebuilt from the current quad set at the start of
/// every fixed-point iteration.
#[derive(Default)]
struct Schema {
    subclass: HashMap<AtomId, HashSet<AtomId>>,
    subproperty: HashMap<AtomId, HashSet<AtomId>>,
    domain: HashMap<AtomId, HashSet<AtomId>>,
    range: HashMap<AtomId, HashSet<AtomId>>,
    transitive: HashSet<AtomId>,
    symmetric: HashSet<AtomId>,
    inverse_of: HashMap<AtomId, HashSet<AtomId>>,
    same_as: HashMap<AtomId, HashSet<AtomId>>,
}

impl Schema {
    fn build(quads: &[(AtomId, AtomId, AtomId, AtomId)], v: &Vocabulary, rules: RuleSet) -> Self {
        let mut schema = Schema::default();
        for &(s, p, o, _g) in quads {
            if rules.contains(RuleSet::RDFS_SUB_CLASS) && v.subclass_of != 0 && p == v.subclass_of {
                schema.subclass.entry(s).or_default().insert(o);
            }
            if rules.contains(RuleSet::RDFS_SUB_PROPERTY) && v.subproperty_of != 0 && p == v.subproperty_of {
                schema.subproperty.entry(s).or_default().insert(o);
            }
            if rules.contains(RuleSet::RDFS_DOMAIN) && v.domain != 0 && p == v.domain {
                schema.domain.entry(s).or_default().insert(o);
            }
            if rules.contains(RuleSet::RDFS_RANGE) && v.range != 0 && p == v.range {
                schema.range.entry(s).or_default().insert(o);
            }
            if rules.contains(RuleSet::OWL_TRANSITIVE) && v.rdf_type != 0 && p == v.rdf_type && o == v.transitive_property {
                schema.transitive.insert(s);
            }
            if rules.contains(RuleSet::OWL_SYMMETRIC) && v.rdf_type != 0 && p == v.rdf_type && o == v.symmetric_property {
                schema.symmetric.insert(s);
            }
            if rules.contains(RuleSet::OWL_INVERSE) && v.inverse_of != 0 && p == v.inverse_of {
                schema.inverse_of.entry(s).or_default().insert(o);
                schema.inverse_of.entry(o).or_default().insert(s);
            }
            if rules.contains(RuleSet::OWL_SAME_AS) && v.same_as != 0 && p == v.same_as {
                schema.same_as.entry(s).or_default().insert(o);
                schema.same_as.entry(o).or_default().insert(s);
            }
            if rules.contains(RuleSet::OWL_EQUIVALENT_CLASS) && v.equivalent_class != 0 && p == v.equivalent_class {
                schema.subclass.entry(s).or_default().insert(o);
                schema.subclass.entry(o).or_default().insert(s);
            }
            if rules.contains(RuleSet::OWL_EQUIVALENT_PROPERTY) && v.equivalent_property != 0 && p == v.equivalent_property {
                schema.subproperty.entry(s).or_default().insert(o);
                schema.subproperty.entry(o).or_default().insert(s);
            }
        }
        close_transitively(&mut schema.subclass);
        close_transitively(&mut schema.subproperty);
        close_transitively(&mut schema.same_as);
        schema
    }
}

/// Repeatedly folds every map entry's targets' own targets in, mirroring
/// `RlReasoner::compute_transitive_closure`'s inner loop.
fn close_transitively(map: &mut HashMap<AtomId, HashSet<AtomId>>) {
    let mut changed = true;
    while changed {
        changed = false;
        let keys: Vec<AtomId> = map.keys().copied().collect();
        for k in keys {
            let direct: Vec<AtomId> = map.get(&k).into_iter().flatten().copied().collect();
            for mid in direct {
                let indirect: Vec<AtomId> = map.get(&mid).into_iter().flatten().copied().collect();
                let entry = map.entry(k).or_default();
                for t in indirect {
                    if entry.insert(t) {
                        changed = true;
                    }
                }
            }
        }
    }
}

/// Determines the `AtomKind` an id was originally interned under by
/// re-deriving its bytes and probing each kind's hash bucket for a match.
/// Exact, not a heuristic: a given id is only ever linked into the bucket
/// selected by its own interning kind, so this recovers it without the
/// store needing to persist a kind tag per atom.
fn classify(store: &QuadStore, id: AtomId) -> Result<AtomKind> {
    let atoms = store.atoms();
    let bytes = atoms.get_bytes(id)?;
    if atoms.get_id(&bytes, AtomKind::Literal)? == id {
        return Ok(AtomKind::Literal);
    }
    if atoms.get_id(&bytes, AtomKind::BlankNode)? == id {
        return Ok(AtomKind::BlankNode);
    }
    Ok(AtomKind::Iri)
}

/// Applies the selected entailment rules to `store` as a naive forward
/// fixed-point: rebuild the schema maps from the current quads, derive every
/// entailed quad they license, insert the ones not already present, and
/// repeat until a pass adds nothing or `max_iters` is hit. Inferred quads are
/// inserted into the default graph with validity starting now and running
/// to `FOREVER`, the same convention `update.rs` uses for ordinary inserts.
/// Returns the number of quads added.
pub fn materialize(store: &QuadStore, rules: RuleSet, max_iters: usize) -> Result<u64> {
    if rules.0 == 0 {
        return Ok(0);
    }
    let v = Vocabulary::resolve(store)?;
    let mut total_inserted = 0u64;
    let mut iterations = 0usize;
    let mut changed = true;

    while changed && iterations < max_iters {
        changed = false;
        iterations += 1;

        let quads = store.query_current(0, 0, 0, 0);
        let mut existing: HashSet<(AtomId, AtomId, AtomId, AtomId)> = quads.iter().copied().collect();
        let schema = Schema::build(&quads, &v, rules);
        let mut candidates: Vec<(AtomId, AtomId, AtomId, AtomId)> = Vec::new();

        for &(s, p, o, g) in &quads {
            if rules.contains(RuleSet::RDFS_DOMAIN) {
                if let Some(classes) = schema.domain.get(&p) {
                    for &c in classes {
                        candidates.push((s, v.rdf_type, c, g));
                    }
                }
            }
            if rules.contains(RuleSet::RDFS_RANGE) {
                if let Some(classes) = schema.range.get(&p) {
                    if classify(store, o)? != AtomKind::Literal {
                        for &c in classes {
                            candidates.push((o, v.rdf_type, c, g));
                        }
                    }
                }
            }
            if rules.contains(RuleSet::RDFS_SUB_CLASS) && v.rdf_type != 0 && p == v.rdf_type {
                if let Some(supers) = schema.subclass.get(&o) {
                    for &sup in supers {
                        candidates.push((s, v.rdf_type, sup, g));
                    }
                }
            }
            if rules.contains(RuleSet::RDFS_SUB_PROPERTY) {
                if let Some(supers) = schema.subproperty.get(&p) {
                    for &sup in supers {
                        candidates.push((s, sup, o, g));
                    }
                }
            }
            if rules.contains(RuleSet::OWL_TRANSITIVE) && schema.transitive.contains(&p) {
                for &(s2, p2, o2, _g2) in &quads {
                    if p2 == p && s2 == o {
                        candidates.push((s, p, o2, g));
                    }
                }
            }
            if rules.contains(RuleSet::OWL_SYMMETRIC) && schema.symmetric.contains(&p) {
                candidates.push((o, p, s, g));
            }
            if rules.contains(RuleSet::OWL_INVERSE) {
                if let Some(inverses) = schema.inverse_of.get(&p) {
                    for &q in inverses {
                        candidates.push((o, q, s, g));
                    }
                }
            }
            if rules.contains(RuleSet::OWL_SAME_AS) {
                if let Some(same_s) = schema.same_as.get(&s) {
                    for &s2 in same_s {
                        candidates.push((s2, p, o, g));
                    }
                }
                if let Some(same_o) = schema.same_as.get(&o) {
                    for &o2 in same_o {
                        candidates.push((s, p, o2, g));
                    }
                }
            }
        }

        if rules.contains(RuleSet::OWL_EQUIVALENT_CLASS) && v.equivalent_class != 0 {
            for &(s, p, o, g) in &quads {
                if p == v.equivalent_class {
                    candidates.push((o, v.subclass_of, s, g));
                    candidates.push((s, v.subclass_of, o, g));
                }
            }
        }
        if rules.contains(RuleSet::OWL_EQUIVALENT_PROPERTY) && v.equivalent_property != 0 {
            for &(s, p, o, g) in &quads {
                if p == v.equivalent_property {
                    candidates.push((o, v.subproperty_of, s, g));
                    candidates.push((s, v.subproperty_of, o, g));
                }
            }
        }

        let now = now_ticks();
        for (s, p, o, g) in candidates {
            if existing.insert((s, p, o, g)) {
                store.add_ids(s, p, o, g, now, FOREVER, Op::Add)?;
                total_inserted += 1;
                changed = true;
            }
        }
    }

    Ok(total_inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomKind as AK;
    use crate::store::StoreConfig;

    fn open_store() -> (tempfile::TempDir, QuadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn subclass_chain_propagates_type() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:Dog", AK::Iri, RDFS_SUBCLASS_OF.as_bytes(), b"ex:Animal", AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:rex", AK::Iri, RDF_TYPE.as_bytes(), b"ex:Dog", AK::Iri, None, 0, FOREVER)
            .unwrap();

        let inserted = materialize(&store, RuleSet::RDFS_SUB_CLASS, 100).unwrap();
        assert_eq!(inserted, 1);

        let rdf_type = store.atoms().get_id(RDF_TYPE.as_bytes(), AK::Iri).unwrap();
        let rex = store.atoms().get_id(b"ex:rex", AK::Iri).unwrap();
        let animal = store.atoms().get_id(b"ex:Animal", AK::Iri).unwrap();
        assert!(store.query_current(rex, rdf_type, animal, 0).iter().any(|_| true));
    }

    #[test]
    fn domain_and_range_skip_literal_objects() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:age", AK::Iri, RDFS_DOMAIN.as_bytes(), b"ex:Person", AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:age", AK::Iri, RDFS_RANGE.as_bytes(), b"xsd:integer", AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:alice", AK::Iri, b"ex:age", b"30", AK::Literal, None, 0, FOREVER)
            .unwrap();

        let inserted = materialize(&store, RuleSet::RDFS_DOMAIN | RuleSet::RDFS_RANGE, 100).unwrap();
        // Only the domain inference fires; "30" is a literal, so no range triple.
        assert_eq!(inserted, 1);

        let rdf_type = store.atoms().get_id(RDF_TYPE.as_bytes(), AK::Iri).unwrap();
        let alice = store.atoms().get_id(b"ex:alice", AK::Iri).unwrap();
        let person = store.atoms().get_id(b"ex:Person", AK::Iri).unwrap();
        assert!(!store.query_current(alice, rdf_type, person, 0).is_empty());
    }

    #[test]
    fn symmetric_property_adds_the_reverse_edge() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:knows", AK::Iri, RDF_TYPE.as_bytes(), OWL_SYMMETRIC_PROPERTY.as_bytes(), AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:a", AK::Iri, b"ex:knows", b"ex:b", AK::Iri, None, 0, FOREVER)
            .unwrap();

        materialize(&store, RuleSet::OWL_SYMMETRIC, 100).unwrap();

        let knows = store.atoms().get_id(b"ex:knows", AK::Iri).unwrap();
        let a = store.atoms().get_id(b"ex:a", AK::Iri).unwrap();
        let b = store.atoms().get_id(b"ex:b", AK::Iri).unwrap();
        assert!(!store.query_current(b, knows, a, 0).is_empty());
    }

    #[test]
    fn transitive_property_closes_multi_hop_chains() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:ancestorOf", AK::Iri, RDF_TYPE.as_bytes(), OWL_TRANSITIVE_PROPERTY.as_bytes(), AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:a", AK::Iri, b"ex:ancestorOf", b"ex:b", AK::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:b", AK::Iri, b"ex:ancestorOf", b"ex:c", AK::Iri, None, 0, FOREVER)
            .unwrap();

        materialize(&store, RuleSet::OWL_TRANSITIVE, 100).unwrap();

        let p = store.atoms().get_id(b"ex:ancestorOf", AK::Iri).unwrap();
        let a = store.atoms().get_id(b"ex:a", AK::Iri).unwrap();
        let c = store.atoms().get_id(b"ex:c", AK::Iri).unwrap();
        assert!(!store.query_current(a, p, c, 0).is_empty());
    }

    #[test]
    fn empty_ruleset_is_a_no_op() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:a", AK::Iri, b"ex:p", b"ex:b", AK::Iri, None, 0, FOREVER)
            .unwrap();
        let inserted = materialize(&store, RuleSet::empty(), 100).unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn max_iters_truncates_a_long_transitive_chain() {
        let (_dir, store) = open_store();
        // a -p-> b -p-> c -p-> d -p-> e, p transitive. Unlike subclass/
        // subproperty (closed in-memory within one Schema::build call),
        // transitive-property closure only combines one extra hop per
        // materialize iteration, so it genuinely needs several outer passes
        // to reach the full 10-edge closure over 5 chained nodes.
        store
            .add(b"ex:p", AK::Iri, RDF_TYPE.as_bytes(), OWL_TRANSITIVE_PROPERTY.as_bytes(), AK::Iri, None, 0, FOREVER)
            .unwrap();
        for (s, o) in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e")] {
            let sub = format!("ex:{s}");
            let obj = format!("ex:{o}");
            store
                .add(sub.as_bytes(), AK::Iri, b"ex:p", obj.as_bytes(), AK::Iri, None, 0, FOREVER)
                .unwrap();
        }

        let inserted = materialize(&store, RuleSet::OWL_TRANSITIVE, 1).unwrap();
        assert_eq!(inserted, 3);

        let p = store.atoms().get_id(b"ex:p", AK::Iri).unwrap();
        let a = store.atoms().get_id(b"ex:a", AK::Iri).unwrap();
        let e = store.atoms().get_id(b"ex:e", AK::Iri).unwrap();
        // a->e is four hops away; one capped iteration only closes one hop.
        assert!(store.query_current(a, p, e, 0).is_empty());
    }
}
