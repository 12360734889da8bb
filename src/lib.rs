//! Mercury: an embedded RDF quad store with a SPARQL 1.1 query/update
//! engine and bitemporal-lite temporal extensions (every quad carries a
//! `[valid_from, valid_to)` validity interval alongside its S/P/O/G).
//!
//! Module layout mirrors `lib/oxigraph`'s split between storage
//! (`store`, `atom`, `wal`, `trigram`) and query processing (`sparql`'s
//! parser/filter/scan/aggregate/update files), with a flat
//! `pattern`/`binding` representation standing in for `spargebra`'s heap
//! AST and `QuerySolutionIter`. This file is the thin facade a consumer
//! tool links against: `run_query`, `load`, `statistics`, `explain`.

pub mod atom;
pub mod binding;
pub mod buffer;
pub mod error;
pub mod pattern;
#[cfg(feature = "reasoning")]
pub mod reasoner;
pub mod sparql;
pub mod store;
pub mod trigram;
pub mod wal;

use crate::atom::{AtomId, AtomStore};
use crate::binding::{BindingTable, Value};
use crate::buffer::BufferManager;
use crate::error::{MercuryError, Result};
use crate::pattern::DEFAULT_CAPACITY;
use crate::sparql::aggregate;
use crate::sparql::lexer::{Lexer, TokenKind};
use crate::sparql::scan::{self, ScanContext};
use crate::sparql::update;
use crate::sparql::{PlanExplanation, Query, QueryForm, QuadCallback, RdfParser, ServiceMaterializer, SparqlParser};
use crate::store::QuadStore;
use crate::wal::Op;
use std::io::Read;

/// Runs one SPARQL statement against `store`: a query (SELECT/ASK/
/// CONSTRUCT/DESCRIBE) or an update (INSERT DATA/DELETE DATA/DELETE
/// WHERE/Modify/CLEAR/DROP/CREATE/COPY/MOVE/ADD), chosen by the first
/// keyword after any PREFIX/BASE prologue.
///
/// SELECT/ASK rows stream through `on_row`, one call per solution (ASK
/// calls it at most once, for its single yes/no row). CONSTRUCT and
/// DESCRIBE stream quads through `on_quad` instead. Updates produce no
/// callback traffic; check `store.get_statistics()` before/after to see
/// their effect.
///
/// Returns `0` on success, `1` if `source` failed to parse or execution
/// failed partway (parse errors and runtime failures are both "invalid
/// input" from a caller's perspective; neither leaves partial state, since
/// updates run as one batch and query scans never mutate the store).
#[allow(clippy::too_many_arguments)]
pub fn run_query(
    store: &QuadStore,
    source: &str,
    pool: &dyn BufferManager,
    service: Option<&dyn ServiceMaterializer>,
    cancelled: &dyn Fn() -> bool,
    on_row: &mut dyn FnMut(&BindingTable),
    on_quad: &mut dyn QuadCallback,
) -> i32 {
    match run_query_inner(store, source, pool, service, cancelled, on_row, on_quad) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_query_inner(
    store: &QuadStore,
    source: &str,
    pool: &dyn BufferManager,
    service: Option<&dyn ServiceMaterializer>,
    cancelled: &dyn Fn() -> bool,
    on_row: &mut dyn FnMut(&BindingTable),
    on_quad: &mut dyn QuadCallback,
) -> Result<()> {
    if is_update_statement(source)? {
        update::execute(store, source, pool, service)?;
        return Ok(());
    }

    let (query, pbuf, group) =
        SparqlParser::parse_query(source, pool, DEFAULT_CAPACITY).map_err(MercuryError::Parse)?;
    let ctx = ScanContext::new(store, &query, source, &pbuf, pool, service, cancelled)?;
    let rows = scan::run_select(&query, &pbuf, &group, &ctx)?;
    // CONSTRUCT/ASK/DESCRIBE queries never set `query.select`, so
    // `aggregate::run` takes its early "nothing to do" exit for them and
    // only SELECT's modifiers (GROUP BY/HAVING/DISTINCT/ORDER BY/LIMIT)
    // actually apply here — a CONSTRUCT with e.g. LIMIT does not limit its
    // constructed triples, same as CONSTRUCT bypassing aggregation. See
    // DESIGN.md.
    let rows = aggregate::run(&query, rows, store.atoms(), &ctx.filter)?;

    match query.form {
        Some(QueryForm::Construct) => {
            let body = query.construct_template.as_deref().unwrap_or_default();
            let (template, template_source) = update::parse_template(body)?;
            update::materialize_construct(&rows, &template, &template_source, store.atoms(), |s, p, o, g| {
                on_quad(s, p, o, if g == 0 { None } else { Some(g) });
            })?;
        }
        Some(QueryForm::Describe) => {
            for row in &rows {
                for id in describe_targets(&query, source, store.atoms(), row)? {
                    for (s, p, o, g) in store.query_current(id, 0, 0, 0) {
                        on_quad(s, p, o, if g == 0 { None } else { Some(g) });
                    }
                }
            }
        }
        _ => {
            for row in &rows {
                on_row(row);
            }
        }
    }
    Ok(())
}

/// `DESCRIBE ?x, <iri>` names specific targets to resolve per row;
/// `DESCRIBE *` (an empty `describe_targets`) means every atom bound in
/// that row.
fn describe_targets(query: &Query, source: &str, atoms: &AtomStore, row: &BindingTable) -> Result<Vec<AtomId>> {
    if query.describe_targets.is_empty() {
        return Ok(row
            .iter()
            .filter_map(|(_, v)| match v {
                Value::Atom(id) => Some(*id),
                _ => None,
            })
            .collect());
    }
    let mut ids = Vec::with_capacity(query.describe_targets.len());
    for term in &query.describe_targets {
        if let Some(id) = update::resolve_for_delete(*term, source, &query.prefixes, atoms, row)? {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Classifies `source` by its first keyword after any PREFIX/BASE
/// prologue: SELECT/ASK/CONSTRUCT/DESCRIBE is a query, anything else
/// (INSERT/DELETE/CLEAR/DROP/CREATE/COPY/MOVE/ADD, or a malformed source
/// that isn't a query either) is handed to the update parser, which will
/// itself reject it if it isn't valid.
fn is_update_statement(source: &str) -> Result<bool> {
    let mut lexer = Lexer::new(source);
    loop {
        let tok = lexer.next_token().map_err(MercuryError::Parse)?;
        match tok.kind {
            TokenKind::Eof => return Ok(false),
            TokenKind::Keyword => match tok.text(source).to_ascii_uppercase().as_str() {
                "PREFIX" => {
                    lexer.next_token().map_err(MercuryError::Parse)?;
                    lexer.next_token().map_err(MercuryError::Parse)?;
                }
                "BASE" => {
                    lexer.next_token().map_err(MercuryError::Parse)?;
                }
                "SELECT" | "ASK" | "CONSTRUCT" | "DESCRIBE" => return Ok(false),
                _ => return Ok(true),
            },
            _ => return Ok(true),
        }
    }
}

/// Reads quads out of `input` via `parser` and adds them to `store`,
/// returning the count received. Interning and WAL placement happen
/// per-quad through the same `add_ids` path `update::execute` uses for
/// `INSERT DATA`; a parser that wants atomic all-or-nothing loading should
/// wrap its own call in `store.begin_batch()`/`commit_batch()`.
pub fn load(store: &QuadStore, input: &mut dyn Read, parser: &dyn RdfParser) -> Result<u64> {
    let mut count = 0u64;
    let mut cb = |s: AtomId, p: AtomId, o: AtomId, g: Option<AtomId>| {
        match store.add_ids(s, p, o, g.unwrap_or(0), crate::store::now_ticks(), crate::store::index::FOREVER, Op::Add) {
            Ok(()) => count += 1,
            Err(err) => tracing::warn!(?err, "load: add_ids failed for a parsed quad, skipping"),
        }
    };
    parser.parse(input, &mut cb).map_err(MercuryError::Parse)?;
    Ok(count)
}

/// Thin passthrough to `QuadStore::get_statistics`, kept as a free
/// function so it sits alongside `run_query`/`load`/`explain` in one
/// consumer-facing surface instead of sending callers back into `store`.
pub fn statistics(store: &QuadStore) -> store::Statistics {
    store.get_statistics()
}

/// Parses `source` as a query and returns the plan `run_query` would have
/// executed, without running it: which index each triple pattern would
/// scan on, and which filters the planner pushed down to which pattern.
pub fn explain(store: &QuadStore, source: &str, pool: &dyn BufferManager) -> Result<PlanExplanation> {
    let (query, pbuf, group) =
        SparqlParser::parse_query(source, pool, DEFAULT_CAPACITY).map_err(MercuryError::Parse)?;
    let no_cancel = || false;
    let ctx = ScanContext::new(store, &query, source, &pbuf, pool, None, &no_cancel)?;
    Ok(scan::explain(&query, &pbuf, &group, &ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferManager;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, QuadStore) {
        let dir = tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn run_query_inserts_then_selects() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let no_cancel = || false;
        let mut rows = Vec::new();
        let mut quads = Vec::new();

        let code = run_query(
            &store,
            "INSERT DATA { <urn:a> <urn:p> <urn:b> }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |s, p, o, g| quads.push((s, p, o, g)),
        );
        assert_eq!(code, 0);

        let code = run_query(
            &store,
            "SELECT ?o WHERE { <urn:a> <urn:p> ?o }",
            &pool,
            None,
            &no_cancel,
            &mut |row: &BindingTable| rows.push(row.clone()),
            &mut |s, p, o, g| quads.push((s, p, o, g)),
        );
        assert_eq!(code, 0);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn run_query_rejects_malformed_source() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let no_cancel = || false;
        let code = run_query(
            &store,
            "SELECT ?x WHERE { ?x ?y ",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |_, _, _, _| {},
        );
        assert_eq!(code, 1);
    }

    #[test]
    fn construct_emits_templated_quads() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let no_cancel = || false;
        run_query(
            &store,
            "INSERT DATA { <urn:a> <urn:p> <urn:b> }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |_, _, _, _| {},
        );

        let mut quads = Vec::new();
        let code = run_query(
            &store,
            "CONSTRUCT { ?s <urn:copyOf> ?o } WHERE { ?s <urn:p> ?o }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |s, p, o, g| quads.push((s, p, o, g)),
        );
        assert_eq!(code, 0);
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].3, None);
    }

    #[test]
    fn describe_emits_the_concise_bounded_description() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let no_cancel = || false;
        run_query(
            &store,
            "INSERT DATA { <urn:a> <urn:p> <urn:b> . <urn:a> <urn:q> <urn:c> }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |_, _, _, _| {},
        );

        let mut quads = Vec::new();
        let code = run_query(
            &store,
            "DESCRIBE ?s WHERE { ?s <urn:p> <urn:b> }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |s, p, o, g| quads.push((s, p, o, g)),
        );
        assert_eq!(code, 0);
        assert_eq!(quads.len(), 2);
    }

    #[test]
    fn load_adds_every_quad_the_parser_yields() {
        struct FixedParser;
        impl RdfParser for FixedParser {
            fn parse(&self, _input: &mut dyn Read, cb: &mut dyn QuadCallback) -> std::result::Result<(), error::ParseError> {
                let store = QuadStore::open(tempdir().unwrap().path(), StoreConfig::default()).unwrap();
                let a = store.atoms().intern_iri("urn:a").unwrap();
                let p = store.atoms().intern_iri("urn:p").unwrap();
                let b = store.atoms().intern_iri("urn:b").unwrap();
                cb(a, p, b, None);
                Ok(())
            }
        }
        let (_dir, store) = open_store();
        let mut cursor = std::io::empty();
        let n = load(&store, &mut cursor, &FixedParser).unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get_statistics().quad_count, 1);
    }

    #[test]
    fn explain_reports_an_index_per_pattern() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let plan = explain(&store, "SELECT ?o WHERE { <urn:a> <urn:p> ?o }", &pool).unwrap();
        assert_eq!(plan.pattern_plans.len(), 1);
    }

    #[test]
    fn statistics_reflects_inserted_quads() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let no_cancel = || false;
        run_query(
            &store,
            "INSERT DATA { <urn:a> <urn:p> <urn:b> }",
            &pool,
            None,
            &no_cancel,
            &mut |_| {},
            &mut |_, _, _, _| {},
        );
        assert_eq!(statistics(&store).quad_count, 1);
    }
}
