//! Pull-based scan pipeline: compiles a `GroupPattern` tree into a tagged-
//! union `Scan` and drives it one row at a time.
//!
//! Grounded on `lib/oxigraph/src/sparql/eval.rs`'s enum-of-evaluation-node
//! shape, adapted here as a named-variant enum with `Box`-indirected
//! children rather than boxed closures, so a scan tree's stack footprint
//! grows with nesting depth through pointers rather than inlined state —
//! see DESIGN.md for why `QuadStore`'s already-materializing query methods
//! make "pull-based" mean "cursor over a prefetched batch" rather than a
//! page-at-a-time index walk here.

use super::filter::FilterEvaluator;
use super::parser::SparqlParser;
use super::{
    GroupPattern, PatternPlan, PlanExplanation, PushedFilter, Query, QueryForm,
    ServiceMaterializer, TemporalClause,
};
use crate::atom::{AtomId, AtomKind, AtomStore};
use crate::binding::{fnv1a_32, generated_hash, BindingTable, Value, VariableHash};
use crate::buffer::BufferManager;
use crate::error::{MercuryError, Result};
use crate::pattern::{PathKind, PatternBuffer, PatternSlot, TermSpan, TermType};
use crate::store::QuadStore;
use std::collections::{BTreeSet, VecDeque};

// ---- Term resolution --------------------------------------------------

/// A compiled triple-pattern position: either fixed to an interned atom or
/// bound dynamically against the row in progress.
#[derive(Debug, Clone, Copy)]
pub enum PatternTerm {
    Bound(AtomId),
    Variable(VariableHash),
}

fn raw_text(span: TermSpan, source: &str) -> &str {
    let start = span.source_start as usize;
    let len = span.source_len as usize;
    &source[start..start + len]
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&i| &hay[i..i + needle.len()] == needle)
}

fn unquote_literal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.is_empty() {
        return String::new();
    }
    let quote = bytes[0];
    if quote != b'"' && quote != b'\'' {
        return raw.to_string();
    }
    let triple = bytes.len() >= 6 && bytes[1] == quote && bytes[2] == quote;
    let start = if triple { 3 } else { 1 };
    let needle: Vec<u8> = if triple {
        vec![quote, quote, quote]
    } else {
        vec![quote]
    };
    match find_subslice(&bytes[start..], &needle) {
        Some(rel) => String::from_utf8_lossy(&bytes[start..start + rel]).to_string(),
        None => raw.to_string(),
    }
}

fn resolve_iri_text(span: TermSpan, source: &str, prefixes: &[(String, String)]) -> String {
    let raw = raw_text(span, source);
    if let Some(stripped) = raw.strip_prefix('<') {
        return stripped.trim_end_matches('>').to_string();
    }
    if raw.eq_ignore_ascii_case("a") {
        return "http://www.w3.org/1999/02/22-rdf-syntax-ns#type".to_string();
    }
    if let Some(idx) = raw.find(':') {
        let (prefix, rest) = raw.split_at(idx);
        let local = &rest[1..];
        if let Some((_, iri)) = prefixes.iter().find(|(p, _)| p == prefix) {
            return format!("{iri}{local}");
        }
    }
    raw.to_string()
}

/// The bytes and `AtomKind` a term span would intern as, without touching
/// the store. Shared by this module's read-path lookups and by the write
/// path (`update.rs`'s interning of the same term spans).
pub(super) fn term_bytes_and_kind(
    span: TermSpan,
    source: &str,
    prefixes: &[(String, String)],
) -> (Vec<u8>, AtomKind) {
    match span.term_type {
        TermType::Iri => (
            resolve_iri_text(span, source, prefixes).into_bytes(),
            AtomKind::Iri,
        ),
        TermType::BlankNode => (
            raw_text(span, source)
                .trim_start_matches("_:")
                .as_bytes()
                .to_vec(),
            AtomKind::BlankNode,
        ),
        TermType::Literal => (
            unquote_literal(raw_text(span, source)).into_bytes(),
            AtomKind::Literal,
        ),
        TermType::Variable | TermType::Generated => (Vec::new(), AtomKind::Literal),
    }
}

fn compile_term(
    span: TermSpan,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
) -> Result<PatternTerm> {
    match span.term_type {
        TermType::Variable => Ok(PatternTerm::Variable(fnv1a_32(
            raw_text(span, source).as_bytes(),
        ))),
        TermType::Generated => Ok(PatternTerm::Variable(generated_hash(span.source_start as u32))),
        _ => {
            let (bytes, kind) = term_bytes_and_kind(span, source, prefixes);
            Ok(PatternTerm::Bound(atoms.get_id(&bytes, kind)?))
        }
    }
}

/// Resolves `term` against the row in progress. `None` means the variable
/// is already bound to a value that can never equal an RDF atom (a
/// definite non-match); `Some(0)` means free.
fn resolve_runtime(term: &PatternTerm, bindings: &BindingTable) -> Option<u64> {
    match term {
        PatternTerm::Bound(id) => Some(*id),
        PatternTerm::Variable(hash) => match bindings.get(*hash) {
            None => Some(0),
            Some(Value::Atom(id)) => Some(*id),
            Some(_) => None,
        },
    }
}

// ---- Temporal frame -----------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum TemporalMode {
    Current,
    AsOf(u64),
    During(u64, u64),
    AllVersions,
}

impl TemporalMode {
    fn from_clause(
        clause: &TemporalClause,
        ev: &FilterEvaluator,
        bindings: &BindingTable,
    ) -> Result<Self> {
        match clause {
            TemporalClause::None => Ok(Self::Current),
            TemporalClause::AsOf(expr) => Ok(Self::AsOf(parse_temporal_instant(expr, ev, bindings)?)),
            TemporalClause::During(from, to) => Ok(Self::During(
                parse_temporal_instant(from, ev, bindings)?,
                parse_temporal_instant(to, ev, bindings)?,
            )),
            TemporalClause::AllVersions => Ok(Self::AllVersions),
        }
    }
}

fn parse_temporal_instant(expr: &str, ev: &FilterEvaluator, bindings: &BindingTable) -> Result<u64> {
    let value = ev.eval(expr, bindings)?;
    let text = match &value {
        Value::Inline(s) => s.clone(),
        Value::Number(n) => return Ok(*n as u64),
        Value::Atom(_) | Value::Bool(_) => String::new(),
    };
    if let Ok(n) = text.parse::<u64>() {
        return Ok(n);
    }
    parse_date_to_ticks(&text)
        .ok_or_else(|| MercuryError::InvalidOperation(format!("cannot interpret '{text}' as a temporal instant")))
}

/// `YYYY`, `YYYY-MM`, or `YYYY-MM-DD` to 100ns ticks at local midnight,
/// via Howard Hinnant's `days_from_civil` day-count (no calendar crate in
/// the dependency stack, and the computation is small/self-contained
/// enough not to warrant adding one).
fn parse_date_to_ticks(text: &str) -> Option<u64> {
    let mut parts = text.splitn(3, '-');
    let year: i64 = parts.next()?.parse().ok()?;
    let month: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let day: i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    let days = days_from_civil(year, month, day);
    let seconds = days.checked_mul(86_400)?;
    u64::try_from(seconds).ok()?.checked_mul(10_000_000)
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

// ---- Scan context -------------------------------------------------------

/// Everything a scan tree needs to resolve terms and read the store, built
/// once per query and threaded by reference through `build_scan`.
pub struct ScanContext<'a> {
    pub store: &'a QuadStore,
    pub source: &'a str,
    pub pbuf: &'a PatternBuffer<'a>,
    pub prefixes: &'a [(String, String)],
    pub temporal: TemporalMode,
    pub filter: FilterEvaluator<'a>,
    pub pool: &'a dyn BufferManager,
    pub service: Option<&'a dyn ServiceMaterializer>,
    pub cancelled: &'a dyn Fn() -> bool,
}

impl<'a> ScanContext<'a> {
    pub fn new(
        store: &'a QuadStore,
        query: &'a Query,
        source: &'a str,
        pbuf: &'a PatternBuffer<'a>,
        pool: &'a dyn BufferManager,
        service: Option<&'a dyn ServiceMaterializer>,
        cancelled: &'a dyn Fn() -> bool,
    ) -> Result<Self> {
        let filter = FilterEvaluator::new(store.atoms(), store.trigram());
        let temporal = TemporalMode::from_clause(&query.temporal, &filter, &BindingTable::new())?;
        Ok(Self {
            store,
            source,
            pbuf,
            prefixes: &query.prefixes,
            temporal,
            filter,
            pool,
            service,
            cancelled,
        })
    }
}

// ---- Scan tree -----------------------------------------------------------

pub enum Scan {
    /// Matches exactly once with no bindings (an empty `{}` group).
    Empty { emitted: bool },
    Triple(TriplePatternScan),
    Path(PropertyPathScan),
    Multi(MultiPatternScan),
    Optional(OptionalScan),
    Union(UnionScan),
    Minus(MinusScan),
    Bind(BindScan),
    Values(ValuesScan),
    Service(ServicePatternScan),
    SubQuery(SubQueryScan),
}

impl Scan {
    pub fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if (ctx.cancelled)() {
            return Err(MercuryError::Cancelled);
        }
        match self {
            Scan::Empty { emitted } => {
                if *emitted {
                    Ok(false)
                } else {
                    *emitted = true;
                    Ok(true)
                }
            }
            Scan::Triple(s) => s.move_next(ctx, bindings),
            Scan::Path(s) => s.move_next(ctx, bindings),
            Scan::Multi(s) => s.move_next(ctx, bindings),
            Scan::Optional(s) => s.move_next(ctx, bindings),
            Scan::Union(s) => s.move_next(ctx, bindings),
            Scan::Minus(s) => s.move_next(ctx, bindings),
            Scan::Bind(s) => s.move_next(ctx, bindings),
            Scan::Values(s) => s.move_next(ctx, bindings),
            Scan::Service(s) => s.move_next(ctx, bindings),
            Scan::SubQuery(s) => s.move_next(ctx, bindings),
        }
    }

    /// Drops cached rows so the next `move_next` call re-resolves bound
    /// positions against whatever the caller's row now looks like. Used by
    /// join/optional/minus scans to re-run their right side per left row.
    fn reset(&mut self) {
        match self {
            Scan::Empty { emitted } => *emitted = false,
            Scan::Triple(s) => s.rows = None,
            Scan::Path(s) => s.results = None,
            Scan::Multi(s) => {
                s.left.reset();
                s.right.reset();
                s.left_primed = false;
            }
            Scan::Optional(s) => {
                s.left.reset();
                s.right = None;
            }
            Scan::Union(s) => {
                s.left.reset();
                s.right.reset();
                s.on_left = true;
            }
            Scan::Minus(s) => {
                s.left.reset();
                s.right_rows = None;
            }
            Scan::Bind(s) => s.child.reset(),
            Scan::Values(s) => s.cursor = 0,
            Scan::Service(s) => s.rows = None,
            Scan::SubQuery(s) => s.cursor = 0,
        }
    }
}

// ---- TriplePatternScan ----------------------------------------------------

pub struct TriplePatternScan {
    pub subject: PatternTerm,
    pub predicate: PatternTerm,
    pub object: PatternTerm,
    pub graph: PatternTerm,
    rows: Option<Vec<(u64, u64, u64, u64)>>,
    cursor: usize,
}

impl TriplePatternScan {
    fn restart(&mut self, ctx: &ScanContext, bindings: &BindingTable) {
        let resolved = [
            resolve_runtime(&self.subject, bindings),
            resolve_runtime(&self.predicate, bindings),
            resolve_runtime(&self.object, bindings),
            resolve_runtime(&self.graph, bindings),
        ];
        let rows = match resolved {
            [Some(s), Some(p), Some(o), Some(g)] => match ctx.temporal {
                TemporalMode::Current => ctx.store.query_current(s, p, o, g),
                TemporalMode::AsOf(t) => ctx.store.query_as_of(s, p, o, g, t),
                TemporalMode::During(from, to) => ctx.store.query_during(s, p, o, g, from, to),
                TemporalMode::AllVersions => ctx
                    .store
                    .query_evolution(s, p, o, g)
                    .into_iter()
                    .map(|(s, p, o, g, _)| (s, p, o, g))
                    .collect(),
            },
            _ => Vec::new(),
        };
        self.rows = Some(rows);
        self.cursor = 0;
    }

    fn bind_row(&self, bindings: &mut BindingTable, row: (u64, u64, u64, u64)) -> bool {
        let (s, p, o, g) = row;
        let positions = [
            (&self.subject, s),
            (&self.predicate, p),
            (&self.object, o),
            (&self.graph, g),
        ];
        let mut seen: Vec<(VariableHash, u64)> = Vec::new();
        for (term, val) in positions {
            if let PatternTerm::Variable(hash) = term {
                if let Some((_, prev)) = seen.iter().find(|(h, _)| h == hash) {
                    if *prev != val {
                        return false;
                    }
                } else {
                    seen.push((*hash, val));
                }
            }
        }
        for (hash, val) in seen {
            bindings.set(hash, Value::Atom(val));
        }
        true
    }

    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.rows.is_none() {
            self.restart(ctx, bindings);
        }
        let rows = self.rows.as_ref().expect("restarted above");
        while self.cursor < rows.len() {
            let row = rows[self.cursor];
            self.cursor += 1;
            if self.bind_row(bindings, row) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---- PropertyPathScan ------------------------------------------------------

pub struct PropertyPathScan {
    pub predicate: AtomId,
    pub kind: PathKind,
    pub subject: PatternTerm,
    pub object: PatternTerm,
    results: Option<Vec<AtomId>>,
    cursor: usize,
    /// `true` once `restart` determines the subject side supplied the root
    /// and the object side is the one being bound from `results`; `false`
    /// for the reverse direction.
    free_is_object: bool,
}

impl PropertyPathScan {
    fn new(predicate: AtomId, kind: PathKind, subject: PatternTerm, object: PatternTerm) -> Self {
        Self {
            predicate,
            kind,
            subject,
            object,
            results: None,
            cursor: 0,
            free_is_object: true,
        }
    }

    fn bfs(store: &QuadStore, predicate: AtomId, from: AtomId, kind: PathKind, reverse: bool) -> Vec<AtomId> {
        let step = |node: AtomId| -> Vec<AtomId> {
            if reverse {
                store
                    .query_current(0, predicate, node, 0)
                    .into_iter()
                    .map(|(s, _, _, _)| s)
                    .collect()
            } else {
                store
                    .query_current(node, predicate, 0, 0)
                    .into_iter()
                    .map(|(_, _, o, _)| o)
                    .collect()
            }
        };
        match kind {
            PathKind::ZeroOrOne => {
                let mut results = vec![from];
                let mut seen = BTreeSet::from([from]);
                for next in step(from) {
                    if seen.insert(next) {
                        results.push(next);
                    }
                }
                results
            }
            PathKind::ZeroOrMore | PathKind::OneOrMore => {
                let mut visited = BTreeSet::new();
                let mut results = Vec::new();
                if kind == PathKind::ZeroOrMore {
                    results.push(from);
                    visited.insert(from);
                }
                let mut frontier = VecDeque::from([from]);
                let mut seen_frontier = BTreeSet::from([from]);
                while let Some(node) = frontier.pop_front() {
                    for next in step(node) {
                        if visited.insert(next) {
                            results.push(next);
                        }
                        if seen_frontier.insert(next) {
                            frontier.push_back(next);
                        }
                    }
                }
                results
            }
            PathKind::None | PathKind::Inverse => unreachable!("handled as a plain triple scan"),
        }
    }

    fn restart(&mut self, ctx: &ScanContext, bindings: &BindingTable) {
        let subject = resolve_runtime(&self.subject, bindings);
        match subject {
            Some(from) if from != 0 => {
                self.free_is_object = true;
                self.results = Some(Self::bfs(ctx.store, self.predicate, from, self.kind, false));
            }
            _ => match resolve_runtime(&self.object, bindings) {
                Some(to) if to != 0 => {
                    self.free_is_object = false;
                    self.results = Some(Self::bfs(ctx.store, self.predicate, to, self.kind, true));
                }
                // Both endpoints unbound: no starting point to BFS from.
                _ => self.results = Some(Vec::new()),
            },
        }
        self.cursor = 0;
    }

    fn bind_candidate(&self, bindings: &mut BindingTable, candidate: AtomId) -> bool {
        let free_term = if self.free_is_object {
            &self.object
        } else {
            &self.subject
        };
        match free_term {
            PatternTerm::Variable(hash) => {
                bindings.set(*hash, Value::Atom(candidate));
                true
            }
            PatternTerm::Bound(id) => *id == candidate,
        }
    }

    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.results.is_none() {
            self.restart(ctx, bindings);
        }
        let results = self.results.as_ref().expect("restarted above");
        while self.cursor < results.len() {
            let candidate = results[self.cursor];
            self.cursor += 1;
            if self.bind_candidate(bindings, candidate) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---- MultiPatternScan (binary nested-loop join) ---------------------------

pub struct MultiPatternScan {
    left: Box<Scan>,
    right: Box<Scan>,
    left_primed: bool,
}

impl MultiPatternScan {
    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        loop {
            if !self.left_primed {
                if !self.left.move_next(ctx, bindings)? {
                    return Ok(false);
                }
                self.left_primed = true;
                self.right.reset();
            }
            if self.right.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.left_primed = false;
        }
    }
}

fn join(left: Scan, right: Scan) -> Scan {
    Scan::Multi(MultiPatternScan {
        left: Box::new(left),
        right: Box::new(right),
        left_primed: false,
    })
}

// ---- OptionalScan -----------------------------------------------------------

pub struct OptionalScan {
    left: Box<Scan>,
    right_group: GroupPattern,
    graph: PatternTerm,
    right: Option<Box<Scan>>,
    left_bindings: BindingTable,
    matched_right: bool,
}

impl OptionalScan {
    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        loop {
            if self.right.is_none() {
                if !self.left.move_next(ctx, bindings)? {
                    return Ok(false);
                }
                self.left_bindings = bindings.clone();
                let mut right = Box::new(build_scan(ctx, &self.right_group, self.graph)?);
                right.reset();
                self.right = Some(right);
                self.matched_right = false;
            }
            let mut scratch = self.left_bindings.clone();
            let right = self.right.as_mut().expect("primed above");
            if right.move_next(ctx, &mut scratch)? {
                self.matched_right = true;
                *bindings = scratch;
                return Ok(true);
            }
            self.right = None;
            if !self.matched_right {
                *bindings = self.left_bindings.clone();
                return Ok(true);
            }
        }
    }
}

// ---- UnionScan ---------------------------------------------------------------

pub struct UnionScan {
    left: Box<Scan>,
    right: Box<Scan>,
    on_left: bool,
}

impl UnionScan {
    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.on_left {
            if self.left.move_next(ctx, bindings)? {
                return Ok(true);
            }
            self.on_left = false;
        }
        self.right.move_next(ctx, bindings)
    }
}

fn union(branches: Vec<Scan>) -> Scan {
    let mut iter = branches.into_iter();
    let first = iter.next().unwrap_or(Scan::Empty { emitted: true });
    iter.fold(first, |acc, next| {
        Scan::Union(UnionScan {
            left: Box::new(acc),
            right: Box::new(next),
            on_left: true,
        })
    })
}

// ---- MinusScan ---------------------------------------------------------------

pub struct MinusScan {
    left: Box<Scan>,
    right_group: GroupPattern,
    graph: PatternTerm,
    right_rows: Option<Vec<BindingTable>>,
}

impl MinusScan {
    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.right_rows.is_none() {
            let mut right = build_scan(ctx, &self.right_group, self.graph)?;
            let mut rows = Vec::new();
            let mut row = BindingTable::new();
            while right.move_next(ctx, &mut row)? {
                rows.push(row.clone());
            }
            self.right_rows = Some(rows);
        }
        loop {
            if !self.left.move_next(ctx, bindings)? {
                return Ok(false);
            }
            let right_rows = self.right_rows.as_ref().expect("primed above");
            let excluded = right_rows.iter().any(|r| bindings.shares_and_agrees_with(r));
            if !excluded {
                return Ok(true);
            }
        }
    }
}

// ---- BindScan -----------------------------------------------------------------

pub struct BindScan {
    child: Box<Scan>,
    expr: String,
    variable: VariableHash,
}

impl BindScan {
    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if !self.child.move_next(ctx, bindings)? {
            return Ok(false);
        }
        let value = ctx.filter.eval(&self.expr, bindings)?;
        bindings.set(self.variable, value);
        Ok(true)
    }
}

// ---- ValuesScan ---------------------------------------------------------------

pub struct ValuesScan {
    variable: VariableHash,
    values: Vec<Option<String>>,
    cursor: usize,
}

impl ValuesScan {
    fn move_next(&mut self, _ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.cursor >= self.values.len() {
            return Ok(false);
        }
        if let Some(text) = &self.values[self.cursor] {
            bindings.set(self.variable, Value::Inline(text.clone()));
        } else {
            bindings.unset(self.variable);
        }
        self.cursor += 1;
        Ok(true)
    }
}

// ---- ServicePatternScan ---------------------------------------------------------

pub struct ServicePatternScan {
    iri: String,
    inner_query: String,
    silent: bool,
    rows: Option<Vec<(AtomId, AtomId, AtomId)>>,
    cursor: usize,
    subject_hash: VariableHash,
    predicate_hash: VariableHash,
    object_hash: VariableHash,
}

impl ServicePatternScan {
    fn restart(&mut self, ctx: &ScanContext) -> Result<()> {
        let Some(materializer) = ctx.service else {
            self.rows = Some(Vec::new());
            return Ok(());
        };
        match materializer.materialize(&self.iri, &self.inner_query) {
            Ok(materialized) => {
                self.rows = Some(
                    materialized
                        .query_current(0, 0, 0, 0)
                        .into_iter()
                        .map(|(s, p, o, _g)| (s, p, o))
                        .collect(),
                );
            }
            Err(e) if self.silent => {
                tracing::warn!(iri = %self.iri, error = %e, "SERVICE SILENT swallowed a failure");
                self.rows = Some(Vec::new());
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn move_next(&mut self, ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.rows.is_none() {
            self.restart(ctx)?;
        }
        let rows = self.rows.as_ref().expect("restarted above");
        if self.cursor >= rows.len() {
            return Ok(false);
        }
        let (s, p, o, _g) = {
            let (s, p, o) = rows[self.cursor];
            (s, p, o, 0)
        };
        self.cursor += 1;
        bindings.set(self.subject_hash, Value::Atom(s));
        bindings.set(self.predicate_hash, Value::Atom(p));
        bindings.set(self.object_hash, Value::Atom(o));
        Ok(true)
    }
}

// ---- SubQueryScan -----------------------------------------------------------

pub struct SubQueryScan {
    rows: Vec<BindingTable>,
    cursor: usize,
}

impl SubQueryScan {
    fn build(ctx: &ScanContext, source: &str) -> Result<Self> {
        let (inner_query, inner_pbuf, inner_group) =
            SparqlParser::parse_query(source, ctx.pool, crate::pattern::DEFAULT_CAPACITY)
                .map_err(MercuryError::Parse)?;
        let inner_ctx = ScanContext {
            store: ctx.store,
            source,
            pbuf: &inner_pbuf,
            prefixes: &inner_query.prefixes,
            temporal: TemporalMode::Current,
            filter: FilterEvaluator::new(ctx.store.atoms(), ctx.store.trigram()),
            pool: ctx.pool,
            service: ctx.service,
            cancelled: ctx.cancelled,
        };
        let rows = run_select(&inner_query, &inner_pbuf, &inner_group, &inner_ctx)?;
        Ok(Self { rows, cursor: 0 })
    }

    fn move_next(&mut self, _ctx: &ScanContext, bindings: &mut BindingTable) -> Result<bool> {
        if self.cursor >= self.rows.len() {
            return Ok(false);
        }
        bindings.merge_from(&self.rows[self.cursor]);
        self.cursor += 1;
        Ok(true)
    }
}

// ---- Plan building --------------------------------------------------------

fn triple_scan(
    ctx: &ScanContext,
    subject: TermSpan,
    predicate: TermSpan,
    object: TermSpan,
    path: PathKind,
    path_iri_start: i32,
    path_iri_len: i32,
    graph: PatternTerm,
) -> Result<Scan> {
    let subject = compile_term(subject, ctx.source, ctx.prefixes, ctx.store.atoms())?;
    let object = compile_term(object, ctx.source, ctx.prefixes, ctx.store.atoms())?;
    match path {
        PathKind::None => {
            let predicate = compile_term(predicate, ctx.source, ctx.prefixes, ctx.store.atoms())?;
            Ok(Scan::Triple(TriplePatternScan {
                subject,
                predicate,
                object,
                graph,
                rows: None,
                cursor: 0,
            }))
        }
        PathKind::Inverse => {
            let path_span = TermSpan {
                term_type: TermType::Iri,
                source_start: path_iri_start,
                source_len: path_iri_len,
            };
            let predicate = compile_term(path_span, ctx.source, ctx.prefixes, ctx.store.atoms())?;
            // `^p`: swap subject/object of the underlying edge.
            Ok(Scan::Triple(TriplePatternScan {
                subject: object,
                predicate,
                object: subject,
                graph,
                rows: None,
                cursor: 0,
            }))
        }
        _ => {
            let path_span = TermSpan {
                term_type: TermType::Iri,
                source_start: path_iri_start,
                source_len: path_iri_len,
            };
            let (bytes, kind) = term_bytes_and_kind(path_span, ctx.source, ctx.prefixes);
            let predicate_id = ctx.store.atoms().get_id(&bytes, kind)?;
            Ok(Scan::Path(PropertyPathScan::new(predicate_id, path, subject, object)))
        }
    }
}

fn build_bgp_scan(ctx: &ScanContext, slots: &[usize], pbuf: &PatternBuffer, graph: PatternTerm) -> Result<Scan> {
    let mut acc: Option<Scan> = None;
    for &index in slots {
        match pbuf.get(index) {
            Some(PatternSlot::Triple {
                subject,
                predicate,
                object,
                path,
                path_iri_start,
                path_iri_len,
            }) => {
                let next = triple_scan(
                    ctx,
                    subject,
                    predicate,
                    object,
                    path,
                    path_iri_start,
                    path_iri_len,
                    graph,
                )?;
                acc = Some(match acc {
                    None => next,
                    Some(prev) => join(prev, next),
                });
            }
            Some(PatternSlot::Bind {
                expr_start,
                expr_len,
                var_start,
                var_len,
            }) => {
                let expr = ctx.source[expr_start as usize..(expr_start + expr_len) as usize].to_string();
                let variable = fnv1a_32(
                    ctx.source[var_start as usize..(var_start + var_len) as usize].as_bytes(),
                );
                let child = acc.unwrap_or(Scan::Empty { emitted: false });
                acc = Some(Scan::Bind(BindScan {
                    child: Box::new(child),
                    expr,
                    variable,
                }));
            }
            // FILTER slots are applied by `run_select` as level filters, not
            // compiled into the scan tree itself.
            Some(PatternSlot::Filter { .. }) | None => {}
            Some(other) => {
                return Err(MercuryError::InvalidOperation(format!(
                    "unexpected pattern slot in a basic graph pattern: {other:?}"
                )))
            }
        }
    }
    Ok(acc.unwrap_or(Scan::Empty { emitted: false }))
}

fn build_values_scan(pbuf: &PatternBuffer, header_index: usize, source: &str) -> Result<Scan> {
    let Some(PatternSlot::ValuesHeader {
        var_start,
        var_len,
        entry_count,
    }) = pbuf.get(header_index)
    else {
        return Err(MercuryError::InvalidOperation("VALUES header slot missing".into()));
    };
    let variable = fnv1a_32(source[var_start as usize..(var_start + var_len) as usize].as_bytes());
    let mut values = Vec::with_capacity(entry_count as usize);
    for i in 0..entry_count as usize {
        match pbuf.get(header_index + 1 + i) {
            Some(PatternSlot::ValuesEntry { value_start, value_len }) => {
                let text = &source[value_start as usize..(value_start + value_len) as usize];
                if text.eq_ignore_ascii_case("UNDEF") {
                    values.push(None);
                } else if text.starts_with('"') || text.starts_with('\'') {
                    values.push(Some(unquote_literal(text)));
                } else {
                    values.push(Some(text.trim_start_matches('<').trim_end_matches('>').to_string()));
                }
            }
            _ => return Err(MercuryError::InvalidOperation("VALUES entry slot missing".into())),
        }
    }
    Ok(Scan::Values(ValuesScan {
        variable,
        values,
        cursor: 0,
    }))
}

fn build_group_elements(
    ctx: &ScanContext,
    elements: &[GroupPattern],
    pbuf: &PatternBuffer,
    graph: PatternTerm,
) -> Result<Scan> {
    let mut acc: Option<Scan> = None;
    for element in elements {
        match element {
            GroupPattern::Optional(inner) => {
                let left = acc.take().ok_or_else(|| {
                    MercuryError::InvalidOperation("OPTIONAL with no preceding pattern".into())
                })?;
                acc = Some(Scan::Optional(OptionalScan {
                    left: Box::new(left),
                    right_group: (**inner).clone(),
                    graph,
                    right: None,
                    left_bindings: BindingTable::new(),
                    matched_right: false,
                }));
            }
            GroupPattern::Minus(inner) => {
                let left = acc.take().ok_or_else(|| {
                    MercuryError::InvalidOperation("MINUS with no preceding pattern".into())
                })?;
                acc = Some(Scan::Minus(MinusScan {
                    left: Box::new(left),
                    right_group: (**inner).clone(),
                    graph,
                    right_rows: None,
                }));
            }
            other => {
                let next = build_scan(ctx, other, graph)?;
                acc = Some(match acc {
                    None => next,
                    Some(prev) => join(prev, next),
                });
            }
        }
    }
    Ok(acc.unwrap_or(Scan::Empty { emitted: false }))
}

/// Compiles one `GroupPattern` node into a `Scan`. `graph` is the currently
/// active graph term (the default graph, `PatternTerm::Bound(0)`, unless
/// nested inside a GRAPH clause).
pub fn build_scan(ctx: &ScanContext, group: &GroupPattern, graph: PatternTerm) -> Result<Scan> {
    match group {
        GroupPattern::Bgp(slots) => {
            // Separate VALUES-less triple/bind slots are already folded by
            // the parser into one Bgp; no ValuesHeader ever appears here
            // since VALUES is its own `GroupPattern::Values` element.
            build_bgp_scan(ctx, slots, ctx.pbuf, graph)
        }
        GroupPattern::Group(elements) => build_group_elements(ctx, elements, ctx.pbuf, graph),
        GroupPattern::Optional(inner) => Ok(Scan::Optional(OptionalScan {
            left: Box::new(Scan::Empty { emitted: false }),
            right_group: (**inner).clone(),
            graph,
            right: None,
            left_bindings: BindingTable::new(),
            matched_right: false,
        })),
        GroupPattern::Minus(inner) => Ok(Scan::Minus(MinusScan {
            left: Box::new(Scan::Empty { emitted: false }),
            right_group: (**inner).clone(),
            graph,
            right_rows: None,
        })),
        GroupPattern::Union(branches) => {
            let compiled: Result<Vec<Scan>> =
                branches.iter().map(|b| build_scan(ctx, b, graph)).collect();
            Ok(union(compiled?))
        }
        GroupPattern::Graph(name, inner) => {
            let graph_term = resolve_graph_name(ctx, name)?;
            build_scan(ctx, inner, graph_term)
        }
        GroupPattern::Values(slot) => build_values_scan(ctx.pbuf, *slot, ctx.source),
        GroupPattern::Service { iri, silent, inner } => Ok(Scan::Service(ServicePatternScan {
            iri: iri.clone(),
            inner_query: inner.clone(),
            silent: *silent,
            rows: None,
            cursor: 0,
            subject_hash: fnv1a_32(b"?s"),
            predicate_hash: fnv1a_32(b"?p"),
            object_hash: fnv1a_32(b"?o"),
        })),
        GroupPattern::SubQuery(text) => Ok(Scan::SubQuery(SubQueryScan::build(ctx, text)?)),
    }
}

fn resolve_graph_name(ctx: &ScanContext, name: &str) -> Result<PatternTerm> {
    if let Some(var) = name.strip_prefix('?').or_else(|| name.strip_prefix('$')) {
        return Ok(PatternTerm::Variable(fnv1a_32(var.as_bytes())));
    }
    let iri = if let Some(idx) = name.find(':') {
        let (prefix, rest) = name.split_at(idx);
        match ctx.prefixes.iter().find(|(p, _)| p == prefix) {
            Some((_, base)) => format!("{base}{}", &rest[1..]),
            None => name.to_string(),
        }
    } else {
        name.to_string()
    };
    Ok(PatternTerm::Bound(ctx.store.atoms().get_id(iri.as_bytes(), AtomKind::Iri)?))
}

// ---- Filter pushdown & query execution -----------------------------------

/// Variables a filter expression references, by scanning its tokens for
/// `TokenKind::Variable` rather than parsing it (cheap over-approximation;
/// a false positive only delays a filter's pushdown point, never its
/// correctness).
fn filter_variables(expr: &str) -> Vec<VariableHash> {
    use super::lexer::{Lexer, TokenKind};
    let mut lexer = Lexer::new(expr);
    let mut vars = Vec::new();
    while let Ok(token) = lexer.next_token() {
        if token.kind == TokenKind::Eof {
            break;
        }
        if token.kind == TokenKind::Variable {
            vars.push(fnv1a_32(token.text(expr).as_bytes()));
        }
    }
    vars
}

fn filter_is_exists(expr: &str) -> bool {
    let trimmed = expr.trim_start();
    trimmed.len() >= 6 && trimmed[..6].eq_ignore_ascii_case("EXISTS")
        || trimmed.len() >= 10 && trimmed[..3].eq_ignore_ascii_case("NOT") && trimmed[3..].trim_start().len() >= 6
}

/// Variable hashes a triple slot's subject/predicate/object positions bind.
fn triple_slot_variables(slot: PatternSlot, source: &str) -> Vec<VariableHash> {
    match slot {
        PatternSlot::Triple {
            subject, predicate, object, ..
        } => [subject, predicate, object]
            .into_iter()
            .filter(|t| t.term_type == TermType::Variable)
            .map(|t| fnv1a_32(raw_text(t, source).as_bytes()))
            .collect(),
        PatternSlot::Bind { var_start, var_len, .. } => {
            vec![fnv1a_32(source[var_start as usize..(var_start + var_len) as usize].as_bytes())]
        }
        _ => Vec::new(),
    }
}

/// Collects a level-indexed filter pushdown plan: for each filter slot not
/// containing EXISTS/NOT EXISTS, the index (into `triple_indices`, the
/// subsequence of `slots` that bind variables) of the earliest point at
/// which every variable the filter references is already bound. EXISTS-bearing filters are always
/// placed after the full BGP, since a nested scan needs every outer binding
/// available to seed its own free variables.
fn plan_filter_pushdown(
    ctx: &ScanContext,
    pbuf: &PatternBuffer,
    slots: &[usize],
) -> Vec<(usize, usize)> {
    let triple_indices: Vec<usize> = slots
        .iter()
        .copied()
        .filter(|&i| {
            matches!(
                pbuf.get(i),
                Some(PatternSlot::Triple { .. }) | Some(PatternSlot::Bind { .. })
            )
        })
        .collect();
    let mut plan = Vec::new();
    for &index in slots {
        let Some(PatternSlot::Filter { source_start, source_len }) = pbuf.get(index) else {
            continue;
        };
        let expr = &ctx.source[source_start as usize..(source_start + source_len) as usize];
        if filter_is_exists(expr) {
            plan.push((index, triple_indices.len().saturating_sub(1)));
            continue;
        }
        let needed: BTreeSet<VariableHash> = filter_variables(expr).into_iter().collect();
        let mut bound = BTreeSet::new();
        let mut level = triple_indices.len().saturating_sub(1);
        for (pos, &triple_index) in triple_indices.iter().enumerate() {
            if let Some(slot) = pbuf.get(triple_index) {
                bound.extend(triple_slot_variables(slot, ctx.source));
            }
            if needed.iter().all(|v| bound.contains(v)) {
                level = pos;
                break;
            }
        }
        plan.push((index, level));
    }
    plan
}

/// Runs `group` to exhaustion, collecting every solution row.
pub fn run_select(
    query: &Query,
    pbuf: &PatternBuffer,
    group: &GroupPattern,
    ctx: &ScanContext,
) -> Result<Vec<BindingTable>> {
    let mut scan = build_scan(ctx, group, PatternTerm::Bound(0))?;
    let filters: Vec<(usize, usize)> = match group {
        GroupPattern::Bgp(slots) => plan_filter_pushdown(ctx, pbuf, slots),
        GroupPattern::Group(elements) => elements
            .iter()
            .filter_map(|e| match e {
                GroupPattern::Bgp(slots) => Some(slots.clone()),
                _ => None,
            })
            .flat_map(|slots| plan_filter_pushdown(ctx, pbuf, &slots))
            .collect(),
        _ => Vec::new(),
    };
    let _ = &query.form;
    let mut rows = Vec::new();
    let mut row = BindingTable::new();
    while scan.move_next(ctx, &mut row)? {
        if filters
            .iter()
            .all(|(slot, _)| eval_filter_slot(ctx, pbuf, *slot, &row).unwrap_or(false))
        {
            rows.push(row.clone());
        }
        row.clear();
        if matches!(query.form, Some(QueryForm::Ask)) && !rows.is_empty() {
            break;
        }
    }
    Ok(rows)
}

fn eval_filter_slot(ctx: &ScanContext, pbuf: &PatternBuffer, slot: usize, row: &BindingTable) -> Result<bool> {
    let Some(PatternSlot::Filter { source_start, source_len }) = pbuf.get(slot) else {
        return Ok(true);
    };
    let expr = &ctx.source[source_start as usize..(source_start + source_len) as usize];
    if filter_is_exists(expr) {
        return eval_exists_filter(ctx, expr, row);
    }
    ctx.filter.eval_bool(expr, row)
}

/// EXISTS/NOT EXISTS as the entirety of a filter expression: parses the
/// inner `{...}` as a standalone WHERE clause and checks whether it
/// produces at least one row against the current bindings. A restricted but
/// common case — EXISTS nested inside a larger boolean expression falls
/// back to `FilterEvaluator`'s single `__exists` pseudo-binding.
fn eval_exists_filter(ctx: &ScanContext, expr: &str, row: &BindingTable) -> Result<bool> {
    let trimmed = expr.trim_start();
    let (negate, rest) = if trimmed[..3].eq_ignore_ascii_case("NOT") {
        (true, trimmed[3..].trim_start())
    } else {
        (false, trimmed)
    };
    let brace = rest.find('{').ok_or_else(|| {
        MercuryError::InvalidOperation("EXISTS filter missing its block".to_string())
    })?;
    let block = &rest[brace..];
    let wrapped = format!("SELECT * WHERE {block}");
    let (_inner_query, inner_pbuf, inner_group) =
        SparqlParser::parse_query(&wrapped, ctx.pool, crate::pattern::DEFAULT_CAPACITY)
            .map_err(MercuryError::Parse)?;
    let inner_ctx = ScanContext {
        store: ctx.store,
        source: &wrapped,
        pbuf: &inner_pbuf,
        prefixes: ctx.prefixes,
        temporal: ctx.temporal,
        filter: FilterEvaluator::new(ctx.store.atoms(), ctx.store.trigram()),
        pool: ctx.pool,
        service: ctx.service,
        cancelled: ctx.cancelled,
    };
    let mut scan = build_scan(&inner_ctx, &inner_group, PatternTerm::Bound(0))?;
    let mut scratch = row.clone();
    let exists = scan.move_next(&inner_ctx, &mut scratch)?;
    Ok(if negate { !exists } else { exists })
}

pub fn explain(query: &Query, pbuf: &PatternBuffer, group: &GroupPattern, ctx: &ScanContext) -> PlanExplanation {
    let mut pattern_plans = Vec::new();
    let mut pushed_filters = Vec::new();
    let bgps: Vec<Vec<usize>> = match group {
        GroupPattern::Bgp(slots) => vec![slots.clone()],
        GroupPattern::Group(elements) => elements
            .iter()
            .filter_map(|e| match e {
                GroupPattern::Bgp(slots) => Some(slots.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    for slots in &bgps {
        for &index in slots {
            if let Some(PatternSlot::Triple { subject, predicate, object, .. }) = pbuf.get(index) {
                let bound_prefix_len = [subject, predicate, object]
                    .iter()
                    .take_while(|t| t.term_type != TermType::Variable)
                    .count() as u8;
                let index_used = if subject.term_type != TermType::Variable {
                    "spot"
                } else if predicate.term_type != TermType::Variable {
                    "post"
                } else if object.term_type != TermType::Variable {
                    "ospt"
                } else {
                    "gspot"
                };
                pattern_plans.push(PatternPlan {
                    slot_index: index,
                    index_used,
                    bound_prefix_len,
                });
            }
        }
        for (slot, level) in plan_filter_pushdown(ctx, pbuf, slots) {
            pushed_filters.push(PushedFilter {
                filter_slot_index: slot,
                applied_after_pattern: level,
            });
        }
    }
    let _ = &query.select;
    PlanExplanation {
        pattern_plans,
        pushed_filters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomKind;
    use crate::buffer::PooledBufferManager;
    use crate::store::{now_ticks, StoreConfig};

    fn no_cancel() -> bool {
        false
    }

    fn setup() -> (tempfile::TempDir, QuadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    fn run(store: &QuadStore, text: &str) -> Vec<BindingTable> {
        let pool = PooledBufferManager::new();
        let (query, pbuf, group) = SparqlParser::parse_query(text, &pool, 32).unwrap();
        let cancel = no_cancel;
        let ctx = ScanContext::new(store, &query, text, &pbuf, &pool, None, &cancel).unwrap();
        run_select(&query, &pbuf, &group, &ctx).unwrap()
    }

    #[test]
    fn scenario_a_select_star_returns_every_quad() {
        let (_dir, store) = setup();
        store
            .add(b"a", AtomKind::Iri, b"p", b"o", AtomKind::Iri, None, 0, u64::MAX)
            .unwrap();
        let rows = run(&store, "SELECT * WHERE { ?s ?p ?o }");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn join_across_two_patterns_requires_shared_variable() {
        let (_dir, store) = setup();
        store
            .add(b"a", AtomKind::Iri, b"knows", b"b", AtomKind::Iri, None, 0, u64::MAX)
            .unwrap();
        store
            .add(b"b", AtomKind::Iri, b"age", b"30", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        let rows = run(
            &store,
            "SELECT ?x ?age WHERE { <a> <knows> ?x . ?x <age> ?age }",
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn optional_yields_left_row_when_right_has_no_match() {
        let (_dir, store) = setup();
        store
            .add(b"a", AtomKind::Iri, b"name", b"Alice", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        let rows = run(
            &store,
            "SELECT ?n ?age WHERE { ?s <name> ?n OPTIONAL { ?s <age> ?age } }",
        );
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_bound(fnv1a_32(b"?age")));
    }

    #[test]
    fn minus_excludes_rows_agreeing_on_shared_variables() {
        let (_dir, store) = setup();
        store
            .add(b"a", AtomKind::Iri, b"p", b"1", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        store
            .add(b"a", AtomKind::Iri, b"blocked", b"true", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        store
            .add(b"b", AtomKind::Iri, b"p", b"2", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        let rows = run(
            &store,
            "SELECT ?s WHERE { ?s <p> ?v MINUS { ?s <blocked> ?x } }",
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn minus_keeps_rows_when_domains_do_not_intersect() {
        let (_dir, store) = setup();
        store
            .add(b"a", AtomKind::Iri, b"p", b"1", AtomKind::Literal, None, 0, u64::MAX)
            .unwrap();
        store
            .add(b"x", AtomKind::Iri, b"blocked", b"y", AtomKind::Iri, None, 0, u64::MAX)
            .unwrap();
        let rows = run(
            &store,
            "SELECT ?s ?v WHERE { ?s <p> ?v MINUS { ?x <blocked> ?y } }",
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn property_path_plus_scenario_d() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"knows", b"b", AtomKind::Iri, None, 0, u64::MAX).unwrap();
        store.add(b"b", AtomKind::Iri, b"knows", b"c", AtomKind::Iri, None, 0, u64::MAX).unwrap();
        let rows = run(&store, "SELECT ?x WHERE { <a> <knows>+ ?x }");
        assert_eq!(rows.len(), 2);
        let rows = run(&store, "SELECT ?x WHERE { <a> <knows>* ?x }");
        assert_eq!(rows.len(), 3);
        let rows = run(&store, "SELECT ?x WHERE { <a> <knows>? ?x }");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn bind_adds_a_computed_value() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"age", b"30", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        let rows = run(&store, "SELECT ?doubled WHERE { ?s <age> ?age BIND(?age * 2 AS ?doubled) }");
        assert_eq!(rows[0].get(fnv1a_32(b"?doubled")), Some(&Value::Number(60.0)));
    }

    #[test]
    fn values_block_joins_with_upstream() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"p", b"x", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        let rows = run(&store, r#"SELECT ?s WHERE { ?s <p> ?o VALUES ?o { "x" "y" } }"#);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn filter_is_applied_after_the_join() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"age", b"17", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        store.add(b"b", AtomKind::Iri, b"age", b"30", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        let rows = run(&store, "SELECT ?s WHERE { ?s <age> ?age FILTER(?age > 18) }");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn as_of_respects_validity_interval() {
        let (_dir, store) = setup();
        store.add(b"alice", AtomKind::Iri, b"worksFor", b"Acme", AtomKind::Iri, None, 100, 200).unwrap();
        store.add(b"alice", AtomKind::Iri, b"worksFor", b"Anthropic", AtomKind::Iri, None, 200, u64::MAX).unwrap();
        let rows = run(&store, "SELECT ?c WHERE { <alice> <worksFor> ?c } AS OF \"150\"");
        assert_eq!(rows.len(), 1);
        let rows = run(&store, "SELECT ?c WHERE { <alice> <worksFor> ?c } ALL VERSIONS");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn union_streams_both_branches() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"p1", b"x", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        store.add(b"b", AtomKind::Iri, b"p2", b"y", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        let rows = run(
            &store,
            "SELECT ?s WHERE { { ?s <p1> ?v } UNION { ?s <p2> ?v } }",
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn sub_query_materializes_inner_select() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"p", b"o", AtomKind::Iri, None, 0, u64::MAX).unwrap();
        let rows = run(
            &store,
            "SELECT ?s WHERE { { SELECT ?s WHERE { ?s <p> ?o } } }",
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn exists_filter_checks_for_a_matching_pattern() {
        let (_dir, store) = setup();
        store.add(b"a", AtomKind::Iri, b"age", b"30", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        store.add(b"a", AtomKind::Iri, b"flagged", b"true", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        store.add(b"b", AtomKind::Iri, b"age", b"25", AtomKind::Literal, None, 0, u64::MAX).unwrap();
        let rows = run(
            &store,
            "SELECT ?s WHERE { ?s <age> ?age FILTER EXISTS { ?s <flagged> ?f } }",
        );
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn quad_store_reexports_now_ticks_for_temporal_tests() {
        assert!(now_ticks() > 0);
    }
}
