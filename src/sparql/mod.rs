//! SPARQL surface: parsing (§4.5), filter evaluation (§4.6), scanning
//! (§4.7), aggregation/modifiers (§4.8), and updates (§4.9).
//!
//! Module wiring follows `lib/oxigraph/src/sparql/mod.rs`'s split between a
//! parser crate, an `algebra`-shaped query header, an `eval` execution
//! layer, and an `update` module — adapted here around the flat
//! `PatternBuffer`/`GroupPattern` representation instead of `spargebra`'s
//! heap `Query`/`GraphPattern` AST.

pub mod aggregate;
pub mod filter;
pub mod lexer;
pub mod parser;
pub mod scan;
pub mod update;

use crate::atom::AtomId;
use crate::error::{MercuryError, ParseError};
use crate::pattern::TermSpan;
use crate::store::QuadStore;
use std::io::Read;

pub use lexer::Lexer;
pub use parser::SparqlParser;

/// The four SPARQL query forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryForm {
    Select,
    Ask,
    Construct,
    Describe,
}

/// One projected column: either a bare variable, or `(expr AS ?var)` with
/// the expression kept verbatim so aggregate functions (`COUNT`, `SUM`, ...)
/// survive into `aggregate::run` instead of being discarded at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectItem {
    Var(String),
    Expr { expr: String, var: String },
}

impl SelectItem {
    pub fn var_name(&self) -> &str {
        match self {
            SelectItem::Var(v) => v,
            SelectItem::Expr { var, .. } => var,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectClause {
    Star,
    Distinct(Vec<SelectItem>),
    Reduced(Vec<SelectItem>),
    Plain(Vec<SelectItem>),
}

/// Solution modifiers, kept as source spans/variable names rather than
/// pre-evaluated since GROUP BY/HAVING/ORDER BY expressions reuse
/// `FilterEvaluator` at execution time (§4.8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolutionModifier {
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<(String, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Temporal suffix appended after solution modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporalClause {
    None,
    AsOf(String),
    During(String, String),
    AllVersions,
}

impl Default for TemporalClause {
    fn default() -> Self {
        Self::None
    }
}

/// The non-pattern half of a parsed query: form, projection, prefixes,
/// modifiers, temporal suffix, and (for GRAPH/WITH) the active graph.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub form: Option<QueryForm>,
    pub select: Option<SelectClause>,
    pub prefixes: Vec<(String, String)>,
    pub modifier: SolutionModifier,
    pub temporal: TemporalClause,
    pub with_graph: Option<String>,
    /// Raw, brace-stripped text of a CONSTRUCT query's template block, kept
    /// as text rather than parsed into `update::QuadPattern`s at parse time
    /// so it reuses `update::parse_template` (and that module's `TermSpan`
    /// resolution) the same way `DELETE WHERE`/`Modify` reuse `SparqlParser`.
    pub construct_template: Option<String>,
    /// Variables or IRIs named directly after `DESCRIBE`. Resolved against
    /// the WHERE solutions at execution time; a bare `DESCRIBE <iri>` with
    /// no WHERE clause is out of scope (every query form here requires one).
    pub describe_targets: Vec<TermSpan>,
}

/// One node of the WHERE-clause nesting tree. The flat `PatternBuffer` only
/// ever holds leaf content (Triple/Filter/Bind/ValuesHeader/ValuesEntry);
/// the nesting structure for OPTIONAL/UNION/MINUS/GRAPH lives here instead,
/// as slot-index ranges into that buffer plus (for GRAPH) the graph term
/// itself. This is a parse-time tree sized to the query text, not a
/// per-token allocation, so it does not conflict with the "no heap
/// allocation per token" tokenizer invariant — see DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupPattern {
    /// A basic graph pattern: a run of slot indices (triples/filters/binds)
    /// in the `PatternBuffer` that must all match together.
    Bgp(Vec<usize>),
    /// Left-joins its pattern against whatever precedes it in the
    /// enclosing `Group`'s element list (there is no separate "left" field:
    /// the fold happens at scan-build time over `Group`'s elements).
    Optional(Box<GroupPattern>),
    /// Subtracts its pattern from whatever precedes it in the enclosing
    /// `Group`, by the same left-fold convention as `Optional`.
    Minus(Box<GroupPattern>),
    Union(Vec<GroupPattern>),
    Graph(String, Box<GroupPattern>),
    /// An ordered sequence of elements joined left to right; `Optional`/
    /// `Minus` elements apply to the join of everything before them.
    Group(Vec<GroupPattern>),
    Values(usize),
    Service { iri: String, silent: bool, inner: String },
    /// A `{ SELECT ... }` sub-query: captured as raw text and re-parsed by
    /// `ScanPipeline::build_scan` when the enclosing query is planned,
    /// mirroring `Service`'s raw-text capture.
    SubQuery(String),
}

/// The `parse(stream, cb(s,p,o[,g]))` contract RDF serialization parsers are
/// expected to satisfy; concrete serialization formats are out of core scope.
pub trait QuadCallback: FnMut(AtomId, AtomId, AtomId, Option<AtomId>) {}
impl<F: FnMut(AtomId, AtomId, AtomId, Option<AtomId>)> QuadCallback for F {}

pub trait RdfParser {
    fn parse(&self, input: &mut dyn Read, cb: &mut dyn QuadCallback) -> Result<(), ParseError>;
}

/// Consumed by `ServicePatternScan` to execute a `SERVICE <iri> { ... }`
/// clause against an external endpoint.
pub trait ServiceMaterializer {
    fn materialize(&self, service_iri: &str, inner_query: &str) -> Result<QuadStore, MercuryError>;
}

/// A structured `explain()` result, exposing
/// the chosen index per pattern and the pushdown decision per filter
/// without requiring the out-of-core CLI/REPL presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanExplanation {
    pub pattern_plans: Vec<PatternPlan>,
    pub pushed_filters: Vec<PushedFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternPlan {
    pub slot_index: usize,
    pub index_used: &'static str,
    pub bound_prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedFilter {
    pub filter_slot_index: usize,
    pub applied_after_pattern: usize,
}
