//! SPARQL 1.1 Update: `INSERT DATA`/`DELETE DATA`/`DELETE WHERE`/`Modify`,
//! and the graph-management forms `CLEAR`/`DROP`/`CREATE`/`COPY`/`MOVE`/`ADD`
//! (§4.9).
//!
//! Grounded on `lib/oxigraph/src/sparql/update.rs`'s split between a
//! `SimpleUpdateEvaluator` (one method per update form, graph scoping
//! threaded through a `GraphName` parameter) and a separate update-statement
//! parser; this module owns both sides itself rather than splitting them
//! across a `spargebra`-equivalent crate, mirroring how `parser.rs` already
//! writes straight into this crate's own representation instead of
//! producing a borrowed AST. The token cursor below is a fresh, simpler
//! sibling of `parser.rs`'s `Parser` (no property paths, no filters, no
//! nested groups) rather than a shared type, since `Parser` is private to
//! its module and the update grammar doesn't need most of what it does.

use super::lexer::{Lexer, Token, TokenKind};
use super::parser::SparqlParser;
use super::scan::{self, term_bytes_and_kind, ScanContext};
use super::ServiceMaterializer;
use crate::atom::{AtomId, AtomKind, AtomStore};
use crate::binding::{fnv1a_32, BindingTable, Value};
use crate::buffer::BufferManager;
use crate::error::{MercuryError, ParseError, Result};
use crate::pattern::{TermSpan, TermType};
use crate::store::index::FOREVER;
use crate::store::{now_ticks, QuadStore};
use crate::wal::Op;
use std::collections::HashMap;

// ---- AST ----------------------------------------------------------------

/// One triple inside a `QuadData`/`QuadPattern` block, with its enclosing
/// `GRAPH` term if any.
#[derive(Debug, Clone)]
pub struct QuadPattern {
    pub subject: TermSpan,
    pub predicate: TermSpan,
    pub object: TermSpan,
    pub graph: Option<TermSpan>,
}

/// `DEFAULT` / `GRAPH <iri>` / `NAMED` / `ALL`, used by `CLEAR`/`DROP` and
/// (minus `NAMED`/`ALL`, which aren't valid there) `COPY`/`MOVE`/`ADD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphTarget {
    Default,
    Graph(String),
    Named,
    All,
}

#[derive(Debug, Clone)]
pub enum UpdateOperation {
    InsertData(Vec<QuadPattern>),
    DeleteData(Vec<QuadPattern>),
    DeleteWhere {
        template: Vec<QuadPattern>,
        where_text: String,
    },
    Modify {
        with_graph: Option<String>,
        delete_template: Vec<QuadPattern>,
        insert_template: Vec<QuadPattern>,
        where_text: String,
    },
    Clear(GraphTarget),
    Drop(GraphTarget),
    Create(String),
    Copy { from: GraphTarget, to: GraphTarget },
    Move { from: GraphTarget, to: GraphTarget },
    Add { from: GraphTarget, to: GraphTarget },
}

/// Counts produced by one `execute` call, for callers that want a summary
/// without re-querying the store (mirrors `store::Statistics`'s shape).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub operations: u64,
    pub quads_inserted: u64,
    pub quads_deleted: u64,
}

// ---- Parsing --------------------------------------------------------------

struct UpdateParser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> UpdateParser<'a> {
    fn new(source: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token().map_err(MercuryError::Parse)?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(Self { source, tokens, pos: 0 })
    }

    fn peek(&self) -> Token {
        self.tokens[self.pos]
    }

    fn text(&self, token: Token) -> &'a str {
        token.text(self.source)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> MercuryError {
        let token = self.peek();
        MercuryError::Parse(ParseError::new(token.line, token.column, message))
    }

    fn is_keyword(&self, kw: &str) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Keyword && self.text(token).eq_ignore_ascii_case(kw)
    }

    fn is_punct(&self, p: &str) -> bool {
        let token = self.peek();
        token.kind == TokenKind::Punct && self.text(token) == p
    }

    fn is_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.is_punct(p) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}'")))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.is_keyword(kw) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn parse_iri_or_prefixed(&mut self) -> Result<String> {
        let token = self.peek();
        match token.kind {
            TokenKind::Iri => {
                self.advance();
                Ok(strip_iri(self.text(token)))
            }
            TokenKind::PrefixedName => {
                self.advance();
                Ok(self.text(token).to_string())
            }
            _ => Err(self.error("expected an IRI")),
        }
    }

    // ---- Update unit ----------------------------------------------------

    fn parse_prologue(&mut self, prefixes: &mut Vec<(String, String)>) -> Result<()> {
        loop {
            if self.is_keyword("PREFIX") {
                self.advance();
                let prefix_token = self.peek();
                if prefix_token.kind != TokenKind::PrefixedName {
                    return Err(self.error("expected a prefix like 'ex:'"));
                }
                self.advance();
                let iri_token = self.peek();
                if iri_token.kind != TokenKind::Iri {
                    return Err(self.error("expected an IRI after PREFIX"));
                }
                self.advance();
                let prefix = self.text(prefix_token).trim_end_matches(':').to_string();
                prefixes.push((prefix, strip_iri(self.text(iri_token))));
            } else if self.is_keyword("BASE") {
                self.advance();
                if self.peek().kind != TokenKind::Iri {
                    return Err(self.error("expected an IRI after BASE"));
                }
                self.advance();
            } else {
                return Ok(());
            }
        }
    }

    fn parse_operations(&mut self) -> Result<Vec<UpdateOperation>> {
        let mut prefixes = Vec::new();
        self.parse_prologue(&mut prefixes)?;
        let mut ops = Vec::new();
        loop {
            if self.is_eof() {
                break;
            }
            ops.push(self.parse_operation(&prefixes)?);
            if self.is_punct(";") {
                self.advance();
                self.parse_prologue(&mut prefixes)?;
                continue;
            }
            break;
        }
        Ok(ops)
    }

    fn parse_operation(&mut self, prefixes: &[(String, String)]) -> Result<UpdateOperation> {
        if self.eat_keyword("INSERT") {
            if self.eat_keyword("DATA") {
                Ok(UpdateOperation::InsertData(self.parse_quad_block(prefixes)?))
            } else {
                self.parse_modify(None, Vec::new(), prefixes)
            }
        } else if self.eat_keyword("DELETE") {
            if self.eat_keyword("DATA") {
                Ok(UpdateOperation::DeleteData(self.parse_quad_block(prefixes)?))
            } else if self.eat_keyword("WHERE") {
                let open = self.peek();
                let inner_start = open.start + open.len;
                let template = self.parse_quad_block(prefixes)?;
                let close = self.tokens[self.pos.saturating_sub(1)];
                let where_text = self.source[inner_start..close.start].to_string();
                Ok(UpdateOperation::DeleteWhere { template, where_text })
            } else {
                let template = self.parse_quad_block(prefixes)?;
                self.parse_modify(None, template, prefixes)
            }
        } else if self.eat_keyword("WITH") {
            let graph = self.parse_iri_or_prefixed()?;
            let with_graph = Some(resolve_named(&graph, prefixes));
            if self.eat_keyword("DELETE") {
                let template = self.parse_quad_block(prefixes)?;
                self.parse_modify(with_graph, template, prefixes)
            } else if self.eat_keyword("INSERT") {
                self.pos -= 1; // replay INSERT for parse_modify's own check
                self.parse_modify(with_graph, Vec::new(), prefixes)
            } else {
                Err(self.error("expected DELETE or INSERT after WITH <graph>"))
            }
        } else if self.eat_keyword("CLEAR") {
            self.eat_keyword("SILENT");
            Ok(UpdateOperation::Clear(self.parse_graph_ref_all(prefixes)?))
        } else if self.eat_keyword("DROP") {
            self.eat_keyword("SILENT");
            Ok(UpdateOperation::Drop(self.parse_graph_ref_all(prefixes)?))
        } else if self.eat_keyword("CREATE") {
            self.eat_keyword("SILENT");
            self.expect_keyword("GRAPH")?;
            Ok(UpdateOperation::Create(resolve_named(&self.parse_iri_or_prefixed()?, prefixes)))
        } else if self.eat_keyword("COPY") {
            self.eat_keyword("SILENT");
            let from = self.parse_graph_or_default(prefixes)?;
            self.expect_keyword("TO")?;
            let to = self.parse_graph_or_default(prefixes)?;
            Ok(UpdateOperation::Copy { from, to })
        } else if self.eat_keyword("MOVE") {
            self.eat_keyword("SILENT");
            let from = self.parse_graph_or_default(prefixes)?;
            self.expect_keyword("TO")?;
            let to = self.parse_graph_or_default(prefixes)?;
            Ok(UpdateOperation::Move { from, to })
        } else if self.eat_keyword("ADD") {
            self.eat_keyword("SILENT");
            let from = self.parse_graph_or_default(prefixes)?;
            self.expect_keyword("TO")?;
            let to = self.parse_graph_or_default(prefixes)?;
            Ok(UpdateOperation::Add { from, to })
        } else {
            Err(self.error("expected an update operation"))
        }
    }

    /// `Modify`'s tail once any leading `WITH`/`DELETE` has already been
    /// consumed: an optional `INSERT` template, then `WHERE { ... }`.
    fn parse_modify(
        &mut self,
        with_graph: Option<String>,
        delete_template: Vec<QuadPattern>,
        prefixes: &[(String, String)],
    ) -> Result<UpdateOperation> {
        let insert_template = if self.eat_keyword("INSERT") {
            self.parse_quad_block(prefixes)?
        } else {
            Vec::new()
        };
        while self.eat_keyword("USING") {
            self.eat_keyword("NAMED");
            self.parse_iri_or_prefixed()?;
        }
        self.expect_keyword("WHERE")?;
        let where_text = self.capture_balanced_text("{", "}")?;
        Ok(UpdateOperation::Modify {
            with_graph,
            delete_template,
            insert_template,
            where_text,
        })
    }

    fn parse_graph_ref_all(&mut self, prefixes: &[(String, String)]) -> Result<GraphTarget> {
        if self.eat_keyword("DEFAULT") {
            Ok(GraphTarget::Default)
        } else if self.eat_keyword("NAMED") {
            Ok(GraphTarget::Named)
        } else if self.eat_keyword("ALL") {
            Ok(GraphTarget::All)
        } else if self.eat_keyword("GRAPH") {
            Ok(GraphTarget::Graph(resolve_named(&self.parse_iri_or_prefixed()?, prefixes)))
        } else {
            Err(self.error("expected DEFAULT, NAMED, ALL, or GRAPH <iri>"))
        }
    }

    fn parse_graph_or_default(&mut self, prefixes: &[(String, String)]) -> Result<GraphTarget> {
        if self.eat_keyword("DEFAULT") {
            Ok(GraphTarget::Default)
        } else {
            self.eat_keyword("GRAPH");
            Ok(GraphTarget::Graph(resolve_named(&self.parse_iri_or_prefixed()?, prefixes)))
        }
    }

    fn capture_balanced_text(&mut self, open: &str, close: &str) -> Result<String> {
        self.expect_punct(open)?;
        let start = self.peek().start;
        let mut depth = 1;
        let mut end = start;
        loop {
            if self.is_eof() {
                return Err(self.error(format!("unterminated '{open}' block")));
            }
            if self.is_punct(open) {
                depth += 1;
            } else if self.is_punct(close) {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            let token = self.advance();
            end = token.start + token.len;
        }
        self.advance(); // closing brace
        Ok(self.source[start..end].to_string())
    }

    // ---- Quad blocks ------------------------------------------------------

    fn parse_quad_block(&mut self, prefixes: &[(String, String)]) -> Result<Vec<QuadPattern>> {
        let _ = prefixes;
        self.expect_punct("{")?;
        let mut quads = Vec::new();
        while !self.is_punct("}") && !self.is_eof() {
            if self.eat_keyword("GRAPH") {
                let graph = self.parse_term()?;
                self.expect_punct("{")?;
                while !self.is_punct("}") && !self.is_eof() {
                    self.parse_triples(Some(graph), &mut quads)?;
                }
                self.expect_punct("}")?;
            } else {
                self.parse_triples(None, &mut quads)?;
            }
        }
        self.expect_punct("}")?;
        Ok(quads)
    }

    fn parse_triples(&mut self, graph: Option<TermSpan>, out: &mut Vec<QuadPattern>) -> Result<()> {
        let subject = self.parse_term()?;
        self.parse_predicate_object_list(subject, graph, out)?;
        if self.is_punct(".") {
            self.advance();
        }
        Ok(())
    }

    fn parse_predicate_object_list(
        &mut self,
        subject: TermSpan,
        graph: Option<TermSpan>,
        out: &mut Vec<QuadPattern>,
    ) -> Result<()> {
        loop {
            let predicate = self.parse_predicate_term()?;
            loop {
                let object = self.parse_term()?;
                out.push(QuadPattern { subject, predicate, object, graph });
                if self.is_punct(",") {
                    self.advance();
                    continue;
                }
                break;
            }
            if self.is_punct(";") {
                self.advance();
                if self.is_punct(".") || self.is_punct("}") {
                    break;
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn parse_predicate_term(&mut self) -> Result<TermSpan> {
        if self.is_keyword("a") {
            let token = self.advance();
            return Ok(TermSpan {
                term_type: TermType::Iri,
                source_start: token.start as i32,
                source_len: token.len as i32,
            });
        }
        self.parse_term()
    }

    /// Adapted from `parser.rs`'s term grammar minus property paths and the
    /// `[]` anonymous-node shorthand, which have no place inside ground/
    /// template quad data.
    fn parse_term(&mut self) -> Result<TermSpan> {
        let token = self.peek();
        let term_type = match token.kind {
            TokenKind::Variable => TermType::Variable,
            TokenKind::Iri | TokenKind::PrefixedName => TermType::Iri,
            TokenKind::BlankNode => TermType::BlankNode,
            TokenKind::String | TokenKind::Number => TermType::Literal,
            TokenKind::Keyword if self.text(token).eq_ignore_ascii_case("a") => TermType::Iri,
            _ => return Err(self.error("expected a triple-pattern term")),
        };
        self.advance();
        let mut end = token.start + token.len;
        if term_type == TermType::Literal {
            if self.is_punct("^^") {
                self.advance();
                let dt = self.peek();
                if dt.kind == TokenKind::Iri || dt.kind == TokenKind::PrefixedName {
                    end = dt.start + dt.len;
                    self.advance();
                }
            } else if self.peek().kind == TokenKind::Punct && self.text(self.peek()).starts_with('@') {
                let lang = self.advance();
                end = lang.start + lang.len;
            }
        }
        Ok(TermSpan {
            term_type,
            source_start: token.start as i32,
            source_len: (end - token.start) as i32,
        })
    }
}

fn strip_iri(text: &str) -> String {
    text.trim_start_matches('<').trim_end_matches('>').to_string()
}

fn resolve_named(text: &str, prefixes: &[(String, String)]) -> String {
    if text.starts_with("http://") || text.starts_with("https://") || text.starts_with("urn:") {
        return text.to_string();
    }
    if let Some(idx) = text.find(':') {
        let (prefix, rest) = text.split_at(idx);
        let local = &rest[1..];
        if let Some((_, iri)) = prefixes.iter().find(|(p, _)| p == prefix) {
            return format!("{iri}{local}");
        }
    }
    text.to_string()
}

pub fn parse(source: &str) -> Result<Vec<UpdateOperation>> {
    UpdateParser::new(source)?.parse_operations()
}

/// Parses a brace-stripped `{...}`-body triple template — e.g. a CONSTRUCT
/// query's template, captured by `SparqlParser` the same way
/// `capture_balanced_text` strips `DELETE`/`INSERT` templates — into
/// `QuadPattern`s plus the exact wrapped source string their `TermSpan`
/// offsets are relative to. Callers must resolve those spans against the
/// returned string, not the original `body`.
pub fn parse_template(body: &str) -> Result<(Vec<QuadPattern>, String)> {
    let wrapped = format!("{{{body}}}");
    let quads = UpdateParser::new(&wrapped)?.parse_quad_block(&[])?;
    Ok((quads, wrapped))
}

/// Resolves a `CONSTRUCT` template against each already-computed WHERE
/// solution, calling `emit(s, p, o, g)` for every template triple with all
/// three terms bound (unbound variables silently drop that triple for that
/// row, matching `run_template_update`'s insert side). Each row gets its own
/// fresh `BlankScope`, so a blank node label repeated in the template names
/// a different node per solution.
pub fn materialize_construct(
    rows: &[BindingTable],
    template: &[QuadPattern],
    source: &str,
    atoms: &AtomStore,
    mut emit: impl FnMut(AtomId, AtomId, AtomId, AtomId),
) -> Result<()> {
    let prefixes: &[(String, String)] = &[];
    let with_graph: Option<String> = None;
    let mut blank_counter: u64 = 0;
    for row in rows {
        let mut blanks = BlankScope { atoms, seen: HashMap::new(), counter: &mut blank_counter };
        for q in template {
            let Some(s) = resolve_for_insert(q.subject, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let Some(p) = resolve_for_insert(q.predicate, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let Some(o) = resolve_for_insert(q.object, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let g = resolve_graph_for_insert(q.graph, &with_graph, source, prefixes, atoms, row)?;
            emit(s, p, o, g);
        }
    }
    Ok(())
}

// ---- Execution ------------------------------------------------------------

fn raw_text(span: TermSpan, source: &str) -> &str {
    &source[span.source_start as usize..(span.source_start + span.source_len) as usize]
}

/// Fresh-per-match scope for blank node labels in a DELETE/INSERT template
/// (DESIGN.md Open Question decision 2): reset once per WHERE solution,
/// shared across that solution's delete and insert passes so a label
/// repeated in both templates names the same fresh node.
struct BlankScope<'a> {
    atoms: &'a AtomStore,
    seen: HashMap<String, AtomId>,
    counter: &'a mut u64,
}

impl<'a> BlankScope<'a> {
    fn resolve(&mut self, label: &str) -> Result<AtomId> {
        if let Some(&id) = self.seen.get(label) {
            return Ok(id);
        }
        *self.counter += 1;
        let fresh = format!("\u{0}update-fresh-{}-{}", *self.counter, label);
        let id = self.atoms.intern(fresh.as_bytes(), AtomKind::BlankNode)?;
        self.seen.insert(label.to_string(), id);
        Ok(id)
    }
}

/// Resolves a template term to an atom id for insertion: ground terms are
/// interned (creating them if new), variables must already be bound by the
/// matched WHERE row, and blank nodes get a label fresh to this match.
fn resolve_for_insert(
    term: TermSpan,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
    row: &BindingTable,
    blanks: &mut BlankScope,
) -> Result<Option<AtomId>> {
    match term.term_type {
        TermType::Variable => {
            let hash = fnv1a_32(raw_text(term, source).as_bytes());
            match row.get(hash) {
                Some(Value::Atom(id)) => Ok(Some(*id)),
                _ => Ok(None),
            }
        }
        TermType::BlankNode => {
            let label = raw_text(term, source).trim_start_matches("_:");
            Ok(Some(blanks.resolve(label)?))
        }
        _ => {
            let (bytes, kind) = term_bytes_and_kind(term, source, prefixes);
            Ok(Some(atoms.intern(&bytes, kind)?))
        }
    }
}

/// Same resolution for a deletion target, but ground terms and fresh blank
/// nodes that were never actually written resolve to `None` (nothing to
/// delete) rather than being interned. Also reused by `lib.rs` to resolve a
/// `DESCRIBE` target against a WHERE row without interning anything new.
pub(crate) fn resolve_for_delete(
    term: TermSpan,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
    row: &BindingTable,
) -> Result<Option<AtomId>> {
    match term.term_type {
        TermType::Variable => {
            let hash = fnv1a_32(raw_text(term, source).as_bytes());
            match row.get(hash) {
                Some(Value::Atom(id)) => Ok(Some(*id)),
                _ => Ok(None),
            }
        }
        // A blank node spelled directly in a DELETE template names a node
        // fresh to this match, which by construction never matched anything
        // already in the store.
        TermType::BlankNode => Ok(None),
        _ => {
            let (bytes, kind) = term_bytes_and_kind(term, source, prefixes);
            let id = atoms.get_id(&bytes, kind)?;
            Ok(if id == 0 { None } else { Some(id) })
        }
    }
}

fn resolve_graph_for_insert(
    pattern_graph: Option<TermSpan>,
    with_graph: &Option<String>,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
    row: &BindingTable,
) -> Result<AtomId> {
    if let Some(term) = pattern_graph {
        return match resolve_for_insert_ground_or_var(term, source, prefixes, atoms, row)? {
            Some(id) => Ok(id),
            None => Ok(0),
        };
    }
    match with_graph {
        Some(iri) => atoms.intern_iri(iri),
        None => Ok(0),
    }
}

fn resolve_graph_for_delete(
    pattern_graph: Option<TermSpan>,
    with_graph: &Option<String>,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
    row: &BindingTable,
) -> Result<AtomId> {
    if let Some(term) = pattern_graph {
        return match resolve_for_delete(term, source, prefixes, atoms, row)? {
            Some(id) => Ok(id),
            None => Ok(0),
        };
    }
    match with_graph {
        Some(iri) => Ok(atoms.get_id(iri.as_bytes(), AtomKind::Iri)?),
        None => Ok(0),
    }
}

/// Graph terms are never blank nodes in practice; a thin variable-or-ground
/// resolver that skips `BlankScope` entirely.
fn resolve_for_insert_ground_or_var(
    term: TermSpan,
    source: &str,
    prefixes: &[(String, String)],
    atoms: &AtomStore,
    row: &BindingTable,
) -> Result<Option<AtomId>> {
    match term.term_type {
        TermType::Variable => {
            let hash = fnv1a_32(raw_text(term, source).as_bytes());
            match row.get(hash) {
                Some(Value::Atom(id)) => Ok(Some(*id)),
                _ => Ok(None),
            }
        }
        _ => {
            let (bytes, kind) = term_bytes_and_kind(term, source, prefixes);
            Ok(Some(atoms.intern(&bytes, kind)?))
        }
    }
}

/// Runs every operation parsed from `source` against `store` as a single
/// write batch: WAL records for every mutation land before `commit_batch`
/// makes any of them visible (§4.9's "run under the exclusive write lock").
pub fn execute(
    store: &QuadStore,
    source: &str,
    pool: &dyn BufferManager,
    service: Option<&dyn ServiceMaterializer>,
) -> Result<UpdateSummary> {
    let operations = parse(source)?;
    let no_cancel = || false;
    let mut summary = UpdateSummary::default();
    store.begin_batch()?;
    let result = (|| {
        for op in &operations {
            execute_operation(store, op, source, pool, service, &no_cancel, &mut summary)?;
            summary.operations += 1;
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            store.commit_batch()?;
            Ok(summary)
        }
        Err(e) => {
            let _ = store.rollback_batch();
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_operation(
    store: &QuadStore,
    op: &UpdateOperation,
    source: &str,
    pool: &dyn BufferManager,
    service: Option<&dyn ServiceMaterializer>,
    cancelled: &dyn Fn() -> bool,
    summary: &mut UpdateSummary,
) -> Result<()> {
    match op {
        UpdateOperation::InsertData(quads) => {
            for q in quads {
                insert_ground_quad(store, q, source)?;
                summary.quads_inserted += 1;
            }
            Ok(())
        }
        UpdateOperation::DeleteData(quads) => {
            for q in quads {
                if delete_ground_quad(store, q, source)? {
                    summary.quads_deleted += 1;
                }
            }
            Ok(())
        }
        UpdateOperation::DeleteWhere { template, where_text } => run_template_update(
            store,
            None,
            template,
            &[],
            where_text,
            source,
            pool,
            service,
            cancelled,
            summary,
        ),
        UpdateOperation::Modify { with_graph, delete_template, insert_template, where_text } => run_template_update(
            store,
            with_graph.as_deref(),
            delete_template,
            insert_template,
            where_text,
            source,
            pool,
            service,
            cancelled,
            summary,
        ),
        UpdateOperation::Clear(target) => {
            summary.quads_deleted += apply_to_targets(store, target, |g| clear_graph(store, g))?;
            Ok(())
        }
        UpdateOperation::Drop(target) => {
            summary.quads_deleted += apply_to_targets(store, target, |g| clear_graph(store, g))?;
            Ok(())
        }
        UpdateOperation::Create(_) => Ok(()),
        UpdateOperation::Copy { from, to } => {
            let (f, t) = resolve_pair(store, from, to)?;
            if f != t {
                clear_graph(store, t)?;
                summary.quads_inserted += copy_graph(store, f, t)?;
            }
            Ok(())
        }
        UpdateOperation::Move { from, to } => {
            let (f, t) = resolve_pair(store, from, to)?;
            if f != t {
                clear_graph(store, t)?;
                summary.quads_inserted += copy_graph(store, f, t)?;
                summary.quads_deleted += clear_graph(store, f)?;
            }
            Ok(())
        }
        UpdateOperation::Add { from, to } => {
            let (f, t) = resolve_pair(store, from, to)?;
            if f != t {
                summary.quads_inserted += copy_graph(store, f, t)?;
            }
            Ok(())
        }
    }
}

fn insert_ground_quad(store: &QuadStore, q: &QuadPattern, source: &str) -> Result<()> {
    let prefixes: &[(String, String)] = &[];
    ground_term_guard(q.subject, q.predicate, q.object)?;
    let (sb, sk) = term_bytes_and_kind(q.subject, source, prefixes);
    let (pb, _) = term_bytes_and_kind(q.predicate, source, prefixes);
    let (ob, ok) = term_bytes_and_kind(q.object, source, prefixes);
    let graph = q.graph.map(|g| term_bytes_and_kind(g, source, prefixes).0);
    store.add(&sb, sk, &pb, &ob, ok, graph.as_deref(), now_ticks(), FOREVER)
}

fn delete_ground_quad(store: &QuadStore, q: &QuadPattern, source: &str) -> Result<bool> {
    let prefixes: &[(String, String)] = &[];
    ground_term_guard(q.subject, q.predicate, q.object)?;
    let (sb, sk) = term_bytes_and_kind(q.subject, source, prefixes);
    let (pb, pk) = term_bytes_and_kind(q.predicate, source, prefixes);
    let (ob, ok) = term_bytes_and_kind(q.object, source, prefixes);
    let s = store.atoms().get_id(&sb, sk)?;
    let p = store.atoms().get_id(&pb, pk)?;
    let o = store.atoms().get_id(&ob, ok)?;
    if s == 0 || p == 0 || o == 0 {
        return Ok(false);
    }
    let g = match q.graph {
        Some(term) => {
            let (gb, gk) = term_bytes_and_kind(term, source, prefixes);
            store.atoms().get_id(&gb, gk)?
        }
        None => 0,
    };
    store.end_current(s, p, o, g)
}

fn ground_term_guard(s: TermSpan, p: TermSpan, o: TermSpan) -> Result<()> {
    if s.term_type == TermType::Variable || p.term_type == TermType::Variable || o.term_type == TermType::Variable {
        return Err(MercuryError::InvalidOperation(
            "INSERT DATA/DELETE DATA cannot reference variables".to_string(),
        ));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_template_update(
    store: &QuadStore,
    with_graph: Option<&str>,
    delete_template: &[QuadPattern],
    insert_template: &[QuadPattern],
    where_text: &str,
    source: &str,
    pool: &dyn BufferManager,
    service: Option<&dyn ServiceMaterializer>,
    cancelled: &dyn Fn() -> bool,
    summary: &mut UpdateSummary,
) -> Result<()> {
    // `where_text` and `source` are deliberately distinct strings: the
    // templates' `TermSpan`s were recorded against the original update
    // text by `UpdateParser`, while the WHERE clause is re-parsed from a
    // freshly built "SELECT * WHERE { ... }" wrapper whose own spans are
    // internal to `scan::run_select` and never escape into `rows`.
    let wrapped = format!("SELECT * WHERE {{{where_text}}}");
    let (inner_query, inner_pbuf, inner_group) =
        SparqlParser::parse_query(&wrapped, pool, crate::pattern::DEFAULT_CAPACITY).map_err(MercuryError::Parse)?;
    let ctx = ScanContext::new(store, &inner_query, &wrapped, &inner_pbuf, pool, service, cancelled)?;
    let rows = scan::run_select(&inner_query, &inner_pbuf, &inner_group, &ctx)?;

    let prefixes: &[(String, String)] = &[];
    let with_graph = with_graph.map(str::to_string);
    let atoms = store.atoms();
    let mut blank_counter: u64 = 0;

    for row in &rows {
        for q in delete_template {
            let s = resolve_for_delete(q.subject, source, prefixes, atoms, row)?;
            let p = resolve_for_delete(q.predicate, source, prefixes, atoms, row)?;
            let o = resolve_for_delete(q.object, source, prefixes, atoms, row)?;
            let (Some(s), Some(p), Some(o)) = (s, p, o) else { continue };
            let g = resolve_graph_for_delete(q.graph, &with_graph, source, prefixes, atoms, row)?;
            if store.end_current(s, p, o, g)? {
                summary.quads_deleted += 1;
            }
        }
        let mut blanks = BlankScope {
            atoms,
            seen: HashMap::new(),
            counter: &mut blank_counter,
        };
        for q in insert_template {
            let Some(s) = resolve_for_insert(q.subject, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let Some(p) = resolve_for_insert(q.predicate, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let Some(o) = resolve_for_insert(q.object, source, prefixes, atoms, row, &mut blanks)? else { continue };
            let g = resolve_graph_for_insert(q.graph, &with_graph, source, prefixes, atoms, row)?;
            store.add_ids(s, p, o, g, now_ticks(), FOREVER, Op::Add)?;
            summary.quads_inserted += 1;
        }
    }
    Ok(())
}

fn resolve_graph_id(store: &QuadStore, target: &GraphTarget, for_insert: bool) -> Result<AtomId> {
    match target {
        GraphTarget::Default => Ok(0),
        GraphTarget::Graph(iri) => {
            if for_insert {
                store.atoms().intern_iri(iri)
            } else {
                Ok(store.atoms().get_id(iri.as_bytes(), AtomKind::Iri)?)
            }
        }
        GraphTarget::Named | GraphTarget::All => {
            Err(MercuryError::InvalidOperation("NAMED/ALL is not a single graph".to_string()))
        }
    }
}

fn resolve_pair(store: &QuadStore, from: &GraphTarget, to: &GraphTarget) -> Result<(AtomId, AtomId)> {
    Ok((resolve_graph_id(store, from, false)?, resolve_graph_id(store, to, true)?))
}

fn clear_graph(store: &QuadStore, g: AtomId) -> Result<u64> {
    let quads = store.query_current(0, 0, 0, g);
    let mut n = 0;
    for (s, p, o, g) in quads {
        if store.end_current(s, p, o, g)? {
            n += 1;
        }
    }
    Ok(n)
}

fn copy_graph(store: &QuadStore, from: AtomId, to: AtomId) -> Result<u64> {
    let quads = store.query_current(0, 0, 0, from);
    let mut n = 0;
    for (s, p, o, _) in quads {
        store.add_ids(s, p, o, to, now_ticks(), FOREVER, Op::Add)?;
        n += 1;
    }
    Ok(n)
}

fn apply_to_targets(store: &QuadStore, target: &GraphTarget, mut f: impl FnMut(AtomId) -> Result<u64>) -> Result<u64> {
    match target {
        GraphTarget::Default => f(0),
        GraphTarget::Graph(iri) => {
            let id = store.atoms().get_id(iri.as_bytes(), AtomKind::Iri)?;
            if id == 0 {
                Ok(0)
            } else {
                f(id)
            }
        }
        GraphTarget::Named => {
            let mut total = 0;
            for g in store.named_graphs() {
                total += f(g)?;
            }
            Ok(total)
        }
        GraphTarget::All => {
            let mut total = f(0)?;
            for g in store.named_graphs() {
                total += f(g)?;
            }
            Ok(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferManager;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, QuadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_data_then_delete_data_round_trips() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        execute(
            &store,
            "INSERT DATA { <ex:a> <ex:p> <ex:b> }",
            &pool,
            None,
        )
        .unwrap();
        let a = store.atoms().get_id(b"ex:a", AtomKind::Iri).unwrap();
        assert_ne!(a, 0);
        assert_eq!(store.query_current(a, 0, 0, 0).len(), 1);

        execute(&store, "DELETE DATA { <ex:a> <ex:p> <ex:b> }", &pool, None).unwrap();
        assert!(store.query_current(a, 0, 0, 0).is_empty());
    }

    #[test]
    fn insert_data_into_named_graph() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        execute(
            &store,
            "INSERT DATA { GRAPH <ex:g1> { <ex:a> <ex:p> <ex:b> } }",
            &pool,
            None,
        )
        .unwrap();
        let g1 = store.atoms().get_id(b"ex:g1", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(g1), 1);
    }

    #[test]
    fn delete_where_removes_every_matching_quad() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:a", AtomKind::Iri, b"ex:knows", b"ex:b", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"ex:a", AtomKind::Iri, b"ex:knows", b"ex:c", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        let pool = PooledBufferManager::new();
        let summary = execute(
            &store,
            "DELETE WHERE { <ex:a> <ex:knows> ?x }",
            &pool,
            None,
        )
        .unwrap();
        assert_eq!(summary.quads_deleted, 2);
        let a = store.atoms().get_id(b"ex:a", AtomKind::Iri).unwrap();
        assert!(store.query_current(a, 0, 0, 0).is_empty());
    }

    #[test]
    fn modify_moves_a_value_from_one_predicate_to_another() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:alice", AtomKind::Iri, b"ex:age", b"30", AtomKind::Literal, None, 0, FOREVER)
            .unwrap();
        let pool = PooledBufferManager::new();
        let summary = execute(
            &store,
            "DELETE { ?p <ex:age> ?a } INSERT { ?p <ex:yearsOld> ?a } WHERE { ?p <ex:age> ?a }",
            &pool,
            None,
        )
        .unwrap();
        assert_eq!(summary.quads_deleted, 1);
        assert_eq!(summary.quads_inserted, 1);
        let alice = store.atoms().get_id(b"ex:alice", AtomKind::Iri).unwrap();
        let years_old = store.atoms().get_id(b"ex:yearsOld", AtomKind::Iri).unwrap();
        assert_eq!(store.query_current(alice, years_old, 0, 0).len(), 1);
        let age = store.atoms().get_id(b"ex:age", AtomKind::Iri).unwrap();
        assert!(store.query_current(alice, age, 0, 0).is_empty());
    }

    #[test]
    fn with_graph_scopes_an_unqualified_modify_template() {
        let (_dir, store) = open_store();
        store
            .add(
                b"ex:a",
                AtomKind::Iri,
                b"ex:p",
                b"ex:b",
                AtomKind::Iri,
                Some(b"ex:g1"),
                0,
                FOREVER,
            )
            .unwrap();
        let pool = PooledBufferManager::new();
        execute(
            &store,
            "WITH <ex:g1> DELETE { ?s ?p ?o } INSERT { ?s ?p <ex:c> } WHERE { ?s ?p ?o }",
            &pool,
            None,
        )
        .unwrap();
        let g1 = store.atoms().get_id(b"ex:g1", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(g1), 1);
        let c = store.atoms().get_id(b"ex:c", AtomKind::Iri).unwrap();
        assert_eq!(store.query_current(0, 0, c, g1).len(), 1);
    }

    #[test]
    fn clear_default_leaves_named_graphs_alone() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:a", AtomKind::Iri, b"ex:p", b"ex:b", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(
                b"ex:a",
                AtomKind::Iri,
                b"ex:p",
                b"ex:b",
                AtomKind::Iri,
                Some(b"ex:g1"),
                0,
                FOREVER,
            )
            .unwrap();
        let pool = PooledBufferManager::new();
        let summary = execute(&store, "CLEAR DEFAULT", &pool, None).unwrap();
        assert_eq!(summary.quads_deleted, 1);
        let g1 = store.atoms().get_id(b"ex:g1", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(g1), 1);
    }

    #[test]
    fn clear_all_empties_every_graph() {
        let (_dir, store) = open_store();
        store
            .add(b"ex:a", AtomKind::Iri, b"ex:p", b"ex:b", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        store
            .add(
                b"ex:a",
                AtomKind::Iri,
                b"ex:p",
                b"ex:b",
                AtomKind::Iri,
                Some(b"ex:g1"),
                0,
                FOREVER,
            )
            .unwrap();
        let pool = PooledBufferManager::new();
        execute(&store, "CLEAR ALL", &pool, None).unwrap();
        let g1 = store.atoms().get_id(b"ex:g1", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(g1), 0);
        let a = store.atoms().get_id(b"ex:a", AtomKind::Iri).unwrap();
        assert!(store.query_current(a, 0, 0, 0).is_empty());
    }

    #[test]
    fn copy_duplicates_into_target_without_clearing_source() {
        let (_dir, store) = open_store();
        store
            .add(
                b"ex:a",
                AtomKind::Iri,
                b"ex:p",
                b"ex:b",
                AtomKind::Iri,
                Some(b"ex:src"),
                0,
                FOREVER,
            )
            .unwrap();
        let pool = PooledBufferManager::new();
        execute(&store, "COPY GRAPH <ex:src> TO GRAPH <ex:dst>", &pool, None).unwrap();
        let src = store.atoms().get_id(b"ex:src", AtomKind::Iri).unwrap();
        let dst = store.atoms().get_id(b"ex:dst", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(src), 1);
        assert_eq!(store.quad_count_in_graph(dst), 1);
    }

    #[test]
    fn move_drains_the_source_graph() {
        let (_dir, store) = open_store();
        store
            .add(
                b"ex:a",
                AtomKind::Iri,
                b"ex:p",
                b"ex:b",
                AtomKind::Iri,
                Some(b"ex:src"),
                0,
                FOREVER,
            )
            .unwrap();
        let pool = PooledBufferManager::new();
        execute(&store, "MOVE GRAPH <ex:src> TO GRAPH <ex:dst>", &pool, None).unwrap();
        let src = store.atoms().get_id(b"ex:src", AtomKind::Iri).unwrap();
        let dst = store.atoms().get_id(b"ex:dst", AtomKind::Iri).unwrap();
        assert_eq!(store.quad_count_in_graph(src), 0);
        assert_eq!(store.quad_count_in_graph(dst), 1);
    }

    #[test]
    fn insert_data_rejects_variables() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let result = execute(&store, "INSERT DATA { ?s <ex:p> <ex:o> }", &pool, None);
        assert!(result.is_err());
    }

    #[test]
    fn semicolon_separates_independent_operations() {
        let (_dir, store) = open_store();
        let pool = PooledBufferManager::new();
        let summary = execute(
            &store,
            "INSERT DATA { <ex:a> <ex:p> <ex:b> } ; INSERT DATA { <ex:c> <ex:p> <ex:d> }",
            &pool,
            None,
        )
        .unwrap();
        assert_eq!(summary.operations, 2);
        assert_eq!(summary.quads_inserted, 2);
    }
}
