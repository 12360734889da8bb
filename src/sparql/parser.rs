//! Recursive-descent parser writing directly into a `PatternBuffer`.
//! Grounded on `lib/spargebra/src/parser.rs`'s grammar
//! coverage (production/token names such as `PathPrimary`, `TriplesBlock`)
//! used purely as a checklist of what to support — spargebra itself builds
//! a heap AST via the `peg` macro crate, incompatible with this crate's
//! offset-based, zero-per-token-allocation requirement, so
//! nothing here is copied from it.
//!
//! Scope note: property-path alternation (`|`) is accepted grammar but is
//! rejected here with a structured `ParseError` rather than silently
//! mis-evaluated — see DESIGN.md.

use super::lexer::{Lexer, Token, TokenKind};
use super::{GroupPattern, Query, QueryForm, SelectClause, SelectItem, SolutionModifier, TemporalClause};
use crate::buffer::BufferManager;
use crate::error::ParseError;
use crate::pattern::{PathKind, PatternBuffer, PatternSlot, TermSpan, TermType};

pub struct SparqlParser;

impl SparqlParser {
    /// Parses a SELECT/ASK/CONSTRUCT/DESCRIBE query, writing triple/filter/
    /// bind/values content into a freshly leased `PatternBuffer` and
    /// returning the query header plus the WHERE-clause nesting tree.
    pub fn parse_query<'a>(
        source: &'a str,
        pool: &'a dyn BufferManager,
        capacity: usize,
    ) -> Result<(Query, PatternBuffer<'a>, GroupPattern), ParseError> {
        let mut parser = Parser::new(source)?;
        let mut pbuf = PatternBuffer::new(pool, capacity);
        let mut query = Query::default();
        let mut gen = GenCounter::default();

        parser.parse_prologue(&mut query)?;
        query.form = Some(parser.parse_form(&mut query)?);
        parser.skip_dataset_clauses()?;

        if parser.is_keyword("WHERE") {
            parser.advance();
        }
        parser.expect_punct("{")?;
        let group = parser.parse_group(&mut pbuf, &mut gen)?;
        parser.expect_punct("}")?;

        parser.parse_solution_modifier(&mut query.modifier)?;
        query.temporal = parser.parse_temporal_clause()?;

        Ok((query, pbuf, group))
    }
}

#[derive(Default)]
struct GenCounter(u32);

impl GenCounter {
    fn next(&mut self) -> u32 {
        let id = self.0;
        self.0 += 1;
        id
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(Self {
            source,
            tokens,
            pos: 0,
        })
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

    fn error(&self, message: impl Into<String>) -> ParseError {
        let token = self.peek();
        ParseError::new(token.line, token.column, message)
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

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.is_punct(p) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{p}'")))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.is_keyword(kw) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn expect_variable(&mut self) -> Result<Token, ParseError> {
        let token = self.peek();
        if token.kind == TokenKind::Variable {
            self.advance();
            Ok(token)
        } else {
            Err(self.error("expected a variable"))
        }
    }

    // ---- Prologue -----------------------------------------------------

    fn parse_prologue(&mut self, query: &mut Query) -> Result<(), ParseError> {
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
                let iri = strip_iri(self.text(iri_token));
                query.prefixes.push((prefix, iri));
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

    fn parse_form(&mut self, query: &mut Query) -> Result<QueryForm, ParseError> {
        if self.is_keyword("SELECT") {
            self.advance();
            query.select = Some(self.parse_select_clause()?);
            Ok(QueryForm::Select)
        } else if self.is_keyword("ASK") {
            self.advance();
            Ok(QueryForm::Ask)
        } else if self.is_keyword("CONSTRUCT") {
            self.advance();
            query.construct_template = Some(self.capture_balanced_text("{", "}")?);
            Ok(QueryForm::Construct)
        } else if self.is_keyword("DESCRIBE") {
            self.advance();
            while !self.is_keyword("WHERE") && !self.is_punct("{") && !self.is_eof() {
                if self.is_punct("*") {
                    self.advance();
                    continue;
                }
                query.describe_targets.push(self.parse_term()?);
            }
            Ok(QueryForm::Describe)
        } else {
            Err(self.error("expected SELECT, ASK, CONSTRUCT, or DESCRIBE"))
        }
    }

    fn parse_select_clause(&mut self) -> Result<SelectClause, ParseError> {
        let distinct = self.is_keyword("DISTINCT");
        let reduced = self.is_keyword("REDUCED");
        if distinct || reduced {
            self.advance();
        }
        if self.is_punct("*") {
            self.advance();
            return Ok(SelectClause::Star);
        }
        let mut vars = Vec::new();
        loop {
            if self.peek().kind == TokenKind::Variable {
                let token = self.advance();
                vars.push(SelectItem::Var(self.text(token).to_string()));
            } else if self.is_punct("(") {
                // (expr AS ?var): keep both, the expr text feeds aggregate::run.
                self.advance();
                let expr_start = self.peek().start;
                let mut expr_end = expr_start;
                while !self.is_keyword("AS") && !self.is_eof() {
                    let token = self.peek();
                    expr_end = token.start + token.len;
                    self.advance();
                }
                let expr = self.source[expr_start..expr_end].to_string();
                self.expect_keyword("AS")?;
                let var = self.expect_variable()?;
                vars.push(SelectItem::Expr {
                    expr,
                    var: self.text(var).to_string(),
                });
                self.expect_punct(")")?;
            } else {
                break;
            }
        }
        Ok(if distinct {
            SelectClause::Distinct(vars)
        } else if reduced {
            SelectClause::Reduced(vars)
        } else {
            SelectClause::Plain(vars)
        })
    }

    fn skip_dataset_clauses(&mut self) -> Result<(), ParseError> {
        while self.is_keyword("FROM") {
            self.advance();
            if self.is_keyword("NAMED") {
                self.advance();
            }
            if self.peek().kind != TokenKind::Iri {
                return Err(self.error("expected an IRI after FROM"));
            }
            self.advance();
        }
        Ok(())
    }

    // ---- WHERE-clause group --------------------------------------------

    fn parse_group(
        &mut self,
        pbuf: &mut PatternBuffer<'a>,
        gen: &mut GenCounter,
    ) -> Result<GroupPattern, ParseError> {
        let mut elements: Vec<GroupPattern> = Vec::new();
        let mut current_bgp: Vec<usize> = Vec::new();

        loop {
            if self.is_punct(".") {
                self.advance();
                continue;
            }
            if self.is_punct("}") || self.is_eof() {
                break;
            }
            if self.is_keyword("OPTIONAL") {
                self.advance();
                self.expect_punct("{")?;
                let inner = self.parse_group(pbuf, gen)?;
                self.expect_punct("}")?;
                flush_bgp(&mut elements, &mut current_bgp);
                elements.push(GroupPattern::Optional(Box::new(inner)));
            } else if self.is_keyword("MINUS") {
                self.advance();
                self.expect_punct("{")?;
                let inner = self.parse_group(pbuf, gen)?;
                self.expect_punct("}")?;
                flush_bgp(&mut elements, &mut current_bgp);
                elements.push(GroupPattern::Minus(Box::new(inner)));
            } else if self.is_keyword("GRAPH") {
                self.advance();
                let name = self.parse_graph_name()?;
                self.expect_punct("{")?;
                let inner = self.parse_group(pbuf, gen)?;
                self.expect_punct("}")?;
                flush_bgp(&mut elements, &mut current_bgp);
                elements.push(GroupPattern::Graph(name, Box::new(inner)));
            } else if self.is_keyword("SERVICE") {
                self.advance();
                let silent = if self.is_keyword("SILENT") {
                    self.advance();
                    true
                } else {
                    false
                };
                let iri = self.parse_graph_name()?;
                let inner = self.capture_balanced_text("{", "}")?;
                flush_bgp(&mut elements, &mut current_bgp);
                elements.push(GroupPattern::Service { iri, silent, inner });
            } else if self.is_keyword("VALUES") {
                self.advance();
                let slot = self.parse_values(pbuf)?;
                flush_bgp(&mut elements, &mut current_bgp);
                elements.push(GroupPattern::Values(slot));
            } else if self.is_keyword("FILTER") {
                self.advance();
                let slot = self.parse_filter(pbuf)?;
                current_bgp.push(slot);
            } else if self.is_keyword("BIND") {
                self.advance();
                let slot = self.parse_bind(pbuf)?;
                current_bgp.push(slot);
            } else if self.is_keyword("UNION") {
                self.advance();
                self.expect_punct("{")?;
                let right = self.parse_group(pbuf, gen)?;
                self.expect_punct("}")?;
                flush_bgp(&mut elements, &mut current_bgp);
                match elements.pop() {
                    Some(GroupPattern::Union(mut branches)) => {
                        branches.push(right);
                        elements.push(GroupPattern::Union(branches));
                    }
                    Some(left) => elements.push(GroupPattern::Union(vec![left, right])),
                    None => return Err(self.error("UNION with no preceding pattern")),
                }
            } else if self.is_punct("{") {
                // Peek past the brace: a leading SELECT makes this a
                // sub-query, captured as raw text and re-parsed at
                // scan-build time rather than folded into this group.
                if self.tokens.get(self.pos + 1).map(|t| {
                    t.kind == TokenKind::Keyword && t.text(self.source).eq_ignore_ascii_case("SELECT")
                }) == Some(true)
                {
                    let text = self.capture_balanced_text("{", "}")?;
                    flush_bgp(&mut elements, &mut current_bgp);
                    elements.push(GroupPattern::SubQuery(text));
                } else {
                    self.advance();
                    let inner = self.parse_group(pbuf, gen)?;
                    self.expect_punct("}")?;
                    flush_bgp(&mut elements, &mut current_bgp);
                    elements.push(inner);
                }
            } else {
                self.parse_triples(pbuf, gen, &mut current_bgp)?;
            }
        }

        flush_bgp(&mut elements, &mut current_bgp);
        Ok(match elements.len() {
            0 => GroupPattern::Bgp(Vec::new()),
            1 => elements.into_iter().next().unwrap(),
            _ => GroupPattern::Group(elements),
        })
    }

    fn parse_graph_name(&mut self) -> Result<String, ParseError> {
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
            TokenKind::Variable => {
                self.advance();
                Ok(self.text(token).to_string())
            }
            _ => Err(self.error("expected a graph name (IRI or variable)")),
        }
    }

    fn capture_balanced_text(&mut self, open: &str, close: &str) -> Result<String, ParseError> {
        self.expect_punct(open)?;
        let start_token = self.peek();
        let start = start_token.start;
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

    fn parse_values(&mut self, pbuf: &mut PatternBuffer<'a>) -> Result<usize, ParseError> {
        let var = self.expect_variable()?;
        self.expect_punct("{")?;
        let mut entries = Vec::new();
        while !self.is_punct("}") && !self.is_eof() {
            let token = self.advance();
            entries.push(token);
        }
        self.expect_punct("}")?;
        let header_index = pbuf
            .push(PatternSlot::ValuesHeader {
                var_start: var.start as i32,
                var_len: var.len as i32,
                entry_count: entries.len() as i32,
            })
            .map_err(|_| self.error("pattern buffer exceeded its capacity"))?;
        for entry in entries {
            pbuf.push(PatternSlot::ValuesEntry {
                value_start: entry.start as i32,
                value_len: entry.len as i32,
            })
            .map_err(|_| self.error("pattern buffer exceeded its capacity"))?;
        }
        Ok(header_index)
    }

    fn parse_filter(&mut self, pbuf: &mut PatternBuffer<'a>) -> Result<usize, ParseError> {
        let (start, end) = self.capture_expr_span()?;
        pbuf.push(PatternSlot::Filter {
            source_start: start as i32,
            source_len: (end - start) as i32,
        })
        .map_err(|_| self.error("pattern buffer exceeded its capacity"))
    }

    fn parse_bind(&mut self, pbuf: &mut PatternBuffer<'a>) -> Result<usize, ParseError> {
        self.expect_punct("(")?;
        let expr_start = self.peek().start;
        let mut expr_end = expr_start;
        while !self.is_keyword("AS") && !self.is_eof() {
            let token = self.advance();
            expr_end = token.start + token.len;
        }
        self.expect_keyword("AS")?;
        let var = self.expect_variable()?;
        self.expect_punct(")")?;
        pbuf.push(PatternSlot::Bind {
            expr_start: expr_start as i32,
            expr_len: (expr_end - expr_start) as i32,
            var_start: var.start as i32,
            var_len: var.len as i32,
        })
        .map_err(|_| self.error("pattern buffer exceeded its capacity"))
    }

    /// Captures a FILTER's parenthesized expression as a verbatim source
    /// span: "filter text is kept verbatim and
    /// parsed again by FilterEvaluator". Also accepts the bare
    /// `EXISTS {...}`/`NOT EXISTS {...}` shorthand without parentheses.
    fn capture_expr_span(&mut self) -> Result<(usize, usize), ParseError> {
        if self.is_punct("(") {
            let start = self.peek().start;
            self.advance();
            let mut depth = 1;
            let mut end = start;
            while depth > 0 {
                if self.is_eof() {
                    return Err(self.error("unterminated filter expression"));
                }
                if self.is_punct("(") {
                    depth += 1;
                } else if self.is_punct(")") {
                    depth -= 1;
                }
                let token = self.advance();
                end = token.start + token.len;
            }
            Ok((start, end))
        } else if self.is_keyword("EXISTS") || self.is_keyword("NOT") {
            let start = self.peek().start;
            if self.is_keyword("NOT") {
                self.advance();
            }
            self.expect_keyword("EXISTS")?;
            self.expect_punct("{")?;
            let mut depth = 1;
            let mut end = start;
            while depth > 0 {
                if self.is_eof() {
                    return Err(self.error("unterminated EXISTS block"));
                }
                if self.is_punct("{") {
                    depth += 1;
                } else if self.is_punct("}") {
                    depth -= 1;
                }
                let token = self.advance();
                end = token.start + token.len;
            }
            Ok((start, end))
        } else {
            Err(self.error("expected '(' or EXISTS/NOT EXISTS to start a filter expression"))
        }
    }

    // ---- Triple patterns & property paths ------------------------------

    fn parse_triples(
        &mut self,
        pbuf: &mut PatternBuffer<'a>,
        gen: &mut GenCounter,
        current_bgp: &mut Vec<usize>,
    ) -> Result<(), ParseError> {
        let subject = self.parse_term()?;
        self.parse_predicate_object_list(pbuf, gen, current_bgp, subject)?;
        if self.is_punct(".") {
            self.advance();
        }
        Ok(())
    }

    fn parse_predicate_object_list(
        &mut self,
        pbuf: &mut PatternBuffer<'a>,
        gen: &mut GenCounter,
        current_bgp: &mut Vec<usize>,
        subject: TermSpan,
    ) -> Result<(), ParseError> {
        loop {
            let path = self.parse_path()?;
            loop {
                let object = self.parse_term()?;
                self.emit_path(pbuf, gen, current_bgp, subject, &path, object)?;
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

    /// One property-path element: an IRI (or `a`), optionally inverted with
    /// `^`, optionally repeated with `*`/`+`/`?`.
    fn parse_path_atom(&mut self) -> Result<(TermSpan, PathKind), ParseError> {
        let inverse = if self.is_punct("^") {
            self.advance();
            true
        } else {
            false
        };
        let predicate = self.parse_predicate_term()?;
        let mut kind = if inverse {
            PathKind::Inverse
        } else {
            PathKind::None
        };
        if self.is_punct("*") {
            self.advance();
            kind = PathKind::ZeroOrMore;
        } else if self.is_punct("+") {
            self.advance();
            kind = PathKind::OneOrMore;
        } else if self.is_punct("?") && !matches!(self.peek().kind, TokenKind::Variable) {
            self.advance();
            kind = PathKind::ZeroOrOne;
        }
        Ok((predicate, kind))
    }

    /// A full path expression: a `/`-separated sequence of atoms. `|`
    /// (alternation) is rejected with a structured error — see module docs.
    fn parse_path(&mut self) -> Result<Vec<(TermSpan, PathKind)>, ParseError> {
        let mut atoms = vec![self.parse_path_atom()?];
        while self.is_punct("/") {
            self.advance();
            atoms.push(self.parse_path_atom()?);
        }
        if self.is_punct("|") {
            return Err(self.error(
                "property-path alternation ('|') is not supported by this parser",
            ));
        }
        Ok(atoms)
    }

    fn emit_path(
        &mut self,
        pbuf: &mut PatternBuffer<'a>,
        gen: &mut GenCounter,
        current_bgp: &mut Vec<usize>,
        subject: TermSpan,
        path: &[(TermSpan, PathKind)],
        object: TermSpan,
    ) -> Result<(), ParseError> {
        if path.len() == 1 {
            let (predicate, kind) = path[0];
            self.push_triple(pbuf, current_bgp, subject, predicate, object, kind)?;
            return Ok(());
        }
        // Sequence expansion: chain through fresh intermediate variables
        //.
        let mut left = subject;
        for (i, (predicate, kind)) in path.iter().enumerate() {
            let right = if i + 1 == path.len() {
                object
            } else {
                TermSpan {
                    term_type: TermType::Generated,
                    source_start: gen.next() as i32,
                    source_len: 0,
                }
            };
            self.push_triple(pbuf, current_bgp, left, *predicate, right, *kind)?;
            left = right;
        }
        Ok(())
    }

    fn push_triple(
        &mut self,
        pbuf: &mut PatternBuffer<'a>,
        current_bgp: &mut Vec<usize>,
        subject: TermSpan,
        predicate: TermSpan,
        object: TermSpan,
        path: PathKind,
    ) -> Result<(), ParseError> {
        let (predicate_field, path_iri_start, path_iri_len) = match path {
            PathKind::None => (predicate, 0, 0),
            _ => (
                TermSpan {
                    term_type: TermType::Variable,
                    source_start: 0,
                    source_len: 0,
                },
                predicate.source_start,
                predicate.source_len,
            ),
        };
        let index = pbuf
            .push(PatternSlot::Triple {
                subject,
                predicate: predicate_field,
                object,
                path,
                path_iri_start,
                path_iri_len,
            })
            .map_err(|_| self.error("pattern buffer exceeded its capacity"))?;
        current_bgp.push(index);
        Ok(())
    }

    fn parse_predicate_term(&mut self) -> Result<TermSpan, ParseError> {
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

    fn parse_term(&mut self) -> Result<TermSpan, ParseError> {
        let token = self.peek();
        let term_type = match token.kind {
            TokenKind::Variable => TermType::Variable,
            TokenKind::Iri | TokenKind::PrefixedName => TermType::Iri,
            TokenKind::BlankNode => TermType::BlankNode,
            TokenKind::String | TokenKind::Number => TermType::Literal,
            TokenKind::Keyword if self.text(token).eq_ignore_ascii_case("a") => TermType::Iri,
            TokenKind::Punct if self.text(token) == "[" => return self.parse_anon_blank_node(),
            _ => return Err(self.error("expected a triple-pattern term")),
        };
        self.advance();
        let mut end = token.start + token.len;
        // A literal may carry a `^^<datatype>` or `@lang` suffix; keep it
        // inside the span so FilterEvaluator sees the whole lexical form.
        if term_type == TermType::Literal {
            if self.is_punct("^^") {
                self.advance();
                let dt = self.peek();
                if dt.kind == TokenKind::Iri || dt.kind == TokenKind::PrefixedName {
                    end = dt.start + dt.len;
                    self.advance();
                }
            } else if self.peek().kind == TokenKind::Punct && self.text(self.peek()).starts_with('@')
            {
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

    /// `[]` or `[ :p :o ; ... ]` is out of this parser's scope beyond the
    /// empty-anonymous-node form, which maps to a generated blank node with
    /// no attached predicate-object list.
    fn parse_anon_blank_node(&mut self) -> Result<TermSpan, ParseError> {
        self.advance(); // '['
        let token = self.peek();
        let span = TermSpan {
            term_type: TermType::BlankNode,
            source_start: token.start as i32,
            source_len: 0,
        };
        while !self.is_punct("]") && !self.is_eof() {
            self.advance();
        }
        self.expect_punct("]")?;
        Ok(span)
    }

    // ---- Solution modifiers & temporal suffix --------------------------

    fn parse_solution_modifier(&mut self, modifier: &mut SolutionModifier) -> Result<(), ParseError> {
        if self.is_keyword("GROUP") {
            self.advance();
            self.expect_keyword("BY")?;
            while self.peek().kind == TokenKind::Variable {
                let token = self.advance();
                modifier.group_by.push(self.text(token).to_string());
            }
        }
        if self.is_keyword("HAVING") {
            self.advance();
            let (start, end) = self.capture_expr_span()?;
            modifier.having = Some(self.source[start..end].to_string());
        }
        if self.is_keyword("ORDER") {
            self.advance();
            self.expect_keyword("BY")?;
            loop {
                let descending = if self.is_keyword("DESC") {
                    self.advance();
                    true
                } else if self.is_keyword("ASC") {
                    self.advance();
                    false
                } else {
                    false
                };
                if self.is_punct("(") {
                    self.advance();
                    let var = self.expect_variable()?;
                    self.expect_punct(")")?;
                    modifier
                        .order_by
                        .push((self.text(var).to_string(), descending));
                } else if self.peek().kind == TokenKind::Variable {
                    let var = self.advance();
                    modifier
                        .order_by
                        .push((self.text(var).to_string(), descending));
                } else {
                    break;
                }
            }
        }
        if self.is_keyword("LIMIT") {
            self.advance();
            modifier.limit = Some(self.parse_integer()?);
        }
        if self.is_keyword("OFFSET") {
            self.advance();
            modifier.offset = Some(self.parse_integer()?);
        }
        Ok(())
    }

    fn parse_integer(&mut self) -> Result<u64, ParseError> {
        let token = self.peek();
        if token.kind != TokenKind::Number {
            return Err(self.error("expected an integer"));
        }
        self.advance();
        self.text(token)
            .parse()
            .map_err(|_| self.error("expected an integer"))
    }

    fn parse_temporal_clause(&mut self) -> Result<TemporalClause, ParseError> {
        if self.is_keyword("AS") {
            self.advance();
            self.expect_keyword("OF")?;
            let (start, end) = self.capture_rest_as_expr()?;
            Ok(TemporalClause::AsOf(self.source[start..end].to_string()))
        } else if self.is_keyword("DURING") {
            self.advance();
            self.expect_punct("[")?;
            let from_start = self.peek().start;
            while !self.is_punct(",") && !self.is_eof() {
                self.advance();
            }
            let from_end = self.tokens[self.pos.saturating_sub(1)].start
                + self.tokens[self.pos.saturating_sub(1)].len;
            self.expect_punct(",")?;
            let to_start = self.peek().start;
            while !self.is_punct("]") && !self.is_eof() {
                self.advance();
            }
            let to_end = self.tokens[self.pos.saturating_sub(1)].start
                + self.tokens[self.pos.saturating_sub(1)].len;
            self.expect_punct("]")?;
            Ok(TemporalClause::During(
                self.source[from_start..from_end].to_string(),
                self.source[to_start..to_end].to_string(),
            ))
        } else if self.is_keyword("ALL") {
            self.advance();
            self.expect_keyword("VERSIONS")?;
            Ok(TemporalClause::AllVersions)
        } else {
            Ok(TemporalClause::None)
        }
    }

    fn capture_rest_as_expr(&mut self) -> Result<(usize, usize), ParseError> {
        let start = self.peek().start;
        let mut end = start;
        while !self.is_eof() {
            let token = self.advance();
            end = token.start + token.len;
        }
        Ok((start, end))
    }
}

fn flush_bgp(elements: &mut Vec<GroupPattern>, current: &mut Vec<usize>) {
    if !current.is_empty() {
        elements.push(GroupPattern::Bgp(std::mem::take(current)));
    }
}

fn strip_iri(text: &str) -> String {
    text.trim_start_matches('<').trim_end_matches('>').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferManager;

    #[test]
    fn parses_scenario_a_select_star() {
        let pool = PooledBufferManager::new();
        let (query, pbuf, group) =
            SparqlParser::parse_query("SELECT * WHERE { ?s ?p ?o }", &pool, 8).unwrap();
        assert_eq!(query.form, Some(QueryForm::Select));
        assert_eq!(query.select, Some(SelectClause::Star));
        assert_eq!(pbuf.len(), 1);
        assert!(matches!(group, GroupPattern::Bgp(ref v) if v.len() == 1));
    }

    #[test]
    fn parses_prefixes_and_prefixed_names() {
        let pool = PooledBufferManager::new();
        let (query, pbuf, _group) = SparqlParser::parse_query(
            "PREFIX foaf: <http://xmlns.com/foaf/0.1/> SELECT ?n WHERE { ?p foaf:name ?n }",
            &pool,
            8,
        )
        .unwrap();
        assert_eq!(query.prefixes, vec![("foaf".to_string(), "http://xmlns.com/foaf/0.1/".to_string())]);
        assert_eq!(pbuf.len(), 1);
    }

    #[test]
    fn parses_optional_as_distinct_group_element() {
        let pool = PooledBufferManager::new();
        let (_q, _pbuf, group) = SparqlParser::parse_query(
            "SELECT * WHERE { ?p <ex:name> ?n OPTIONAL { ?p <ex:age> ?age } }",
            &pool,
            8,
        )
        .unwrap();
        match group {
            GroupPattern::Group(elements) => {
                assert_eq!(elements.len(), 2);
                assert!(matches!(elements[0], GroupPattern::Bgp(_)));
                assert!(matches!(elements[1], GroupPattern::Optional(_)));
            }
            other => panic!("expected a Group, got {other:?}"),
        }
    }

    #[test]
    fn parses_plus_property_path_scenario_d() {
        let pool = PooledBufferManager::new();
        let (_q, pbuf, _group) =
            SparqlParser::parse_query("SELECT ?x WHERE { <ex:a> <ex:knows>+ ?x }", &pool, 8).unwrap();
        match pbuf.get(0) {
            Some(PatternSlot::Triple { path, .. }) => assert_eq!(path, PathKind::OneOrMore),
            other => panic!("expected a path triple, got {other:?}"),
        }
    }

    #[test]
    fn parses_sequence_path_with_generated_intermediate() {
        let pool = PooledBufferManager::new();
        let (_q, pbuf, _group) = SparqlParser::parse_query(
            "SELECT ?x WHERE { <ex:a> <ex:p1>/<ex:p2> ?x }",
            &pool,
            8,
        )
        .unwrap();
        assert_eq!(pbuf.len(), 2);
        match pbuf.get(0) {
            Some(PatternSlot::Triple { object, .. }) => {
                assert_eq!(object.term_type, TermType::Generated)
            }
            other => panic!("expected a generated intermediate, got {other:?}"),
        }
    }

    #[test]
    fn temporal_as_of_suffix_is_captured_scenario_e() {
        let pool = PooledBufferManager::new();
        let (query, _pbuf, _group) = SparqlParser::parse_query(
            "SELECT ?c WHERE { <ex:alice> <ex:worksFor> ?c } AS OF \"2023-08\"^^xsd:date",
            &pool,
            8,
        )
        .unwrap();
        assert!(matches!(query.temporal, TemporalClause::AsOf(_)));
    }

    #[test]
    fn all_versions_suffix_is_recognized() {
        let pool = PooledBufferManager::new();
        let (query, ..) = SparqlParser::parse_query(
            "SELECT ?c WHERE { <ex:alice> <ex:worksFor> ?c } ALL VERSIONS",
            &pool,
            8,
        )
        .unwrap();
        assert_eq!(query.temporal, TemporalClause::AllVersions);
    }

    #[test]
    fn filter_text_is_kept_verbatim() {
        let pool = PooledBufferManager::new();
        let (_q, pbuf, _g) = SparqlParser::parse_query(
            "SELECT * WHERE { ?s ?p ?o FILTER(?o = 1) }",
            &pool,
            8,
        )
        .unwrap();
        let filter_slot = (0..pbuf.len()).find_map(|i| match pbuf.get(i) {
            Some(slot @ PatternSlot::Filter { .. }) => Some(slot),
            _ => None,
        });
        assert!(filter_slot.is_some());
    }

    #[test]
    fn filter_exists_without_parens_is_accepted() {
        let pool = PooledBufferManager::new();
        let (_q, pbuf, _g) = SparqlParser::parse_query(
            "SELECT * WHERE { ?s ?p ?o FILTER NOT EXISTS { ?s <ex:deleted> true } }",
            &pool,
            8,
        )
        .unwrap();
        let has_filter = (0..pbuf.len()).any(|i| matches!(pbuf.get(i), Some(PatternSlot::Filter { .. })));
        assert!(has_filter);
    }

    #[test]
    fn rejects_path_alternation() {
        let pool = PooledBufferManager::new();
        let result = SparqlParser::parse_query(
            "SELECT * WHERE { ?s <ex:p1>|<ex:p2> ?o }",
            &pool,
            8,
        );
        assert!(result.is_err());
    }

    #[test]
    fn nested_select_is_captured_as_a_sub_query() {
        let pool = PooledBufferManager::new();
        let (_q, _pbuf, group) = SparqlParser::parse_query(
            "SELECT ?s WHERE { { SELECT ?s WHERE { ?s <ex:p> ?o } } }",
            &pool,
            8,
        )
        .unwrap();
        assert!(matches!(group, GroupPattern::SubQuery(ref text) if text.contains("SELECT ?s")));
    }

    #[test]
    fn parses_limit_and_offset() {
        let pool = PooledBufferManager::new();
        let (query, ..) = SparqlParser::parse_query(
            "SELECT * WHERE { ?s ?p ?o } LIMIT 10 OFFSET 5",
            &pool,
            8,
        )
        .unwrap();
        assert_eq!(query.modifier.limit, Some(10));
        assert_eq!(query.modifier.offset, Some(5));
    }
}
