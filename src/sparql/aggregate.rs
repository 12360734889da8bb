//! Post-join pipeline: GROUP BY, aggregates, HAVING, DISTINCT/REDUCED,
//! ORDER BY, OFFSET, LIMIT, applied in that order to `scan::run_select`'s
//! materialized rows.
//!
//! Grounded on `lib/oxigraph/src/sparql/eval.rs`'s aggregate accumulator
//! shape: one enum driving a small per-group accumulator, folded over the
//! solution sequence rather than built as a tree of combinator iterators
//! (aggregation runs once, after the scan pipeline is exhausted, so there is
//! no pull-based enumerator to keep small here).

use super::filter::FilterEvaluator;
use super::{Query, SelectClause, SelectItem};
use crate::atom::AtomStore;
use crate::binding::{fnv1a_32, BindingTable, Value, VariableHash};
use crate::error::Result;
use std::cmp::Ordering;

/// One parsed `(expr AS ?var)` aggregate call. `Count`'s `var: None` is
/// `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
enum AggregateCall {
    Count { distinct: bool, var: Option<VariableHash> },
    Sum { distinct: bool, var: VariableHash },
    Avg { distinct: bool, var: VariableHash },
    Min { var: VariableHash },
    Max { var: VariableHash },
    GroupConcat { distinct: bool, var: VariableHash, separator: String },
}

fn strip_distinct(inner: &str) -> (bool, &str) {
    let trimmed = inner.trim_start();
    if trimmed.len() >= 8 && trimmed[..8].eq_ignore_ascii_case("DISTINCT") {
        (true, trimmed[8..].trim_start())
    } else {
        (false, trimmed)
    }
}

fn parse_var(text: &str) -> Option<VariableHash> {
    let t = text.trim();
    if t.starts_with('?') || t.starts_with('$') {
        Some(fnv1a_32(t.as_bytes()))
    } else {
        None
    }
}

fn extract_separator_literal(rest: &str) -> Option<String> {
    let rest = rest.trim_start();
    if rest.len() < 9 || !rest[..9].eq_ignore_ascii_case("SEPARATOR") {
        return None;
    }
    let rest = rest[9..].trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let end = rest[quote.len_utf8()..].find(quote)?;
    Some(rest[quote.len_utf8()..quote.len_utf8() + end].to_string())
}

fn split_group_concat_args(inner: &str) -> (&str, Option<String>) {
    if let Some(semi) = inner.find(';') {
        let var_part = &inner[..semi];
        (var_part, extract_separator_literal(&inner[semi + 1..]))
    } else {
        // `GROUP_CONCAT(?x SEPARATOR "-")` (no semicolon) is also accepted.
        let upper = inner.to_ascii_uppercase();
        match upper.find("SEPARATOR") {
            Some(idx) => (&inner[..idx], extract_separator_literal(&inner[idx..])),
            None => (inner, None),
        }
    }
}

/// Parses one projected `(expr AS ?var)` span into a known aggregate call.
/// Returns `None` for any expression that isn't a recognized aggregate
/// function (e.g. a plain scalar expression), which callers treat as "not
/// an aggregate" rather than an error.
fn parse_aggregate(expr: &str) -> Option<AggregateCall> {
    let trimmed = expr.trim();
    let paren = trimmed.find('(')?;
    let name = trimmed[..paren].trim().to_ascii_uppercase();
    let close = trimmed.rfind(')')?;
    if close <= paren {
        return None;
    }
    let inner = trimmed[paren + 1..close].trim();
    match name.as_str() {
        "COUNT" => {
            let (distinct, rest) = strip_distinct(inner);
            let var = if rest.trim() == "*" { None } else { parse_var(rest) };
            Some(AggregateCall::Count { distinct, var })
        }
        "SUM" => {
            let (distinct, rest) = strip_distinct(inner);
            Some(AggregateCall::Sum { distinct, var: parse_var(rest)? })
        }
        "AVG" => {
            let (distinct, rest) = strip_distinct(inner);
            Some(AggregateCall::Avg { distinct, var: parse_var(rest)? })
        }
        "MIN" => {
            let (_, rest) = strip_distinct(inner);
            Some(AggregateCall::Min { var: parse_var(rest)? })
        }
        "MAX" => {
            let (_, rest) = strip_distinct(inner);
            Some(AggregateCall::Max { var: parse_var(rest)? })
        }
        "GROUP_CONCAT" => {
            let (distinct, rest) = strip_distinct(inner);
            let (var_part, separator) = split_group_concat_args(rest);
            Some(AggregateCall::GroupConcat {
                distinct,
                var: parse_var(var_part)?,
                separator: separator.unwrap_or_else(|| " ".to_string()),
            })
        }
        _ => None,
    }
}

fn value_key(value: &Value, atoms: &AtomStore) -> Result<String> {
    Ok(match value {
        Value::Atom(id) => atoms.get_utf8(*id)?,
        Value::Inline(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
    })
}

fn as_number(value: &Value, atoms: &AtomStore) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Atom(id) => atoms.get_utf8(*id).ok()?.trim().parse().ok(),
        Value::Inline(s) => s.trim().parse().ok(),
    }
}

/// SPARQL's value comparator, approximated: numeric values compare by value,
/// everything else compares by resolved text (Unicode code point order).
/// `AtomStore` doesn't retain per-atom IRI/blank/literal kind after
/// interning, so this doesn't distinguish those three kinds the way the
/// full SPARQL ORDER BY comparator does — see DESIGN.md.
fn compare_values(a: &Value, b: &Value, atoms: &AtomStore) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a, atoms), as_number(b, atoms)) {
        return Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal));
    }
    Ok(value_key(a, atoms)?.cmp(&value_key(b, atoms)?))
}

struct Accumulator {
    call: AggregateCall,
    count: u64,
    total: f64,
    extreme: Option<Value>,
    parts: Vec<String>,
    seen: Vec<String>,
}

impl Accumulator {
    fn new(call: AggregateCall) -> Self {
        Self {
            call,
            count: 0,
            total: 0.0,
            extreme: None,
            parts: Vec::new(),
            seen: Vec::new(),
        }
    }

    fn distinct_gate(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            false
        } else {
            self.seen.push(key);
            true
        }
    }

    fn accumulate(&mut self, row: &BindingTable, atoms: &AtomStore) -> Result<()> {
        match self.call.clone() {
            AggregateCall::Count { distinct, var } => {
                if let Some(v) = var {
                    if !row.is_bound(v) {
                        return Ok(());
                    }
                }
                if distinct {
                    // COUNT(DISTINCT ?x) dedupes on ?x; COUNT(DISTINCT *)
                    // dedupes on the whole row.
                    let key = match var {
                        Some(v) => value_key(row.get(v).expect("checked bound above"), atoms)?,
                        None => {
                            let mut parts: Vec<(VariableHash, String)> = row
                                .iter()
                                .map(|(rv, value)| value_key(value, atoms).map(|s| (rv, s)))
                                .collect::<Result<_>>()?;
                            parts.sort_by_key(|(rv, _)| *rv);
                            format!("{parts:?}")
                        }
                    };
                    if !self.distinct_gate(key) {
                        return Ok(());
                    }
                }
                self.count += 1;
            }
            AggregateCall::Sum { distinct, var } | AggregateCall::Avg { distinct, var } => {
                let Some(value) = row.get(var) else { return Ok(()) };
                if distinct && !self.distinct_gate(value_key(value, atoms)?) {
                    return Ok(());
                }
                if let Some(n) = as_number(value, atoms) {
                    self.total += n;
                    self.count += 1;
                }
            }
            AggregateCall::Min { var } => {
                let Some(value) = row.get(var) else { return Ok(()) };
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => compare_values(value, current, atoms)? == Ordering::Less,
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateCall::Max { var } => {
                let Some(value) = row.get(var) else { return Ok(()) };
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => compare_values(value, current, atoms)? == Ordering::Greater,
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateCall::GroupConcat { distinct, var, .. } => {
                let Some(value) = row.get(var) else { return Ok(()) };
                let text = value_key(value, atoms)?;
                if distinct && !self.distinct_gate(text.clone()) {
                    return Ok(());
                }
                self.parts.push(text);
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self.call {
            AggregateCall::Count { .. } => Value::Number(self.count as f64),
            AggregateCall::Sum { .. } => Value::Number(self.total),
            AggregateCall::Avg { .. } => {
                if self.count == 0 {
                    Value::Number(0.0)
                } else {
                    Value::Number(self.total / self.count as f64)
                }
            }
            AggregateCall::Min { .. } | AggregateCall::Max { .. } => {
                self.extreme.unwrap_or(Value::Inline(String::new()))
            }
            AggregateCall::GroupConcat { separator, .. } => Value::Inline(self.parts.join(&separator)),
        }
    }
}

fn select_items(select: &SelectClause) -> &[SelectItem] {
    match select {
        SelectClause::Star => &[],
        SelectClause::Distinct(items) | SelectClause::Reduced(items) | SelectClause::Plain(items) => items,
    }
}

fn aggregate_calls(select: &SelectClause) -> Vec<(VariableHash, AggregateCall)> {
    select_items(select)
        .iter()
        .filter_map(|item| match item {
            SelectItem::Expr { expr, var } => {
                parse_aggregate(expr).map(|call| (fnv1a_32(var.as_bytes()), call))
            }
            SelectItem::Var(_) => None,
        })
        .collect()
}

fn group_rows(
    group_by: &[String],
    calls: Vec<(VariableHash, AggregateCall)>,
    rows: Vec<BindingTable>,
    atoms: &AtomStore,
) -> Result<Vec<BindingTable>> {
    let group_vars: Vec<VariableHash> = group_by.iter().map(|v| fnv1a_32(v.as_bytes())).collect();
    let mut keys: Vec<Vec<Option<Value>>> = Vec::new();
    let mut states: Vec<(BindingTable, Vec<Accumulator>)> = Vec::new();

    for row in &rows {
        let key: Vec<Option<Value>> = group_vars.iter().map(|v| row.get(*v).cloned()).collect();
        let index = keys.iter().position(|k| k == &key);
        let index = match index {
            Some(i) => i,
            None => {
                let mut key_binding = BindingTable::new();
                for (var, value) in group_vars.iter().zip(key.iter()) {
                    if let Some(value) = value {
                        key_binding.set(*var, value.clone());
                    }
                }
                let accumulators = calls.iter().map(|(_, c)| Accumulator::new(c.clone())).collect();
                keys.push(key);
                states.push((key_binding, accumulators));
                states.len() - 1
            }
        };
        for accumulator in states[index].1.iter_mut() {
            accumulator.accumulate(row, atoms)?;
        }
    }

    // Aggregates with no GROUP BY over zero input rows still yield one row
    // (e.g. `COUNT(*)` over an empty result set is `0`, not "no rows").
    if states.is_empty() && group_vars.is_empty() && !calls.is_empty() {
        let accumulators = calls.iter().map(|(_, c)| Accumulator::new(c.clone())).collect();
        states.push((BindingTable::new(), accumulators));
    }

    let mut out = Vec::with_capacity(states.len());
    for (mut row, accumulators) in states {
        for (accumulator, (var, _)) in accumulators.into_iter().zip(calls.iter()) {
            row.set(*var, accumulator.finish());
        }
        out.push(row);
    }
    Ok(out)
}

fn dedupe_rows(rows: Vec<BindingTable>, atoms: &AtomStore) -> Result<Vec<BindingTable>> {
    let mut seen: Vec<Vec<(VariableHash, String)>> = Vec::with_capacity(rows.len());
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut key: Vec<(VariableHash, String)> = Vec::new();
        for (var, value) in row.iter() {
            key.push((var, value_key(value, atoms)?));
        }
        key.sort_by_key(|(var, _)| *var);
        if !seen.contains(&key) {
            seen.push(key);
            out.push(row);
        }
    }
    Ok(out)
}

enum SortPart {
    Unbound,
    Num(f64),
    Text(String),
}

fn compare_parts(a: &SortPart, b: &SortPart) -> Ordering {
    match (a, b) {
        (SortPart::Unbound, SortPart::Unbound) => Ordering::Equal,
        (SortPart::Unbound, _) => Ordering::Less,
        (_, SortPart::Unbound) => Ordering::Greater,
        (SortPart::Num(x), SortPart::Num(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SortPart::Num(_), SortPart::Text(_)) => Ordering::Less,
        (SortPart::Text(_), SortPart::Num(_)) => Ordering::Greater,
        (SortPart::Text(x), SortPart::Text(y)) => x.cmp(y),
    }
}

fn sort_rows(rows: Vec<BindingTable>, order_by: &[(String, bool)], atoms: &AtomStore) -> Result<Vec<BindingTable>> {
    let keys: Vec<(VariableHash, bool)> = order_by
        .iter()
        .map(|(v, desc)| (fnv1a_32(v.as_bytes()), *desc))
        .collect();
    let mut indexed: Vec<(Vec<SortPart>, BindingTable)> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut parts = Vec::with_capacity(keys.len());
        for (var, _) in &keys {
            parts.push(match row.get(*var) {
                None => SortPart::Unbound,
                Some(value) => match as_number(value, atoms) {
                    Some(n) => SortPart::Num(n),
                    None => SortPart::Text(value_key(value, atoms)?),
                },
            });
        }
        indexed.push((parts, row));
    }
    indexed.sort_by(|a, b| {
        for (i, (pa, pb)) in a.0.iter().zip(b.0.iter()).enumerate() {
            let ord = compare_parts(pa, pb);
            let ord = if keys[i].1 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(indexed.into_iter().map(|(_, row)| row).collect())
}

/// Runs the full post-join pipeline over `rows`. A no-op pass-through for
/// query forms that don't carry a `SelectClause` (ASK/CONSTRUCT/DESCRIBE are
/// handled by their own callers before or instead of reaching here).
pub fn run(
    query: &Query,
    rows: Vec<BindingTable>,
    atoms: &AtomStore,
    filter: &FilterEvaluator,
) -> Result<Vec<BindingTable>> {
    let Some(select) = &query.select else {
        return Ok(rows);
    };
    let calls = aggregate_calls(select);
    let grouped = !query.modifier.group_by.is_empty() || !calls.is_empty();
    let mut rows = if grouped {
        group_rows(&query.modifier.group_by, calls, rows, atoms)?
    } else {
        rows
    };

    if let Some(having) = &query.modifier.having {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if filter.eval_bool(having, &row)? {
                kept.push(row);
            }
        }
        rows = kept;
    }

    if matches!(select, SelectClause::Distinct(_) | SelectClause::Reduced(_)) {
        rows = dedupe_rows(rows, atoms)?;
    }

    if !query.modifier.order_by.is_empty() {
        rows = sort_rows(rows, &query.modifier.order_by, atoms)?;
    }

    if let Some(offset) = query.modifier.offset {
        rows = rows.into_iter().skip(offset as usize).collect();
    }
    if let Some(limit) = query.modifier.limit {
        rows.truncate(limit as usize);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparql::{QueryForm, SolutionModifier, TemporalClause};
    use tempfile::TempDir;

    fn test_atoms() -> (TempDir, AtomStore, crate::trigram::TrigramIndex) {
        let dir = TempDir::new().unwrap();
        let store = AtomStore::open(dir.path().join("atoms")).unwrap();
        let trigram = crate::trigram::TrigramIndex::open(dir.path().join("trigram")).unwrap();
        (dir, store, trigram)
    }

    fn query_with(select: SelectClause, modifier: SolutionModifier) -> Query {
        Query {
            form: Some(QueryForm::Select),
            select: Some(select),
            prefixes: Vec::new(),
            modifier,
            temporal: TemporalClause::None,
            with_graph: None,
            construct_template: None,
            describe_targets: Vec::new(),
        }
    }

    #[test]
    fn count_star_over_two_rows_is_two() {
        let (_dir, atoms, trigram) = test_atoms();
        let n = fnv1a_32(b"n");
        let select = SelectClause::Plain(vec![SelectItem::Expr {
            expr: "COUNT(*)".to_string(),
            var: "n".to_string(),
        }]);
        let query = query_with(select, SolutionModifier::default());
        let mut a = BindingTable::new();
        a.set(fnv1a_32(b"?o"), Value::Inline("1".to_string()));
        let mut b = BindingTable::new();
        b.set(fnv1a_32(b"?o"), Value::Inline("2".to_string()));
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let rows = run(&query, vec![a, b], &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(n), Some(&Value::Number(2.0)));
    }

    #[test]
    fn count_with_no_rows_still_yields_zero() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![SelectItem::Expr {
            expr: "COUNT(*)".to_string(),
            var: "n".to_string(),
        }]);
        let query = query_with(select, SolutionModifier::default());
        let rows = run(&query, Vec::new(), &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(fnv1a_32(b"n")), Some(&Value::Number(0.0)));
    }

    #[test]
    fn group_by_partitions_before_aggregating() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![
            SelectItem::Var("?g".to_string()),
            SelectItem::Expr { expr: "COUNT(*)".to_string(), var: "n".to_string() },
        ]);
        let mut modifier = SolutionModifier::default();
        modifier.group_by.push("?g".to_string());
        let query = query_with(select, modifier);
        let g = fnv1a_32(b"?g");
        let mut a = BindingTable::new();
        a.set(g, Value::Inline("x".to_string()));
        let mut b = BindingTable::new();
        b.set(g, Value::Inline("x".to_string()));
        let mut c = BindingTable::new();
        c.set(g, Value::Inline("y".to_string()));
        let rows = run(&query, vec![a, b, c], &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 2);
        let total: f64 = rows
            .iter()
            .map(|r| match r.get(fnv1a_32(b"n")) {
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            })
            .sum();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn sum_and_avg_ignore_unparseable_values() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![
            SelectItem::Expr { expr: "SUM(?v)".to_string(), var: "s".to_string() },
            SelectItem::Expr { expr: "AVG(?v)".to_string(), var: "a".to_string() },
        ]);
        let query = query_with(select, SolutionModifier::default());
        let v = fnv1a_32(b"?v");
        let mut a = BindingTable::new();
        a.set(v, Value::Number(10.0));
        let mut b = BindingTable::new();
        b.set(v, Value::Number(20.0));
        let rows = run(&query, vec![a, b], &atoms, &filter).unwrap();
        assert_eq!(rows[0].get(fnv1a_32(b"s")), Some(&Value::Number(30.0)));
        assert_eq!(rows[0].get(fnv1a_32(b"a")), Some(&Value::Number(15.0)));
    }

    #[test]
    fn min_and_max_over_numeric_values() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![
            SelectItem::Expr { expr: "MIN(?v)".to_string(), var: "lo".to_string() },
            SelectItem::Expr { expr: "MAX(?v)".to_string(), var: "hi".to_string() },
        ]);
        let query = query_with(select, SolutionModifier::default());
        let v = fnv1a_32(b"?v");
        let rows_in: Vec<BindingTable> = [3.0, 1.0, 2.0]
            .iter()
            .map(|n| {
                let mut row = BindingTable::new();
                row.set(v, Value::Number(*n));
                row
            })
            .collect();
        let rows = run(&query, rows_in, &atoms, &filter).unwrap();
        assert_eq!(rows[0].get(fnv1a_32(b"lo")), Some(&Value::Number(1.0)));
        assert_eq!(rows[0].get(fnv1a_32(b"hi")), Some(&Value::Number(3.0)));
    }

    #[test]
    fn group_concat_joins_with_custom_separator() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![SelectItem::Expr {
            expr: "GROUP_CONCAT(?v;SEPARATOR=\"-\")".to_string(),
            var: "c".to_string(),
        }]);
        let query = query_with(select, SolutionModifier::default());
        let v = fnv1a_32(b"?v");
        let mut a = BindingTable::new();
        a.set(v, Value::Inline("a".to_string()));
        let mut b = BindingTable::new();
        b.set(v, Value::Inline("b".to_string()));
        let rows = run(&query, vec![a, b], &atoms, &filter).unwrap();
        assert_eq!(rows[0].get(fnv1a_32(b"c")), Some(&Value::Inline("a-b".to_string())));
    }

    #[test]
    fn having_filters_out_groups_below_threshold() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![
            SelectItem::Var("?g".to_string()),
            SelectItem::Expr { expr: "COUNT(*)".to_string(), var: "n".to_string() },
        ]);
        let mut modifier = SolutionModifier::default();
        modifier.group_by.push("?g".to_string());
        modifier.having = Some("?n > 1".to_string());
        let query = query_with(select, modifier);
        let g = fnv1a_32(b"?g");
        let mut a = BindingTable::new();
        a.set(g, Value::Inline("x".to_string()));
        let mut b = BindingTable::new();
        b.set(g, Value::Inline("x".to_string()));
        let mut c = BindingTable::new();
        c.set(g, Value::Inline("y".to_string()));
        let rows = run(&query, vec![a, b, c], &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(g), Some(&Value::Inline("x".to_string())));
    }

    #[test]
    fn distinct_removes_duplicate_rows() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Distinct(vec![SelectItem::Var("?x".to_string())]);
        let query = query_with(select, SolutionModifier::default());
        let x = fnv1a_32(b"?x");
        let mut a = BindingTable::new();
        a.set(x, Value::Number(1.0));
        let mut b = BindingTable::new();
        b.set(x, Value::Number(1.0));
        let rows = run(&query, vec![a, b], &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn order_by_sorts_numerically_then_limit_applies() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![SelectItem::Var("?x".to_string())]);
        let mut modifier = SolutionModifier::default();
        modifier.order_by.push(("?x".to_string(), false));
        modifier.limit = Some(1);
        let query = query_with(select, modifier);
        let x = fnv1a_32(b"?x");
        let rows_in: Vec<BindingTable> = [3.0, 1.0, 2.0]
            .iter()
            .map(|n| {
                let mut row = BindingTable::new();
                row.set(x, Value::Number(*n));
                row
            })
            .collect();
        let rows = run(&query, rows_in, &atoms, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(x), Some(&Value::Number(1.0)));
    }

    #[test]
    fn order_by_descending_reverses_order() {
        let (_dir, atoms, trigram) = test_atoms();
        let filter = FilterEvaluator::new(&atoms, &trigram);
        let select = SelectClause::Plain(vec![SelectItem::Var("?x".to_string())]);
        let mut modifier = SolutionModifier::default();
        modifier.order_by.push(("?x".to_string(), true));
        let query = query_with(select, modifier);
        let x = fnv1a_32(b"?x");
        let rows_in: Vec<BindingTable> = [1.0, 3.0, 2.0]
            .iter()
            .map(|n| {
                let mut row = BindingTable::new();
                row.set(x, Value::Number(*n));
                row
            })
            .collect();
        let rows = run(&query, rows_in, &atoms, &filter).unwrap();
        let values: Vec<f64> = rows
            .iter()
            .map(|r| match r.get(x) {
                Some(Value::Number(n)) => *n,
                _ => 0.0,
            })
            .collect();
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
    }
}
