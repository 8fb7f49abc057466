//! Shared test doubles
//!
//! `MemoryDatabase` is an in-memory table store behind the real connection
//! pool. It parses and evaluates the statement shapes tabsync generates
//! (rendered PostgreSQL placeholders included), so integration tests run the
//! production SQL end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsync::db::Database;
use tabsync::field::{FieldType, Instance};
use tabsync::forward::Forwarder;
use tabsync::registry::Source;
use tabsync_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory, Cursor};
use tabsync_rdbc::dialect::PostgresDialect;
use tabsync_rdbc::pool::{PoolConfig, SimpleConnectionPool};
use tabsync_rdbc::types::{Row, Value};
use tabsync_rdbc::{Error, Result};
use tokio::sync::Notify;

// ==================== Memory Database ====================

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// In-memory tables plus instrumentation
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<HashMap<String, Table>>,
    statements: Mutex<Vec<String>>,
    fetch_sizes: Mutex<Vec<usize>>,
    open_cursors: AtomicUsize,
    cursors_opened: AtomicUsize,
    inserts_before_failure: Mutex<Option<usize>>,
    fail_fetches: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) {
        self.tables.lock().insert(
            name.to_string(),
            Table {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Insert a row directly, bypassing SQL
    pub fn seed(&self, table: &str, values: Vec<Value>) {
        let mut tables = self.tables.lock();
        let t = tables.get_mut(table).expect("unknown table");
        assert_eq!(t.columns.len(), values.len());
        t.rows.push(values);
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn fetch_sizes(&self) -> Vec<usize> {
        self.fetch_sizes.lock().clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn cursors_opened(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst)
    }

    /// Let `n` more inserts succeed, then fail every following one
    pub fn fail_inserts_after(&self, n: usize) {
        *self.inserts_before_failure.lock() = Some(n);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make every cursor fetch take `delay`
    pub fn slow_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    /// Run a rendered SELECT without going through a connection
    pub fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match self.run(sql, params)? {
            StatementResult::Rows(rows) => Ok(rows),
            StatementResult::Affected(_) => Err(Error::query("not a query")),
        }
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.statements.lock().push(sql.to_string());
        let tokens = tokenize(sql)?;
        let statement = Parser::new(tokens).statement()?;

        match statement {
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                {
                    let mut budget = self.inserts_before_failure.lock();
                    if let Some(n) = budget.as_mut() {
                        if *n == 0 {
                            return Err(Error::query("injected insert failure"));
                        }
                        *n -= 1;
                    }
                }
                let mut tables = self.tables.lock();
                let t = tables
                    .get_mut(&table)
                    .ok_or_else(|| Error::query(format!("relation \"{}\" does not exist", table)))?;
                let mut row = vec![Value::Null; t.columns.len()];
                for (column, expr) in columns.iter().zip(values.iter()) {
                    let idx = t
                        .columns
                        .iter()
                        .position(|c| c == column)
                        .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", column)))?;
                    row[idx] = eval(expr, &[], &[], params)?;
                }
                t.rows.push(row);
                Ok(StatementResult::Affected(1))
            }
            Statement::Select(select) => {
                let tables = self.tables.lock();
                let t = tables.get(&select.table).ok_or_else(|| {
                    Error::query(format!("relation \"{}\" does not exist", select.table))
                })?;
                Ok(StatementResult::Rows(run_select(&select, t, params)?))
            }
        }
    }
}

enum StatementResult {
    Rows(Vec<Row>),
    Affected(u64),
}

fn run_select(select: &Select, table: &Table, params: &[Value]) -> Result<Vec<Row>> {
    let mut matching = Vec::new();
    for row in &table.rows {
        let keep = match &select.filter {
            Some(expr) => eval(expr, &table.columns, row, params)? == Value::Bool(true),
            None => true,
        };
        if keep {
            matching.push(row.clone());
        }
    }

    if let Projection::Count = select.projection {
        return Ok(vec![Row::new(
            vec!["count".into()],
            vec![Value::Int64(matching.len() as i64)],
        )]);
    }

    let column_index = |name: &str| -> Result<usize> {
        table
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", name)))
    };

    if let Some((column, asc)) = &select.order_by {
        let idx = column_index(column)?;
        matching.sort_by(|a, b| order_values(&a[idx], &b[idx], *asc));
    }

    let (names, indices): (Vec<String>, Vec<usize>) = match &select.projection {
        Projection::All => (table.columns.clone(), (0..table.columns.len()).collect()),
        Projection::Columns(cols) => {
            let indices = cols.iter().map(|c| column_index(c)).collect::<Result<Vec<_>>>()?;
            (cols.clone(), indices)
        }
        Projection::Count => unreachable!(),
    };

    let mut projected: Vec<Vec<Value>> = matching
        .iter()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect();

    if select.distinct {
        let mut unique: Vec<Vec<Value>> = Vec::new();
        for row in projected {
            if !unique.contains(&row) {
                unique.push(row);
            }
        }
        projected = unique;
    }

    let offset = select.offset.unwrap_or(0) as usize;
    let limit = select.limit.map(|l| l as usize).unwrap_or(usize::MAX);

    Ok(projected
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|values| Row::new(names.clone(), values))
        .collect())
}

/// PostgreSQL default ordering: NULLS LAST ascending, NULLS FIRST descending
fn order_values(a: &Value, b: &Value, asc: bool) -> CmpOrdering {
    let ord = match (a.is_null(), b.is_null()) {
        (true, true) => CmpOrdering::Equal,
        (true, false) => CmpOrdering::Greater,
        (false, true) => CmpOrdering::Less,
        (false, false) => compare(a, b).unwrap_or(CmpOrdering::Equal),
    };
    if asc {
        ord
    } else {
        ord.reverse()
    }
}

fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (x, y) => match (numeric(x), numeric(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int64(n) => Some(*n as f64),
        Value::Float64(n) => Some(*n),
        _ => None,
    }
}

fn as_text(v: &Value) -> Value {
    match v {
        Value::Null => Value::Null,
        Value::Float64(n) if n.fract() == 0.0 && n.is_finite() => {
            Value::String(format!("{}", *n as i64))
        }
        other => other.as_string().map(Value::String).unwrap_or(Value::Null),
    }
}

/// SQL LIKE with `%`, `_` and a single-character escape
pub fn like_matches(text: &str, pattern: &str, escape: Option<char>) -> bool {
    enum Tok {
        Any,
        One,
        Lit(char),
    }

    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(next) = chars.next() {
                toks.push(Tok::Lit(next));
            }
        } else if c == '%' {
            toks.push(Tok::Any);
        } else if c == '_' {
            toks.push(Tok::One);
        } else {
            toks.push(Tok::Lit(c));
        }
    }

    let text: Vec<char> = text.chars().collect();
    // dp[j]: pattern prefix of length i matches text prefix of length j
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for tok in &toks {
        let mut next = vec![false; text.len() + 1];
        match tok {
            Tok::Any => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= dp[j];
                    next[j] = reachable;
                }
            }
            Tok::One => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            Tok::Lit(c) => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

// ==================== SQL Subset ====================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Word(String),
    Param(usize),
    Str(String),
    Number(String),
    Punct(&'static str),
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') if chars.get(i + 1) == Some(&'"') => {
                            s.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(Error::query("unterminated identifier")),
                    }
                }
                tokens.push(Token::Ident(s));
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(Error::query("unterminated literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let n: usize = chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| Error::query("bad placeholder"))?;
                // Skip the ::type annotation
                if chars.get(i) == Some(&':') && chars.get(i + 1) == Some(&':') {
                    i += 2;
                    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                }
                tokens.push(Token::Param(n - 1));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Punct("<="));
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Punct(">="));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Punct("<>"));
                i += 2;
            }
            '(' | ')' | ',' | '*' | '=' | '<' | '>' => {
                tokens.push(Token::Punct(match c {
                    '(' => "(",
                    ')' => ")",
                    ',' => ",",
                    '*' => "*",
                    '=' => "=",
                    '<' => "<",
                    _ => ">",
                }));
                i += 1;
            }
            other => return Err(Error::query(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Column(String),
    Param(usize),
    Literal(Value),
    Lower(Box<Expr>),
    CastText(Box<Expr>),
    Compare(Box<Expr>, &'static str, Box<Expr>),
    Like(Box<Expr>, Box<Expr>, Option<char>),
    IsNull(Box<Expr>, bool),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug)]
enum Projection {
    All,
    Count,
    Columns(Vec<String>),
}

#[derive(Debug)]
struct Select {
    distinct: bool,
    projection: Projection,
    table: String,
    filter: Option<Expr>,
    order_by: Option<(String, bool)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

#[derive(Debug)]
enum Statement {
    Select(Select),
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(x)) if x == w)
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(x)) if *x == p)
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.is_word(w) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, w: &str) -> Result<()> {
        if self.eat_word(w) {
            Ok(())
        } else {
            Err(Error::query(format!("expected {} at {:?}", w, self.peek())))
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(Error::query(format!("expected '{}' at {:?}", p, self.peek())))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(Error::query(format!("expected identifier, got {:?}", other))),
        }
    }

    fn number(&mut self) -> Result<u64> {
        match self.next() {
            Some(Token::Number(n)) => n.parse().map_err(|_| Error::query("bad number")),
            other => Err(Error::query(format!("expected number, got {:?}", other))),
        }
    }

    fn statement(mut self) -> Result<Statement> {
        let statement = if self.eat_word("INSERT") {
            self.insert()?
        } else if self.eat_word("SELECT") {
            Statement::Select(self.select()?)
        } else {
            return Err(Error::query(format!("unsupported statement at {:?}", self.peek())));
        };
        if self.pos < self.tokens.len() {
            return Err(Error::query(format!("trailing input at {:?}", self.peek())));
        }
        Ok(statement)
    }

    fn insert(&mut self) -> Result<Statement> {
        self.expect_word("INTO")?;
        let table = self.ident()?;
        self.expect_punct("(")?;
        let mut columns = vec![self.ident()?];
        while self.eat_punct(",") {
            columns.push(self.ident()?);
        }
        self.expect_punct(")")?;
        self.expect_word("VALUES")?;
        self.expect_punct("(")?;
        let mut values = vec![self.operand()?];
        while self.eat_punct(",") {
            values.push(self.operand()?);
        }
        self.expect_punct(")")?;
        if columns.len() != values.len() {
            return Err(Error::query("INSERT has more target columns than expressions"));
        }
        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn select(&mut self) -> Result<Select> {
        let distinct = self.eat_word("DISTINCT");
        let projection = if self.eat_punct("*") {
            Projection::All
        } else if self.eat_word("COUNT") {
            self.expect_punct("(")?;
            self.expect_punct("*")?;
            self.expect_punct(")")?;
            Projection::Count
        } else {
            let mut cols = vec![self.ident()?];
            while self.eat_punct(",") {
                cols.push(self.ident()?);
            }
            Projection::Columns(cols)
        };

        self.expect_word("FROM")?;
        let table = self.ident()?;

        let filter = if self.eat_word("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };

        let order_by = if self.eat_word("ORDER") {
            self.expect_word("BY")?;
            let col = self.ident()?;
            let asc = if self.eat_word("DESC") {
                false
            } else {
                self.eat_word("ASC");
                true
            };
            Some((col, asc))
        } else {
            None
        };

        let limit = if self.eat_word("LIMIT") {
            Some(self.number()?)
        } else {
            None
        };
        let offset = if self.eat_word("OFFSET") {
            Some(self.number()?)
        } else {
            None
        };

        Ok(Select {
            distinct,
            projection,
            table,
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_word("OR") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_word("AND") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_word("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr> {
        let left = self.operand()?;

        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            self.expect_word("NULL")?;
            return Ok(Expr::IsNull(Box::new(left), negated));
        }

        if self.eat_word("LIKE") {
            let pattern = self.operand()?;
            let escape = if self.eat_word("ESCAPE") {
                match self.next() {
                    Some(Token::Str(s)) => s.chars().next(),
                    other => return Err(Error::query(format!("bad ESCAPE {:?}", other))),
                }
            } else {
                None
            };
            return Ok(Expr::Like(Box::new(left), Box::new(pattern), escape));
        }

        for op in ["=", "<>", "<=", ">=", "<", ">"] {
            if self.eat_punct(op) {
                let right = self.operand()?;
                return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
            }
        }

        Ok(left)
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Punct("(")) => {
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => Ok(Expr::Column(name)),
            Some(Token::Param(i)) => Ok(Expr::Param(i)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(
                n.parse::<f64>()
                    .map(Value::Float64)
                    .map_err(|_| Error::query("bad number"))?,
            )),
            Some(Token::Word(w)) if w == "NULL" => Ok(Expr::Literal(Value::Null)),
            Some(Token::Word(w)) if w == "TRUE" => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::Word(w)) if w == "FALSE" => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Word(w)) if w == "LOWER" => {
                self.expect_punct("(")?;
                let inner = self.operand()?;
                self.expect_punct(")")?;
                Ok(Expr::Lower(Box::new(inner)))
            }
            Some(Token::Word(w)) if w == "CAST" => {
                self.expect_punct("(")?;
                let inner = self.operand()?;
                self.expect_word("AS")?;
                self.expect_word("TEXT")?;
                self.expect_punct(")")?;
                Ok(Expr::CastText(Box::new(inner)))
            }
            other => Err(Error::query(format!("unexpected token {:?}", other))),
        }
    }
}

fn truth(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn from_truth(b: Option<bool>) -> Value {
    b.map(Value::Bool).unwrap_or(Value::Null)
}

fn eval(expr: &Expr, columns: &[String], row: &[Value], params: &[Value]) -> Result<Value> {
    Ok(match expr {
        Expr::Column(name) => {
            let idx = columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", name)))?;
            row[idx].clone()
        }
        Expr::Param(i) => params
            .get(*i)
            .cloned()
            .ok_or_else(|| Error::query(format!("missing parameter ${}", i + 1)))?,
        Expr::Literal(v) => v.clone(),
        Expr::Lower(inner) => match eval(inner, columns, row, params)? {
            Value::String(s) => Value::String(s.to_lowercase()),
            Value::Null => Value::Null,
            other => return Err(Error::query(format!("LOWER of non-text {:?}", other))),
        },
        Expr::CastText(inner) => as_text(&eval(inner, columns, row, params)?),
        Expr::Compare(l, op, r) => {
            let l = eval(l, columns, row, params)?;
            let r = eval(r, columns, row, params)?;
            from_truth(compare(&l, &r).map(|ord| match *op {
                "=" => ord == CmpOrdering::Equal,
                "<>" => ord != CmpOrdering::Equal,
                "<" => ord == CmpOrdering::Less,
                "<=" => ord != CmpOrdering::Greater,
                ">" => ord == CmpOrdering::Greater,
                _ => ord != CmpOrdering::Less,
            }))
        }
        Expr::Like(text, pattern, escape) => {
            let text = eval(text, columns, row, params)?;
            let pattern = eval(pattern, columns, row, params)?;
            match (text, pattern) {
                (Value::String(t), Value::String(p)) => Value::Bool(like_matches(&t, &p, *escape)),
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                (t, _) => return Err(Error::query(format!("LIKE on non-text {:?}", t))),
            }
        }
        Expr::IsNull(inner, negated) => {
            let is_null = eval(inner, columns, row, params)?.is_null();
            Value::Bool(is_null != *negated)
        }
        Expr::And(l, r) => {
            let l = truth(&eval(l, columns, row, params)?);
            let r = truth(&eval(r, columns, row, params)?);
            match (l, r) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }
        }
        Expr::Or(l, r) => {
            let l = truth(&eval(l, columns, row, params)?);
            let r = truth(&eval(r, columns, row, params)?);
            match (l, r) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }
        }
        Expr::Not(inner) => from_truth(truth(&eval(inner, columns, row, params)?).map(|b| !b)),
    })
}

// ==================== Connection Plumbing ====================

/// One session. While a cursor is open the session is inside the cursor's
/// transaction and refuses other statements; closing the session ends that
/// transaction the way a server does when the client goes away.
struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    in_cursor: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn ensure_idle(&self) -> Result<()> {
        if self.in_cursor.load(Ordering::SeqCst) {
            return Err(Error::transaction("session is busy with an open cursor"));
        }
        Ok(())
    }

    fn end_cursor_transaction(db: &MemoryDatabase, in_cursor: &AtomicBool) {
        if in_cursor.swap(false, Ordering::SeqCst) {
            db.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MemoryCursor {
    db: Arc<MemoryDatabase>,
    in_cursor: Arc<AtomicBool>,
    rows: std::vec::IntoIter<Row>,
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let delay = *self.db.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.db.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::query("injected fetch failure"));
        }
        self.db.fetch_sizes.lock().push(max_rows);
        Ok(self.rows.by_ref().take(max_rows).collect())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        MemoryConnection::end_cursor_transaction(&self.db, &self.in_cursor);
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_idle()?;
        match self.db.run(sql, params)? {
            StatementResult::Rows(rows) => Ok(rows),
            StatementResult::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_idle()?;
        match self.db.run(sql, params)? {
            StatementResult::Rows(rows) => Ok(rows.len() as u64),
            StatementResult::Affected(n) => Ok(n),
        }
    }

    async fn open_cursor(&self, sql: &str, params: &[Value]) -> Result<Box<dyn Cursor>> {
        self.ensure_idle()?;
        let rows = match self.db.run(sql, params)? {
            StatementResult::Rows(rows) => rows,
            StatementResult::Affected(_) => return Err(Error::query("cursor over non-query")),
        };
        self.in_cursor.store(true, Ordering::SeqCst);
        self.db.open_cursors.fetch_add(1, Ordering::SeqCst);
        self.db.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            db: Arc::clone(&self.db),
            in_cursor: Arc::clone(&self.in_cursor),
            rows: rows.into_iter(),
        }))
    }

    async fn is_valid(&self) -> bool {
        // A liveness check passes inside an open transaction too.
        true
    }

    async fn close(&self) -> Result<()> {
        Self::end_cursor_transaction(&self.db, &self.in_cursor);
        Ok(())
    }
}

struct MemoryFactory {
    db: Arc<MemoryDatabase>,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            db: Arc::clone(&self.db),
            in_cursor: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A [`Database`] over the real pool and dialect, backed by `memory`
pub async fn database(memory: &Arc<MemoryDatabase>, max_connections: usize) -> Database {
    let config = PoolConfig::new("memory://test")
        .with_min_size(0)
        .with_max_size(max_connections)
        .with_acquire_timeout(Duration::from_secs(5));
    let pool = SimpleConnectionPool::new(
        config,
        Arc::new(MemoryFactory {
            db: Arc::clone(memory),
        }),
    )
    .await
    .expect("pool");
    Database::new(pool, Arc::new(PostgresDialect))
}

// ==================== Sources ====================

/// Source over `table` whose fields are `(name, type)` pairs
pub fn source(table: &str, public_key: &str, secret_key: &str, fields: &[(&str, FieldType)]) -> Source {
    Source::new(
        table,
        public_key,
        secret_key,
        None,
        fields.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
    )
    .expect("valid source")
}

/// Create the backing table of `source` in `memory`
pub fn create_table_for(memory: &MemoryDatabase, source: &Source) {
    let columns: Vec<&str> = source.fields().iter().map(|f| f.name.as_str()).collect();
    memory.create_table(source.table(), &columns);
}

// ==================== Forwarders ====================

/// One forward attempt as seen by a test forwarder
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardCall {
    pub public_key: String,
    pub instances: Vec<Instance>,
}

/// Records every call; fails the first `failures` attempts and every call
/// for a blocked source
#[derive(Default)]
pub struct RecordingForwarder {
    attempts: Mutex<Vec<ForwardCall>>,
    delivered: Mutex<Vec<ForwardCall>>,
    remaining_failures: AtomicUsize,
    blocked: Mutex<Vec<String>>,
    changed: Notify,
}

impl RecordingForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(failures: usize) -> Arc<Self> {
        let forwarder = Self::default();
        forwarder.remaining_failures.store(failures, Ordering::SeqCst);
        Arc::new(forwarder)
    }

    pub fn set_failures(&self, failures: usize) {
        self.remaining_failures.store(failures, Ordering::SeqCst);
    }

    /// Fail every call made for `public_key`
    pub fn block(&self, public_key: &str) {
        self.blocked.lock().push(public_key.to_string());
    }

    /// Every attempt, failed ones included
    pub fn attempts(&self) -> Vec<ForwardCall> {
        self.attempts.lock().clone()
    }

    /// Acknowledged calls only
    pub fn delivered(&self) -> Vec<ForwardCall> {
        self.delivered.lock().clone()
    }

    /// Instances acknowledged so far, in delivery order
    pub fn delivered_instances(&self) -> Vec<Instance> {
        self.delivered
            .lock()
            .iter()
            .flat_map(|c| c.instances.clone())
            .collect()
    }

    /// Wait until at least `n` calls were acknowledged
    pub async fn wait_for_deliveries(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.delivered.lock().len() >= n {
                return;
            }
            changed.await;
        }
    }

    /// Wait until at least `n` attempts were made
    pub async fn wait_for_attempts(&self, n: usize) {
        loop {
            let changed = self.changed.notified();
            if self.attempts.lock().len() >= n {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(&self, source: &Source, instances: &[Instance]) -> tabsync::Result<()> {
        let call = ForwardCall {
            public_key: source.public_key().to_string(),
            instances: instances.to_vec(),
        };
        self.attempts.lock().push(call.clone());

        let failed = self.blocked.lock().contains(&call.public_key)
            || self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        let result = if failed {
            Err(tabsync::Error::forward("platform unavailable", Some(503)))
        } else {
            self.delivered.lock().push(call);
            Ok(())
        };
        self.changed.notify_waiters();
        result
    }
}
