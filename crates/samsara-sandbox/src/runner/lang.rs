//! The guest expression language.
//!
//! A deliberately small, line-oriented language: each logical line is an
//! assignment (`name = expr`) or a bare expression. Open brackets join
//! physical lines, so multi-line calls work the way the planner writes them.
//! There is no control flow; the builtin helpers (`chunk`, `join`,
//! `llm_query_batched`, …) cover the exploration patterns the system prompt
//! teaches.

use super::value::{Builtin, Namespace, Value, show_vars};

/// An evaluation error, rendered into the execute reply's `error` field.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestError {
    pub message: String,
    pub line: Option<usize>,
}

impl GuestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    fn at(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    pub fn render(&self) -> String {
        match self.line {
            Some(line) => format!("line {}: {}", line, self.message),
            None => self.message.clone(),
        }
    }
}

type EvalResult<T> = Result<T, GuestError>;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    True,
    False,
    NoneLit,
    Assign,
    Eq,
    Ne,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Newline,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    line: usize,
}

fn lex(code: &str) -> EvalResult<Vec<Spanned>> {
    let mut toks = Vec::new();
    let mut chars = code.chars().peekable();
    let mut line = 1usize;
    let mut depth = 0usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                // Open brackets join physical lines.
                if depth == 0 {
                    toks.push(Spanned {
                        tok: Tok::Newline,
                        line,
                    });
                }
                line += 1;
            }
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(
                                GuestError::new("unterminated string literal").at(line)
                            );
                        }
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('\'') => s.push('\''),
                            Some('"') => s.push('"'),
                            Some(other) => {
                                return Err(GuestError::new(format!(
                                    "invalid escape sequence '\\{other}'"
                                ))
                                .at(line));
                            }
                            None => {
                                return Err(
                                    GuestError::new("unterminated string literal").at(line)
                                );
                            }
                        },
                        Some(c) if c == quote => break,
                        Some('\n') => {
                            return Err(
                                GuestError::new("unterminated string literal").at(line)
                            );
                        }
                        Some(c) => s.push(c),
                    }
                }
                toks.push(Spanned {
                    tok: Tok::Str(s),
                    line,
                });
            }
            '0'..='9' => {
                let mut n = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        n.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: i64 = n
                    .parse()
                    .map_err(|_| GuestError::new(format!("integer literal too large: {n}")).at(line))?;
                toks.push(Spanned {
                    tok: Tok::Int(value),
                    line,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = match ident.as_str() {
                    "True" => Tok::True,
                    "False" => Tok::False,
                    "None" => Tok::NoneLit,
                    _ => Tok::Ident(ident),
                };
                toks.push(Spanned { tok, line });
            }
            _ => {
                chars.next();
                let tok = match c {
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::Eq
                        } else {
                            Tok::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Tok::Ne
                        } else {
                            return Err(GuestError::new("unexpected character '!'").at(line));
                        }
                    }
                    '<' => Tok::Lt,
                    '>' => Tok::Gt,
                    '+' => Tok::Plus,
                    '-' => Tok::Minus,
                    '*' => Tok::Star,
                    '(' => {
                        depth += 1;
                        Tok::LParen
                    }
                    ')' => {
                        depth = depth.saturating_sub(1);
                        Tok::RParen
                    }
                    '[' => {
                        depth += 1;
                        Tok::LBracket
                    }
                    ']' => {
                        depth = depth.saturating_sub(1);
                        Tok::RBracket
                    }
                    ',' => Tok::Comma,
                    ':' => Tok::Colon,
                    other => {
                        return Err(
                            GuestError::new(format!("unexpected character '{other}'")).at(line)
                        );
                    }
                };
                toks.push(Spanned { tok, line });
            }
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone)]
enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    NoneLit,
    Var(String),
    List(Vec<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign { name: String, expr: Expr, line: usize },
    Expr { expr: Expr, line: usize },
}

struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn new(toks: Vec<Spanned>) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|s| &s.tok)
    }

    fn peek2(&self) -> Option<&Tok> {
        self.toks.get(self.pos + 1).map(|s| &s.tok)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos.min(self.toks.len().saturating_sub(1)))
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).map(|s| s.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> EvalResult<()> {
        let line = self.line();
        match self.next() {
            Some(tok) if tok == *expected => Ok(()),
            _ => Err(GuestError::new(format!("expected {what}")).at(line)),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(Tok::Newline)) {
            self.pos += 1;
        }
    }

    fn parse_program(&mut self) -> EvalResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.peek().is_none() {
                break;
            }
            stmts.push(self.parse_stmt()?);
            match self.peek() {
                None | Some(Tok::Newline) => {}
                _ => {
                    let line = self.line();
                    return Err(
                        GuestError::new("expected end of line after statement").at(line)
                    );
                }
            }
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> EvalResult<Stmt> {
        let line = self.line();
        if let (Some(Tok::Ident(name)), Some(Tok::Assign)) = (self.peek(), self.peek2()) {
            let name = name.clone();
            self.pos += 2;
            let expr = self.parse_expr()?;
            return Ok(Stmt::Assign { name, expr, line });
        }
        let expr = self.parse_expr()?;
        Ok(Stmt::Expr { expr, line })
    }

    fn parse_expr(&mut self) -> EvalResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Tok::Eq) => Some(BinOp::Eq),
            Some(Tok::Ne) => Some(BinOp::Ne),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Gt) => Some(BinOp::Gt),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.parse_additive()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Tok::Star)) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op: BinOp::Mul,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        if matches!(self.peek(), Some(Tok::Minus)) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EvalResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Tok::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Tok::RParen)) {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.peek() {
                                Some(Tok::Comma) => {
                                    self.pos += 1;
                                    // Trailing comma before the close paren.
                                    if matches!(self.peek(), Some(Tok::RParen)) {
                                        break;
                                    }
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let start = if matches!(self.peek(), Some(Tok::Colon)) {
                        None
                    } else {
                        Some(Box::new(self.parse_expr()?))
                    };
                    if matches!(self.peek(), Some(Tok::Colon)) {
                        self.pos += 1;
                        let end = if matches!(self.peek(), Some(Tok::RBracket)) {
                            None
                        } else {
                            Some(Box::new(self.parse_expr()?))
                        };
                        self.expect(&Tok::RBracket, "']'")?;
                        expr = Expr::Slice {
                            obj: Box::new(expr),
                            start,
                            end,
                        };
                    } else {
                        let index = start.ok_or_else(|| {
                            GuestError::new("expected index expression").at(self.line())
                        })?;
                        self.expect(&Tok::RBracket, "']'")?;
                        expr = Expr::Index {
                            obj: Box::new(expr),
                            index,
                        };
                    }
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> EvalResult<Expr> {
        let line = self.line();
        match self.next() {
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Int(n)) => Ok(Expr::Int(n)),
            Some(Tok::True) => Ok(Expr::Bool(true)),
            Some(Tok::False) => Ok(Expr::Bool(false)),
            Some(Tok::NoneLit) => Ok(Expr::NoneLit),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            Some(Tok::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Tok::RBracket)) {
                    loop {
                        items.push(self.parse_expr()?);
                        match self.peek() {
                            Some(Tok::Comma) => {
                                self.pos += 1;
                                if matches!(self.peek(), Some(Tok::RBracket)) {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Tok::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            other => Err(GuestError::new(format!(
                "unexpected token{}",
                match other {
                    Some(_) => "",
                    None => " (end of input)",
                }
            ))
            .at(line)),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Host hooks the interpreter blocks on for sub-LLM calls.
pub trait HostBridge {
    fn llm_query(&mut self, instruction: &str, content: &str) -> Result<String, GuestError>;
    fn llm_query_batched(&mut self, prompts: &[String]) -> Result<Vec<String>, GuestError>;
}

/// A final marker registered by `FINAL`/`FINAL_VAR` during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalMarker {
    Answer(Value),
    Var { name: String, value: String },
}

/// Everything one program run produced.
#[derive(Debug)]
pub struct ProgramResult {
    pub stdout: String,
    pub error: Option<String>,
    pub final_marker: Option<FinalMarker>,
}

struct Interp<'a> {
    ns: &'a mut Namespace,
    bridge: &'a mut dyn HostBridge,
    stdout: String,
    final_marker: Option<FinalMarker>,
}

/// Run a program against the persistent namespace.
///
/// On error the partial stdout is kept, the error carries the failing line,
/// and any final marker registered before the error is dropped.
pub fn run_program(
    code: &str,
    ns: &mut Namespace,
    bridge: &mut dyn HostBridge,
) -> ProgramResult {
    let stmts = match lex(code).and_then(|toks| Parser::new(toks).parse_program()) {
        Ok(stmts) => stmts,
        Err(e) => {
            return ProgramResult {
                stdout: String::new(),
                error: Some(e.render()),
                final_marker: None,
            };
        }
    };

    let mut interp = Interp {
        ns,
        bridge,
        stdout: String::new(),
        final_marker: None,
    };

    for stmt in &stmts {
        if let Err(e) = interp.exec_stmt(stmt) {
            return ProgramResult {
                stdout: interp.stdout,
                error: Some(e.render()),
                final_marker: None,
            };
        }
    }

    ProgramResult {
        stdout: interp.stdout,
        error: None,
        final_marker: interp.final_marker,
    }
}

impl Interp<'_> {
    fn exec_stmt(&mut self, stmt: &Stmt) -> EvalResult<()> {
        match stmt {
            Stmt::Assign { name, expr, line } => {
                let value = self.eval(expr).map_err(|e| e.at(*line))?;
                self.ns.insert(name.clone(), value);
                Ok(())
            }
            Stmt::Expr { expr, line } => {
                self.eval(expr).map_err(|e| e.at(*line))?;
                Ok(())
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::NoneLit => Ok(Value::None),
            Expr::Var(name) => self
                .ns
                .get(name)
                .cloned()
                .ok_or_else(|| GuestError::new(format!("undefined name '{name}'"))),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::List(values))
            }
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Int(n) => Ok(Value::Int(-n)),
                other => Err(GuestError::new(format!(
                    "cannot negate value of type '{}'",
                    other.type_name()
                ))),
            },
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.eval_binary(op, left, right)
            }
            Expr::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                eval_index(&obj, &index)
            }
            Expr::Slice { obj, start, end } => {
                let obj = self.eval(obj)?;
                let start = match start {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                let end = match end {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                eval_slice(&obj, start.as_ref(), end.as_ref())
            }
            Expr::Call { callee, args } => {
                let callee = self.eval(callee)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                match callee {
                    Value::Builtin(builtin) => self.call_builtin(builtin, values),
                    other => Err(GuestError::new(format!(
                        "value of type '{}' is not callable",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn eval_binary(&mut self, op: &BinOp, left: Value, right: Value) -> EvalResult<Value> {
        match op {
            BinOp::Eq => Ok(Value::Bool(left == right)),
            BinOp::Ne => Ok(Value::Bool(left != right)),
            BinOp::Lt | BinOp::Gt => {
                let ordering = match (&left, &right) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    _ => {
                        return Err(GuestError::new(format!(
                            "cannot compare '{}' and '{}'",
                            left.type_name(),
                            right.type_name()
                        )));
                    }
                };
                Ok(Value::Bool(match op {
                    BinOp::Lt => ordering.is_lt(),
                    _ => ordering.is_gt(),
                }))
            }
            BinOp::Add => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
                (Value::List(mut a), Value::List(b)) => {
                    a.extend(b);
                    Ok(Value::List(a))
                }
                (a, b) => Err(GuestError::new(format!(
                    "cannot add '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ))),
            },
            BinOp::Sub => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
                (a, b) => Err(GuestError::new(format!(
                    "cannot subtract '{}' from '{}'",
                    b.type_name(),
                    a.type_name()
                ))),
            },
            BinOp::Mul => match (left, right) {
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
                (Value::Str(s), Value::Int(n)) => Ok(Value::Str(s.repeat(n.max(0) as usize))),
                (a, b) => Err(GuestError::new(format!(
                    "cannot multiply '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> EvalResult<Value> {
        match builtin {
            Builtin::Print => {
                let rendered: Vec<String> = args.iter().map(|v| v.str_form()).collect();
                self.stdout.push_str(&rendered.join(" "));
                self.stdout.push('\n');
                Ok(Value::None)
            }
            Builtin::Len => {
                let [arg] = take_args::<1>(builtin, args)?;
                match arg {
                    Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    other => Err(GuestError::new(format!(
                        "len() expects str or list, got '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Str => {
                let [arg] = take_args::<1>(builtin, args)?;
                Ok(Value::Str(arg.str_form()))
            }
            Builtin::Callable => {
                let [arg] = take_args::<1>(builtin, args)?;
                Ok(Value::Bool(arg.is_callable()))
            }
            Builtin::Join => {
                let [list, sep] = take_args::<2>(builtin, args)?;
                let items = expect_list(builtin, &list)?;
                let sep = expect_str(builtin, &sep)?;
                let rendered: Vec<String> = items.iter().map(|v| v.str_form()).collect();
                Ok(Value::Str(rendered.join(sep)))
            }
            Builtin::Chunk => {
                let [s, size] = take_args::<2>(builtin, args)?;
                let s = expect_str(builtin, &s)?;
                let size = expect_int(builtin, &size)?;
                if size <= 0 {
                    return Err(GuestError::new("chunk() size must be positive"));
                }
                let chars: Vec<char> = s.chars().collect();
                let chunks: Vec<Value> = chars
                    .chunks(size as usize)
                    .map(|c| Value::Str(c.iter().collect()))
                    .collect();
                Ok(Value::List(chunks))
            }
            Builtin::Head => {
                let [s, n] = take_args::<2>(builtin, args)?;
                let s = expect_str(builtin, &s)?;
                let n = expect_int(builtin, &n)?.max(0) as usize;
                Ok(Value::Str(s.chars().take(n).collect()))
            }
            Builtin::Count => {
                let [s, needle] = take_args::<2>(builtin, args)?;
                let s = expect_str(builtin, &s)?;
                let needle = expect_str(builtin, &needle)?;
                if needle.is_empty() {
                    return Ok(Value::Int(0));
                }
                Ok(Value::Int(s.matches(needle).count() as i64))
            }
            Builtin::Find => {
                let [s, needle] = take_args::<2>(builtin, args)?;
                let s = expect_str(builtin, &s)?;
                let needle = expect_str(builtin, &needle)?;
                match s.find(needle) {
                    Some(byte_idx) => Ok(Value::Int(s[..byte_idx].chars().count() as i64)),
                    None => Ok(Value::Int(-1)),
                }
            }
            Builtin::Contains => {
                let [s, needle] = take_args::<2>(builtin, args)?;
                let s = expect_str(builtin, &s)?;
                let needle = expect_str(builtin, &needle)?;
                Ok(Value::Bool(s.contains(needle)))
            }
            Builtin::FindInContext => {
                let [needle] = take_args::<1>(builtin, args)?;
                let needle = expect_str(builtin, &needle)?.to_string();
                let context = self.ns.get("context").cloned().ok_or_else(|| {
                    GuestError::new("undefined name 'context' (no setup received)")
                })?;
                let docs = expect_list(builtin, &context)?;
                for (i, doc) in docs.iter().enumerate() {
                    if let Value::Str(s) = doc {
                        if s.contains(&needle) {
                            return Ok(Value::Int(i as i64));
                        }
                    }
                }
                Ok(Value::Int(-1))
            }
            Builtin::LlmQuery => {
                if args.is_empty() || args.len() > 2 {
                    return Err(GuestError::new(
                        "llm_query() expects 1 or 2 arguments (instruction, content)",
                    ));
                }
                let mut args = args.into_iter();
                let instruction = match args.next().unwrap() {
                    Value::Str(s) => s,
                    other => {
                        return Err(GuestError::new(format!(
                            "llm_query() instruction must be str, got '{}'",
                            other.type_name()
                        )));
                    }
                };
                let content = match args.next() {
                    None => String::new(),
                    Some(Value::Str(s)) => s,
                    Some(other) => {
                        return Err(GuestError::new(format!(
                            "llm_query() content must be str, got '{}'",
                            other.type_name()
                        )));
                    }
                };
                let result = self.bridge.llm_query(&instruction, &content)?;
                Ok(Value::Str(result))
            }
            Builtin::LlmQueryBatched => {
                let [arg] = take_args::<1>(builtin, args)?;
                let items = expect_list(builtin, &arg)?;
                let mut prompts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Str(s) => prompts.push(s.clone()),
                        other => {
                            return Err(GuestError::new(format!(
                                "llm_query_batched() expects a list of str, got '{}'",
                                other.type_name()
                            )));
                        }
                    }
                }
                let results = self.bridge.llm_query_batched(&prompts)?;
                Ok(Value::List(results.into_iter().map(Value::Str).collect()))
            }
            Builtin::Final => {
                let [arg] = take_args::<1>(builtin, args)?;
                self.final_marker = Some(FinalMarker::Answer(arg.clone()));
                Ok(arg)
            }
            Builtin::FinalVar => {
                let [arg] = take_args::<1>(builtin, args)?;
                let name = expect_str(builtin, &arg)?.to_string();
                let value = self
                    .ns
                    .get(&name)
                    .map(|v| v.str_form())
                    .unwrap_or_default();
                self.final_marker = Some(FinalMarker::Var { name, value });
                Ok(Value::None)
            }
            Builtin::ShowVars => {
                take_args::<0>(builtin, args)?;
                Ok(Value::Str(show_vars(self.ns)))
            }
        }
    }
}

fn take_args<const N: usize>(builtin: Builtin, args: Vec<Value>) -> EvalResult<[Value; N]> {
    let got = args.len();
    args.try_into().map_err(|_| {
        GuestError::new(format!(
            "{}() expects {} argument{}, got {}",
            builtin.name(),
            N,
            if N == 1 { "" } else { "s" },
            got,
        ))
    })
}

fn expect_str<'a>(builtin: Builtin, value: &'a Value) -> EvalResult<&'a str> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(GuestError::new(format!(
            "{}() expects str, got '{}'",
            builtin.name(),
            other.type_name()
        ))),
    }
}

fn expect_int(builtin: Builtin, value: &Value) -> EvalResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(GuestError::new(format!(
            "{}() expects int, got '{}'",
            builtin.name(),
            other.type_name()
        ))),
    }
}

fn expect_list<'a>(builtin: Builtin, value: &'a Value) -> EvalResult<&'a [Value]> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(GuestError::new(format!(
            "{}() expects list, got '{}'",
            builtin.name(),
            other.type_name()
        ))),
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn eval_index(obj: &Value, index: &Value) -> EvalResult<Value> {
    let idx = match index {
        Value::Int(n) => *n,
        other => {
            return Err(GuestError::new(format!(
                "index must be int, got '{}'",
                other.type_name()
            )));
        }
    };
    match obj {
        Value::List(items) => normalize_index(idx, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| GuestError::new("list index out of range")),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(idx, chars.len())
                .map(|i| Value::Str(chars[i].to_string()))
                .ok_or_else(|| GuestError::new("string index out of range"))
        }
        other => Err(GuestError::new(format!(
            "value of type '{}' is not indexable",
            other.type_name()
        ))),
    }
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let len = len as i64;
    let clamp = |i: i64| -> i64 {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len)
    };
    let lo = clamp(start.unwrap_or(0));
    let hi = clamp(end.unwrap_or(len));
    (lo as usize, (hi.max(lo)) as usize)
}

fn eval_slice(obj: &Value, start: Option<&Value>, end: Option<&Value>) -> EvalResult<Value> {
    let as_int = |v: Option<&Value>| -> EvalResult<Option<i64>> {
        match v {
            None => Ok(None),
            Some(Value::Int(n)) => Ok(Some(*n)),
            Some(other) => Err(GuestError::new(format!(
                "slice bound must be int, got '{}'",
                other.type_name()
            ))),
        }
    };
    let start = as_int(start)?;
    let end = as_int(end)?;
    match obj {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = slice_bounds(start, end, chars.len());
            Ok(Value::Str(chars[lo..hi].iter().collect()))
        }
        Value::List(items) => {
            let (lo, hi) = slice_bounds(start, end, items.len());
            Ok(Value::List(items[lo..hi].to_vec()))
        }
        other => Err(GuestError::new(format!(
            "value of type '{}' is not sliceable",
            other.type_name()
        ))),
    }
}
