//! Safety condition expressions
//!
//! Conditions come from configuration as short expressions such as
//! `ai_volts[1] < pressure_thresholds.chamber_medium_vacuum and not relay_state['pump_turbo']`.
//! They are parsed once into an [`Expr`] tree and evaluated against a
//! [`SystemStateSnapshot`]. Evaluation is fail-closed: anything that cannot be
//! evaluated (unknown relay, bad index, type mismatch) yields `false`.

use crate::error::ControlError;
use crate::types::{SystemStateSnapshot, NUM_ANALOG, NUM_DIGITAL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Default ion gauge on-threshold when the config does not set one
pub const DEFAULT_ION_GAUGE_ON_THRESHOLD: f64 = 4.4;

/// Runtime value produced while evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    None,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::None => false,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Snapshot fields an expression can read
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    AnalogInput(usize),
    DigitalInput(usize),
    Relay {
        name: String,
        default: Option<Box<Expr>>,
    },
    CurrentMode,
    CurrentProcedure,
    SystemStatus,
    IonGaugeOn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(Field),
    Threshold(String),
    List(Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    Negate(Box<Expr>),
    ToFloat(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Everything an expression may look at
pub struct EvalContext<'a> {
    pub snapshot: &'a SystemStateSnapshot,
    pub thresholds: &'a HashMap<String, f64>,
}

impl<'a> EvalContext<'a> {
    pub fn new(snapshot: &'a SystemStateSnapshot, thresholds: &'a HashMap<String, f64>) -> Self {
        Self {
            snapshot,
            thresholds,
        }
    }

    pub fn ion_gauge_on(&self) -> bool {
        let threshold = self
            .thresholds
            .get("ion_gauge_on_threshold")
            .copied()
            .unwrap_or(DEFAULT_ION_GAUGE_ON_THRESHOLD);
        self.snapshot.ion_gauge_on(threshold)
    }
}

/// Evaluate a parsed expression as a boolean. Never fails; errors evaluate to false.
pub fn evaluate(
    expr: &Expr,
    snapshot: &SystemStateSnapshot,
    thresholds: &HashMap<String, f64>,
) -> bool {
    let ctx = EvalContext::new(snapshot, thresholds);
    match eval(expr, &ctx) {
        Ok(value) => value.truthy(),
        Err(e) => {
            log::debug!("Condition evaluated fail-closed: {}", e);
            false
        }
    }
}

fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(field) => eval_field(field, ctx),
        Expr::Threshold(name) => ctx
            .thresholds
            .get(name)
            .map(|v| Value::Num(*v))
            .ok_or_else(|| format!("unknown threshold '{}'", name)),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Compare(lhs, op, rhs) => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            compare(&l, *op, &r).map(Value::Bool)
        }
        Expr::Arith(lhs, op, rhs) => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            arith(&l, *op, &r).map(Value::Num)
        }
        Expr::Negate(inner) => eval(inner, ctx)?
            .as_number()
            .map(|n| Value::Num(-n))
            .ok_or_else(|| "cannot negate non-number".to_string()),
        Expr::ToFloat(inner) => match eval(inner, ctx)? {
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Num)
                .map_err(|_| format!("could not convert '{}' to float", s)),
            other => other
                .as_number()
                .map(Value::Num)
                .ok_or_else(|| "float() of non-number".to_string()),
        },
        Expr::And(items) => {
            for item in items {
                if !eval(item, ctx)?.truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(items) => {
            for item in items {
                if eval(item, ctx)?.truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, ctx)?.truthy())),
    }
}

fn eval_field(field: &Field, ctx: &EvalContext) -> Result<Value, String> {
    let snapshot = ctx.snapshot;
    match field {
        Field::AnalogInput(i) => snapshot
            .analog_inputs
            .get(*i)
            .map(|v| Value::Num(if v.is_finite() { *v } else { 0.0 }))
            .ok_or_else(|| format!("ai_volts index {} out of range", i)),
        Field::DigitalInput(i) => snapshot
            .digital_inputs
            .get(*i)
            .map(|v| Value::Bool(*v))
            .ok_or_else(|| format!("digital_inputs index {} out of range", i)),
        Field::Relay { name, default } => match snapshot.relay_states.get(name) {
            Some(state) => Ok(Value::Bool(*state)),
            None => match default {
                Some(d) => eval(d, ctx),
                None => Err(format!("no relay state for '{}'", name)),
            },
        },
        Field::CurrentMode => Ok(Value::Str(snapshot.current_mode.as_str().to_string())),
        Field::CurrentProcedure => Ok(snapshot
            .current_procedure
            .map(|p| Value::Str(p.as_str().to_string()))
            .unwrap_or(Value::None)),
        Field::SystemStatus => Ok(Value::Str(snapshot.system_status.clone())),
        Field::IonGaugeOn => Ok(Value::Bool(ctx.ion_gauge_on())),
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(l.loosely_equals(r)),
        CmpOp::Ne => Ok(!l.loosely_equals(r)),
        CmpOp::In | CmpOp::NotIn => {
            let found = match (l, r) {
                (_, Value::List(items)) => items.iter().any(|item| l.loosely_equals(item)),
                (Value::Str(needle), Value::Str(haystack)) => haystack.contains(needle.as_str()),
                _ => return Err("'in' needs a list or string on the right".to_string()),
            };
            Ok(if op == CmpOp::In { found } else { !found })
        }
        _ => {
            let ordering = match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| "cannot order NaN".to_string())?,
                _ => match (l, r) {
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    _ => return Err(format!("cannot order {:?} and {:?}", l, r)),
                },
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => return Err("unsupported comparison".to_string()),
            })
        }
    }
}

fn arith(l: &Value, op: ArithOp, r: &Value) -> Result<f64, String> {
    let (a, b) = match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err("arithmetic on non-numbers".to_string()),
    };
    match op {
        ArithOp::Add => Ok(a + b),
        ArithOp::Sub => Ok(a - b),
        ArithOp::Mul => Ok(a * b),
        ArithOp::Div if b == 0.0 => Err("division by zero".to_string()),
        ArithOp::Div => Ok(a / b),
    }
}

// Parsing

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Sym(&'static str),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '-' || chars[i] == '+') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| format!("bad number '{}'", text))?;
            tokens.push(Token::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated string".to_string());
            }
            tokens.push(Token::Str(chars[start..i].iter().collect()));
            i += 1;
        } else {
            let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let sym = match two.as_str() {
                "<=" => Some("<="),
                ">=" => Some(">="),
                "==" => Some("=="),
                "!=" => Some("!="),
                _ => None,
            };
            if let Some(sym) = sym {
                tokens.push(Token::Sym(sym));
                i += 2;
                continue;
            }
            let sym = match c {
                '<' => "<",
                '>' => ">",
                '+' => "+",
                '-' => "-",
                '*' => "*",
                '/' => "/",
                '(' => "(",
                ')' => ")",
                '[' => "[",
                ']' => "]",
                ',' => ",",
                '.' => ".",
                other => return Err(format!("unexpected character '{}'", other)),
            };
            tokens.push(Token::Sym(sym));
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == sym)
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == word)
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), String> {
        match self.next() {
            Some(Token::Sym(s)) if s == sym => Ok(()),
            other => Err(format!("expected '{}', found {:?}", sym, other)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut items = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut items = vec![self.parse_not()?];
        while self.peek_keyword("and") {
            self.pos += 1;
            items.push(self.parse_not()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let not_in = self.peek_keyword("not")
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(w)) if w == "in");
        if not_in {
            self.pos += 2;
            return Some(CmpOp::NotIn);
        }
        let op = match self.peek()? {
            Token::Sym("<") => CmpOp::Lt,
            Token::Sym("<=") => CmpOp::Le,
            Token::Sym(">") => CmpOp::Gt,
            Token::Sym(">=") => CmpOp::Ge,
            Token::Sym("==") => CmpOp::Eq,
            Token::Sym("!=") => CmpOp::Ne,
            Token::Ident(word) if word == "in" => CmpOp::In,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    /// Chained comparisons (`a < b < c`) become a conjunction of pairs
    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let first = self.parse_sum()?;
        let mut pairs = Vec::new();
        let mut lhs = first.clone();
        while let Some(op) = self.comparison_op() {
            let rhs = self.parse_sum()?;
            pairs.push(Expr::Compare(Box::new(lhs), op, Box::new(rhs.clone())));
            lhs = rhs;
        }
        Ok(match pairs.len() {
            0 => first,
            1 => pairs.remove(0),
            _ => Expr::And(pairs),
        })
    }

    fn parse_sum(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = if self.peek_sym("+") {
                ArithOp::Add
            } else if self.peek_sym("-") {
                ArithOp::Sub
            } else {
                break;
            };
            self.pos += 1;
            let rhs = self.parse_term()?;
            lhs = Expr::Arith(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.peek_sym("*") {
                ArithOp::Mul
            } else if self.peek_sym("/") {
                ArithOp::Div
            } else {
                break;
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek_sym("-") {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_index(&mut self, limit: usize, field: &str) -> Result<usize, String> {
        self.expect_sym("[")?;
        let index = match self.next() {
            Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
            other => return Err(format!("{} needs an integer index, found {:?}", field, other)),
        };
        self.expect_sym("]")?;
        if index >= limit {
            return Err(format!("{}[{}] out of range", field, index));
        }
        Ok(index)
    }

    fn parse_string_arg(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(format!("expected string, found {:?}", other)),
        }
    }

    fn parse_relay(&mut self) -> Result<Expr, String> {
        if self.peek_sym("[") {
            self.pos += 1;
            let name = self.parse_string_arg()?;
            self.expect_sym("]")?;
            return Ok(Expr::Field(Field::Relay {
                name,
                default: None,
            }));
        }
        self.expect_sym(".")?;
        match self.next() {
            Some(Token::Ident(method)) if method == "get" => {}
            other => return Err(format!("relay_state only supports .get(), found {:?}", other)),
        }
        self.expect_sym("(")?;
        let name = self.parse_string_arg()?;
        let default = if self.peek_sym(",") {
            self.pos += 1;
            Some(Box::new(self.parse_or()?))
        } else {
            Some(Box::new(Expr::Literal(Value::None)))
        };
        self.expect_sym(")")?;
        Ok(Expr::Field(Field::Relay { name, default }))
    }

    fn parse_threshold(&mut self) -> Result<Expr, String> {
        if self.peek_sym("[") {
            self.pos += 1;
            let name = self.parse_string_arg()?;
            self.expect_sym("]")?;
            return Ok(Expr::Threshold(name));
        }
        self.expect_sym(".")?;
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Threshold(name)),
            other => Err(format!("expected threshold name, found {:?}", other)),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Sym("(")) => {
                let inner = self.parse_or()?;
                self.expect_sym(")")?;
                Ok(inner)
            }
            Some(Token::Sym("[")) => {
                let mut items = Vec::new();
                if !self.peek_sym("]") {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek_sym(",") {
                            self.pos += 1;
                            if self.peek_sym("]") {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect_sym("]")?;
                Ok(Expr::List(items))
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::None)),
                "ai_volts" | "analog_inputs" => {
                    let i = self.parse_index(NUM_ANALOG, &word)?;
                    Ok(Expr::Field(Field::AnalogInput(i)))
                }
                "digital_inputs" => {
                    let i = self.parse_index(NUM_DIGITAL, &word)?;
                    Ok(Expr::Field(Field::DigitalInput(i)))
                }
                "relay_state" | "relay_states" => self.parse_relay(),
                "pressure_thresholds" => self.parse_threshold(),
                "current_mode" => Ok(Expr::Field(Field::CurrentMode)),
                "current_procedure" => Ok(Expr::Field(Field::CurrentProcedure)),
                "system_status" => Ok(Expr::Field(Field::SystemStatus)),
                "ion_gauge_on" => Ok(Expr::Field(Field::IonGaugeOn)),
                "float" => {
                    self.expect_sym("(")?;
                    let inner = self.parse_or()?;
                    self.expect_sym(")")?;
                    Ok(Expr::ToFloat(Box::new(inner)))
                }
                other => Err(format!("unknown name '{}'", other)),
            },
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

/// Parse a condition expression into an AST
pub fn parse(src: &str) -> Result<Expr, ControlError> {
    let tokens = tokenize(src).map_err(|e| ControlError::Condition(format!("'{}': {}", src, e)))?;
    if tokens.is_empty() {
        return Err(ControlError::Condition("empty condition".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .parse_or()
        .map_err(|e| ControlError::Condition(format!("'{}': {}", src, e)))?;
    if parser.pos < parser.tokens.len() {
        return Err(ControlError::Condition(format!(
            "'{}': trailing input {:?}",
            src,
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

/// A compiled condition that keeps its source text for messages
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Option<Expr>,
}

impl Condition {
    /// Compile a condition. Unparseable text compiles to a condition that is always false.
    pub fn compile(source: &str) -> Self {
        let expr = match parse(source) {
            Ok(expr) => Some(expr),
            Err(e) => {
                log::warn!("Invalid safety condition, it will always fail: {}", e);
                None
            }
        };
        Self {
            source: source.to_string(),
            expr,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_valid(&self) -> bool {
        self.expr.is_some()
    }

    pub fn evaluate(&self, ctx: &EvalContext) -> bool {
        match &self.expr {
            Some(expr) => {
                let result = evaluate(expr, ctx.snapshot, ctx.thresholds);
                log::trace!("Condition '{}' -> {}", self.source, result);
                result
            }
            None => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Condition entry as written in configuration: a string or a nested AND-list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionSpec {
    Single(String),
    All(Vec<ConditionSpec>),
}

impl ConditionSpec {
    pub fn sources(&self) -> Vec<&str> {
        match self {
            ConditionSpec::Single(s) => vec![s.as_str()],
            ConditionSpec::All(items) => items.iter().flat_map(|i| i.sources()).collect(),
        }
    }
}

impl From<&str> for ConditionSpec {
    fn from(s: &str) -> Self {
        ConditionSpec::Single(s.to_string())
    }
}

/// Compiled counterpart of [`ConditionSpec`]
#[derive(Debug, Clone)]
pub enum ConditionNode {
    Leaf(Condition),
    All(Vec<ConditionNode>),
}

impl ConditionNode {
    pub fn compile(spec: &ConditionSpec) -> Self {
        match spec {
            ConditionSpec::Single(s) => ConditionNode::Leaf(Condition::compile(s)),
            ConditionSpec::All(items) => {
                ConditionNode::All(items.iter().map(ConditionNode::compile).collect())
            }
        }
    }

    pub fn evaluate(&self, ctx: &EvalContext) -> bool {
        match self {
            ConditionNode::Leaf(c) => c.evaluate(ctx),
            ConditionNode::All(items) => items.iter().all(|i| i.evaluate(ctx)),
        }
    }
}

impl fmt::Display for ConditionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionNode::Leaf(c) => write!(f, "{}", c),
            ConditionNode::All(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Required conditions of a rule. Any nested list at the top level switches
/// the whole rule to OR-of-groups; otherwise every entry must hold.
#[derive(Debug, Clone)]
pub enum RequiredConditions {
    AllOf(Vec<ConditionNode>),
    AnyGroup(Vec<ConditionNode>),
}

impl RequiredConditions {
    pub fn compile(specs: &[ConditionSpec]) -> Self {
        let nodes = specs.iter().map(ConditionNode::compile).collect();
        if specs.iter().any(|s| matches!(s, ConditionSpec::All(_))) {
            RequiredConditions::AnyGroup(nodes)
        } else {
            RequiredConditions::AllOf(nodes)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RequiredConditions::AllOf(n) | RequiredConditions::AnyGroup(n) => n.is_empty(),
        }
    }

    /// Returns `Err` with the first failing condition in AND mode, or `Err(None)`
    /// when no group is satisfied.
    pub fn check(&self, ctx: &EvalContext) -> Result<(), Option<String>> {
        match self {
            RequiredConditions::AllOf(nodes) => {
                for node in nodes {
                    if !node.evaluate(ctx) {
                        return Err(Some(node.to_string()));
                    }
                }
                Ok(())
            }
            RequiredConditions::AnyGroup(groups) => {
                if groups.is_empty() || groups.iter().any(|g| g.evaluate(ctx)) {
                    Ok(())
                } else {
                    Err(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Mode, ProcedureId};

    fn thresholds() -> HashMap<String, f64> {
        HashMap::from([
            ("chamber_medium_vacuum".to_string(), 2.0),
            ("ion_gauge_on_threshold".to_string(), 4.4),
        ])
    }

    fn snapshot() -> SystemStateSnapshot {
        let mut s = SystemStateSnapshot::new("high_vacuum");
        s.analog_inputs = [1.0, 1.5, 4.9, 3.6];
        s.digital_inputs = [true, true, true, false];
        s.relay_states.insert("pump_turbo".to_string(), true);
        s.relay_states.insert("valve_vent".to_string(), false);
        s
    }

    fn check(src: &str, snapshot: &SystemStateSnapshot) -> bool {
        let t = thresholds();
        let ctx = EvalContext::new(snapshot, &t);
        Condition::compile(src).evaluate(&ctx)
    }

    #[test]
    fn test_threshold_comparison() {
        let s = snapshot();
        assert!(check("ai_volts[1] < pressure_thresholds.chamber_medium_vacuum", &s));
        assert!(check("ai_volts[1] < pressure_thresholds.chamber_medium_vacuum - 0.4", &s));
        assert!(!check("ai_volts[1] < pressure_thresholds.chamber_medium_vacuum - 0.6", &s));
    }

    #[test]
    fn test_relay_and_digital_fields() {
        let s = snapshot();
        assert!(check("relay_state['pump_turbo'] and digital_inputs[2]", &s));
        assert!(check("not relay_state.get('valve_vent', False)", &s));
        assert!(check("relay_state.get('shutter1', False) == False", &s));
        assert!(check("digital_inputs[0] == True and digital_inputs[3] == False", &s));
    }

    #[test]
    fn test_status_membership() {
        let mut s = snapshot();
        assert!(check("system_status in ['high_vacuum', 'pumping']", &s));
        assert!(!check("system_status not in ['high_vacuum', 'pumping']", &s));
        s.current_mode = Mode::Override;
        assert!(check("current_mode == 'Override'", &s));
        assert!(check("current_procedure == None", &s));
        s.current_procedure = Some(ProcedureId::Vent);
        assert!(check("current_procedure == 'vent'", &s));
    }

    #[test]
    fn test_chained_comparison() {
        let s = snapshot();
        assert!(check("0.5 < ai_volts[1] < 2.0", &s));
        assert!(!check("1.6 < ai_volts[1] < 2.0", &s));
    }

    #[test]
    fn test_ion_gauge_derived_field() {
        let mut s = snapshot();
        assert!(!check("ion_gauge_on", &s));
        s.analog_inputs[2] = 2.0;
        assert!(check("ion_gauge_on", &s));
        s.analog_inputs[2] = 0.0;
        assert!(!check("ion_gauge_on", &s));
    }

    #[test]
    fn test_malformed_conditions_fail_closed() {
        let s = snapshot();
        for src in [
            "ai_volts[9] < 1.0",
            "ai_volts[1] <",
            "relay_state['does_not_exist']",
            "pressure_thresholds.missing > 0",
            "system_status < 3",
            "undefined_name == 1",
            "ai_volts[1] / 0 > 1",
            "'unterminated",
            "",
            "float('abc') > 0",
        ] {
            assert!(!check(src, &s), "expected '{}' to fail closed", src);
        }
    }

    #[test]
    fn test_negated_malformed_condition_still_false() {
        let s = snapshot();
        assert!(!check("not relay_state['does_not_exist']", &s));
    }

    #[test]
    fn test_parse_reports_errors() {
        assert!(parse("ai_volts[1] <").is_err());
        assert!(parse("ai_volts[1] < 2.0 2.0").is_err());
        assert!(parse("digital_inputs[4]").is_err());
        assert!(parse("ai_volts[1] < 2.0").is_ok());
    }

    #[test]
    fn test_or_of_groups() {
        let t = thresholds();
        let specs = vec![
            ConditionSpec::All(vec!["digital_inputs[0]".into(), "digital_inputs[1]".into()]),
            ConditionSpec::All(vec!["digital_inputs[2]".into()]),
        ];
        let required = RequiredConditions::compile(&specs);

        let mut s = snapshot();
        s.digital_inputs = [true, true, false, false];
        assert!(required.check(&EvalContext::new(&s, &t)).is_ok());

        s.digital_inputs = [false, false, true, false];
        assert!(required.check(&EvalContext::new(&s, &t)).is_ok());

        s.digital_inputs = [true, false, false, false];
        assert_eq!(required.check(&EvalContext::new(&s, &t)), Err(None));
    }

    #[test]
    fn test_mixed_list_is_treated_as_groups() {
        let t = thresholds();
        let specs = vec![
            ConditionSpec::Single("digital_inputs[3]".to_string()),
            ConditionSpec::All(vec!["digital_inputs[0]".into()]),
        ];
        let required = RequiredConditions::compile(&specs);
        assert!(matches!(required, RequiredConditions::AnyGroup(_)));

        let s = snapshot();
        // digital_inputs[3] is false but the second group holds
        assert!(required.check(&EvalContext::new(&s, &t)).is_ok());
    }

    #[test]
    fn test_flat_list_reports_failing_condition() {
        let t = thresholds();
        let specs = vec![
            ConditionSpec::Single("digital_inputs[0]".to_string()),
            ConditionSpec::Single("digital_inputs[3]".to_string()),
        ];
        let required = RequiredConditions::compile(&specs);
        let s = snapshot();
        assert_eq!(
            required.check(&EvalContext::new(&s, &t)),
            Err(Some("digital_inputs[3]".to_string()))
        );
    }
}
