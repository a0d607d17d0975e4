//! Condition expression language: typed parser, reference checks and evaluator.
//!
//! Grammar:
//! ```text
//! expr       ::= and ( '||' and )*
//! and        ::= unary ( '&&' unary )*
//! unary      ::= '!' unary | primary
//! primary    ::= '(' expr ')' | 'true' | 'false' | field ( op literal )?
//! field      ::= 'section' '.' name
//!              | 'section' '[' id ']' '.' name
//!              | 'steps' '[' step ']' '.' name
//! op         ::= '=' | '==' | '!=' | '<' | '<=' | '>' | '>='
//! literal    ::= QuotedString | BareWord | Integer
//! ```
//!
//! Every field has a fixed type, so literals are checked against the field
//! they are compared with while parsing. What remains for validation is
//! reference checking ([`check_references`]). Evaluating a checked expression
//! cannot fail.

use std::collections::HashMap;
use std::fmt;

use grantops_types::{SectionStatus, StepStatus};
use grantops_versions::{validate_section_id, SectionSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown field '{field}'")]
    UnknownField { field: String },

    #[error("unknown step '{step}'")]
    UnknownStep { step: String },

    #[error("invalid section id '{section}'")]
    InvalidSection { section: String },

    #[error("'section.{field}' needs a section target but the step targets all sections; use section[<id>].{field}")]
    MissingSectionTarget { field: String },

    #[error("type mismatch: {0}")]
    Type(String),
}

impl ConditionError {
    /// Errors naming something that does not exist, as opposed to malformed text.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(
            self,
            ConditionError::UnknownField { .. } | ConditionError::UnknownStep { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Typed expression tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Int,
    Text,
    SectionStatus,
    StepStatus,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "a boolean",
            ValueType::Int => "an integer",
            ValueType::Text => "text",
            ValueType::SectionStatus => "a section status",
            ValueType::StepStatus => "a step status",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    SectionStatus(SectionStatus),
    StepStatus(StepStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionField {
    Id,
    Exists,
    Status,
    CurrentVersion,
    WordCount,
}

impl SectionField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "id" => Some(SectionField::Id),
            "exists" => Some(SectionField::Exists),
            "status" => Some(SectionField::Status),
            "current_version" => Some(SectionField::CurrentVersion),
            "word_count" => Some(SectionField::WordCount),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionField::Id => "id",
            SectionField::Exists => "exists",
            SectionField::Status => "status",
            SectionField::CurrentVersion => "current_version",
            SectionField::WordCount => "word_count",
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            SectionField::Id => ValueType::Text,
            SectionField::Exists => ValueType::Bool,
            SectionField::Status => ValueType::SectionStatus,
            SectionField::CurrentVersion | SectionField::WordCount => ValueType::Int,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepField {
    Executed,
    Status,
    Succeeded,
    Failed,
    Skipped,
}

impl StepField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "executed" => Some(StepField::Executed),
            "status" => Some(StepField::Status),
            "succeeded" => Some(StepField::Succeeded),
            "failed" => Some(StepField::Failed),
            "skipped" => Some(StepField::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepField::Executed => "executed",
            StepField::Status => "status",
            StepField::Succeeded => "succeeded",
            StepField::Failed => "failed",
            StepField::Skipped => "skipped",
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            StepField::Status => ValueType::StepStatus,
            _ => ValueType::Bool,
        }
    }
}

/// Which section a `section` field reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionRef {
    /// The section targeted by the step owning the condition.
    Target,
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Section {
        section: SectionRef,
        field: SectionField,
    },
    Step {
        step: String,
        field: StepField,
    },
}

impl FieldRef {
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldRef::Section { field, .. } => field.value_type(),
            FieldRef::Step { field, .. } => field.value_type(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRef::Section {
                section: SectionRef::Target,
                field,
            } => write!(f, "section.{}", field.as_str()),
            FieldRef::Section {
                section: SectionRef::Named(id),
                field,
            } => write!(f, "section[{}].{}", id, field.as_str()),
            FieldRef::Step { step, field } => write!(f, "steps[{}].{}", step, field.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn is_ordering(&self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::NotEq)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionExpr {
    Const(bool),
    /// A boolean field used on its own.
    Field(FieldRef),
    Compare {
        field: FieldRef,
        op: CompareOp,
        value: Value,
    },
    Not(Box<ConditionExpr>),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
}

impl ConditionExpr {
    /// Every field the expression reads, left to right.
    pub fn fields(&self) -> Vec<&FieldRef> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a FieldRef>) {
        match self {
            ConditionExpr::Const(_) => {}
            ConditionExpr::Field(field) | ConditionExpr::Compare { field, .. } => out.push(field),
            ConditionExpr::Not(inner) => inner.collect_fields(out),
            ConditionExpr::And(a, b) | ConditionExpr::Or(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
        }
    }

    pub fn referenced_steps(&self) -> Vec<&str> {
        self.fields()
            .into_iter()
            .filter_map(|f| match f {
                FieldRef::Step { step, .. } => Some(step.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Sections named explicitly with `section[<id>]`.
    pub fn named_sections(&self) -> Vec<&str> {
        self.fields()
            .into_iter()
            .filter_map(|f| match f {
                FieldRef::Section {
                    section: SectionRef::Named(id),
                    ..
                } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Identifiers, bare words and integers.
    Word(String),
    Quoted(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Op(CompareOp),
    And,
    Or,
    Not,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn syntax(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let next_is = |i: usize, c: char| chars.get(i + 1).map(|&(_, n)| n) == Some(c);
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let (token, width) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '.' => (Token::Dot, 1),
            '&' if next_is(i, '&') => (Token::And, 2),
            '|' if next_is(i, '|') => (Token::Or, 2),
            '&' | '|' => return Err(syntax(offset, format!("expected '{c}{c}'"))),
            '!' if next_is(i, '=') => (Token::Op(CompareOp::NotEq), 2),
            '!' => (Token::Not, 1),
            '=' if next_is(i, '=') => (Token::Op(CompareOp::Eq), 2),
            '=' => (Token::Op(CompareOp::Eq), 1),
            '<' if next_is(i, '=') => (Token::Op(CompareOp::Le), 2),
            '<' => (Token::Op(CompareOp::Lt), 1),
            '>' if next_is(i, '=') => (Token::Op(CompareOp::Ge), 2),
            '>' => (Token::Op(CompareOp::Gt), 1),
            '"' | '\'' => {
                let mut text = String::new();
                let mut j = i + 1;
                while j < chars.len() && chars[j].1 != c {
                    text.push(chars[j].1);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(syntax(offset, "unterminated string"));
                }
                (Token::Quoted(text), j + 1 - i)
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                let mut j = i;
                while j < chars.len() && is_word_char(chars[j].1) {
                    word.push(chars[j].1);
                    j += 1;
                }
                (Token::Word(word), j - i)
            }
            other => return Err(syntax(offset, format!("unexpected character '{other}'"))),
        };
        tokens.push((offset, token));
        i += width;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

enum Literal {
    Quoted(String),
    Bare(String),
}

impl Literal {
    fn text(&self) -> &str {
        match self {
            Literal::Quoted(s) | Literal::Bare(s) => s,
        }
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(syntax(offset, format!("expected {what}"))),
        }
    }

    /// A word or quoted string, used for names inside brackets and after dots.
    fn expect_name(&mut self, what: &str) -> Result<String, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) if !w.is_empty() => Ok(w),
            _ => Err(syntax(offset, format!("expected {what}"))),
        }
    }

    fn parse_or(&mut self) -> Result<ConditionExpr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = ConditionExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<ConditionExpr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = ConditionExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<ConditionExpr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(ConditionExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ConditionExpr, ConditionError> {
        let offset = self.offset();
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Word(w)) if w == "true" || w == "false" => {
                self.pos += 1;
                Ok(ConditionExpr::Const(w == "true"))
            }
            Some(Token::Word(w)) if w == "section" || w == "steps" => {
                let field = self.parse_field()?;
                if let Some(Token::Op(op)) = self.peek().cloned() {
                    self.pos += 1;
                    let literal = self.parse_literal()?;
                    let value = coerce(&field, op, literal)?;
                    return Ok(ConditionExpr::Compare { field, op, value });
                }
                let ty = field.value_type();
                if ty != ValueType::Bool {
                    return Err(ConditionError::Type(format!(
                        "'{field}' is {ty}; compare it with a value"
                    )));
                }
                Ok(ConditionExpr::Field(field))
            }
            Some(Token::Word(w)) => Err(ConditionError::UnknownField { field: w }),
            Some(_) => Err(syntax(offset, "expected a field, 'true', 'false' or '('")),
            None => Err(syntax(offset, "unexpected end of expression")),
        }
    }

    fn parse_field(&mut self) -> Result<FieldRef, ConditionError> {
        let root = self.expect_name("'section' or 'steps'")?;
        if root == "steps" {
            self.expect(Token::LBracket, "'[' after 'steps'")?;
            let step = self.expect_name("a step name")?;
            self.expect(Token::RBracket, "']'")?;
            self.expect(Token::Dot, "'.'")?;
            let name = self.expect_name("a field name")?;
            let field = StepField::parse(&name).ok_or_else(|| ConditionError::UnknownField {
                field: format!("steps[{step}].{name}"),
            })?;
            return Ok(FieldRef::Step { step, field });
        }

        let section = if self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            let id = self.expect_name("a section id")?;
            self.expect(Token::RBracket, "']'")?;
            SectionRef::Named(id)
        } else {
            SectionRef::Target
        };
        self.expect(Token::Dot, "'.'")?;
        let name = self.expect_name("a field name")?;
        let field = SectionField::parse(&name).ok_or_else(|| ConditionError::UnknownField {
            field: format!("section.{name}"),
        })?;
        Ok(FieldRef::Section { section, field })
    }

    fn parse_literal(&mut self) -> Result<Literal, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Quoted(s)) => Ok(Literal::Quoted(s)),
            Some(Token::Word(w)) => Ok(Literal::Bare(w)),
            _ => Err(syntax(offset, "expected a value after the operator")),
        }
    }
}

fn coerce(field: &FieldRef, op: CompareOp, literal: Literal) -> Result<Value, ConditionError> {
    let ty = field.value_type();
    if op.is_ordering() && ty != ValueType::Int {
        return Err(ConditionError::Type(format!(
            "'{op}' needs an integer field, '{field}' is {ty}"
        )));
    }
    let mismatch = || {
        ConditionError::Type(format!(
            "'{field}' is {ty}, cannot compare it with '{}'",
            literal.text()
        ))
    };
    match ty {
        ValueType::Bool => match &literal {
            Literal::Bare(w) if w == "true" => Ok(Value::Bool(true)),
            Literal::Bare(w) if w == "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        ValueType::Int => match &literal {
            Literal::Bare(w) => w.parse::<i64>().map(Value::Int).map_err(|_| mismatch()),
            Literal::Quoted(_) => Err(mismatch()),
        },
        ValueType::Text => Ok(Value::Text(literal.text().to_string())),
        ValueType::SectionStatus => literal
            .text()
            .parse::<SectionStatus>()
            .map(Value::SectionStatus)
            .map_err(|_| mismatch()),
        ValueType::StepStatus => literal
            .text()
            .parse::<StepStatus>()
            .map(Value::StepStatus)
            .map_err(|_| mismatch()),
    }
}

/// Parse a condition string into a typed [`ConditionExpr`].
///
/// Empty or whitespace-only input is the constant `true`.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(ConditionExpr::Const(true));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(syntax(parser.offset(), "unexpected trailing input"));
    }
    Ok(expr)
}

/// Check the names an expression refers to. Returns every problem found.
pub fn check_references(
    expr: &ConditionExpr,
    has_section_target: bool,
    step_exists: impl Fn(&str) -> bool,
) -> Vec<ConditionError> {
    let mut errors = Vec::new();
    for field in expr.fields() {
        match field {
            FieldRef::Step { step, .. } if !step_exists(step) => {
                errors.push(ConditionError::UnknownStep { step: step.clone() });
            }
            FieldRef::Section {
                section: SectionRef::Target,
                field,
            } if !has_section_target => {
                errors.push(ConditionError::MissingSectionTarget {
                    field: field.as_str().to_string(),
                });
            }
            FieldRef::Section {
                section: SectionRef::Named(id),
                ..
            } if validate_section_id(id).is_err() => {
                errors.push(ConditionError::InvalidSection { section: id.clone() });
            }
            _ => {}
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Read-only data a condition is evaluated against.
pub struct ConditionScope<'a> {
    /// Snapshot of the step's own target, `None` for steps targeting all sections.
    pub target: Option<&'a SectionSnapshot>,
    /// Snapshots of sections named with `section[<id>]`.
    pub sections: &'a HashMap<String, SectionSnapshot>,
    pub steps: &'a HashMap<String, StepStatus>,
}

impl ConditionScope<'_> {
    fn resolve(&self, field: &FieldRef) -> Value {
        match field {
            FieldRef::Section { section, field } => {
                let snapshot = match section {
                    SectionRef::Target => self.target,
                    SectionRef::Named(id) => self.sections.get(id),
                };
                let missing;
                let snapshot = match snapshot {
                    Some(s) => s,
                    None => {
                        let id = match section {
                            SectionRef::Named(id) => id.as_str(),
                            SectionRef::Target => "",
                        };
                        missing = SectionSnapshot::missing(id);
                        &missing
                    }
                };
                match field {
                    SectionField::Id => Value::Text(snapshot.id.clone()),
                    SectionField::Exists => Value::Bool(snapshot.exists),
                    SectionField::Status => Value::SectionStatus(snapshot.status),
                    SectionField::CurrentVersion => Value::Int(i64::from(snapshot.current_version)),
                    SectionField::WordCount => Value::Int(snapshot.word_count as i64),
                }
            }
            FieldRef::Step { step, field } => {
                let status = self.steps.get(step).copied().unwrap_or(StepStatus::Pending);
                match field {
                    StepField::Status => Value::StepStatus(status),
                    StepField::Executed => Value::Bool(matches!(
                        status,
                        StepStatus::Success | StepStatus::Failed
                    )),
                    StepField::Succeeded => Value::Bool(status == StepStatus::Success),
                    StepField::Failed => Value::Bool(status == StepStatus::Failed),
                    StepField::Skipped => Value::Bool(status == StepStatus::Skipped),
                }
            }
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::NotEq => actual != expected,
        _ => match (actual, expected) {
            (Value::Int(a), Value::Int(b)) => match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                _ => a >= b,
            },
            _ => false,
        },
    }
}

pub fn evaluate_condition(expr: &ConditionExpr, scope: &ConditionScope<'_>) -> bool {
    match expr {
        ConditionExpr::Const(b) => *b,
        ConditionExpr::Field(field) => scope.resolve(field) == Value::Bool(true),
        ConditionExpr::Compare { field, op, value } => compare(&scope.resolve(field), *op, value),
        ConditionExpr::Not(inner) => !evaluate_condition(inner, scope),
        ConditionExpr::And(a, b) => evaluate_condition(a, scope) && evaluate_condition(b, scope),
        ConditionExpr::Or(a, b) => evaluate_condition(a, scope) || evaluate_condition(b, scope),
    }
}
