//! Restricted shell-assignment language
//!
//! Recipe files (`spec`, `defines`) are lists of shell variable assignments.
//! Most of them stay within a small subset of the shell syntax that is parsed
//! and evaluated here without spawning a process:
//!
//! - `name=value` and `name+=value`, one per line, with optional `#` comments
//! - single-quoted, double-quoted and unquoted text
//! - `$name` and `${name}` references, with the `:offset[:length]`,
//!   `/pat/rep`, `//pat/rep`, `/#pat/rep`, `/%pat/rep`, `#pat`, `##pat`,
//!   `%pat` and `%%pat` modifiers (patterns are literal text)
//!
//! Files that step outside the subset are evaluated by a real shell through
//! [`crate::infra::shell::ShellStrategy`]; [`parse_assignments`] chains the
//! two strategies.

use std::fmt;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::BashVarError;
use crate::infra::shell::ShellStrategy;

/// Variables in assignment order
pub type Variables = IndexMap<String, String>;

/// Non-fatal finding produced while evaluating a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A variable was referenced (or appended to) before being assigned
    UndefinedVariable { name: String, line: usize },
    /// The fallback shell wrote to stderr
    ShellMessage(String),
    /// The fallback shell printed a different number of values than requested
    OutputMismatch { expected: usize, actual: usize },
}

impl Diagnostic {
    /// Undefined references are routine in recipes and only logged at debug
    pub fn is_warning(&self) -> bool {
        !matches!(self, Self::UndefinedVariable { .. })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedVariable { name, line } => {
                write!(f, "line {line}: variable '{name}' is not defined")
            }
            Self::ShellMessage(message) => write!(f, "shell: {message}"),
            Self::OutputMismatch { expected, actual } => write!(
                f,
                "shell printed {actual} value(s), expected {expected}; some variables may be wrong"
            ),
        }
    }
}

/// Result of evaluating one file
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub variables: Variables,
    pub diagnostics: Vec<Diagnostic>,
}

impl Evaluation {
    /// Log every diagnostic against `file`
    pub fn report(&self, file: &str) {
        for diagnostic in &self.diagnostics {
            if diagnostic.is_warning() {
                warn!("{file}: {diagnostic}");
            } else {
                debug!("{file}: {diagnostic}");
            }
        }
    }
}

/// A way of turning assignment source text into variables
pub trait AssignmentStrategy {
    fn evaluate(&self, source: &str, file: &str) -> Result<Evaluation, BashVarError>;
}

/// In-process evaluation of the supported subset
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteralStrategy;

impl AssignmentStrategy for LiteralStrategy {
    fn evaluate(&self, source: &str, file: &str) -> Result<Evaluation, BashVarError> {
        let statements = parse_document(source).map_err(|e| e.into_error(source, file))?;
        Ok(evaluate(&statements))
    }
}

/// Runs `primary`, and `fallback` when `primary` rejects the syntax
#[derive(Debug, Clone)]
pub struct WithFallback<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> WithFallback<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A: AssignmentStrategy, B: AssignmentStrategy> AssignmentStrategy for WithFallback<A, B> {
    fn evaluate(&self, source: &str, file: &str) -> Result<Evaluation, BashVarError> {
        match self.primary.evaluate(source, file) {
            Err(e) if e.is_syntax() => {
                debug!("{e}, falling back");
                self.fallback.evaluate(source, file)
            }
            other => other,
        }
    }
}

/// Parse and evaluate assignment source text
///
/// `file` is only used in diagnostics and errors.
pub fn parse_assignments(source: &str, file: &str) -> Result<Variables, BashVarError> {
    let strategy = WithFallback::new(LiteralStrategy, ShellStrategy::default());
    let evaluation = strategy.evaluate(source, file)?;
    evaluation.report(file);
    Ok(evaluation.variables)
}

/// Render `value` so that it reads back as exactly `value`
pub fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_plain) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

// ============================================
// Syntax tree
// ============================================

/// One `name=value` or `name+=value` statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub append: bool,
    pub value: Word,
    pub line: usize,
}

/// A value: concatenation of segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Word(pub Vec<Segment>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Plain(String),
    SingleQuoted(String),
    DoubleQuoted(Vec<QuotedPart>),
    Expansion(Expansion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotedPart {
    Text(String),
    Escaped(char),
    LineContinuation,
    Expansion(Expansion),
}

/// `$name` or `${name<modifier>}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub name: String,
    pub braced: bool,
    pub modifier: Option<Modifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Substring { offset: i64, length: Option<i64> },
    Replace {
        mode: ReplaceMode,
        pattern: String,
        replacement: Option<String>,
    },
    RemovePrefix { longest: bool, pattern: String },
    RemoveSuffix { longest: bool, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    First,
    All,
    Prefix,
    Suffix,
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                Segment::Plain(text) => f.write_str(text)?,
                Segment::SingleQuoted(text) => write!(f, "'{text}'")?,
                Segment::DoubleQuoted(parts) => {
                    f.write_str("\"")?;
                    for part in parts {
                        match part {
                            QuotedPart::Text(text) => f.write_str(text)?,
                            QuotedPart::Escaped(c) => write!(f, "\\{c}")?,
                            QuotedPart::LineContinuation => f.write_str("\\\n")?,
                            QuotedPart::Expansion(expansion) => write!(f, "{expansion}")?,
                        }
                    }
                    f.write_str("\"")?;
                }
                Segment::Expansion(expansion) => write!(f, "{expansion}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expansion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.braced {
            return write!(f, "${}", self.name);
        }
        write!(f, "${{{}", self.name)?;
        match &self.modifier {
            None => {}
            Some(Modifier::Substring { offset, length }) => {
                if *offset < 0 {
                    write!(f, ": {offset}")?;
                } else {
                    write!(f, ":{offset}")?;
                }
                if let Some(length) = length {
                    write!(f, ":{length}")?;
                }
            }
            Some(Modifier::Replace {
                mode,
                pattern,
                replacement,
            }) => {
                let op = match mode {
                    ReplaceMode::First => "/",
                    ReplaceMode::All => "//",
                    ReplaceMode::Prefix => "/#",
                    ReplaceMode::Suffix => "/%",
                };
                write!(f, "{op}{pattern}")?;
                if let Some(replacement) = replacement {
                    write!(f, "/{replacement}")?;
                }
            }
            Some(Modifier::RemovePrefix { longest, pattern }) => {
                write!(f, "{}{pattern}", if *longest { "##" } else { "#" })?;
            }
            Some(Modifier::RemoveSuffix { longest, pattern }) => {
                write!(f, "{}{pattern}", if *longest { "%%" } else { "%" })?;
            }
        }
        f.write_str("}")
    }
}

// ============================================
// Parser
// ============================================

/// Position and reason of a rejected input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub offset: usize,
    pub message: String,
}

impl SyntaxError {
    fn into_error(self, source: &str, file: &str) -> BashVarError {
        let before = &source[..self.offset.min(source.len())];
        let line = before.matches('\n').count() + 1;
        let column = before
            .rsplit('\n')
            .next()
            .map_or(0, |tail| tail.chars().count())
            + 1;
        BashVarError::Syntax {
            file: file.to_string(),
            line,
            column,
            message: self.message,
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_plain(c: char) -> bool {
    !matches!(
        c,
        '~' | '{' | '}' | '(' | ')' | '$' | '\'' | '"' | '`' | '\\' | '*' | '?' | '[' | ']' | ' '
            | '\t'
            | '\n'
    )
}

fn is_pattern_char(c: char) -> bool {
    !matches!(
        c,
        '/' | '#' | '%' | '*' | '?' | '[' | '}' | '\'' | '"' | '`' | '\\' | '$'
    )
}

/// Parse a whole file into statements
pub fn parse_document(source: &str) -> Result<Vec<Assignment>, SyntaxError> {
    let mut parser = Parser::new(source);
    let mut statements = Vec::new();
    while !parser.at_end() {
        if let Some(statement) = parser.statement()? {
            statements.push(statement);
        }
    }
    Ok(statements)
}

/// Parse a single value, as found on the right of `=`
pub fn parse_value(text: &str) -> Result<Word, SyntaxError> {
    let mut parser = Parser::new(text);
    let word = parser.word()?;
    if parser.at_end() {
        Ok(word)
    } else {
        parser.fail("unexpected character in value")
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0, line: 1 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.src[self.pos..].chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError {
            offset: self.pos,
            message: message.into(),
        })
    }

    fn statement(&mut self) -> Result<Option<Assignment>, SyntaxError> {
        self.take_while(is_blank);
        let line = self.line;
        let mut assignment = None;

        if self.peek().is_some_and(is_name_start) {
            let name = self.take_while(is_name_char).to_string();
            let append = if self.peek() == Some('+') && self.peek_second() == Some('=') {
                self.bump();
                self.bump();
                true
            } else if self.eat('=') {
                false
            } else {
                return self.fail(format!("expected '=' after '{name}'"));
            };
            let value = self.word()?;
            assignment = Some(Assignment {
                name,
                append,
                value,
                line,
            });
        }

        self.take_while(is_blank);
        if self.peek() == Some('#') {
            self.take_while(|c| c != '\n');
        }

        match self.peek() {
            None => Ok(assignment),
            Some('\n') => {
                self.bump();
                Ok(assignment)
            }
            Some(c) => self.fail(format!("unexpected '{c}'")),
        }
    }

    fn word(&mut self) -> Result<Word, SyntaxError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some('\'') => segments.push(self.single_quoted()?),
                Some('"') => segments.push(self.double_quoted()?),
                Some('$') => segments.push(Segment::Expansion(self.expansion()?)),
                Some(c) if is_plain(c) => {
                    segments.push(Segment::Plain(self.take_while(is_plain).to_string()));
                }
                _ => break,
            }
        }
        Ok(Word(segments))
    }

    fn single_quoted(&mut self) -> Result<Segment, SyntaxError> {
        self.bump();
        let text = self.take_while(|c| c != '\'').to_string();
        if !self.eat('\'') {
            return self.fail("unterminated single quote");
        }
        Ok(Segment::SingleQuoted(text))
    }

    fn double_quoted(&mut self) -> Result<Segment, SyntaxError> {
        self.bump();
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                None => return self.fail("unterminated double quote"),
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => match self.peek_second() {
                    Some('\n') => {
                        self.bump();
                        self.bump();
                        parts.push(QuotedPart::LineContinuation);
                    }
                    Some(c @ ('$' | '`' | '"' | '\\')) => {
                        self.bump();
                        self.bump();
                        parts.push(QuotedPart::Escaped(c));
                    }
                    // any other backslash is literal inside double quotes
                    _ => {
                        self.bump();
                        parts.push(QuotedPart::Text("\\".to_string()));
                    }
                },
                Some('$') => parts.push(QuotedPart::Expansion(self.expansion()?)),
                Some('`') => return self.fail("command substitution is not supported"),
                Some(_) => {
                    let text = self.take_while(|c| !matches!(c, '"' | '\\' | '$' | '`'));
                    parts.push(QuotedPart::Text(text.to_string()));
                }
            }
        }
        Ok(Segment::DoubleQuoted(parts))
    }

    fn expansion(&mut self) -> Result<Expansion, SyntaxError> {
        self.bump();
        if self.eat('{') {
            if !self.peek().is_some_and(is_name_start) {
                return self.fail("expected a variable name after '${'");
            }
            let name = self.take_while(is_name_char).to_string();
            let modifier = self.modifier()?;
            if !self.eat('}') {
                return self.fail("expected '}'");
            }
            Ok(Expansion {
                name,
                braced: true,
                modifier,
            })
        } else if self.peek().is_some_and(is_name_start) {
            Ok(Expansion {
                name: self.take_while(is_name_char).to_string(),
                braced: false,
                modifier: None,
            })
        } else {
            self.fail("unsupported expansion")
        }
    }

    fn modifier(&mut self) -> Result<Option<Modifier>, SyntaxError> {
        match self.peek() {
            Some('}') => Ok(None),
            Some(':') => {
                self.bump();
                let offset = self.offset()?;
                let length = if self.eat(':') {
                    Some(self.integer()?)
                } else {
                    None
                };
                Ok(Some(Modifier::Substring { offset, length }))
            }
            Some('/') => {
                self.bump();
                let mode = if self.eat('/') {
                    ReplaceMode::All
                } else if self.eat('#') {
                    ReplaceMode::Prefix
                } else if self.eat('%') {
                    ReplaceMode::Suffix
                } else {
                    ReplaceMode::First
                };
                let pattern = self.take_while(is_pattern_char).to_string();
                let replacement = if self.eat('/') {
                    Some(self.take_while(is_pattern_char).to_string())
                } else {
                    None
                };
                Ok(Some(Modifier::Replace {
                    mode,
                    pattern,
                    replacement,
                }))
            }
            Some('#') => {
                self.bump();
                let longest = self.eat('#');
                let pattern = self.take_while(is_pattern_char).to_string();
                Ok(Some(Modifier::RemovePrefix { longest, pattern }))
            }
            Some('%') => {
                self.bump();
                let longest = self.eat('%');
                let pattern = self.take_while(is_pattern_char).to_string();
                Ok(Some(Modifier::RemoveSuffix { longest, pattern }))
            }
            _ => self.fail("unsupported parameter expansion"),
        }
    }

    // `${v:-x}` is the default-value operator, so a negative offset needs a
    // blank before the sign
    fn offset(&mut self) -> Result<i64, SyntaxError> {
        if self.peek().is_some_and(|c| c.is_ascii_digit()) {
            return self.integer();
        }
        if self.take_while(is_blank).is_empty() {
            return self.fail("expected a substring offset");
        }
        self.integer()
    }

    fn integer(&mut self) -> Result<i64, SyntaxError> {
        let start = self.pos;
        self.eat('-');
        if self.take_while(|c| c.is_ascii_digit()).is_empty() {
            return self.fail("expected a number");
        }
        match self.src[start..self.pos].parse() {
            Ok(n) => Ok(n),
            Err(_) => self.fail("number out of range"),
        }
    }
}

// ============================================
// Evaluation
// ============================================

fn evaluate(statements: &[Assignment]) -> Evaluation {
    let mut evaluation = Evaluation::default();
    for statement in statements {
        let value = evaluation.expand_word(&statement.value, statement.line);
        if statement.append {
            if let Some(existing) = evaluation.variables.get_mut(&statement.name) {
                existing.push_str(&value);
                continue;
            }
            evaluation.diagnostics.push(Diagnostic::UndefinedVariable {
                name: statement.name.clone(),
                line: statement.line,
            });
        }
        evaluation.variables.insert(statement.name.clone(), value);
    }
    evaluation
}

impl Evaluation {
    fn expand_word(&mut self, word: &Word, line: usize) -> String {
        let mut out = String::new();
        for segment in &word.0 {
            match segment {
                Segment::Plain(text) | Segment::SingleQuoted(text) => out.push_str(text),
                Segment::DoubleQuoted(parts) => {
                    for part in parts {
                        match part {
                            QuotedPart::Text(text) => out.push_str(text),
                            QuotedPart::Escaped(c) => out.push(*c),
                            QuotedPart::LineContinuation => {}
                            QuotedPart::Expansion(expansion) => {
                                out.push_str(&self.expand(expansion, line));
                            }
                        }
                    }
                }
                Segment::Expansion(expansion) => out.push_str(&self.expand(expansion, line)),
            }
        }
        out
    }

    fn expand(&mut self, expansion: &Expansion, line: usize) -> String {
        let Some(value) = self.variables.get(&expansion.name) else {
            self.diagnostics.push(Diagnostic::UndefinedVariable {
                name: expansion.name.clone(),
                line,
            });
            return String::new();
        };
        match &expansion.modifier {
            None => value.clone(),
            Some(modifier) => apply_modifier(value, modifier),
        }
    }
}

fn apply_modifier(value: &str, modifier: &Modifier) -> String {
    match modifier {
        Modifier::Substring { offset, length } => substring(value, *offset, *length),
        Modifier::Replace {
            mode,
            pattern,
            replacement,
        } => {
            let replacement = replacement.as_deref().unwrap_or("");
            match mode {
                ReplaceMode::First if !pattern.is_empty() => value.replacen(pattern, replacement, 1),
                ReplaceMode::All if !pattern.is_empty() => value.replace(pattern, replacement),
                ReplaceMode::First | ReplaceMode::All => value.to_string(),
                ReplaceMode::Prefix => match value.strip_prefix(pattern.as_str()) {
                    Some(rest) => format!("{replacement}{rest}"),
                    None => value.to_string(),
                },
                ReplaceMode::Suffix => match value.strip_suffix(pattern.as_str()) {
                    Some(rest) => format!("{rest}{replacement}"),
                    None => value.to_string(),
                },
            }
        }
        // patterns are literal, so shortest and longest matches coincide
        Modifier::RemovePrefix { pattern, .. } => value
            .strip_prefix(pattern.as_str())
            .unwrap_or(value)
            .to_string(),
        Modifier::RemoveSuffix { pattern, .. } => value
            .strip_suffix(pattern.as_str())
            .unwrap_or(value)
            .to_string(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn substring(value: &str, offset: i64, length: Option<i64>) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len() as i64;
    let start = if offset < 0 { len + offset } else { offset };
    if start < 0 || start > len {
        return String::new();
    }
    let end = match length {
        None => len,
        Some(length) if length >= 0 => (start + length).min(len),
        Some(length) => len + length,
    };
    if end <= start {
        return String::new();
    }
    chars[start as usize..end as usize].iter().collect()
}
