//! Model formulas: named parameter expressions over a data table.
//!
//! A formula is an ordered list of terms of the form `name ~ expression`.
//! Each right-hand side is parsed once into an [`Expr`] tree, which yields
//! the free variable names (the predictors) and is later evaluated against
//! the working table by an [`Evaluator`].
//!
//! ```text
//! mean ~ 1 + 2*x1 + gp(s1, s2, phi = 0.3)
//! sd   ~ exp(0.5 * x2)
//! ```

mod eval;
mod parser;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexSet;

use crate::error::{Result, SimError};

pub use eval::{Evaluator, FunctionTable, UserFunction, Value};

/// Names that evaluate to constants and are never treated as predictors.
pub const CONSTANTS: &[(&str, f64)] = &[("pi", std::f64::consts::PI)];

/// Looks up a built-in constant by name.
pub fn constant(name: &str) -> Option<f64> {
    CONSTANTS.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Pow => "^",
        }
    }

    /// Applies the operator to two scalars.
    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Pow => a.powf(b),
        }
    }
}

/// A call argument, optionally labelled (`phi = 0.5`).
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

/// Expression tree of a right-hand side.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call { name: String, args: Vec<Arg> },
}

impl Expr {
    /// Parses a single expression.
    pub fn parse(src: &str) -> Result<Self> {
        parser::parse_expr(src)
    }

    /// Free variable names in order of first appearance.
    ///
    /// Function names, argument labels, string literals and constants are
    /// not variables.
    pub fn variables(&self) -> Vec<String> {
        let mut seen = IndexSet::new();
        self.collect_variables(&mut seen);
        seen.into_iter().collect()
    }

    fn collect_variables(&self, seen: &mut IndexSet<String>) {
        match self {
            Expr::Number(_) | Expr::Text(_) => {}
            Expr::Var(name) => {
                if constant(name).is_none() {
                    seen.insert(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_variables(seen),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_variables(seen);
                rhs.collect_variables(seen);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.value.collect_variables(seen);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Text(s) => write!(f, "\"{s}\""),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(label) = &arg.name {
                        write!(f, "{label} = ")?;
                    }
                    write!(f, "{}", arg.value)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// One `parameter ~ expression` line of a formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub parameter: String,
    pub expr: Expr,
}

impl Term {
    pub fn new(parameter: impl Into<String>, expr: Expr) -> Self {
        Self {
            parameter: parameter.into(),
            expr,
        }
    }

    /// Parses `name ~ expression`.
    pub fn parse(line: &str) -> Result<Self> {
        let (lhs, rhs) = line
            .split_once('~')
            .ok_or_else(|| SimError::Parse(format!("missing '~' in '{line}'")))?;
        let parameter = lhs.trim();
        let valid_name = parameter
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '.')
            && parameter
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_name {
            return Err(SimError::Parse(format!(
                "invalid parameter name '{parameter}' in '{line}'"
            )));
        }
        Ok(Self::new(parameter, Expr::parse(rhs.trim())?))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ~ {}", self.parameter, self.expr)
    }
}

/// Ordered, uniquely named collection of parameter terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    /// Builds a formula, rejecting duplicate parameter names.
    pub fn new(terms: Vec<Term>) -> Result<Self> {
        let mut names = IndexSet::new();
        for term in &terms {
            if !names.insert(term.parameter.as_str()) {
                return Err(SimError::Parse(format!(
                    "parameter '{}' is defined more than once",
                    term.parameter
                )));
            }
        }
        Ok(Self { terms })
    }

    /// Parses one term per line; blank lines and `#` comments are skipped.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            terms.push(Term::parse(line)?);
        }
        Self::new(terms)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Parameter names in definition order.
    pub fn parameters(&self) -> Vec<&str> {
        self.terms.iter().map(|t| t.parameter.as_str()).collect()
    }

    /// Free variables of all right-hand sides, excluding parameter names.
    pub fn predictors(&self) -> Vec<String> {
        let parameters = self.parameters();
        let mut seen = IndexSet::new();
        for term in &self.terms {
            term.expr.collect_variables(&mut seen);
        }
        seen.into_iter()
            .filter(|name| !parameters.contains(&name.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl FromStr for Formula {
    type Err = SimError;

    /// Terms are separated by newlines or `;`.
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s.split(|c| c == '\n' || c == ';'))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}
