//! Evaluation of expression trees against a working table.
//!
//! Names resolve against the table's columns first, then against the
//! built-in constants. Calls resolve against the caller's
//! [`FunctionTable`] first, then against the closed set of built-ins.
//! Arguments bind the way R binds them: labelled arguments by exact name,
//! then the remaining positional arguments in order.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use nalgebra::DMatrix;

use super::{constant, Arg, BinOp, Expr};
use crate::covariance::{exp_cor, exp_cov, CovarianceFamily, Kernel};
use crate::error::{Result, SimError};
use crate::smoothing::runmean;
use crate::spatial::{gp, mfe, mgp, Coregionalization};
use crate::stream::RandomStream;
use crate::table::Table;

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Numeric vector (scalars are vectors of length 1)
    Vector(Vec<f64>),

    /// Numeric matrix, column-major
    Matrix(DMatrix<f64>),

    /// Text literal, e.g. a covariance model name
    Text(String),
}

impl Value {
    pub fn scalar(x: f64) -> Self {
        Value::Vector(vec![x])
    }

    /// Number of elements (`1` for text).
    pub fn len(&self) -> usize {
        match self {
            Value::Vector(v) => v.len(),
            Value::Matrix(m) => m.len(),
            Value::Text(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens to a numeric vector; matrices are read column-major.
    pub fn into_vector(self) -> Result<Vec<f64>> {
        match self {
            Value::Vector(v) => Ok(v),
            Value::Matrix(m) => Ok(m.as_slice().to_vec()),
            Value::Text(s) => Err(SimError::invocation(format!(
                "expected a numeric value, got text \"{s}\""
            ))),
        }
    }

    /// Converts to a matrix. A vector whose length is a perfect square is
    /// read column-major into a square matrix.
    pub fn into_matrix(self) -> Result<DMatrix<f64>> {
        match self {
            Value::Matrix(m) => Ok(m),
            Value::Vector(v) => {
                let side = (v.len() as f64).sqrt().round() as usize;
                if side == 0 || side * side != v.len() {
                    return Err(SimError::reshape(format!(
                        "cannot read a vector of length {} as a square matrix",
                        v.len()
                    )));
                }
                Ok(DMatrix::from_vec(side, side, v))
            }
            Value::Text(s) => Err(SimError::invocation(format!(
                "expected a numeric matrix, got text \"{s}\""
            ))),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(SimError::invocation(format!(
                "expected text, got a numeric value of length {}",
                other.len()
            ))),
        }
    }

    /// Applies `f` elementwise, keeping the shape.
    fn map(self, f: impl Fn(f64) -> f64) -> Result<Value> {
        match self {
            Value::Vector(v) => Ok(Value::Vector(v.into_iter().map(f).collect())),
            Value::Matrix(m) => Ok(Value::Matrix(m.map(f))),
            Value::Text(_) => Err(SimError::invocation(
                "non-numeric argument to mathematical function",
            )),
        }
    }
}

/// A caller-supplied function over one numeric vector.
pub type UserFunction = Arc<dyn Fn(&[f64]) -> Vec<f64> + Send + Sync>;

/// User functions visible to formula expressions, shadowing built-ins.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: IndexMap<String, UserFunction>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a function under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<&UserFunction> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Built-ins ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Floor,
    Ceiling,
    Plogis,
    Pow,
    Sum,
    Mean,
    Length,
    Pmin,
    Pmax,
    Concat,
    Rep,
    Matrix,
    Diag,
    ExpCor,
    ExpCov,
    Gp,
    Mgp,
    Mfe,
    Runmean,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "exp" => Builtin::Exp,
            "log" => Builtin::Log,
            "sqrt" => Builtin::Sqrt,
            "abs" => Builtin::Abs,
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "floor" => Builtin::Floor,
            "ceiling" => Builtin::Ceiling,
            "plogis" => Builtin::Plogis,
            "pow" => Builtin::Pow,
            "sum" => Builtin::Sum,
            "mean" => Builtin::Mean,
            "length" => Builtin::Length,
            "pmin" => Builtin::Pmin,
            "pmax" => Builtin::Pmax,
            "c" => Builtin::Concat,
            "rep" => Builtin::Rep,
            "matrix" => Builtin::Matrix,
            "diag" => Builtin::Diag,
            "exp_cor" | "exp.cor" => Builtin::ExpCor,
            "exp_cov" | "exp.cov" => Builtin::ExpCov,
            "gp" => Builtin::Gp,
            "mgp" => Builtin::Mgp,
            "mfe" => Builtin::Mfe,
            "runmean" => Builtin::Runmean,
            _ => return None,
        };
        Some(builtin)
    }

    /// Formal argument names; empty for variadic built-ins.
    fn formals(&self) -> &'static [&'static str] {
        match self {
            Builtin::Exp
            | Builtin::Sqrt
            | Builtin::Abs
            | Builtin::Sin
            | Builtin::Cos
            | Builtin::Floor
            | Builtin::Ceiling
            | Builtin::Sum
            | Builtin::Mean
            | Builtin::Length => &["x"],
            Builtin::Log => &["x", "base"],
            Builtin::Plogis => &["q"],
            Builtin::Pow => &["x", "y"],
            Builtin::Pmin | Builtin::Pmax | Builtin::Concat => &[],
            Builtin::Rep => &["x", "times", "each"],
            Builtin::Matrix => &["data", "nrow", "ncol"],
            Builtin::Diag => &["x", "nrow"],
            Builtin::ExpCor => &["distance", "phi"],
            Builtin::ExpCov => &["distance", "phi", "sigma2"],
            Builtin::Gp => &["s1", "s2", "model", "phi", "sigma2", "kappa"],
            Builtin::Mgp => &["s1", "s2", "model", "variance", "nugget", "phi", "kappa"],
            Builtin::Mfe => &["x", "beta"],
            Builtin::Runmean => &["x", "k"],
        }
    }
}

/// Evaluated call arguments bound to a built-in's formals.
struct Arguments<'f> {
    function: &'f str,
    formals: &'static [&'static str],
    slots: Vec<Option<Value>>,
}

impl<'f> Arguments<'f> {
    fn bind(
        function: &'f str,
        formals: &'static [&'static str],
        actuals: Vec<(Option<String>, Value)>,
    ) -> Result<Self> {
        let mut slots: Vec<Option<Value>> = vec![None; formals.len()];
        let mut positional = Vec::new();

        for (label, value) in actuals {
            let Some(label) = label else {
                positional.push(value);
                continue;
            };
            let index = formals.iter().position(|f| *f == label).ok_or_else(|| {
                SimError::invocation(format!("{function}(): unused argument ({label} = ...)"))
            })?;
            if slots[index].is_some() {
                return Err(SimError::invocation(format!(
                    "{function}(): formal argument '{label}' matched by multiple actual arguments"
                )));
            }
            slots[index] = Some(value);
        }

        let open: Vec<usize> = (0..formals.len()).filter(|&i| slots[i].is_none()).collect();
        if positional.len() > open.len() {
            return Err(SimError::invocation(format!(
                "{function}(): unused argument (takes at most {} arguments)",
                formals.len()
            )));
        }
        for (index, value) in open.into_iter().zip(positional) {
            slots[index] = Some(value);
        }

        Ok(Self {
            function,
            formals,
            slots,
        })
    }

    fn take(&mut self, formal: &str) -> Option<Value> {
        let index = self.formals.iter().position(|f| *f == formal)?;
        self.slots[index].take()
    }

    fn missing(&self, formal: &str) -> SimError {
        SimError::invocation(format!(
            "{}(): argument \"{formal}\" is missing, with no default",
            self.function
        ))
    }

    fn required(&mut self, formal: &str) -> Result<Value> {
        self.take(formal).ok_or_else(|| self.missing(formal))
    }

    fn numeric(&self, formal: &str, value: Value) -> Result<Vec<f64>> {
        value.into_vector().map_err(|_| {
            SimError::invocation(format!(
                "{}(): argument \"{formal}\" must be numeric",
                self.function
            ))
        })
    }

    fn vector(&mut self, formal: &str) -> Result<Vec<f64>> {
        let value = self.required(formal)?;
        self.numeric(formal, value)
    }

    fn optional_vector(&mut self, formal: &str) -> Result<Option<Vec<f64>>> {
        match self.take(formal) {
            Some(value) => self.numeric(formal, value).map(Some),
            None => Ok(None),
        }
    }

    fn to_scalar(&self, formal: &str, values: Vec<f64>) -> Result<f64> {
        match values.as_slice() {
            [x] => Ok(*x),
            _ => Err(SimError::invocation(format!(
                "{}(): argument \"{formal}\" must be a single number, got length {}",
                self.function,
                values.len()
            ))),
        }
    }

    fn scalar(&mut self, formal: &str) -> Result<f64> {
        let values = self.vector(formal)?;
        self.to_scalar(formal, values)
    }

    fn optional_scalar(&mut self, formal: &str) -> Result<Option<f64>> {
        match self.optional_vector(formal)? {
            Some(values) => self.to_scalar(formal, values).map(Some),
            None => Ok(None),
        }
    }

    fn scalar_or(&mut self, formal: &str, default: f64) -> Result<f64> {
        Ok(self.optional_scalar(formal)?.unwrap_or(default))
    }

    /// A non-negative whole number, e.g. a row count or a window width.
    fn optional_count(&mut self, formal: &str) -> Result<Option<usize>> {
        match self.optional_scalar(formal)? {
            Some(x) if x.is_finite() && x >= 0.0 && x.fract() == 0.0 => Ok(Some(x as usize)),
            Some(x) => Err(SimError::invocation(format!(
                "{}(): invalid '{formal}' argument {x}",
                self.function
            ))),
            None => Ok(None),
        }
    }

    fn count_or(&mut self, formal: &str, default: usize) -> Result<usize> {
        Ok(self.optional_count(formal)?.unwrap_or(default))
    }

    fn count(&mut self, formal: &str) -> Result<usize> {
        self.optional_count(formal)?
            .ok_or_else(|| self.missing(formal))
    }

    fn text_or(&mut self, formal: &str, default: &str) -> Result<String> {
        match self.take(formal) {
            Some(value) => value.into_text().map_err(|_| {
                SimError::invocation(format!(
                    "{}(): argument \"{formal}\" must be a string",
                    self.function
                ))
            }),
            None => Ok(default.to_string()),
        }
    }

    fn matrix(&mut self, formal: &str) -> Result<DMatrix<f64>> {
        self.required(formal)?.into_matrix()
    }

    fn optional_matrix(&mut self, formal: &str) -> Result<Option<DMatrix<f64>>> {
        self.take(formal).map(Value::into_matrix).transpose()
    }
}

fn recycle(op: BinOp, a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
    if a.is_empty() || b.is_empty() {
        return Ok(Vec::new());
    }
    let len = a.len().max(b.len());
    if len % a.len() != 0 || len % b.len() != 0 {
        return Err(SimError::reshape(format!(
            "longer object length {} is not a multiple of shorter object length {}",
            len,
            a.len().min(b.len())
        )));
    }
    Ok((0..len)
        .map(|i| op.apply(a[i % a.len()], b[i % b.len()]))
        .collect())
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    let conformable = |out: Vec<f64>, (rows, cols): (usize, usize)| {
        if out.len() == rows * cols {
            Ok(Value::Matrix(DMatrix::from_vec(rows, cols, out)))
        } else {
            Err(SimError::reshape(format!(
                "vector of length {} is not conformable with a {rows}x{cols} matrix",
                out.len()
            )))
        }
    };

    match (lhs, rhs) {
        (Value::Text(_), _) | (_, Value::Text(_)) => Err(SimError::invocation(format!(
            "non-numeric argument to binary operator '{}'",
            op.symbol()
        ))),
        (Value::Matrix(a), Value::Matrix(b)) => {
            if a.shape() != b.shape() {
                return Err(SimError::reshape(format!(
                    "non-conformable matrices: {:?} and {:?}",
                    a.shape(),
                    b.shape()
                )));
            }
            Ok(Value::Matrix(a.zip_map(&b, |x, y| op.apply(x, y))))
        }
        (Value::Matrix(a), Value::Vector(b)) => conformable(recycle(op, a.as_slice(), &b)?, a.shape()),
        (Value::Vector(a), Value::Matrix(b)) => conformable(recycle(op, &a, b.as_slice())?, b.shape()),
        (Value::Vector(a), Value::Vector(b)) => Ok(Value::Vector(recycle(op, &a, &b)?)),
    }
}

/// Extends a length-1 vector to `len`; any other length must already match.
fn broadcast(function: &str, formal: &str, values: Vec<f64>, len: usize) -> Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; len]),
        n if n == len => Ok(values),
        n => Err(SimError::reshape(format!(
            "{function}(): \"{formal}\" must have length 1 or {len}, got {n}"
        ))),
    }
}

fn parallel(builtin: Builtin, function: &str, values: Vec<Vec<f64>>) -> Result<Value> {
    let mut iter = values.into_iter();
    let first = iter.next().ok_or_else(|| {
        SimError::invocation(format!("{function}(): no arguments"))
    })?;
    iter.try_fold(first, |acc, next| {
        let len = acc.len().max(next.len());
        if acc.is_empty() || next.is_empty() || len % acc.len() != 0 || len % next.len() != 0 {
            return Err(SimError::reshape(format!(
                "{function}(): argument lengths {} and {} do not recycle",
                acc.len(),
                next.len()
            )));
        }
        Ok((0..len)
            .map(|i| {
                let (a, b) = (acc[i % acc.len()], next[i % next.len()]);
                if builtin == Builtin::Pmin {
                    a.min(b)
                } else {
                    a.max(b)
                }
            })
            .collect())
    })
    .map(Value::Vector)
}

// ── Evaluator ──────────────────────────────────────────────────

/// Evaluates expressions against one table, drawing randomness from `stream`.
pub struct Evaluator<'a> {
    table: &'a Table,
    stream: &'a mut RandomStream,
    functions: &'a FunctionTable,
}

impl<'a> Evaluator<'a> {
    pub fn new(table: &'a Table, stream: &'a mut RandomStream, functions: &'a FunctionTable) -> Self {
        Self {
            table,
            stream,
            functions,
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Number(n) => Ok(Value::scalar(*n)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Var(name) => self.lookup(name),
            Expr::Neg(inner) => self.eval(inner)?.map(|x| -x),
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                binary(*op, a, b)
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(column) = self.table.column(name) {
            return Ok(Value::Vector(column.to_vec()));
        }
        constant(name)
            .map(Value::scalar)
            .ok_or_else(|| SimError::resolution(format!("object '{name}' not found")))
    }

    fn eval_args(&mut self, args: &[Arg]) -> Result<Vec<(Option<String>, Value)>> {
        args.iter()
            .map(|arg| Ok((arg.name.clone(), self.eval(&arg.value)?)))
            .collect()
    }

    fn call(&mut self, name: &str, args: &[Arg]) -> Result<Value> {
        let functions = self.functions;
        if let Some(function) = functions.get(name) {
            let mut actuals = self.eval_args(args)?;
            if actuals.len() != 1 {
                return Err(SimError::invocation(format!(
                    "{name}(): expects exactly one argument, got {}",
                    actuals.len()
                )));
            }
            let (_, value) = actuals.remove(0);
            let x = value.into_vector()?;
            return Ok(Value::Vector(function(&x)));
        }

        let builtin = Builtin::from_name(name)
            .ok_or_else(|| SimError::resolution(format!("could not find function '{name}'")))?;
        let actuals = self.eval_args(args)?;

        match builtin {
            Builtin::Concat => {
                let mut out = Vec::new();
                for (_, value) in actuals {
                    out.extend(value.into_vector()?);
                }
                Ok(Value::Vector(out))
            }
            Builtin::Pmin | Builtin::Pmax => {
                let vectors = actuals
                    .into_iter()
                    .map(|(_, value)| value.into_vector())
                    .collect::<Result<Vec<_>>>()?;
                parallel(builtin, name, vectors)
            }
            _ => {
                let mut bound = Arguments::bind(name, builtin.formals(), actuals)?;
                self.apply(builtin, &mut bound)
            }
        }
    }

    fn apply(&mut self, builtin: Builtin, args: &mut Arguments<'_>) -> Result<Value> {
        let function = args.function;
        match builtin {
            Builtin::Exp => args.required("x")?.map(f64::exp),
            Builtin::Sqrt => args.required("x")?.map(f64::sqrt),
            Builtin::Abs => args.required("x")?.map(f64::abs),
            Builtin::Sin => args.required("x")?.map(f64::sin),
            Builtin::Cos => args.required("x")?.map(f64::cos),
            Builtin::Floor => args.required("x")?.map(f64::floor),
            Builtin::Ceiling => args.required("x")?.map(f64::ceil),
            Builtin::Plogis => args.required("q")?.map(|q| 1.0 / (1.0 + (-q).exp())),
            Builtin::Log => {
                let x = args.required("x")?;
                match args.optional_scalar("base")? {
                    Some(base) => x.map(|v| v.ln() / base.ln()),
                    None => x.map(f64::ln),
                }
            }
            Builtin::Pow => {
                let x = args.required("x")?;
                let y = args.required("y")?;
                binary(BinOp::Pow, x, y)
            }
            Builtin::Sum => Ok(Value::scalar(args.vector("x")?.iter().sum())),
            Builtin::Mean => {
                let x = args.vector("x")?;
                Ok(Value::scalar(x.iter().sum::<f64>() / x.len() as f64))
            }
            Builtin::Length => Ok(Value::scalar(args.required("x")?.len() as f64)),
            Builtin::Rep => {
                let x = args.vector("x")?;
                let times = args.count_or("times", 1)?;
                let each = args.count_or("each", 1)?;
                let once: Vec<f64> = x
                    .iter()
                    .flat_map(|&v| std::iter::repeat(v).take(each))
                    .collect();
                Ok(Value::Vector(once.repeat(times)))
            }
            Builtin::Matrix => {
                let data = args.vector("data")?;
                if data.is_empty() {
                    return Err(SimError::reshape("matrix(): data has length zero"));
                }
                let len = data.len();
                let (rows, cols) = match (args.optional_count("nrow")?, args.optional_count("ncol")?) {
                    (None, None) => (len, 1),
                    (Some(r), None) if r > 0 => (r, len.div_ceil(r)),
                    (None, Some(c)) if c > 0 => (len.div_ceil(c), c),
                    (Some(r), Some(c)) => (r, c),
                    _ => {
                        return Err(SimError::invocation(
                            "matrix(): nrow and ncol must be positive",
                        ))
                    }
                };
                let values = (0..rows * cols).map(|i| data[i % len]).collect();
                Ok(Value::Matrix(DMatrix::from_vec(rows, cols, values)))
            }
            Builtin::Diag => {
                let x = args.required("x")?;
                let nrow = args.optional_count("nrow")?;
                match (x, nrow) {
                    (Value::Matrix(m), _) => Ok(Value::Vector(m.diagonal().iter().copied().collect())),
                    (Value::Vector(v), None) if v.len() == 1 => {
                        let size = v[0];
                        if !(size.is_finite() && size >= 0.0 && size.fract() == 0.0) {
                            return Err(SimError::invocation(format!("diag(): invalid size {size}")));
                        }
                        Ok(Value::Matrix(DMatrix::identity(size as usize, size as usize)))
                    }
                    (Value::Vector(v), nrow) => {
                        if v.is_empty() {
                            return Err(SimError::reshape("diag(): x has length zero"));
                        }
                        let size = nrow.unwrap_or(v.len());
                        Ok(Value::Matrix(DMatrix::from_fn(size, size, |i, j| {
                            if i == j {
                                v[i % v.len()]
                            } else {
                                0.0
                            }
                        })))
                    }
                    (Value::Text(_), _) => Err(SimError::invocation("diag(): x must be numeric")),
                }
            }
            Builtin::ExpCor => {
                let distance = args.required("distance")?;
                let phi = args.scalar("phi")?;
                match distance {
                    Value::Matrix(d) => Ok(Value::Matrix(exp_cor(&d, phi))),
                    other => other.map(|d| (-d / phi).exp()),
                }
            }
            Builtin::ExpCov => {
                let distance = args.required("distance")?;
                let phi = args.scalar("phi")?;
                let sigma2 = args.scalar("sigma2")?;
                match distance {
                    Value::Matrix(d) => Ok(Value::Matrix(exp_cov(&d, phi, sigma2))),
                    other => other.map(|d| sigma2 * (-d / phi).exp()),
                }
            }
            Builtin::Gp => {
                let s1 = args.vector("s1")?;
                let s2 = args.vector("s2")?;
                let family: CovarianceFamily = args.text_or("model", "exponential")?.parse()?;
                let mut kernel = Kernel::new(family, args.scalar_or("phi", 1.0)?, args.scalar_or("sigma2", 1.0)?);
                if let Some(kappa) = args.optional_scalar("kappa")? {
                    kernel = kernel.with_kappa(kappa);
                }
                Ok(Value::Vector(gp(&s1, &s2, &kernel, self.stream)?))
            }
            Builtin::Mgp => {
                let s1 = args.vector("s1")?;
                let s2 = args.vector("s2")?;
                let family: CovarianceFamily = args.text_or("model", "exponential")?.parse()?;
                let variance = args.matrix("variance")?;
                let q = variance.nrows();
                let phi = args.optional_vector("phi")?.unwrap_or_else(|| vec![1.0]);
                let mut params =
                    Coregionalization::new(family, variance, broadcast(function, "phi", phi, q)?);
                if let Some(nugget) = args.optional_matrix("nugget")? {
                    params = params.with_nugget(nugget);
                }
                if let Some(kappa) = args.optional_vector("kappa")? {
                    params = params.with_kappa(broadcast(function, "kappa", kappa, q)?);
                }
                Ok(Value::Vector(mgp(&s1, &s2, &params, self.stream)?))
            }
            Builtin::Mfe => {
                let x = args.vector("x")?;
                let beta = args.vector("beta")?;
                Ok(Value::Vector(mfe(&x, &beta)?))
            }
            Builtin::Runmean => {
                let x = args.vector("x")?;
                let k = args.count("k")?;
                Ok(Value::Vector(runmean(&x, k)?))
            }
            Builtin::Pmin | Builtin::Pmax | Builtin::Concat => {
                Err(SimError::invocation(format!("{function}(): unexpected binding")))
            }
        }
    }
}
