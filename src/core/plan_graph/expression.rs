use crate::core::error::AppError;
use crate::core::plan_graph::state::{json_type_name, lookup_in_value, SharedState};
use crate::core::types::ErrorCategory;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Default number of compiled rule strings kept per evaluator.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

const OPERATORS: &[&str] = &[
    "var", "missing", "if", "?:", "==", "!=", "===", "!==", "!", "!!", "and", "or", "<", "<=",
    ">", ">=", "+", "-", "*", "/", "%", "min", "max", "cat", "in", "merge", "map", "filter",
    "all", "some", "none",
];

/// An expression resolved once from its wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpression {
    /// Declarative JSON rule tree.
    Rule(Value),
    /// Direct dot-path lookup into shared state.
    Path(String),
    /// Plain JSON scalar used as-is.
    Literal(Value),
}

/// Failures raised while compiling or applying a rule.
#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("rule string is not valid JSON: {0}")]
    MalformedRule(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("rule objects must contain exactly one operator, found {0} keys")]
    AmbiguousRule(usize),
    #[error("operator '{op}' expected {expected}")]
    BadArguments { op: String, expected: &'static str },
    #[error("division by zero in '{0}'")]
    DivisionByZero(String),
}

enum Scope<'a> {
    State(&'a SharedState),
    Value(&'a Value),
}

impl Scope<'_> {
    fn resolve(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        match self {
            Scope::State(state) if path.is_empty() => Some(state.to_value()),
            Scope::State(state) => state.lookup(path).cloned(),
            Scope::Value(value) if path.is_empty() => Some((*value).clone()),
            Scope::Value(value) => {
                let segments: Vec<&str> = path.split('.').collect();
                lookup_in_value(value, &segments).cloned()
            }
        }
    }
}

/// Evaluates conditions and collection expressions against shared state.
///
/// Rule strings are compiled once and cached on the instance; the cache is
/// cleared wholesale when it reaches capacity.
pub struct ExpressionEvaluator {
    cache: Mutex<HashMap<String, Arc<CompiledExpression>>>,
    capacity: usize,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ExpressionEvaluator {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Compile an expression, failing on malformed rule strings or unknown operators.
    pub fn compile(&self, expr: &Value) -> Result<Arc<CompiledExpression>, AppError> {
        self.compile_inner(expr).map_err(|err| {
            AppError::new(
                ErrorCategory::ExpressionError,
                format!("expression compile error: {}", err),
            )
            .with_code("PLN-EXPR-001")
        })
    }

    /// Number of rule strings currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Evaluate an expression as a condition. Failures degrade to `false`.
    pub fn evaluate_condition(&self, expr: &Value, state: &SharedState) -> bool {
        match self.compile_inner(expr) {
            Ok(compiled) => self.condition_holds(&compiled, state),
            Err(err) => {
                tracing::warn!(error = %err, "condition failed to compile; treating as false");
                false
            }
        }
    }

    /// Condition check for an expression compiled at load time.
    pub fn condition_holds(&self, compiled: &CompiledExpression, state: &SharedState) -> bool {
        match compiled {
            CompiledExpression::Literal(value) => is_truthy(value),
            CompiledExpression::Path(path) => match state.lookup(path) {
                Some(value) => is_truthy(value),
                None => {
                    tracing::debug!(path = %path, "condition path not present in shared state");
                    false
                }
            },
            CompiledExpression::Rule(rule) => match apply_rule(rule, &Scope::State(state)) {
                Ok(value) => is_truthy(&value),
                Err(err) => {
                    tracing::warn!(error = %err, "condition evaluation failed; treating as false");
                    false
                }
            },
        }
    }

    /// Evaluate an expression that must produce an array. Failures degrade to `[]`.
    pub fn read_collection(&self, expr: &Value, state: &SharedState) -> Vec<Value> {
        match self.compile_inner(expr) {
            Ok(compiled) => self.collection_items(&compiled, state),
            Err(err) => {
                tracing::warn!(error = %err, "collection failed to compile; treating as empty");
                Vec::new()
            }
        }
    }

    /// Collection read for an expression compiled at load time.
    pub fn collection_items(&self, compiled: &CompiledExpression, state: &SharedState) -> Vec<Value> {
        let resolved = match compiled {
            CompiledExpression::Literal(value) => Some(value.clone()),
            CompiledExpression::Path(path) => state.lookup(path).cloned(),
            CompiledExpression::Rule(rule) => match apply_rule(rule, &Scope::State(state)) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(error = %err, "collection evaluation failed; treating as empty");
                    return Vec::new();
                }
            },
        };
        match resolved {
            Some(Value::Array(items)) => items,
            Some(other) => {
                tracing::warn!(
                    found = json_type_name(&other),
                    "collection expression did not resolve to an array; treating as empty"
                );
                Vec::new()
            }
            None => {
                tracing::warn!("collection expression resolved to nothing; treating as empty");
                Vec::new()
            }
        }
    }

    /// Apply an expression to an arbitrary JSON document.
    pub fn apply(&self, expr: &Value, data: &Value) -> Result<Value, AppError> {
        let compiled = self.compile(expr)?;
        let scope = Scope::Value(data);
        let result = match compiled.as_ref() {
            CompiledExpression::Literal(value) => Ok(value.clone()),
            CompiledExpression::Path(path) => Ok(scope.resolve(path).unwrap_or(Value::Null)),
            CompiledExpression::Rule(rule) => apply_rule(rule, &scope),
        };
        result.map_err(|err| {
            AppError::new(
                ErrorCategory::ExpressionError,
                format!("expression execution error: {}", err),
            )
            .with_code("PLN-EXPR-001")
        })
    }

    fn compile_inner(&self, expr: &Value) -> Result<Arc<CompiledExpression>, EvalError> {
        match expr {
            Value::String(source) => {
                {
                    let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(hit) = cache.get(source) {
                        return Ok(Arc::clone(hit));
                    }
                }
                let compiled = Arc::new(compile_string(source)?);
                let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                if cache.len() >= self.capacity {
                    tracing::debug!(capacity = self.capacity, "expression cache full; clearing");
                    cache.clear();
                }
                cache.insert(source.clone(), Arc::clone(&compiled));
                Ok(compiled)
            }
            Value::Object(_) | Value::Array(_) => {
                check_operators(expr)?;
                Ok(Arc::new(CompiledExpression::Rule(expr.clone())))
            }
            other => Ok(Arc::new(CompiledExpression::Literal(other.clone()))),
        }
    }
}

fn compile_string(source: &str) -> Result<CompiledExpression, EvalError> {
    let trimmed = source.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let rule: Value = serde_json::from_str(trimmed)
            .map_err(|err| EvalError::MalformedRule(err.to_string()))?;
        check_operators(&rule)?;
        Ok(CompiledExpression::Rule(rule))
    } else {
        Ok(CompiledExpression::Path(trimmed.to_string()))
    }
}

fn check_operators(rule: &Value) -> Result<(), EvalError> {
    match rule {
        Value::Object(map) if map.is_empty() => Ok(()),
        Value::Object(map) if map.len() > 1 => Err(EvalError::AmbiguousRule(map.len())),
        Value::Object(map) => {
            for (op, args) in map {
                if !OPERATORS.contains(&op.as_str()) {
                    return Err(EvalError::UnknownOperator(op.clone()));
                }
                check_operators(args)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_operators),
        _ => Ok(()),
    }
}

/// JavaScript-style truthiness used by every condition.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0 && !n.is_nan()).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn apply_rule(rule: &Value, scope: &Scope<'_>) -> Result<Value, EvalError> {
    match rule {
        Value::Array(items) => items
            .iter()
            .map(|item| apply_rule(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) if map.is_empty() => Ok(Value::Object(Map::new())),
        Value::Object(map) if map.len() > 1 => Err(EvalError::AmbiguousRule(map.len())),
        Value::Object(map) => {
            let mut entries = map.iter();
            match entries.next() {
                Some((op, raw)) => {
                    let args: Vec<&Value> = match raw {
                        Value::Array(items) => items.iter().collect(),
                        other => vec![other],
                    };
                    apply_operator(op, &args, scope)
                }
                None => Ok(Value::Object(Map::new())),
            }
        }
        other => Ok(other.clone()),
    }
}

fn eval_arg(args: &[&Value], index: usize, scope: &Scope<'_>) -> Result<Value, EvalError> {
    match args.get(index) {
        Some(arg) => apply_rule(arg, scope),
        None => Ok(Value::Null),
    }
}

fn eval_all(args: &[&Value], scope: &Scope<'_>) -> Result<Vec<Value>, EvalError> {
    args.iter().map(|arg| apply_rule(arg, scope)).collect()
}

fn apply_operator(op: &str, args: &[&Value], scope: &Scope<'_>) -> Result<Value, EvalError> {
    match op {
        "var" => {
            let path = eval_arg(args, 0, scope)?;
            let resolved = match &path {
                Value::Null => scope.resolve(""),
                Value::String(text) => scope.resolve(text),
                Value::Number(number) => scope.resolve(&number.to_string()),
                _ => {
                    return Err(EvalError::BadArguments {
                        op: op.to_string(),
                        expected: "a string or numeric path",
                    })
                }
            };
            match resolved {
                Some(Value::Null) | None => eval_arg(args, 1, scope),
                Some(value) => Ok(value),
            }
        }
        "missing" => {
            let evaluated = eval_all(args, scope)?;
            let keys = match evaluated.first() {
                Some(Value::Array(items)) => items.clone(),
                _ => evaluated,
            };
            let missing = keys
                .into_iter()
                .filter(|key| {
                    let path = loose_string(key);
                    matches!(scope.resolve(&path), None | Some(Value::Null))
                })
                .collect();
            Ok(Value::Array(missing))
        }
        "if" | "?:" => {
            let mut index = 0;
            while index < args.len() {
                if index + 1 == args.len() {
                    return apply_rule(args[index], scope);
                }
                if is_truthy(&apply_rule(args[index], scope)?) {
                    return apply_rule(args[index + 1], scope);
                }
                index += 2;
            }
            Ok(Value::Null)
        }
        "==" => Ok(Value::Bool(loose_eq(
            &eval_arg(args, 0, scope)?,
            &eval_arg(args, 1, scope)?,
        ))),
        "!=" => Ok(Value::Bool(!loose_eq(
            &eval_arg(args, 0, scope)?,
            &eval_arg(args, 1, scope)?,
        ))),
        "===" => Ok(Value::Bool(strict_eq(
            &eval_arg(args, 0, scope)?,
            &eval_arg(args, 1, scope)?,
        ))),
        "!==" => Ok(Value::Bool(!strict_eq(
            &eval_arg(args, 0, scope)?,
            &eval_arg(args, 1, scope)?,
        ))),
        "!" => Ok(Value::Bool(!is_truthy(&eval_arg(args, 0, scope)?))),
        "!!" => Ok(Value::Bool(is_truthy(&eval_arg(args, 0, scope)?))),
        "and" => {
            let mut last = Value::Null;
            for arg in args {
                last = apply_rule(arg, scope)?;
                if !is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "or" => {
            let mut last = Value::Null;
            for arg in args {
                last = apply_rule(arg, scope)?;
                if is_truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        "<" | "<=" => {
            let strict = op == "<";
            let values = eval_all(args, scope)?;
            let holds = |a: &Value, b: &Value| match compare(a, b) {
                Some(Ordering::Less) => true,
                Some(Ordering::Equal) => !strict,
                _ => false,
            };
            match values.len() {
                2 => Ok(Value::Bool(holds(&values[0], &values[1]))),
                3 => Ok(Value::Bool(
                    holds(&values[0], &values[1]) && holds(&values[1], &values[2]),
                )),
                _ => Err(EvalError::BadArguments {
                    op: op.to_string(),
                    expected: "two or three arguments",
                }),
            }
        }
        ">" | ">=" => {
            let a = eval_arg(args, 0, scope)?;
            let b = eval_arg(args, 1, scope)?;
            let result = match compare(&a, &b) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => op == ">=",
                _ => false,
            };
            Ok(Value::Bool(result))
        }
        "+" => {
            let numbers = numeric_args(op, &eval_all(args, scope)?)?;
            Ok(number_value(numbers.iter().sum()))
        }
        "*" => {
            let numbers = numeric_args(op, &eval_all(args, scope)?)?;
            Ok(number_value(numbers.iter().product()))
        }
        "-" => {
            let numbers = numeric_args(op, &eval_all(args, scope)?)?;
            match numbers.as_slice() {
                [single] => Ok(number_value(-single)),
                [a, b] => Ok(number_value(a - b)),
                _ => Err(EvalError::BadArguments {
                    op: op.to_string(),
                    expected: "one or two numeric arguments",
                }),
            }
        }
        "/" | "%" => {
            let numbers = numeric_args(op, &eval_all(args, scope)?)?;
            match numbers.as_slice() {
                [_, b] if *b == 0.0 => Err(EvalError::DivisionByZero(op.to_string())),
                [a, b] if op == "/" => Ok(number_value(a / b)),
                [a, b] => Ok(number_value(a % b)),
                _ => Err(EvalError::BadArguments {
                    op: op.to_string(),
                    expected: "two numeric arguments",
                }),
            }
        }
        "min" | "max" => {
            let numbers = numeric_args(op, &eval_all(args, scope)?)?;
            let folded = numbers.into_iter().reduce(|acc, n| {
                if op == "min" {
                    acc.min(n)
                } else {
                    acc.max(n)
                }
            });
            Ok(folded.map(number_value).unwrap_or(Value::Null))
        }
        "cat" => {
            let joined: String = eval_all(args, scope)?.iter().map(loose_string).collect();
            Ok(Value::String(joined))
        }
        "in" => {
            let needle = eval_arg(args, 0, scope)?;
            let haystack = eval_arg(args, 1, scope)?;
            let found = match &haystack {
                Value::String(text) => text.contains(&loose_string(&needle)),
                Value::Array(items) => items.iter().any(|item| strict_eq(item, &needle)),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "merge" => {
            let mut merged = Vec::new();
            for value in eval_all(args, scope)? {
                match value {
                    Value::Array(items) => merged.extend(items),
                    other => merged.push(other),
                }
            }
            Ok(Value::Array(merged))
        }
        "map" | "filter" | "all" | "some" | "none" => {
            let items = match eval_arg(args, 0, scope)? {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                _ => {
                    return Err(EvalError::BadArguments {
                        op: op.to_string(),
                        expected: "an array as first argument",
                    })
                }
            };
            let body = args.get(1).copied().unwrap_or(&Value::Null);
            let mut mapped = Vec::with_capacity(items.len());
            for item in &items {
                mapped.push(apply_rule(body, &Scope::Value(item))?);
            }
            let result = match op {
                "map" => Value::Array(mapped),
                "filter" => Value::Array(
                    items
                        .into_iter()
                        .zip(mapped.iter())
                        .filter(|(_, keep)| is_truthy(keep))
                        .map(|(item, _)| item)
                        .collect(),
                ),
                "all" => Value::Bool(!mapped.is_empty() && mapped.iter().all(is_truthy)),
                "some" => Value::Bool(mapped.iter().any(is_truthy)),
                _ => Value::Bool(!mapped.iter().any(is_truthy)),
            };
            Ok(result)
        }
        other => Err(EvalError::UnknownOperator(other.to_string())),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn numeric_args(op: &str, values: &[Value]) -> Result<Vec<f64>, EvalError> {
    values
        .iter()
        .map(|value| {
            to_number(value).ok_or_else(|| EvalError::BadArguments {
                op: op.to_string(),
                expected: "numeric arguments",
            })
        })
        .collect()
}

fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn loose_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    let x = to_number(a)?;
    let y = to_number(b)?;
    x.partial_cmp(&y)
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(_), _) | (Value::Object(_), _) | (_, Value::Array(_)) | (_, Value::Object(_)) => {
            a == b
        }
        _ => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
