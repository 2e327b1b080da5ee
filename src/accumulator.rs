use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::expression::Expression;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Count,
    Push,
    AddToSet,
}

impl AccumulatorOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$count" => AccumulatorOp::Count,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            _ => return None,
        })
    }
}

/// One output field of `$group`/`$bucket`: the reducer and the expression
/// feeding it.
#[derive(Debug, Clone)]
pub struct AccumulatorSpec {
    pub op: AccumulatorOp,
    pub expr: Expression,
}

impl AccumulatorSpec {
    pub fn parse(val: &JsonValue) -> Result<Self> {
        let obj = val
            .as_object()
            .ok_or_else(|| Error::InvalidSpec("accumulator must be an object".into()))?;
        let mut entries = obj.iter();
        let (name, arg) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(Error::InvalidSpec(
                    "accumulator must have exactly one operator".into(),
                ));
            }
        };
        let op = AccumulatorOp::from_name(name)
            .ok_or_else(|| Error::InvalidSpec(format!("unknown accumulator: {name}")))?;
        let expr = if op == AccumulatorOp::Count {
            if !arg.as_object().is_some_and(|m| m.is_empty()) {
                return Err(Error::InvalidSpec("$count takes an empty object".into()));
            }
            Expression::Literal(Value::Null)
        } else {
            Expression::parse(arg)?
        };
        Ok(Self { op, expr })
    }

    pub fn count() -> Self {
        Self {
            op: AccumulatorOp::Count,
            expr: Expression::Literal(Value::Null),
        }
    }

    pub fn start(&self) -> Accumulator {
        Accumulator::new(self.op)
    }
}

/// Live reducer state for one group and one output field.
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Value),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Count(u64),
    Push(Vec<Value>),
    AddToSet { seen: HashSet<Value>, items: Vec<Value> },
}

impl Accumulator {
    pub fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => Accumulator::Sum(Value::Int(0)),
            AccumulatorOp::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AccumulatorOp::Min => Accumulator::Min(None),
            AccumulatorOp::Max => Accumulator::Max(None),
            AccumulatorOp::First => Accumulator::First(None),
            AccumulatorOp::Last => Accumulator::Last(None),
            AccumulatorOp::Count => Accumulator::Count(0),
            AccumulatorOp::Push => Accumulator::Push(Vec::new()),
            AccumulatorOp::AddToSet => Accumulator::AddToSet {
                seen: HashSet::new(),
                items: Vec::new(),
            },
        }
    }

    /// Fold one record's value into the state, in arrival order.
    pub fn accumulate(&mut self, value: Value) {
        match self {
            Accumulator::Sum(total) => {
                if let Some(next) = total.checked_add(&value) {
                    *total = next;
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(n) = value.as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !value.is_nullish() && current.as_ref().is_none_or(|cur| value < *cur) {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !value.is_nullish() && current.as_ref().is_none_or(|cur| value > *cur) {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = Some(value),
            Accumulator::Count(c) => *c += 1,
            Accumulator::Push(items) => {
                if !value.is_missing() {
                    items.push(value);
                }
            }
            Accumulator::AddToSet { seen, items } => {
                if !value.is_missing() && seen.insert(value.clone()) {
                    items.push(value);
                }
            }
        }
    }

    pub fn finalize(self) -> Value {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Double(sum / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
            Accumulator::First(v) | Accumulator::Last(v) => match v {
                Some(v) if !v.is_missing() => v,
                _ => Value::Null,
            },
            Accumulator::Count(c) => Value::Int(c as i64),
            Accumulator::Push(items) | Accumulator::AddToSet { items, .. } => Value::Array(items),
        }
    }
}
