use std::collections::BTreeMap;

use ndarray::ArrayViewD;
use serde_json::{Map, Number, Value};
use tract_core::prelude::Tensor;

use crate::error::PredictError;

/// A value as handed over by the inference provider. Numbers may still be
/// wrapped in tensors of any rank, so nothing here is guaranteed to be
/// JSON-safe until it goes through [`RawValue::to_json`] or one of the
/// numeric accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Seq(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
    Tensor(Tensor),
}

impl RawValue {
    /// Unwraps into plain JSON. Never fails: anything that cannot be
    /// represented (non-finite floats, tensors of exotic types) becomes its
    /// string representation. Applying it to its own output is a no-op.
    pub fn to_json(&self) -> Value {
        match self {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::Int(i) => Value::from(*i),
            RawValue::Float(f) => float_json(*f),
            RawValue::Text(s) => Value::String(s.clone()),
            RawValue::Seq(items) => Value::Array(items.iter().map(RawValue::to_json).collect()),
            RawValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            RawValue::Tensor(t) => tensor_json(t),
        }
    }

    /// Reads a single number. One-element sequences and tensors count as
    /// scalars.
    pub fn as_f64(&self) -> Result<f64, PredictError> {
        match self {
            RawValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            RawValue::Int(i) => Ok(*i as f64),
            RawValue::Float(f) => Ok(*f),
            RawValue::Seq(items) if items.len() == 1 => items[0].as_f64(),
            RawValue::Tensor(t) if t.len() == 1 => t
                .cast_to_scalar::<f64>()
                .map_err(|e| PredictError::shape(format!("non-numeric tensor scalar: {}", e))),
            other => Err(PredictError::shape(format!(
                "expected a number, found {}",
                other.type_name()
            ))),
        }
    }

    /// Flattens any nesting of sequences and tensors into a list of numbers
    /// in row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, PredictError> {
        let mut out = Vec::new();
        self.flatten_into(&mut out)?;
        Ok(out)
    }

    fn flatten_into(&self, out: &mut Vec<f64>) -> Result<(), PredictError> {
        match self {
            RawValue::Seq(items) => {
                for item in items {
                    item.flatten_into(out)?;
                }
                Ok(())
            }
            RawValue::Tensor(t) => {
                let cast = t
                    .cast_to::<f64>()
                    .map_err(|e| PredictError::shape(format!("non-numeric tensor: {}", e)))?;
                let view = cast
                    .to_array_view::<f64>()
                    .map_err(|e| PredictError::shape(format!("non-numeric tensor: {}", e)))?;
                out.extend(view.iter().copied());
                Ok(())
            }
            scalar => {
                out.push(scalar.as_f64()?);
                Ok(())
            }
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(_) => "float",
            RawValue::Text(_) => "text",
            RawValue::Seq(_) => "sequence",
            RawValue::Map(_) => "mapping",
            RawValue::Tensor(_) => "tensor",
        }
    }
}

fn float_json(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn tensor_json(t: &Tensor) -> Value {
    if let Ok(view) = t.to_array_view::<bool>() {
        return nested(view, &Value::Bool);
    }
    if t.datum_type().is_integer() {
        if let Ok(cast) = t.cast_to::<i64>() {
            if let Ok(view) = cast.to_array_view::<i64>() {
                return nested(view, &|v: i64| Value::from(v));
            }
        }
    }
    match t.cast_to::<f64>() {
        Ok(cast) => match cast.to_array_view::<f64>() {
            Ok(view) => nested(view, &float_json),
            Err(_) => Value::String(format!("{:?}", t)),
        },
        Err(_) => Value::String(format!("{:?}", t)),
    }
}

fn nested<T: Copy>(view: ArrayViewD<'_, T>, leaf: &dyn Fn(T) -> Value) -> Value {
    if view.ndim() == 0 {
        return view.iter().next().map(|v| leaf(*v)).unwrap_or(Value::Null);
    }
    Value::Array(view.outer_iter().map(|sub| nested(sub, leaf)).collect())
}

impl From<Value> for RawValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Int(i),
                None => RawValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => RawValue::Text(s),
            Value::Array(items) => RawValue::Seq(items.into_iter().map(RawValue::from).collect()),
            Value::Object(entries) => RawValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Tensor> for RawValue {
    fn from(t: Tensor) -> Self {
        RawValue::Tensor(t)
    }
}

impl From<f64> for RawValue {
    fn from(f: f64) -> Self {
        RawValue::Float(f)
    }
}

impl From<f32> for RawValue {
    fn from(f: f32) -> Self {
        RawValue::Float(f as f64)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Int(i)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl<T: Into<RawValue>> From<Vec<T>> for RawValue {
    fn from(items: Vec<T>) -> Self {
        RawValue::Seq(items.into_iter().map(Into::into).collect())
    }
}
