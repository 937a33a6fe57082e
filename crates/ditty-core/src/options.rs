//! Live option objects.
//!
//! An [`OptionSet`] is plain data (defaults, overrides). An [`Options`] is the
//! live, shared instance attached to a loop, voice or filter. It remembers the
//! tick it was created at, so function-valued options can be evaluated against
//! the time since creation.
//!
//! Writes go through [`Options::set`]: while the owning task is filling a loop
//! the write is recorded as a `ParamChange` operator and applied at playback,
//! otherwise it is applied immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::ContextHandle;
use crate::error::{DittyError, Result};
use crate::operator::Operator;

/// Option evaluated on read with `(ticks since creation, options)`.
pub type OptionFn = Arc<dyn Fn(f64, &Options) -> Result<f64> + Send + Sync>;

/// A single option value.
#[derive(Clone)]
pub enum OptionValue {
    Number(f64),
    Text(String),
    List(Vec<f64>),
    Function(OptionFn),
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Number(v) => write!(f, "Number({})", v),
            OptionValue::Text(s) => write!(f, "Text({:?})", s),
            OptionValue::List(l) => write!(f, "List({:?})", l),
            OptionValue::Function(_) => write!(f, "Function"),
        }
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

impl From<Vec<f64>> for OptionValue {
    fn from(value: Vec<f64>) -> Self {
        OptionValue::List(value)
    }
}

/// Plain, ordered option values.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    values: BTreeMap<String, OptionValue>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Text value of a key, if it is text.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Layer `self` over `base`: keys in `self` win.
    pub fn over(&self, base: &OptionSet) -> OptionSet {
        let mut merged = base.clone();
        for (key, value) in &self.values {
            merged.values.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
struct OptionMap {
    start_tick: f64,
    values: BTreeMap<String, OptionValue>,
}

/// Live option object shared between its owner and recorded operators.
#[derive(Clone)]
pub struct Options {
    inner: Arc<RwLock<OptionMap>>,
    ctx: ContextHandle,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Options")
            .field("start_tick", &map.start_tick)
            .field("values", &map.values)
            .finish()
    }
}

impl Options {
    /// Create a live instance starting at the context's current tick.
    pub fn new(ctx: &ContextHandle, values: OptionSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(OptionMap {
                start_tick: ctx.tick(),
                values: values.values,
            })),
            ctx: ctx.clone(),
        }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.ctx
    }

    pub fn start_tick(&self) -> f64 {
        self.read(|map| map.start_tick)
    }

    /// Ticks elapsed since creation.
    pub fn tick(&self) -> f64 {
        self.ctx.tick() - self.start_tick()
    }

    fn read<R>(&self, f: impl FnOnce(&OptionMap) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<R>(&self, f: impl FnOnce(&mut OptionMap) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Raw stored value.
    pub fn get(&self, key: &str) -> Option<OptionValue> {
        self.read(|map| map.values.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(|map| map.values.contains_key(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.read(|map| map.values.keys().cloned().collect())
    }

    /// Numeric value of a key, evaluating function-valued options.
    pub fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            Some(OptionValue::Number(v)) => Ok(Some(v)),
            Some(OptionValue::Function(f)) => f(self.tick(), self).map(Some),
            Some(OptionValue::Text(s)) => Ok(s.trim().parse().ok()),
            Some(OptionValue::List(_)) | None => Ok(None),
        }
    }

    pub fn number_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.number(key)?.unwrap_or(default))
    }

    pub fn text(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// List value of a key. A single number is treated as a one-element list.
    pub fn list(&self, key: &str) -> Result<Option<Vec<f64>>> {
        match self.get(key) {
            Some(OptionValue::List(values)) => Ok(Some(values)),
            Some(OptionValue::Number(v)) => Ok(Some(vec![v])),
            Some(OptionValue::Function(f)) => f(self.tick(), self).map(|v| Some(vec![v])),
            _ => Ok(None),
        }
    }

    /// Strict list read used where a wrong type is a user error.
    pub fn require_list(&self, key: &str) -> Result<Vec<f64>> {
        self.list(key)?
            .ok_or_else(|| DittyError::Config(format!("option '{}' must be a list of numbers", key)))
    }

    /// Write an option: recorded while a loop is filling, applied otherwise.
    pub fn set(&self, key: &str, value: OptionValue) {
        let operator = Operator::ParamChange {
            start_tick: self.ctx.tick(),
            target: self.clone(),
            key: key.to_string(),
            value,
        };
        if let Err(Operator::ParamChange { key, value, .. }) = self.ctx.record(operator) {
            self.set_now(&key, value);
        }
    }

    /// Write an option immediately.
    pub fn set_now(&self, key: &str, value: OptionValue) {
        self.write(|map| {
            map.values.insert(key.to_string(), value);
        });
    }

    /// Add defaults for keys that are not set yet.
    pub fn extend(&self, defaults: &OptionSet) {
        self.write(|map| {
            for (key, value) in defaults.iter() {
                map.values.entry(key.clone()).or_insert_with(|| value.clone());
            }
        });
    }

    /// Whether both handles point at the same live object.
    pub fn ptr_eq(&self, other: &Options) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextHandle {
        ContextHandle::new(120.0, 44100).unwrap()
    }

    #[test]
    fn test_option_set_layering() {
        let defaults = OptionSet::new().with("amp", 1.0).with("pan", 0.0);
        let overrides = OptionSet::new().with("amp", 0.5);
        let merged = overrides.over(&defaults);
        assert!(matches!(merged.get("amp"), Some(OptionValue::Number(v)) if *v == 0.5));
        assert!(matches!(merged.get("pan"), Some(OptionValue::Number(v)) if *v == 0.0));
    }

    #[test]
    fn test_tick_since_creation() {
        let ctx = ctx();
        ctx.set_tick(2.0);
        let options = Options::new(&ctx, OptionSet::new());
        ctx.set_tick(3.5);
        assert!((options.tick() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_function_valued_option() {
        let ctx = ctx();
        let f: OptionFn = Arc::new(|tick, _| Ok(tick * 2.0));
        let options = Options::new(&ctx, OptionSet::new().with("cutoff", OptionValue::Function(f)));
        ctx.set_tick(0.25);
        assert!((options.number("cutoff").unwrap().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_set_applies_immediately_outside_recording() {
        let ctx = ctx();
        let options = Options::new(&ctx, OptionSet::new().with("amp", 1.0));
        options.set("amp", OptionValue::Number(0.2));
        assert_eq!(options.number("amp").unwrap(), Some(0.2));
    }

    #[test]
    fn test_set_is_deferred_while_recording() {
        let ctx = ctx();
        let options = Options::new(&ctx, OptionSet::new().with("amp", 1.0));
        let previous = ctx.begin_recording();
        options.set("amp", OptionValue::Number(0.2));
        let operators = ctx.end_recording(previous);
        assert_eq!(options.number("amp").unwrap(), Some(1.0));
        assert_eq!(operators.len(), 1);
    }

    #[test]
    fn test_extend_keeps_existing() {
        let ctx = ctx();
        let options = Options::new(&ctx, OptionSet::new().with("release", 0.1));
        options.extend(&OptionSet::new().with("release", 0.5).with("attack", 0.0));
        assert_eq!(options.number("release").unwrap(), Some(0.1));
        assert_eq!(options.number("attack").unwrap(), Some(0.0));
    }

    #[test]
    fn test_list_reads() {
        let ctx = ctx();
        let options = Options::new(
            &ctx,
            OptionSet::new().with("levels", vec![0.0, 1.0]).with("curve", -2.0).with("env", "adsr"),
        );
        assert_eq!(options.require_list("levels").unwrap(), vec![0.0, 1.0]);
        assert_eq!(options.list("curve").unwrap(), Some(vec![-2.0]));
        assert!(options.require_list("env").is_err());
    }
}
