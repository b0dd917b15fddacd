//! Value validators: the shape boundary of the catalog.
//!
//! A validator is an opaque pure function from a JSON value to either
//! a (possibly coerced) JSON value or a [`ValidationError`].  The
//! engine never looks inside: whatever the function returns is the
//! value used downstream, so validators may strip fields or coerce
//! representations as well as reject.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::err::ValidationError;

/// Type-erased validation function.
type ValidateFn = dyn Fn(Value) -> Result<Value, ValidationError> + Send + Sync;

/// A shape check applied to a value crossing the RPC boundary.
///
/// Validators are cheap to clone; the underlying function is shared.
#[derive(Clone)]
pub struct Validator(Arc<ValidateFn>);

impl Validator {
    /// Wrap an arbitrary function as a validator.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ValidationError> + Send + Sync + 'static,
    {
        Validator(Arc::new(f))
    }

    /// A validator that accepts every value unchanged.
    pub fn identity() -> Self {
        Validator::new(Ok)
    }

    /// A validator that accepts exactly the values `T` deserializes
    /// from, re-serialized through `T`.
    ///
    /// The round trip gives the usual serde coercions: unknown fields
    /// are stripped, defaulted fields are filled in.
    pub fn schema<T>() -> Self
    where
        T: DeserializeOwned + Serialize + 'static,
    {
        Validator::new(|value| {
            let typed: T = serde_json::from_value(value)
                .map_err(|e| ValidationError::new(e.to_string()))?;
            serde_json::to_value(&typed).map_err(|e| ValidationError::new(e.to_string()))
        })
    }

    /// Apply this validator to `value`.
    pub fn check(&self, value: Value) -> Result<Value, ValidationError> {
        (self.0)(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Validator(..)")
    }
}
