//! Variables: the readable (and optionally writable) leaves of the address space.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{ConfigurationError, ServiceError};
use crate::node_id::NodeId;
use crate::status::StatusCode;
use crate::value::{DataType, DataValue, Variant};

/// Read accessor. Returns the current value or the status explaining why there is none.
pub type ValueGetter = Arc<dyn Fn() -> Result<Variant, StatusCode> + Send + Sync>;

/// Write accessor. Receives a value already coerced to the declared data type.
pub type ValueSetter = Arc<dyn Fn(Variant) -> Result<(), StatusCode> + Send + Sync>;

/// One addressable variable: identity, declared type and its accessors.
///
/// Accessors are called from the sampling timer's context and must not block for long.
pub struct Variable {
    node_id: NodeId,
    browse_name: String,
    data_type: DataType,
    getter: ValueGetter,
    setter: Option<ValueSetter>,
}

impl Variable {
    /// Starts building a variable.
    ///
    /// # Examples
    ///
    /// ```
    /// use uasub::{DataType, NodeId, Variable, Variant};
    ///
    /// let var = Variable::builder(NodeId::string(1, "setpoint"), "Setpoint", DataType::Double)
    ///     .value(Variant::Double(10.0))
    ///     .build()
    ///     .unwrap();
    /// var.write(Variant::Int32(12)).unwrap();
    /// assert_eq!(var.read(), Ok(Variant::Double(12.0)));
    /// ```
    #[must_use]
    pub fn builder(node_id: NodeId, browse_name: impl Into<String>, data_type: DataType) -> VariableBuilder {
        VariableBuilder {
            node_id,
            browse_name: browse_name.into(),
            data_type,
            getter: None,
            setter: None,
        }
    }

    /// Id of this variable.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Name used in browse paths.
    #[must_use]
    pub fn browse_name(&self) -> &str {
        &self.browse_name
    }

    /// Declared type; writes are coerced to it.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// True if the variable has a write accessor.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Invokes the read accessor.
    ///
    /// # Errors
    ///
    /// Returns the accessor's status when no value is available.
    pub fn read(&self) -> Result<Variant, StatusCode> {
        (self.getter)()
    }

    /// Reads the variable and stamps the result with `at`.
    #[must_use]
    pub fn read_value(&self, at: DateTime<Utc>) -> DataValue {
        match self.read() {
            Ok(value) => DataValue::new_at(value, at),
            Err(status) => DataValue::with_status(status, at),
        }
    }

    /// Coerces `value` to the declared data type and invokes the write accessor.
    ///
    /// # Errors
    ///
    /// - `ReadOnly` if the variable has no write accessor
    /// - `TypeMismatch` if the value cannot be coerced losslessly
    /// - `WriteRejected` if the accessor refuses the value
    pub fn write(&self, value: Variant) -> Result<(), ServiceError> {
        let Some(setter) = self.setter.as_ref() else {
            return Err(ServiceError::ReadOnly {
                node_id: self.node_id.clone(),
            });
        };

        let actual = value.data_type();
        let coerced = value.coerce_to(self.data_type).ok_or_else(|| ServiceError::TypeMismatch {
            node_id: self.node_id.clone(),
            expected: self.data_type,
            actual,
        })?;

        setter(coerced).map_err(|status| ServiceError::WriteRejected {
            node_id: self.node_id.clone(),
            status,
        })
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("node_id", &self.node_id)
            .field("browse_name", &self.browse_name)
            .field("data_type", &self.data_type)
            .field("writable", &self.is_writable())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Variable`].
pub struct VariableBuilder {
    node_id: NodeId,
    browse_name: String,
    data_type: DataType,
    getter: Option<ValueGetter>,
    setter: Option<ValueSetter>,
}

impl VariableBuilder {
    /// Sets the read accessor.
    #[must_use]
    pub fn getter<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<Variant, StatusCode> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(f));
        self
    }

    /// Sets the write accessor.
    #[must_use]
    pub fn setter<F>(mut self, f: F) -> Self
    where
        F: Fn(Variant) -> Result<(), StatusCode> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(f));
        self
    }

    /// Backs the variable with an internal cell: reads return the last written value.
    #[must_use]
    pub fn value(mut self, initial: Variant) -> Self {
        let cell = Arc::new(RwLock::new(initial));
        let read_cell = Arc::clone(&cell);
        self.getter = Some(Arc::new(move || {
            read_cell
                .read()
                .map(|v| v.clone())
                .map_err(|_| StatusCode::BadInternalError)
        }));
        self.setter = Some(Arc::new(move |v| {
            let mut guard = cell.write().map_err(|_| StatusCode::BadInternalError)?;
            *guard = v;
            Ok(())
        }));
        self
    }

    /// A constant, read-only value.
    #[must_use]
    pub fn constant(mut self, value: Variant) -> Self {
        self.getter = Some(Arc::new(move || Ok(value.clone())));
        self.setter = None;
        self
    }

    /// Finishes the variable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidField` if no read accessor was provided.
    pub fn build(self) -> Result<Variable, ConfigurationError> {
        let getter = self.getter.ok_or_else(|| ConfigurationError::InvalidField {
            field: "getter".to_string(),
            reason: format!("variable {} has no read accessor", self.node_id),
        })?;
        Ok(Variable {
            node_id: self.node_id,
            browse_name: self.browse_name,
            data_type: self.data_type,
            getter,
            setter: self.setter,
        })
    }
}
