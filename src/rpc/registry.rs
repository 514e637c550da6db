//! Explicit method tables for exposed services.
//!
//! A service is built once at registration time. Each method is keyed by its
//! name and its parameter type list, so overloads with the same name but
//! different parameters resolve independently.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use super::protocol::CallDescriptor;
use super::value::{FromValue, IntoValue, TypeTag, Value};
use super::RpcError;

type Handler = Arc<dyn Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync>;

/// Method key: name plus parameter type list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: String,
    pub params: Vec<TypeTag>,
}

impl MethodKey {
    pub fn new(name: impl Into<String>, params: &[TypeTag]) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
        }
    }
}

/// A named set of invocable methods.
#[derive(Clone)]
pub struct Service {
    name: String,
    methods: HashMap<MethodKey, Handler>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            service: Self {
                name: name.into(),
                methods: HashMap::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve and invoke a call.
    ///
    /// Resolution uses the declared parameter tags; each argument is then
    /// decoded as its declared tag before the handler runs.
    pub fn invoke(&self, call: &CallDescriptor) -> Result<Value, RpcError> {
        let key = MethodKey {
            name: call.method.clone(),
            params: call.signature()?,
        };
        let handler = self.methods.get(&key).ok_or_else(|| RpcError::NoSuchMethod {
            method: call.method.clone(),
            signature: render_signature(&key.params),
        })?;
        let args = call.decode_args()?;
        handler(args)
    }
}

fn render_signature(params: &[TypeTag]) -> String {
    let mut out = String::new();
    for (i, tag) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{tag}");
    }
    out
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    /// Register a raw handler for `name(params...)`.
    ///
    /// The handler receives arguments already decoded to `params`.
    #[must_use]
    pub fn method<F>(mut self, name: &str, params: &[TypeTag], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.service
            .methods
            .insert(MethodKey::new(name, params), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn method0<R, F>(self, name: &str, handler: F) -> Self
    where
        R: IntoValue,
        F: Fn() -> Result<R, RpcError> + Send + Sync + 'static,
    {
        self.method(name, &[], move |_| handler().map(IntoValue::into_value))
    }

    #[must_use]
    pub fn method1<A, R, F>(self, name: &str, handler: F) -> Self
    where
        A: FromValue,
        R: IntoValue,
        F: Fn(A) -> Result<R, RpcError> + Send + Sync + 'static,
    {
        self.method(name, &[A::TAG], move |args| {
            let [a] = take_args::<1>(args)?;
            handler(A::from_value(a)?).map(IntoValue::into_value)
        })
    }

    #[must_use]
    pub fn method2<A, B, R, F>(self, name: &str, handler: F) -> Self
    where
        A: FromValue,
        B: FromValue,
        R: IntoValue,
        F: Fn(A, B) -> Result<R, RpcError> + Send + Sync + 'static,
    {
        self.method(name, &[A::TAG, B::TAG], move |args| {
            let [a, b] = take_args::<2>(args)?;
            handler(A::from_value(a)?, B::from_value(b)?).map(IntoValue::into_value)
        })
    }

    pub fn build(self) -> Service {
        self.service
    }
}

fn take_args<const N: usize>(args: Vec<Value>) -> Result<[Value; N], RpcError> {
    let found = args.len();
    <[Value; N]>::try_from(args).map_err(|_| RpcError::Decode(format!("expected {N} arguments, got {found}")))
}
