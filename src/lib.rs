//! # Definition-Driven Dependency Injection Container
//!
//! A lazy, singleton-per-name service container. Services are described by
//! declarative [`ServiceDefinition`]s (a class identifier, positional constructor
//! arguments and post-construction calls), parameters live in a nested
//! [`serde_json::Value`] tree addressed by dotted paths, and classes are
//! late-bound through a [`ClassRegistry`] of factory closures.
//!
//! ## Features
//!
//! - **Lazy**: a service is constructed the first time it is requested, directly or
//!   as a dependency of another service
//! - **Singleton per name**: every later request returns the identical [`Instance`]
//! - **References**: arguments may be literals, [`ServiceReference`]s or
//!   [`ParameterReference`]s, resolved depth-first in declared order
//! - **Cycle detection**: re-entering a service that is still being built fails with
//!   [`ContainerError::CircularReference`] instead of recursing forever
//! - **Serde-friendly definitions**: loaders can deserialize definitions straight
//!   into [`ServiceDefinition`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use wiring::{ArgumentSpec, ClassRegistry, ContainerBuilder, ServiceDefinition};
//!
//! struct Logger;
//!
//! struct App {
//!     logger: Arc<Logger>,
//!     env: String,
//! }
//!
//! let mut classes = ClassRegistry::new();
//! classes.register("Logger", |_| Ok(Logger));
//! classes.register("App", |args| {
//!     Ok(App {
//!         logger: args.service::<Logger>(0)?,
//!         env: args.string(1)?,
//!     })
//! });
//!
//! let container = ContainerBuilder::new()
//!     .classes(classes)
//!     .parameters(json!({ "env": { "name": "prod" } }))
//!     .service("logger", ServiceDefinition::new("Logger"))
//!     .service(
//!         "app",
//!         ServiceDefinition::new("App")
//!             .argument(ArgumentSpec::service("logger"))
//!             .argument(ArgumentSpec::parameter("env.name")),
//!     )
//!     .build();
//!
//! let app = container.resolve::<App>("app")?;
//! assert_eq!(app.env, "prod");
//! assert!(Arc::ptr_eq(&app.logger, &container.resolve::<Logger>("logger")?));
//! assert!(Arc::ptr_eq(&app, &container.resolve::<App>("app")?));
//! # Ok::<(), wiring::ContainerError>(())
//! ```

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// A constructed service, shared by every consumer that requests its name.
pub type Instance = Arc<dyn Any + Send + Sync>;

type AnyService = dyn Any + Send + Sync;

type Constructor = Box<dyn Fn(Arguments) -> Result<Box<AnyService>, ContainerError> + Send + Sync>;

type Method = Box<dyn Fn(&mut AnyService, Arguments) -> Result<(), ContainerError> + Send + Sync>;

// ============================================================================
// Core Traits
// ============================================================================

/// Trait for types that know how to build themselves from resolved arguments.
///
/// Register with [`ClassRegistry::register_injectable`] instead of writing a
/// constructor closure.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use wiring::{Arguments, ArgumentSpec, ClassRegistry, ContainerBuilder, ContainerError, Injectable, ServiceDefinition};
///
/// struct Mailer {
///     host: String,
///     port: u16,
/// }
///
/// impl Injectable for Mailer {
///     fn inject(arguments: Arguments) -> Result<Self, ContainerError> {
///         Ok(Self {
///             host: arguments.string(0)?,
///             port: arguments.deserialize(1)?,
///         })
///     }
/// }
///
/// let mut classes = ClassRegistry::new();
/// classes.register_injectable::<Mailer>("Mailer");
///
/// let container = ContainerBuilder::new()
///     .classes(classes)
///     .parameters(json!({ "smtp": { "host": "mail.local", "port": 25 } }))
///     .service(
///         "mailer",
///         ServiceDefinition::new("Mailer")
///             .argument(ArgumentSpec::parameter("smtp.host"))
///             .argument(ArgumentSpec::parameter("smtp.port")),
///     )
///     .build();
///
/// let mailer = container.resolve::<Mailer>("mailer")?;
/// assert_eq!((mailer.host.as_str(), mailer.port), ("mail.local", 25));
/// # Ok::<(), ContainerError>(())
/// ```
pub trait Injectable: Send + Sync + Sized + 'static {
    /// Builds the service from its positional constructor arguments.
    fn inject(arguments: Arguments) -> Result<Self, ContainerError>;
}

/// The public lookup surface of a container.
///
/// Code that only consumes services and parameters can depend on this trait
/// rather than on [`Container`] itself.
pub trait ServiceLocator {
    /// Returns the instance registered under `name`, building it on first use.
    fn get(&self, name: &str) -> Result<Instance, ContainerError>;

    /// Checks whether a definition exists for `name`. Nothing is built.
    fn has(&self, name: &str) -> bool;

    /// Returns the parameter at the dotted `path`.
    fn get_parameter(&self, path: &str) -> Result<&Value, ContainerError>;

    /// Checks whether the dotted `path` addresses a parameter.
    fn has_parameter(&self, path: &str) -> bool;
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while resolving services and parameters.
///
/// Errors raised deep inside a dependency chain reach the caller of
/// [`Container::get`] unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    /// `get` was called with a name that has no definition
    #[error("Service not found: {name}")]
    ServiceNotFound { name: String },

    /// A segment of a dotted parameter path is absent
    #[error("Parameter not found: {path}")]
    ParameterNotFound { path: String },

    /// The builder was asked for a name the definition store does not hold
    #[error("{name} service has no definition")]
    DefinitionMissing { name: String },

    /// A definition is malformed
    #[error("{name} service definition is invalid: {reason}")]
    InvalidDefinition { name: String, reason: &'static str },

    /// The class identifier is not present in the class registry
    #[error("{name} service class does not exist: {class}")]
    ClassNotFound { name: String, class: String },

    /// A service was requested again while it was still being built
    #[error("{name} contains circular reference")]
    CircularReference { name: String },

    /// A post-construction call names a method the class does not expose
    #[error("{name} service asks for call to uncallable method: {method}")]
    UncallableMethod { name: String, method: String },

    /// A service exists but is not of the requested type
    #[error("{name} service is not a {type_name}")]
    TypeMismatch {
        name: String,
        type_name: &'static str,
    },

    /// A factory asked for an argument position the definition does not supply
    #[error("argument {index} is missing")]
    MissingArgument { index: usize },

    /// A factory asked for an argument as the wrong kind of value
    #[error("argument {index} is not a {expected}")]
    ArgumentType { index: usize, expected: &'static str },

    /// A parameter exists but could not be deserialized into the requested type
    #[error("parameter {path} is invalid: {message}")]
    InvalidParameter { path: String, message: String },

    /// A factory or method failed for a reason of its own
    #[error("failed to instantiate {class}: {message}")]
    Instantiation { class: String, message: String },
}

impl ContainerError {
    /// Wraps a factory's own failure so it can travel through the container.
    pub fn instantiation(class: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::Instantiation {
            class: class.into(),
            message: error.to_string(),
        }
    }
}

// ============================================================================
// References
// ============================================================================

/// Marks an argument that must be replaced by the service with this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceReference {
    name: String,
}

impl ServiceReference {
    /// Creates a reference to the service registered under `name`.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The container key of the referenced service.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Marks an argument that must be replaced by the parameter at this dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterReference {
    name: String,
}

impl ParameterReference {
    /// Creates a reference to the parameter at the dotted `path`.
    #[inline]
    pub fn new(path: impl Into<String>) -> Self {
        Self { name: path.into() }
    }

    /// The dotted parameter path.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// One positional argument of a constructor or post-construction call.
///
/// Serialized externally tagged: `{"service": "logger"}`,
/// `{"parameter": "env.name"}` or `{"literal": 42}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentSpec {
    Literal(Value),
    Service(ServiceReference),
    Parameter(ParameterReference),
}

impl ArgumentSpec {
    /// An argument passed through unchanged.
    #[inline]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// An argument replaced by the service `name`.
    #[inline]
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(ServiceReference::new(name))
    }

    /// An argument replaced by the parameter at `path`.
    #[inline]
    pub fn parameter(path: impl Into<String>) -> Self {
        Self::Parameter(ParameterReference::new(path))
    }
}

impl From<ServiceReference> for ArgumentSpec {
    fn from(reference: ServiceReference) -> Self {
        Self::Service(reference)
    }
}

impl From<ParameterReference> for ArgumentSpec {
    fn from(reference: ParameterReference) -> Self {
        Self::Parameter(reference)
    }
}

impl From<Value> for ArgumentSpec {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

/// A method invoked on a freshly constructed service, before it is cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
}

impl CallSpec {
    /// Creates a call to `method` without arguments.
    #[inline]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: Vec::new(),
        }
    }

    /// Appends a positional argument to the call.
    #[inline]
    pub fn argument(mut self, argument: impl Into<ArgumentSpec>) -> Self {
        self.arguments.push(argument.into());
        self
    }
}

/// The recipe for one service: which class to build, with which constructor
/// arguments, followed by which calls. Order is significant in both lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub class: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub calls: Vec<CallSpec>,
}

impl ServiceDefinition {
    /// Creates a definition for `class` with no arguments and no calls.
    #[inline]
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Self::default()
        }
    }

    /// Appends a positional constructor argument.
    #[inline]
    pub fn argument(mut self, argument: impl Into<ArgumentSpec>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Appends a post-construction call.
    #[inline]
    pub fn call(mut self, call: CallSpec) -> Self {
        self.calls.push(call);
        self
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A nested parameter tree addressed by dotted paths such as `"db.host"`.
///
/// Each path segment descends one level: into an object by key, or into an
/// array by zero-based index. Whatever sits at the end of the path is returned,
/// scalar or subtree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    root: Value,
}

impl Parameters {
    /// Wraps `root` as the top of the parameter tree.
    #[inline]
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Looks up the value at `path`.
    pub fn resolve(&self, path: &str) -> Result<&Value, ContainerError> {
        path.split('.').try_fold(&self.root, |context, segment| {
            descend(context, segment).ok_or_else(|| ContainerError::ParameterNotFound {
                path: path.to_owned(),
            })
        })
    }

    /// Looks up the value at `path` and deserializes it.
    pub fn resolve_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ContainerError> {
        let value = self.resolve(path)?;
        T::deserialize(value).map_err(|err| ContainerError::InvalidParameter {
            path: path.to_owned(),
            message: err.to_string(),
        })
    }

    /// Checks whether `path` resolves. Lookup can only fail with
    /// [`ContainerError::ParameterNotFound`].
    #[inline]
    pub fn has(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }
}

impl From<Value> for Parameters {
    fn from(root: Value) -> Self {
        Self::new(root)
    }
}

fn descend<'a>(context: &'a Value, segment: &str) -> Option<&'a Value> {
    match context {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => array_index(segment).and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Parses `segment` as an array index only when written canonically: `"0"`, or
/// ASCII digits without a leading zero. `"01"` and `"+1"` name no element.
fn array_index(segment: &str) -> Option<usize> {
    let canonical = segment == "0"
        || (!segment.is_empty()
            && !segment.starts_with('0')
            && segment.bytes().all(|b| b.is_ascii_digit()));
    if canonical {
        segment.parse().ok()
    } else {
        None
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// A resolved argument: either a shared service or a plain value.
#[derive(Debug, Clone)]
pub enum Argument {
    Service(Instance),
    Value(Value),
}

impl Argument {
    /// Returns the instance if this argument is a service.
    #[inline]
    pub fn as_service(&self) -> Option<&Instance> {
        match self {
            Self::Service(instance) => Some(instance),
            Self::Value(_) => None,
        }
    }

    /// Returns the value if this argument is not a service.
    #[inline]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Service(_) => None,
        }
    }
}

/// The ordered arguments handed to a constructor or method.
///
/// Accessors are positional and fail with [`ContainerError::MissingArgument`]
/// or [`ContainerError::ArgumentType`], so factories can use `?` throughout.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: Vec<Argument>,
}

impl Arguments {
    #[inline]
    pub fn new(values: Vec<Argument>) -> Self {
        Self { values }
    }

    /// Returns the number of arguments.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Checks if no arguments were supplied.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Argument> {
        self.values.iter()
    }

    /// Returns the argument at `index`.
    pub fn get(&self, index: usize) -> Result<&Argument, ContainerError> {
        self.values
            .get(index)
            .ok_or(ContainerError::MissingArgument { index })
    }

    /// Returns the service at `index`, downcast to `T`.
    pub fn service<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>, ContainerError> {
        let mismatch = ContainerError::ArgumentType {
            index,
            expected: std::any::type_name::<T>(),
        };
        match self.get(index)? {
            Argument::Service(instance) => Arc::clone(instance).downcast::<T>().map_err(|_| mismatch),
            Argument::Value(_) => Err(mismatch),
        }
    }

    /// Returns the plain value at `index`.
    pub fn value(&self, index: usize) -> Result<&Value, ContainerError> {
        self.get(index)?
            .as_value()
            .ok_or(ContainerError::ArgumentType {
                index,
                expected: "value",
            })
    }

    /// Returns the string value at `index`.
    pub fn string(&self, index: usize) -> Result<String, ContainerError> {
        self.value(index)?
            .as_str()
            .map(str::to_owned)
            .ok_or(ContainerError::ArgumentType {
                index,
                expected: "string",
            })
    }

    /// Deserializes the value at `index` into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self, index: usize) -> Result<T, ContainerError> {
        T::deserialize(self.value(index)?).map_err(|_| ContainerError::ArgumentType {
            index,
            expected: std::any::type_name::<T>(),
        })
    }
}

impl FromIterator<Argument> for Arguments {
    fn from_iter<I: IntoIterator<Item = Argument>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Arguments {
    type Item = Argument;
    type IntoIter = std::vec::IntoIter<Argument>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Arguments {
    type Item = &'a Argument;
    type IntoIter = std::slice::Iter<'a, Argument>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

// ============================================================================
// Class Registry
// ============================================================================

/// A late-bound class: its constructor and the methods definitions may call.
struct Class {
    identifier: String,
    type_name: &'static str,
    constructor: Constructor,
    methods: HashMap<String, Method>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("identifier", &self.identifier)
            .field("type", &self.type_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Maps class identifiers used in definitions to factory closures.
///
/// This is what a definition's `class` names. An identifier missing here makes
/// the service fail with [`ContainerError::ClassNotFound`].
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, Class>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `class`, replacing any earlier registration.
    ///
    /// The returned builder adds methods that post-construction calls may invoke.
    pub fn register<T, F>(&mut self, class: impl Into<String>, constructor: F) -> ClassBuilder<'_, T>
    where
        T: Send + Sync + 'static,
        F: Fn(Arguments) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let class = class.into();
        let entry = Class {
            identifier: class.clone(),
            type_name: std::any::type_name::<T>(),
            constructor: Box::new(move |arguments: Arguments| {
                constructor(arguments).map(|service| Box::new(service) as Box<AnyService>)
            }),
            methods: HashMap::new(),
        };
        let class = match self.classes.entry(class) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(entry),
        };
        ClassBuilder {
            class,
            marker: PhantomData,
        }
    }

    /// Registers an [`Injectable`] type under `class`.
    #[inline]
    pub fn register_injectable<T: Injectable>(&mut self, class: impl Into<String>) -> ClassBuilder<'_, T> {
        self.register(class, T::inject)
    }

    /// Checks if a class is registered under `class`.
    #[inline]
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Returns the number of registered classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Checks if the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn get(&self, class: &str) -> Option<&Class> {
        self.classes.get(class)
    }
}

/// Adds callable methods to a class just registered in a [`ClassRegistry`].
pub struct ClassBuilder<'a, T> {
    class: &'a mut Class,
    marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ClassBuilder<'_, T> {
    /// Exposes `method` to post-construction calls under `name`.
    ///
    /// Methods receive the instance mutably: calls run before the service is
    /// shared through the cache.
    pub fn method<F>(self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&mut T, Arguments) -> Result<(), ContainerError> + Send + Sync + 'static,
    {
        let identifier = self.class.identifier.clone();
        let type_name = self.class.type_name;
        self.class.methods.insert(
            name.into(),
            Box::new(move |instance: &mut AnyService, arguments: Arguments| {
                let target = instance.downcast_mut::<T>().ok_or_else(|| {
                    ContainerError::instantiation(&identifier, format!("instance is not a {type_name}"))
                })?;
                method(target, arguments)
            }),
        );
        self
    }
}

impl<T> fmt::Debug for ClassBuilder<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBuilder")
            .field("class", &self.class)
            .finish()
    }
}

// ============================================================================
// Container
// ============================================================================

/// Where a service name stands in its construction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    Building,
    Built,
    Failed,
}

/// What happens to a service whose build failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The build marker stays set: every later `get` of the name reports
    /// [`ContainerError::CircularReference`].
    #[default]
    Poison,
    /// The marker is cleared and the next `get` builds the service again.
    Retry,
}

/// Owns the definitions, parameters and classes, plus the instance cache.
///
/// Definitions are fixed once the container exists; the cache only grows.
///
/// # Thread Safety
///
/// The cache and build states sit behind `RwLock`s that are released before any
/// nested build starts, so the container is `Send + Sync`. A built instance is
/// cached under the build-state lock, so a name is never constructed twice. Two
/// threads requesting the same name for the first time still race on the build
/// marker: the loser gets [`ContainerError::CircularReference`]. Guard the
/// first `get` externally when that matters.
pub struct Container {
    definitions: HashMap<String, ServiceDefinition>,
    parameters: Parameters,
    classes: ClassRegistry,
    failure_policy: FailurePolicy,
    instances: RwLock<HashMap<String, Instance>>,
    states: RwLock<HashMap<String, BuildState>>,
}

impl Container {
    /// Creates a container with the default [`FailurePolicy`].
    pub fn new(
        definitions: HashMap<String, ServiceDefinition>,
        parameters: impl Into<Parameters>,
        classes: ClassRegistry,
    ) -> Self {
        Self::with_policy(definitions, parameters.into(), classes, FailurePolicy::default())
    }

    fn with_policy(
        definitions: HashMap<String, ServiceDefinition>,
        parameters: Parameters,
        classes: ClassRegistry,
        failure_policy: FailurePolicy,
    ) -> Self {
        debug!(
            services = definitions.len(),
            classes = classes.len(),
            ?failure_policy,
            "creating container"
        );
        Self {
            definitions,
            parameters,
            classes,
            failure_policy,
            instances: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Checks whether a definition exists for `name`.
    #[inline]
    pub fn has(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Returns the service registered under `name`, building and caching it on
    /// first use.
    pub fn get(&self, name: &str) -> Result<Instance, ContainerError> {
        if !self.has(name) {
            return Err(ContainerError::ServiceNotFound {
                name: name.to_owned(),
            });
        }

        let cached = self.instances.read().get(name).cloned();
        if let Some(instance) = cached {
            trace!(service = name, "serving cached instance");
            return Ok(instance);
        }

        self.build(name)
    }

    /// Returns the service registered under `name` as a `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        self.get(name)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                name: name.to_owned(),
                type_name: std::any::type_name::<T>(),
            })
    }

    /// Returns the parameter at the dotted `path`.
    #[inline]
    pub fn get_parameter(&self, path: &str) -> Result<&Value, ContainerError> {
        self.parameters.resolve(path)
    }

    /// Returns the parameter at `path`, deserialized into `T`.
    pub fn parameter<T: DeserializeOwned>(&self, path: &str) -> Result<T, ContainerError> {
        self.parameters.resolve_as(path)
    }

    /// Checks whether the dotted `path` addresses a parameter.
    #[inline]
    pub fn has_parameter(&self, path: &str) -> bool {
        self.parameters.has(path)
    }

    /// Reports the lifecycle state of `name`.
    pub fn build_state(&self, name: &str) -> BuildState {
        self.states
            .read()
            .get(name)
            .copied()
            .unwrap_or(BuildState::Unbuilt)
    }

    /// Iterates over the names of all defined services, in no particular order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// Returns the number of defined services.
    #[inline]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Checks if the container defines no services.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn build(&self, name: &str) -> Result<Instance, ContainerError> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| ContainerError::DefinitionMissing {
                name: name.to_owned(),
            })?;
        if definition.class.trim().is_empty() {
            return Err(ContainerError::InvalidDefinition {
                name: name.to_owned(),
                reason: "missing class identifier",
            });
        }
        let class = self
            .classes
            .get(&definition.class)
            .ok_or_else(|| ContainerError::ClassNotFound {
                name: name.to_owned(),
                class: definition.class.clone(),
            })?;

        if let Some(instance) = self.begin_build(name)? {
            trace!(service = name, "serving instance cached by a concurrent build");
            return Ok(instance);
        }
        debug!(service = name, class = %definition.class, "building service");

        let result = self.construct(name, definition, class);
        match &result {
            Ok(_) => debug!(service = name, "service built"),
            Err(err) => debug!(service = name, error = %err, "service build failed"),
        }
        self.finish_build(name, &result);
        result
    }

    /// Sets the build marker. A name already `Built` yields its cached instance
    /// instead, since the cache entry is written under the same lock.
    fn begin_build(&self, name: &str) -> Result<Option<Instance>, ContainerError> {
        let mut states = self.states.write();
        match states.get(name) {
            Some(BuildState::Building | BuildState::Failed) => {
                return Err(ContainerError::CircularReference {
                    name: name.to_owned(),
                });
            }
            Some(BuildState::Built) => {
                if let Some(instance) = self.instances.read().get(name) {
                    return Ok(Some(Arc::clone(instance)));
                }
            }
            Some(BuildState::Unbuilt) | None => {}
        }
        states.insert(name.to_owned(), BuildState::Building);
        Ok(None)
    }

    /// Records the outcome; a built instance enters the cache together with
    /// its `Built` state.
    fn finish_build(&self, name: &str, result: &Result<Instance, ContainerError>) {
        let mut states = self.states.write();
        if let Ok(instance) = result {
            self.instances
                .write()
                .insert(name.to_owned(), Arc::clone(instance));
            states.insert(name.to_owned(), BuildState::Built);
            return;
        }
        match self.failure_policy {
            FailurePolicy::Poison => {
                states.insert(name.to_owned(), BuildState::Failed);
            }
            FailurePolicy::Retry => {
                states.remove(name);
            }
        }
    }

    fn construct(
        &self,
        name: &str,
        definition: &ServiceDefinition,
        class: &Class,
    ) -> Result<Instance, ContainerError> {
        let arguments = self.resolve_arguments(&definition.arguments)?;
        let mut instance = (class.constructor)(arguments)?;

        for call in &definition.calls {
            if call.method.trim().is_empty() {
                return Err(ContainerError::InvalidDefinition {
                    name: name.to_owned(),
                    reason: "call without a method name",
                });
            }
            let method = class
                .methods
                .get(&call.method)
                .ok_or_else(|| ContainerError::UncallableMethod {
                    name: name.to_owned(),
                    method: call.method.clone(),
                })?;
            let arguments = self.resolve_arguments(&call.arguments)?;
            trace!(service = name, method = %call.method, "invoking call");
            method(instance.as_mut(), arguments)?;
        }

        Ok(Arc::from(instance))
    }

    /// Substitutes references in `specs`, depth-first and in order.
    fn resolve_arguments(&self, specs: &[ArgumentSpec]) -> Result<Arguments, ContainerError> {
        specs.iter().map(|spec| self.resolve_argument(spec)).collect()
    }

    fn resolve_argument(&self, spec: &ArgumentSpec) -> Result<Argument, ContainerError> {
        match spec {
            ArgumentSpec::Service(reference) => {
                trace!(service = reference.name(), "resolving service argument");
                self.get(reference.name()).map(Argument::Service)
            }
            ArgumentSpec::Parameter(reference) => {
                trace!(path = reference.name(), "resolving parameter argument");
                self.get_parameter(reference.name())
                    .map(|value| Argument::Value(value.clone()))
            }
            ArgumentSpec::Literal(value) => Ok(Argument::Value(value.clone())),
        }
    }
}

impl ServiceLocator for Container {
    fn get(&self, name: &str) -> Result<Instance, ContainerError> {
        Container::get(self, name)
    }

    fn has(&self, name: &str) -> bool {
        Container::has(self, name)
    }

    fn get_parameter(&self, path: &str) -> Result<&Value, ContainerError> {
        Container::get_parameter(self, path)
    }

    fn has_parameter(&self, path: &str) -> bool {
        Container::has_parameter(self, path)
    }
}

impl Default for Container {
    fn default() -> Self {
        ContainerBuilder::new().build()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("service_count", &self.definitions.len())
            .field("instance_count", &self.instances.read().len())
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder Pattern
// ============================================================================

/// Fluent builder for constructing a [`Container`].
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    definitions: HashMap<String, ServiceDefinition>,
    parameters: Parameters,
    classes: ClassRegistry,
    failure_policy: FailurePolicy,
}

impl ContainerBuilder {
    /// Creates a builder with no services, no classes and an empty parameter tree.
    #[inline]
    pub fn new() -> Self {
        Self {
            parameters: Parameters::new(Value::Object(Default::default())),
            ..Self::default()
        }
    }

    /// Defines the service `name`, replacing an earlier definition of the same name.
    #[inline]
    pub fn service(mut self, name: impl Into<String>, definition: ServiceDefinition) -> Self {
        self.definitions.insert(name.into(), definition);
        self
    }

    /// Defines several services at once, e.g. from deserialized configuration.
    pub fn services<I, S>(mut self, definitions: I) -> Self
    where
        I: IntoIterator<Item = (S, ServiceDefinition)>,
        S: Into<String>,
    {
        self.definitions
            .extend(definitions.into_iter().map(|(name, definition)| (name.into(), definition)));
        self
    }

    /// Replaces the parameter tree.
    #[inline]
    pub fn parameters(mut self, parameters: impl Into<Parameters>) -> Self {
        self.parameters = parameters.into();
        self
    }

    /// Replaces the class registry definitions are resolved against.
    #[inline]
    pub fn classes(mut self, classes: ClassRegistry) -> Self {
        self.classes = classes;
        self
    }

    /// Sets what happens to a service whose build failed.
    #[inline]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builds the container.
    #[inline]
    pub fn build(self) -> Container {
        Container::with_policy(self.definitions, self.parameters, self.classes, self.failure_policy)
    }
}

// ============================================================================
// Tests
// ============================================================================
