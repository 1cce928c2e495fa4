//!
//! Option tables, attribute builders and the configuration file loader.
//!
//! Attributes start from the built-in defaults overlaid with whatever the last
//! successful [`load`] installed for their scope. They are consumed by value by the
//! creation call they configure, so each attribute is used exactly once and released
//! when it goes out of scope.
//!
use crate::callback::{CallbackResult, SourceNotifier};
use crate::error::{self, ClientError};
use crate::logger;
use crate::topic::Role;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const CONTEXT_NAME: &str = "context_name";
pub const SOURCE_NOTIFICATION_FUNCTION: &str = "resolver_source_notification_function";
pub const DISPATCH_THREAD_COUNT: &str = "dispatch_thread_count";
pub const SOURCE_SEND_WINDOW: &str = "source_send_window";
pub const RECEIVER_DELIVERY_QUEUE_SIZE: &str = "receiver_delivery_queue_size";
pub const SHUTDOWN_TIMEOUT_MS: &str = "shutdown_timeout_ms";
pub const DELIVERY_CONTROL_MESSAGES: &str = "delivery_control_messages";

/// Largest accepted send window or delivery queue size, in messages.
pub const MAX_QUEUE_DEPTH: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Which attribute an option belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Context,
    Source,
    Receiver,
}

impl Scope {
    fn table(&self) -> &'static [OptionSpec] {
        match self {
            Scope::Context => CONTEXT_OPTIONS,
            Scope::Source => SOURCE_OPTIONS,
            Scope::Receiver => RECEIVER_OPTIONS,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Context => f.write_str("context"),
            Scope::Source => f.write_str("source"),
            Scope::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    Integer,
    Text,
    Flag,
    Callback,
}

#[derive(Debug, Clone, Copy)]
enum Builtin {
    Integer(u64),
    Text(&'static str),
    Flag(bool),
    Unset,
}

struct OptionSpec {
    name: &'static str,
    kind: OptionKind,
    default: Builtin,
}

const CONTEXT_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: CONTEXT_NAME,
        kind: OptionKind::Text,
        default: Builtin::Text("default"),
    },
    OptionSpec {
        name: SOURCE_NOTIFICATION_FUNCTION,
        kind: OptionKind::Callback,
        default: Builtin::Unset,
    },
    OptionSpec {
        name: DISPATCH_THREAD_COUNT,
        kind: OptionKind::Integer,
        default: Builtin::Integer(2),
    },
    OptionSpec {
        name: SOURCE_SEND_WINDOW,
        kind: OptionKind::Integer,
        default: Builtin::Integer(1024),
    },
    OptionSpec {
        name: RECEIVER_DELIVERY_QUEUE_SIZE,
        kind: OptionKind::Integer,
        default: Builtin::Integer(1024),
    },
    OptionSpec {
        name: SHUTDOWN_TIMEOUT_MS,
        kind: OptionKind::Integer,
        default: Builtin::Integer(5000),
    },
];

// Zero inherits the context window.
const SOURCE_OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: SOURCE_SEND_WINDOW,
    kind: OptionKind::Integer,
    default: Builtin::Integer(0),
}];

const RECEIVER_OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: DELIVERY_CONTROL_MESSAGES,
    kind: OptionKind::Flag,
    default: Builtin::Flag(false),
}];

/// Typed value of a configuration option.
#[derive(Clone)]
pub enum OptionValue {
    Integer(u64),
    Text(String),
    Flag(bool),
    SourceNotify(Arc<dyn SourceNotifier>),
}

impl OptionValue {
    /// Wraps a new-source notification closure for
    /// [`SOURCE_NOTIFICATION_FUNCTION`].
    pub fn source_notify<F>(notify: F) -> Self
    where
        F: Fn(&str, &str) -> CallbackResult + Send + Sync + 'static,
    {
        OptionValue::SourceNotify(Arc::new(notify))
    }

    fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Integer(_) => OptionKind::Integer,
            OptionValue::Text(_) => OptionKind::Text,
            OptionValue::Flag(_) => OptionKind::Flag,
            OptionValue::SourceNotify(_) => OptionKind::Callback,
        }
    }

    fn parse(kind: OptionKind, name: &str, text: &str) -> Result<Self, ClientError> {
        let text = text.trim();
        match kind {
            OptionKind::Integer => text.parse::<u64>().map(OptionValue::Integer).map_err(|e| {
                ClientError::Config(format!("option `{}` expects an integer, got `{}`: {}", name, text, e))
            }),
            OptionKind::Text => Ok(OptionValue::Text(text.to_owned())),
            OptionKind::Flag => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(OptionValue::Flag(true)),
                "0" | "false" | "no" | "off" => Ok(OptionValue::Flag(false)),
                _ => Err(ClientError::Config(format!(
                    "option `{}` expects a boolean, got `{}`",
                    name, text
                ))),
            },
            OptionKind::Callback => Err(ClientError::Config(format!(
                "option `{}` holds a callback and cannot be set from text",
                name
            ))),
        }
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            OptionValue::Text(v) => f.debug_tuple("Text").field(v).finish(),
            OptionValue::Flag(v) => f.debug_tuple("Flag").field(v).finish(),
            OptionValue::SourceNotify(_) => f.write_str("SourceNotify(..)"),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Integer(v) => write!(f, "{}", v),
            OptionValue::Text(v) => f.write_str(v),
            OptionValue::Flag(v) => write!(f, "{}", if *v { 1 } else { 0 }),
            OptionValue::SourceNotify(_) => f.write_str("<callback>"),
        }
    }
}

/// Defaults installed by the last successful [`load`].
static FILE_DEFAULTS: RwLock<Vec<(Scope, &'static str, OptionValue)>> = RwLock::new(Vec::new());

/// Ordered option set of one attribute.
#[derive(Debug, Clone)]
struct Options {
    scope: Scope,
    values: Vec<(&'static str, OptionValue)>,
}

impl Options {
    fn new(scope: Scope) -> Self {
        let mut options = Options {
            scope,
            values: Vec::new(),
        };
        let defaults = match FILE_DEFAULTS.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for (default_scope, name, value) in defaults {
            if default_scope == scope {
                options.put(name, value);
            }
        }
        options
    }

    fn spec(&self, name: &str) -> Result<&'static OptionSpec, ClientError> {
        lookup(self.scope, name)
    }

    fn put(&mut self, name: &'static str, value: OptionValue) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    fn setopt(&mut self, name: &str, value: OptionValue) -> Result<(), ClientError> {
        let spec = self.spec(name)?;
        if spec.kind != value.kind() {
            return Err(ClientError::Config(format!(
                "option `{}` expects a {:?} value, got {:?}",
                name,
                spec.kind,
                value.kind()
            )));
        }
        self.put(spec.name, value);
        Ok(())
    }

    fn str_setopt(&mut self, name: &str, text: &str) -> Result<(), ClientError> {
        let spec = self.spec(name)?;
        let value = OptionValue::parse(spec.kind, name, text)?;
        self.put(spec.name, value);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<OptionValue> {
        if let Some((_, value)) = self.values.iter().find(|(n, _)| *n == name) {
            return Some(value.clone());
        }
        let spec = self.scope.table().iter().find(|spec| spec.name == name)?;
        match spec.default {
            Builtin::Integer(v) => Some(OptionValue::Integer(v)),
            Builtin::Text(v) => Some(OptionValue::Text(v.to_owned())),
            Builtin::Flag(v) => Some(OptionValue::Flag(v)),
            Builtin::Unset => None,
        }
    }

    fn getopt(&self, name: &str) -> Result<String, ClientError> {
        self.spec(name)?;
        Ok(self.get(name).map(|v| v.to_string()).unwrap_or_default())
    }

    fn integer(&self, name: &str) -> u64 {
        match self.get(name) {
            Some(OptionValue::Integer(v)) => v,
            _ => 0,
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(OptionValue::Flag(true)))
    }

    fn text(&self, name: &str) -> String {
        match self.get(name) {
            Some(OptionValue::Text(v)) => v,
            _ => String::new(),
        }
    }
}

fn lookup(scope: Scope, name: &str) -> Result<&'static OptionSpec, ClientError> {
    scope
        .table()
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| ClientError::Config(format!("unknown {} option `{}`", scope, name)))
}

/// Builder for a [`Context`](crate::context::Context).
#[derive(Debug)]
pub struct ContextAttribute {
    options: Options,
}

impl ContextAttribute {
    pub fn new() -> Self {
        ContextAttribute {
            options: Options::new(Scope::Context),
        }
    }

    /// Installs a typed option. Fails with `ClientError::Config` on an unknown name or
    /// a value of the wrong type.
    pub fn setopt(&mut self, name: &str, value: OptionValue) -> Result<(), ClientError> {
        error::track(self.options.setopt(name, value))
    }

    /// Installs an option from its textual form.
    pub fn str_setopt(&mut self, name: &str, value: &str) -> Result<(), ClientError> {
        error::track(self.options.str_setopt(name, value))
    }

    /// Textual form of the current value; empty for an unset callback option.
    pub fn getopt(&self, name: &str) -> Result<String, ClientError> {
        error::track(self.options.getopt(name))
    }

    pub(crate) fn into_config(self) -> Result<ContextConfig, ClientError> {
        let options = self.options;
        let name = options.text(CONTEXT_NAME);
        if name.is_empty() {
            return Err(ClientError::Creation("context_name must not be empty".to_owned()));
        }

        let positive = |option: &str| -> Result<usize, ClientError> {
            match options.integer(option) {
                0 => Err(ClientError::Creation(format!("{} must be positive", option))),
                v => usize::try_from(v)
                    .map_err(|_| ClientError::Creation(format!("{} is too large", option))),
            }
        };
        let depth = |option: &str| -> Result<usize, ClientError> {
            let value = positive(option)?;
            if value > MAX_QUEUE_DEPTH {
                return Err(ClientError::Creation(format!(
                    "{} is {}, limit is {}",
                    option, value, MAX_QUEUE_DEPTH
                )));
            }
            Ok(value)
        };

        let notifier = match options.get(SOURCE_NOTIFICATION_FUNCTION) {
            Some(OptionValue::SourceNotify(notifier)) => Some(notifier),
            _ => None,
        };

        Ok(ContextConfig {
            dispatch_threads: positive(DISPATCH_THREAD_COUNT)?,
            send_window: depth(SOURCE_SEND_WINDOW)?,
            delivery_queue: depth(RECEIVER_DELIVERY_QUEUE_SIZE)?,
            shutdown_timeout: Duration::from_millis(options.integer(SHUTDOWN_TIMEOUT_MS)),
            name,
            notifier,
        })
    }
}

impl Default for ContextAttribute {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated context configuration.
pub(crate) struct ContextConfig {
    pub(crate) name: String,
    pub(crate) notifier: Option<Arc<dyn SourceNotifier>>,
    pub(crate) dispatch_threads: usize,
    pub(crate) send_window: usize,
    pub(crate) delivery_queue: usize,
    pub(crate) shutdown_timeout: Duration,
}

/// Builder for a [`Topic`](crate::topic::Topic), either publish side or subscribe side.
#[derive(Debug)]
pub struct TopicAttribute {
    role: Role,
    options: Options,
}

impl TopicAttribute {
    /// Attribute for [`Topic::allocate`](crate::topic::Topic::allocate).
    pub fn source() -> Self {
        TopicAttribute {
            role: Role::Publish,
            options: Options::new(Scope::Source),
        }
    }

    /// Attribute for [`Topic::resolve`](crate::topic::Topic::resolve).
    pub fn receiver() -> Self {
        TopicAttribute {
            role: Role::Subscribe,
            options: Options::new(Scope::Receiver),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn setopt(&mut self, name: &str, value: OptionValue) -> Result<(), ClientError> {
        error::track(self.options.setopt(name, value))
    }

    pub fn str_setopt(&mut self, name: &str, value: &str) -> Result<(), ClientError> {
        error::track(self.options.str_setopt(name, value))
    }

    pub fn getopt(&self, name: &str) -> Result<String, ClientError> {
        error::track(self.options.getopt(name))
    }

    /// A zero send window inherits the context value.
    pub(crate) fn into_config(self) -> Result<TopicConfig, ClientError> {
        match self.role {
            Role::Publish => {
                let window = self.options.integer(SOURCE_SEND_WINDOW);
                let send_window = match usize::try_from(window) {
                    Ok(0) => None,
                    Ok(window) if window <= MAX_QUEUE_DEPTH => Some(window),
                    _ => {
                        return Err(ClientError::Resolution(format!(
                            "{} is {}, limit is {}",
                            SOURCE_SEND_WINDOW, window, MAX_QUEUE_DEPTH
                        )))
                    }
                };
                Ok(TopicConfig {
                    send_window,
                    control_messages: false,
                })
            }
            Role::Subscribe => Ok(TopicConfig {
                send_window: None,
                control_messages: self.options.flag(DELIVERY_CONTROL_MESSAGES),
            }),
        }
    }
}

/// Per-topic settings carried from the attribute to the bound source or receiver.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopicConfig {
    pub(crate) send_window: Option<usize>,
    pub(crate) control_messages: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    context: HashMap<String, serde_json::Value>,

    #[serde(default)]
    source: HashMap<String, serde_json::Value>,

    #[serde(default)]
    receiver: HashMap<String, serde_json::Value>,
}

fn parse(text: &str) -> Result<Vec<(Scope, &'static str, OptionValue)>, ClientError> {
    let file: ConfigFile = serde_json::from_str(text)
        .map_err(|e| ClientError::Config(format!("malformed configuration: {}", e)))?;

    let mut defaults = Vec::new();
    for (scope, entries) in [
        (Scope::Context, file.context),
        (Scope::Source, file.source),
        (Scope::Receiver, file.receiver),
    ] {
        // Sorted so that the installed order does not depend on map iteration.
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in entries {
            let spec = lookup(scope, &name)?;
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(ClientError::Config(format!(
                        "{} option `{}` has unsupported value {}",
                        scope, name, other
                    )))
                }
            };
            defaults.push((scope, spec.name, OptionValue::parse(spec.kind, &name, &text)?));
        }
    }
    Ok(defaults)
}

/// Loads a JSON configuration file and installs its entries as process-wide defaults
/// for attributes created afterward.
///
/// ```json
/// { "context": { "context_name": "pricing", "source_send_window": 64 },
///   "receiver": { "delivery_control_messages": true } }
/// ```
///
/// A missing or malformed file is not fatal: the failure is logged as a warning and
/// returned, and the previously installed defaults stay in effect.
pub fn load(path: impl AsRef<Path>) -> Result<(), ClientError> {
    let path = path.as_ref();
    let outcome = std::fs::read_to_string(path)
        .map_err(|e| ClientError::Config(format!("cannot read {}: {}", path.display(), e)))
        .and_then(|text| parse(&text));

    match outcome {
        Ok(defaults) => {
            let count = defaults.len();
            let mut guard = match FILE_DEFAULTS.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = defaults;
            logger::info(&format!(
                "loaded {} option(s) from configuration file {}",
                count,
                path.display()
            ));
            Ok(())
        }
        Err(e) => {
            logger::warning(&format!(
                "configuration file {} not applied: {}",
                path.display(),
                e
            ));
            error::track(Err(e))
        }
    }
}

/// Drops every default installed by [`load`].
pub fn reset() {
    let mut guard = match FILE_DEFAULTS.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.clear();
}
