//! Feature declarations: one instrument attribute as data.
//!
//! A [`Feature`] binds command templates, a value transform, a limits spec,
//! pre-condition checks and invalidation edges. Declarations are immutable
//! configuration attached to a container [`Schema`](crate::node::Schema);
//! per-instance cache state lives on the [`Node`](crate::node::Node). The
//! get/set engine itself is implemented on `Node`.
//!
//! Most drivers read like tables of these declarations:
//!
//! ```rust,ignore
//! Feature::text("mode")
//!     .get("getm {ch_id}")
//!     .set("setm {ch_id} {value}")
//!     .mapping([("Ground", "gnd"), ("Step", "stp")])
//! ```

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::cache::Discard;
use crate::error::Result;
use crate::limits::Limits;
use crate::node::Node;
use crate::transform::{Kind, Transform};
use crate::value::Value;

/// Async predicate evaluated against the owning container and the candidate
/// value before any I/O.
pub type CheckFn = Arc<dyn Fn(Arc<Node>, Value) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// A labelled pre-condition check; the label names the failed condition in
/// [`InstrError::Precondition`](crate::error::InstrError::Precondition).
#[derive(Clone)]
pub struct Check {
    pub(crate) label: String,
    pub(crate) test: CheckFn,
}

impl Check {
    pub fn new(
        label: impl Into<String>,
        test: impl Fn(Arc<Node>, Value) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            test: Arc::new(test),
        }
    }
}

/// How a feature produces its value.
#[derive(Clone)]
pub enum Getter {
    /// No way to read; `get` fails with `UnsupportedOperation` unless a
    /// value is cached from an earlier set.
    None,
    /// Command template queried over the backend.
    Template(String),
    /// Named template resolver picking the command from container state at
    /// call time (read-only; resolvers must not mutate).
    Conditional(String),
    /// Named zero-argument resolver computing the value (constant features,
    /// values derived from sibling state).
    Computed(String),
    /// Fixed value.
    Constant(Value),
}

/// How a feature writes its value.
#[derive(Clone)]
pub enum Setter {
    None,
    Template(String),
    /// Named template resolver, as [`Getter::Conditional`].
    Conditional(String),
}

/// Shape of the device's answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMode {
    /// One terminated line.
    Line,
    /// No response expected.
    Silent,
    /// Lines until one of two sentinel tokens; the error sentinel raises
    /// `DeviceError` with the body as message.
    Sentinel { ok: String, error: String },
}

/// Static or per-call-resolved limits.
#[derive(Clone)]
pub enum LimitsSpec {
    Static(Limits),
    /// Named resolver run against the container; results are cached per
    /// instance until a `discard limits` edge drops them.
    Resolver(String),
}

/// Declaration of one instrument attribute.
#[derive(Clone)]
pub struct Feature {
    pub(crate) name: String,
    pub(crate) getter: Getter,
    pub(crate) setter: Setter,
    pub(crate) transform: Transform,
    pub(crate) limits: Option<LimitsSpec>,
    pub(crate) checks: Vec<Check>,
    pub(crate) discard: Vec<Discard>,
    pub(crate) caching: bool,
    pub(crate) clamp: bool,
    pub(crate) get_mode: ResponseMode,
    pub(crate) set_mode: ResponseMode,
}

impl Feature {
    fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            getter: Getter::None,
            setter: Setter::None,
            transform: Transform::new(kind),
            limits: None,
            checks: Vec::new(),
            discard: Vec::new(),
            caching: true,
            clamp: false,
            get_mode: ResponseMode::Line,
            set_mode: ResponseMode::Silent,
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Bool)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Float)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Str)
    }

    pub fn get(mut self, template: impl Into<String>) -> Self {
        self.getter = Getter::Template(template.into());
        self
    }

    pub fn set(mut self, template: impl Into<String>) -> Self {
        self.setter = Setter::Template(template.into());
        self
    }

    /// Pick the get command at call time via a named template resolver.
    pub fn get_conditional(mut self, resolver: impl Into<String>) -> Self {
        self.getter = Getter::Conditional(resolver.into());
        self
    }

    /// Pick the set command at call time via a named template resolver.
    pub fn set_conditional(mut self, resolver: impl Into<String>) -> Self {
        self.setter = Setter::Conditional(resolver.into());
        self
    }

    /// Read through a named value resolver instead of the wire.
    pub fn computed(mut self, resolver: impl Into<String>) -> Self {
        self.getter = Getter::Computed(resolver.into());
        self
    }

    pub fn constant(mut self, value: impl Into<Value>) -> Self {
        self.getter = Getter::Constant(value.into());
        self
    }

    pub fn mapping<V, T>(mut self, pairs: impl IntoIterator<Item = (V, T)>) -> Self
    where
        V: Into<Value>,
        T: Into<String>,
    {
        self.transform = self.transform.with_mapping(pairs);
        self
    }

    pub fn aliases<V: Into<Value>>(
        mut self,
        pairs: impl IntoIterator<Item = (&'static str, V)>,
    ) -> Self {
        self.transform = self.transform.with_aliases(pairs);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.transform = self.transform.with_unit(unit);
        self
    }

    pub fn extract(mut self, pattern: impl Into<String>) -> Self {
        self.transform = self.transform.with_extract(pattern);
        self
    }

    /// Wire text decoded as [`Value::Empty`].
    pub fn empty_token(mut self, token: impl Into<String>) -> Self {
        self.transform = self.transform.with_empty_token(token);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = Some(LimitsSpec::Static(limits));
        self
    }

    pub fn limits_resolver(mut self, resolver: impl Into<String>) -> Self {
        self.limits = Some(LimitsSpec::Resolver(resolver.into()));
        self
    }

    pub fn check(
        mut self,
        label: impl Into<String>,
        test: impl Fn(Arc<Node>, Value) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    ) -> Self {
        self.checks.push(Check::new(label, test));
        self
    }

    pub fn discard(mut self, edges: impl IntoIterator<Item = Discard>) -> Self {
        self.discard.extend(edges);
        self
    }

    /// Never cache this feature's value.
    pub fn no_cache(mut self) -> Self {
        self.caching = false;
        self
    }

    /// Snap out-of-range numeric values instead of rejecting them.
    pub fn clamping(mut self) -> Self {
        self.clamp = true;
        self
    }

    /// Responses (both directions) are multi-line and end with a sentinel.
    pub fn sentinel(mut self, ok: impl Into<String>, error: impl Into<String>) -> Self {
        let mode = ResponseMode::Sentinel {
            ok: ok.into(),
            error: error.into(),
        };
        self.get_mode = mode.clone();
        self.set_mode = mode;
        self
    }

    /// The set command answers one line (default expects none).
    pub fn set_replies(mut self) -> Self {
        self.set_mode = ResponseMode::Line;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_tag(&self) -> Option<&str> {
        self.transform.unit()
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }
}
