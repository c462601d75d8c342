//! Action declarations: imperative instrument operations as data.
//!
//! An [`Action`] pairs pre-condition checks and unit expectations with a
//! free-form async body. Bodies may read and write sibling features, hold a
//! backend [`Session`](crate::backend::Session) across several exchanges,
//! or run a bounded wait/poll loop. Invocation (checks first, then unit
//! normalization, then the body) is implemented on
//! [`Node`](crate::node::Node).

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::error::Result;
use crate::node::Node;
use crate::value::Value;

/// The side-effecting body of an action.
pub type ActionBody =
    Arc<dyn Fn(Arc<Node>, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Async predicate over the container and the call arguments.
pub type ActionCheckFn =
    Arc<dyn Fn(Arc<Node>, Vec<Value>) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// A labelled pre-condition check for an action.
#[derive(Clone)]
pub struct ActionCheck {
    pub(crate) label: String,
    pub(crate) test: ActionCheckFn,
}

/// Declaration of one imperative operation.
#[derive(Clone)]
pub struct Action {
    pub(crate) name: String,
    pub(crate) checks: Vec<ActionCheck>,
    /// Expected wire unit per positional argument; `None` entries pass
    /// through untouched.
    pub(crate) arg_units: Vec<Option<String>>,
    /// Unit attached to a numeric return value.
    pub(crate) ret_unit: Option<String>,
    pub(crate) body: ActionBody,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(Arc<Node>, Vec<Value>) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            checks: Vec::new(),
            arg_units: Vec::new(),
            ret_unit: None,
            body: Arc::new(body),
        }
    }

    pub fn check(
        mut self,
        label: impl Into<String>,
        test: impl Fn(Arc<Node>, Vec<Value>) -> BoxFuture<'static, Result<bool>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.checks.push(ActionCheck {
            label: label.into(),
            test: Arc::new(test),
        });
        self
    }

    /// Declare the wire unit expected for each positional argument.
    pub fn arg_units(mut self, units: impl IntoIterator<Item = Option<&'static str>>) -> Self {
        self.arg_units = units
            .into_iter()
            .map(|u| u.map(|u| u.to_string()))
            .collect();
        self
    }

    /// Attach a unit to the returned value.
    pub fn ret_unit(mut self, unit: impl Into<String>) -> Self {
        self.ret_unit = Some(unit.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
