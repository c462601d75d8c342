//! Containers: schemas (per type) and nodes (per instance).
//!
//! A [`Schema`] is the immutable description of one container type — its
//! features, actions, channels, subsystems, resolvers and discard graph —
//! built once by a driver through [`SchemaBuilder`] and validated at build
//! time. A [`Node`] is one addressable instance of a schema: it holds the
//! shared backend handle, its channel address, its own cache, and the
//! memoized child containers. The root node owns the backend; channels and
//! subsystems borrow it, so the backend's lock serializes every exchange in
//! the device tree.
//!
//! The get/set/invoke engine lives here: declarations stay pure data, all
//! control flow is in [`Node::get`], [`Node::set`] and [`Node::invoke`].

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::action::Action;
use crate::backend::Backend;
use crate::cache::{DiscardGraph, Store};
use crate::error::{InstrError, Result};
use crate::feature::{Feature, Getter, LimitsSpec, ResponseMode, Setter};
use crate::limits::Limits;
use crate::template;
use crate::value::Value;

/// Resolver recomputing a limits validator from container state.
pub type LimitsResolver =
    Arc<dyn Fn(Arc<Node>) -> BoxFuture<'static, Result<Limits>> + Send + Sync>;
/// Resolver computing a feature value without a wire exchange.
pub type ValueResolver = Arc<dyn Fn(Arc<Node>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
/// Resolver choosing a command template from container state.
pub type TemplateResolver =
    Arc<dyn Fn(Arc<Node>) -> BoxFuture<'static, Result<String>> + Send + Sync>;
/// Resolver discovering the valid channel id set from the instrument.
pub type DiscoveryResolver =
    Arc<dyn Fn(Arc<Node>) -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync>;

/// What the engine knows right after a set exchange, handed to the
/// container's operation-check hook.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub feature: String,
    /// Canonical user value that was requested.
    pub value: Value,
    /// Encoded wire value that was sent.
    pub wire: Value,
    /// Device response to the set command, when one was read.
    pub response: Option<String>,
}

/// Hook verifying on the instrument that a set actually took effect;
/// returns the device's fault message if it did not.
pub type OperationCheck =
    Arc<dyn Fn(Arc<Node>, OpOutcome) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// Valid ids of a channel: declared statically or discovered once.
#[derive(Clone)]
pub enum ChannelIds {
    Static(Vec<String>),
    Resolver(String),
}

impl ChannelIds {
    pub fn list<I: ToString>(ids: impl IntoIterator<Item = I>) -> Self {
        ChannelIds::Static(ids.into_iter().map(|i| i.to_string()).collect())
    }

    pub fn resolver(name: impl Into<String>) -> Self {
        ChannelIds::Resolver(name.into())
    }
}

#[derive(Clone)]
pub(crate) struct ChannelDecl {
    pub ids: ChannelIds,
    pub schema: Arc<Schema>,
}

#[derive(Clone)]
pub(crate) struct SubsystemDecl {
    pub schema: Arc<Schema>,
    /// Address override; by default a subsystem inherits its parent's.
    pub ch_id: Option<String>,
}

/// A reusable set of feature/action declarations (a command-set standard).
///
/// Containers include bundles at build time; two bundles declaring the same
/// name collide (a configuration error), while a direct declaration made
/// after `include` deliberately overrides the bundled one.
#[derive(Default, Clone)]
pub struct Bundle {
    pub(crate) features: Vec<Feature>,
    pub(crate) actions: Vec<Action>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// Immutable description of one container type.
pub struct Schema {
    name: String,
    features: HashMap<String, Feature>,
    actions: HashMap<String, Action>,
    channels: HashMap<String, ChannelDecl>,
    subsystems: HashMap<String, SubsystemDecl>,
    limits_resolvers: HashMap<String, LimitsResolver>,
    value_resolvers: HashMap<String, ValueResolver>,
    template_resolvers: HashMap<String, TemplateResolver>,
    discovery_resolvers: HashMap<String, DiscoveryResolver>,
    command_prefix: Option<String>,
    operation_check: Option<OperationCheck>,
    graph: DiscardGraph,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            features: HashMap::new(),
            bundled: HashSet::new(),
            actions: HashMap::new(),
            channels: HashMap::new(),
            subsystems: HashMap::new(),
            limits_resolvers: HashMap::new(),
            value_resolvers: HashMap::new(),
            template_resolvers: HashMap::new(),
            discovery_resolvers: HashMap::new(),
            command_prefix: None,
            operation_check: None,
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    fn require_feature(&self, name: &str) -> Result<&Feature> {
        self.features.get(name).ok_or_else(|| {
            InstrError::config(format!("no feature '{}' on '{}'", name, self.name))
        })
    }

    fn require_action(&self, name: &str) -> Result<&Action> {
        self.actions
            .get(name)
            .ok_or_else(|| InstrError::config(format!("no action '{}' on '{}'", name, self.name)))
    }

    fn require_channel(&self, name: &str) -> Result<&ChannelDecl> {
        self.channels
            .get(name)
            .ok_or_else(|| InstrError::config(format!("no channel '{}' on '{}'", name, self.name)))
    }
}

/// Builder collecting declarations for a [`Schema`].
///
/// Declaration problems are accumulated and reported together by
/// [`SchemaBuilder::build`], which also validates the discard graph and
/// every resolver reference.
pub struct SchemaBuilder {
    name: String,
    features: HashMap<String, Feature>,
    bundled: HashSet<String>,
    actions: HashMap<String, Action>,
    channels: HashMap<String, ChannelDecl>,
    subsystems: HashMap<String, SubsystemDecl>,
    limits_resolvers: HashMap<String, LimitsResolver>,
    value_resolvers: HashMap<String, ValueResolver>,
    template_resolvers: HashMap<String, TemplateResolver>,
    discovery_resolvers: HashMap<String, DiscoveryResolver>,
    command_prefix: Option<String>,
    operation_check: Option<OperationCheck>,
    errors: Vec<String>,
}

impl SchemaBuilder {
    /// Declare (or override) a feature.
    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.insert(feature.name.clone(), feature);
        self
    }

    /// Declare (or override) an action.
    pub fn action(mut self, action: Action) -> Self {
        self.actions.insert(action.name.clone(), action);
        self
    }

    /// Include a capability bundle. Colliding names across bundles are a
    /// configuration error; override them afterwards with
    /// [`SchemaBuilder::feature`] / [`SchemaBuilder::action`] instead.
    pub fn include(mut self, bundle: Bundle) -> Self {
        for feature in bundle.features {
            if self.bundled.contains(&feature.name) || self.features.contains_key(&feature.name) {
                self.errors.push(format!(
                    "bundle collision on feature '{}' in '{}'",
                    feature.name, self.name
                ));
                continue;
            }
            self.bundled.insert(feature.name.clone());
            self.features.insert(feature.name.clone(), feature);
        }
        for action in bundle.actions {
            if self.actions.contains_key(&action.name) {
                self.errors.push(format!(
                    "bundle collision on action '{}' in '{}'",
                    action.name, self.name
                ));
                continue;
            }
            self.actions.insert(action.name.clone(), action);
        }
        self
    }

    /// Declare an indexed, repeatable sub-device.
    pub fn channel(mut self, name: impl Into<String>, ids: ChannelIds, schema: Arc<Schema>) -> Self {
        self.channels
            .insert(name.into(), ChannelDecl { ids, schema });
        self
    }

    /// Declare a non-multiplexed nested container.
    pub fn subsystem(mut self, name: impl Into<String>, schema: Arc<Schema>) -> Self {
        self.subsystems.insert(
            name.into(),
            SubsystemDecl {
                schema,
                ch_id: None,
            },
        );
        self
    }

    /// Subsystem with its own address instead of the parent's.
    pub fn subsystem_at(
        mut self,
        name: impl Into<String>,
        schema: Arc<Schema>,
        ch_id: impl Into<String>,
    ) -> Self {
        self.subsystems.insert(
            name.into(),
            SubsystemDecl {
                schema,
                ch_id: Some(ch_id.into()),
            },
        );
        self
    }

    pub fn limits_resolver(
        mut self,
        name: impl Into<String>,
        resolver: impl Fn(Arc<Node>) -> BoxFuture<'static, Result<Limits>> + Send + Sync + 'static,
    ) -> Self {
        self.limits_resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    pub fn value_resolver(
        mut self,
        name: impl Into<String>,
        resolver: impl Fn(Arc<Node>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.value_resolvers.insert(name.into(), Arc::new(resolver));
        self
    }

    pub fn template_resolver(
        mut self,
        name: impl Into<String>,
        resolver: impl Fn(Arc<Node>) -> BoxFuture<'static, Result<String>> + Send + Sync + 'static,
    ) -> Self {
        self.template_resolvers
            .insert(name.into(), Arc::new(resolver));
        self
    }

    pub fn discovery_resolver(
        mut self,
        name: impl Into<String>,
        resolver: impl Fn(Arc<Node>) -> BoxFuture<'static, Result<Vec<String>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.discovery_resolvers
            .insert(name.into(), Arc::new(resolver));
        self
    }

    /// Prefix prepended to every rendered command (e.g. a chassis selecting
    /// the addressed card with `I{ch_id};`).
    pub fn command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.command_prefix = Some(prefix.into());
        self
    }

    /// Post-set hook confirming on the device that the operation took
    /// effect.
    pub fn operation_check(
        mut self,
        check: impl Fn(Arc<Node>, OpOutcome) -> BoxFuture<'static, Result<Option<String>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.operation_check = Some(Arc::new(check));
        self
    }

    /// Validate everything declared and freeze the schema.
    pub fn build(self) -> Result<Arc<Schema>> {
        let mut errors = self.errors;

        let known: HashSet<String> = self.features.keys().cloned().collect();
        let mut graph = DiscardGraph::default();
        for feature in self.features.values() {
            graph.insert(feature.name.clone(), feature.discard.clone());

            if let Some(LimitsSpec::Static(limits)) = &feature.limits {
                if let Err(err) = limits.well_formed() {
                    errors.push(format!("feature '{}': {}", feature.name, err));
                }
            }
            if let Some(LimitsSpec::Resolver(name)) = &feature.limits {
                if !self.limits_resolvers.contains_key(name) {
                    errors.push(format!(
                        "feature '{}' references unknown limits resolver '{}'",
                        feature.name, name
                    ));
                }
            }
            match &feature.getter {
                Getter::Computed(name) if !self.value_resolvers.contains_key(name) => {
                    errors.push(format!(
                        "feature '{}' references unknown value resolver '{}'",
                        feature.name, name
                    ));
                }
                Getter::Conditional(name) if !self.template_resolvers.contains_key(name) => {
                    errors.push(format!(
                        "feature '{}' references unknown template resolver '{}'",
                        feature.name, name
                    ));
                }
                _ => {}
            }
            if let Setter::Conditional(name) = &feature.setter {
                if !self.template_resolvers.contains_key(name) {
                    errors.push(format!(
                        "feature '{}' references unknown template resolver '{}'",
                        feature.name, name
                    ));
                }
            }
        }
        if let Err(err) = graph.validate(&known) {
            errors.push(err.to_string());
        }
        for (name, decl) in &self.channels {
            if let ChannelIds::Resolver(resolver) = &decl.ids {
                if !self.discovery_resolvers.contains_key(resolver) {
                    errors.push(format!(
                        "channel '{}' references unknown discovery resolver '{}'",
                        name, resolver
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(InstrError::config(errors.join("; ")));
        }

        Ok(Arc::new(Schema {
            name: self.name,
            features: self.features,
            actions: self.actions,
            channels: self.channels,
            subsystems: self.subsystems,
            limits_resolvers: self.limits_resolvers,
            value_resolvers: self.value_resolvers,
            template_resolvers: self.template_resolvers,
            discovery_resolvers: self.discovery_resolvers,
            command_prefix: self.command_prefix,
            operation_check: self.operation_check,
            graph,
        }))
    }
}

/// One addressable container instance.
pub struct Node {
    schema: Arc<Schema>,
    backend: Arc<Backend>,
    ch_id: Option<String>,
    caching_allowed: bool,
    parent: Option<Weak<Node>>,
    store: Store,
    channel_ids: RwLock<HashMap<String, Vec<String>>>,
    channel_instances: RwLock<HashMap<String, HashMap<String, Arc<Node>>>>,
    subsystem_instances: RwLock<HashMap<String, Arc<Node>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("schema", &self.schema.name())
            .field("ch_id", &self.ch_id)
            .field("caching_allowed", &self.caching_allowed)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Root container owning the backend.
    pub fn root(schema: Arc<Schema>, backend: Arc<Backend>) -> Arc<Node> {
        Self::construct(schema, backend, None, true, None)
    }

    /// Root container with per-instance caching disabled.
    pub fn root_uncached(schema: Arc<Schema>, backend: Arc<Backend>) -> Arc<Node> {
        Self::construct(schema, backend, None, false, None)
    }

    fn construct(
        schema: Arc<Schema>,
        backend: Arc<Backend>,
        ch_id: Option<String>,
        caching_allowed: bool,
        parent: Option<Weak<Node>>,
    ) -> Arc<Node> {
        Arc::new(Node {
            schema,
            backend,
            ch_id,
            caching_allowed,
            parent,
            store: Store::default(),
            channel_ids: RwLock::new(HashMap::new()),
            channel_instances: RwLock::new(HashMap::new()),
            subsystem_instances: RwLock::new(HashMap::new()),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn ch_id(&self) -> Option<&str> {
        self.ch_id.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Qualified name used in error messages: `schema[ch_id].feature`.
    fn qualified(&self, name: &str) -> String {
        match &self.ch_id {
            Some(id) => format!("{}[{}].{}", self.schema.name, id, name),
            None => format!("{}.{}", self.schema.name, name),
        }
    }

    // =========================================================================
    // Cache access
    // =========================================================================

    pub fn cached(&self, feature: &str) -> Option<Value> {
        self.store.value(feature)
    }

    /// Seed a cache entry directly. For computed getters that derive several
    /// sibling values from one exchange; the value must already be in
    /// canonical form.
    pub fn prime_cache(&self, feature: &str, value: Value) {
        self.store.put_value(feature, value);
    }

    /// Drop every cached value and resolved validator on this node.
    pub fn clear_cache(&self) {
        self.store.clear();
    }

    /// Drop the cache entries of the named features.
    pub fn clear_cache_of(&self, features: &[&str]) {
        for feature in features {
            self.store.drop_value(feature);
        }
    }

    /// Drop every cached value in this node and all the child containers
    /// created so far. For operations that reset the whole instrument
    /// (`*RST`, recalling a stored setup).
    pub fn clear_cache_deep(&self) {
        self.store.clear();
        for instances in self.channel_instances.read().values() {
            for node in instances.values() {
                node.clear_cache_deep();
            }
        }
        for node in self.subsystem_instances.read().values() {
            node.clear_cache_deep();
        }
    }

    // =========================================================================
    // Feature engine
    // =========================================================================

    /// Read a feature: cache, else wire/resolver, then cache the result.
    pub async fn get(self: &Arc<Self>, name: &str) -> Result<Value> {
        let feature = self.schema.require_feature(name)?.clone();
        if self.caching_allowed && feature.caching {
            if let Some(value) = self.store.value(name) {
                return Ok(value);
            }
        }

        let value = match &feature.getter {
            Getter::None => {
                return Err(InstrError::UnsupportedOperation {
                    target: self.qualified(name),
                    operation: "get",
                })
            }
            Getter::Constant(value) => value.clone(),
            Getter::Computed(resolver) => {
                let resolver = self.value_resolver(resolver)?;
                resolver(self.clone()).await?
            }
            Getter::Template(template) => self.exchange_get(&feature, template).await?,
            Getter::Conditional(resolver) => {
                let resolver = self.template_resolver(resolver)?;
                let template = resolver(self.clone()).await?;
                self.exchange_get(&feature, &template).await?
            }
        };

        if self.caching_allowed && feature.caching {
            self.store.put_value(name, value.clone());
        }
        Ok(value)
    }

    /// Write a feature, honoring the declared order: checks, limits,
    /// encode, exchange, operation check, cache update + invalidation.
    pub async fn set(self: &Arc<Self>, name: &str, value: impl Into<Value>) -> Result<()> {
        let feature = self.schema.require_feature(name)?.clone();
        let user_value = value.into();

        for check in &feature.checks {
            if !(check.test)(self.clone(), user_value.clone()).await? {
                return Err(InstrError::Precondition {
                    target: self.qualified(name),
                    check: check.label.clone(),
                });
            }
        }

        let canonical = feature.transform.normalize(&user_value)?;
        let canonical = match self.limits_of(&feature, name).await? {
            Some(limits) => limits.validate(&self.qualified(name), &canonical, feature.clamp)?,
            None => canonical,
        };
        let wire = feature.transform.encode(&self.qualified(name), &canonical)?;

        let template = match &feature.setter {
            Setter::None => {
                return Err(InstrError::UnsupportedOperation {
                    target: self.qualified(name),
                    operation: "set",
                })
            }
            Setter::Template(template) => template.clone(),
            Setter::Conditional(resolver) => {
                let resolver = self.template_resolver(resolver)?;
                resolver(self.clone()).await?
            }
        };
        let command = self.render_command(&template, &[("value", &wire)])?;

        let response = match &feature.set_mode {
            ResponseMode::Silent => {
                self.backend.write(&command).await?;
                None
            }
            ResponseMode::Line => Some(self.backend.query(&command).await?),
            ResponseMode::Sentinel { ok, error } => {
                let (terminator, body) = self
                    .backend
                    .query_until(&command, &[ok.as_str(), error.as_str()])
                    .await?;
                if &terminator == error {
                    self.store.drop_value(name);
                    return Err(InstrError::Device {
                        target: self.qualified(name),
                        message: body,
                    });
                }
                Some(body)
            }
        };

        if let Some(op_check) = &self.schema.operation_check {
            let outcome = OpOutcome {
                feature: name.to_string(),
                value: canonical.clone(),
                wire,
                response,
            };
            if let Some(message) = op_check(self.clone(), outcome).await? {
                self.store.drop_value(name);
                return Err(InstrError::Device {
                    target: self.qualified(name),
                    message,
                });
            }
        }

        if self.caching_allowed && feature.caching {
            self.store.put_value(name, canonical);
        }
        self.schema.graph.invalidate_from(name, &self.store);
        Ok(())
    }

    async fn exchange_get(self: &Arc<Self>, feature: &Feature, template: &str) -> Result<Value> {
        let command = self.render_command(template, &[])?;
        let raw = match &feature.get_mode {
            ResponseMode::Line | ResponseMode::Silent => self.backend.query(&command).await?,
            ResponseMode::Sentinel { ok, error } => {
                let (terminator, body) = self
                    .backend
                    .query_until(&command, &[ok.as_str(), error.as_str()])
                    .await?;
                if &terminator == error {
                    return Err(InstrError::Device {
                        target: self.qualified(&feature.name),
                        message: body,
                    });
                }
                // Sentinel bodies may span lines; the value is the first.
                body.lines().next().unwrap_or_default().to_string()
            }
        };
        feature
            .transform
            .decode(&self.qualified(&feature.name), &raw)
    }

    fn render_command(&self, template: &str, extra: &[(&str, &Value)]) -> Result<String> {
        let full = match &self.schema.command_prefix {
            Some(prefix) => format!("{}{}", prefix, template),
            None => template.to_string(),
        };
        let ch_value = self.ch_id.as_ref().map(|id| Value::Str(id.clone()));
        let mut vars: Vec<(&str, &Value)> = extra.to_vec();
        if let Some(value) = &ch_value {
            vars.push(("ch_id", value));
        }
        template::render(&full, &vars)
    }

    /// The validator currently governing `feature`, resolving and caching it
    /// if needed.
    pub async fn resolved_limits(self: &Arc<Self>, name: &str) -> Result<Option<Limits>> {
        let feature = self.schema.require_feature(name)?.clone();
        self.limits_of(&feature, name).await
    }

    async fn limits_of(self: &Arc<Self>, feature: &Feature, name: &str) -> Result<Option<Limits>> {
        match &feature.limits {
            None => Ok(None),
            Some(LimitsSpec::Static(limits)) => Ok(Some(limits.clone())),
            Some(LimitsSpec::Resolver(resolver)) => {
                if let Some(limits) = self.store.limits(name) {
                    return Ok(Some(limits));
                }
                let resolver = self
                    .schema
                    .limits_resolvers
                    .get(resolver)
                    .cloned()
                    .ok_or_else(|| {
                        InstrError::config(format!("unknown limits resolver '{}'", resolver))
                    })?;
                let limits = resolver(self.clone()).await?;
                limits.well_formed()?;
                self.store.put_limits(name, limits.clone());
                Ok(Some(limits))
            }
        }
    }

    fn value_resolver(&self, name: &str) -> Result<ValueResolver> {
        self.schema
            .value_resolvers
            .get(name)
            .cloned()
            .ok_or_else(|| InstrError::config(format!("unknown value resolver '{}'", name)))
    }

    fn template_resolver(&self, name: &str) -> Result<TemplateResolver> {
        self.schema
            .template_resolvers
            .get(name)
            .cloned()
            .ok_or_else(|| InstrError::config(format!("unknown template resolver '{}'", name)))
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Run an action: checks first (zero I/O on failure), then unit
    /// normalization of the arguments, then the body.
    pub async fn invoke(self: &Arc<Self>, name: &str, args: Vec<Value>) -> Result<Value> {
        let action = self.schema.require_action(name)?.clone();

        for check in &action.checks {
            if !(check.test)(self.clone(), args.clone()).await? {
                return Err(InstrError::Precondition {
                    target: self.qualified(name),
                    check: check.label.clone(),
                });
            }
        }

        let mut normalized = Vec::with_capacity(args.len());
        for (index, arg) in args.into_iter().enumerate() {
            let expected = action.arg_units.get(index).and_then(Option::as_deref);
            normalized.push(match (expected, arg) {
                (Some(unit), Value::Quantity(q)) => Value::Float(q.to_unit(unit)?),
                (_, other) => other,
            });
        }

        let result = (action.body)(self.clone(), normalized).await?;
        Ok(match (&action.ret_unit, result) {
            (Some(unit), Value::Float(f)) => Value::quantity(f, unit),
            (Some(unit), Value::Int(i)) => Value::quantity(i as f64, unit),
            (_, other) => other,
        })
    }

    // =========================================================================
    // Channels and subsystems
    // =========================================================================

    /// The valid id set of a channel; discovery runs at most once per parent
    /// lifetime.
    pub async fn channel_ids(self: &Arc<Self>, name: &str) -> Result<Vec<String>> {
        let decl = self.schema.require_channel(name)?.clone();
        if let Some(ids) = self.channel_ids.read().get(name) {
            return Ok(ids.clone());
        }
        let ids = match &decl.ids {
            ChannelIds::Static(ids) => ids.clone(),
            ChannelIds::Resolver(resolver) => {
                let resolver = self
                    .schema
                    .discovery_resolvers
                    .get(resolver)
                    .cloned()
                    .ok_or_else(|| {
                        InstrError::config(format!("unknown discovery resolver '{}'", resolver))
                    })?;
                let ids = resolver(self.clone()).await?;
                tracing::info!(channel = name, ids = ?ids, "discovered channel ids");
                ids
            }
        };
        self.channel_ids
            .write()
            .entry(name.to_string())
            .or_insert(ids.clone());
        Ok(ids)
    }

    /// One channel instance, created on first access and memoized so its
    /// cache persists.
    pub async fn channel(self: &Arc<Self>, name: &str, id: impl ToString) -> Result<Arc<Node>> {
        let id = id.to_string();
        let ids = self.channel_ids(name).await?;
        if !ids.contains(&id) {
            return Err(InstrError::UnknownChannel {
                channel: name.to_string(),
                id,
            });
        }
        if let Some(node) = self
            .channel_instances
            .read()
            .get(name)
            .and_then(|instances| instances.get(&id))
        {
            return Ok(node.clone());
        }
        let decl = self.schema.require_channel(name)?.clone();
        let mut instances = self.channel_instances.write();
        let entry = instances.entry(name.to_string()).or_default();
        if let Some(node) = entry.get(&id) {
            return Ok(node.clone());
        }
        let node = Node::construct(
            decl.schema,
            self.backend.clone(),
            Some(id.clone()),
            self.caching_allowed,
            Some(Arc::downgrade(self)),
        );
        entry.insert(id, node.clone());
        Ok(node)
    }

    /// The named subsystem instance, created lazily; exactly one per parent.
    pub fn subsystem(self: &Arc<Self>, name: &str) -> Result<Arc<Node>> {
        if let Some(node) = self.subsystem_instances.read().get(name) {
            return Ok(node.clone());
        }
        let decl = self
            .schema
            .subsystems
            .get(name)
            .cloned()
            .ok_or_else(|| {
                InstrError::config(format!("no subsystem '{}' on '{}'", name, self.schema.name))
            })?;
        let mut instances = self.subsystem_instances.write();
        if let Some(node) = instances.get(name) {
            return Ok(node.clone());
        }
        let ch_id = decl.ch_id.clone().or_else(|| self.ch_id.clone());
        let node = Node::construct(
            decl.schema,
            self.backend.clone(),
            ch_id,
            self.caching_allowed,
            Some(Arc::downgrade(self)),
        );
        instances.insert(name.to_string(), node.clone());
        Ok(node)
    }

    // =========================================================================
    // Typed convenience accessors
    // =========================================================================

    pub async fn get_f64(self: &Arc<Self>, name: &str) -> Result<f64> {
        let value = self.get(name).await?;
        value.as_f64().ok_or_else(|| InstrError::Protocol {
            feature: self.qualified(name),
            raw: value.to_string(),
        })
    }

    pub async fn get_bool(self: &Arc<Self>, name: &str) -> Result<bool> {
        let value = self.get(name).await?;
        value.as_bool().ok_or_else(|| InstrError::Protocol {
            feature: self.qualified(name),
            raw: value.to_string(),
        })
    }

    pub async fn get_string(self: &Arc<Self>, name: &str) -> Result<String> {
        let value = self.get(name).await?;
        match value {
            Value::Str(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}
