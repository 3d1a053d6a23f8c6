//! Declarative description of which properties of a remote object get mirrored.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use crate::{ObjectNode, PropValue, Result, Transport};

/// Handler for an extra signal, called with the node that received it and the signal arguments.
pub type SignalHandler<T> = Arc<dyn Fn(Arc<ObjectNode<T>>, Vec<PropValue>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs once after the initial property sync of a node, before its subscriptions are armed.
pub type InitHook<T> = Arc<dyn Fn(Arc<ObjectNode<T>>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// How a single property is mirrored.
pub enum Track<T: Transport> {
    /// Stored as-is.
    Scalar,
    /// The property holds an object path or a list of object paths, each mirrored as a child node.
    Object(Arc<FieldDefinition<T>>),
}

impl<T: Transport> Clone for Track<T> {
    fn clone(&self) -> Self {
        match self {
            Track::Scalar => Track::Scalar,
            Track::Object(def) => Track::Object(def.clone()),
        }
    }
}

/// Property name to [`Track`]. Properties not listed are ignored.
pub struct Subtree<T: Transport>(HashMap<String, Track<T>>);

impl<T: Transport> Default for Subtree<T> {
    fn default() -> Self {
        Subtree(HashMap::new())
    }
}

impl<T: Transport> Subtree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), Track::Scalar);
        self
    }

    pub fn object(mut self, name: impl Into<String>, definition: FieldDefinition<T>) -> Self {
        self.0.insert(name.into(), Track::Object(Arc::new(definition)));
        self
    }

    /// Like [`Subtree::object`], for a definition that is shared between several fields.
    pub fn shared_object(mut self, name: impl Into<String>, definition: Arc<FieldDefinition<T>>) -> Self {
        self.0.insert(name.into(), Track::Object(definition));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Track<T>> {
        self.0.get(name)
    }

    pub fn is_scalar(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(Track::Scalar))
    }
}

/// Everything needed to mirror one object: the interface whose properties are tracked, the
/// subtree, and optional per-node behaviour.
pub struct FieldDefinition<T: Transport> {
    pub interface: String,
    pub subtree: Subtree<T>,
    pub extra_listeners: HashMap<String, SignalHandler<T>>,
    pub extra_init: Option<InitHook<T>>,
}

impl<T: Transport> FieldDefinition<T> {
    pub fn new(interface: impl Into<String>, subtree: Subtree<T>) -> Self {
        FieldDefinition { interface: interface.into(), subtree, extra_listeners: HashMap::new(), extra_init: None }
    }

    pub fn with_listener<F, Fut>(mut self, signal: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<ObjectNode<T>>, Vec<PropValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.extra_listeners.insert(signal.into(), Arc::new(move |node, args| handler(node, args).boxed()));
        self
    }

    pub fn with_init<F, Fut>(mut self, init: F) -> Self
    where
        F: Fn(Arc<ObjectNode<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.extra_init = Some(Arc::new(move |node| init(node).boxed()));
        self
    }
}
