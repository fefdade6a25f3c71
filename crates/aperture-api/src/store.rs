//! Storage contract behind each served resource
//!
//! A [`Store`] owns the objects of one resource kind. The delegate passes
//! the caller's identity and namespace on every call in a
//! [`RequestContext`], and list or watch options parsed from the query.

use std::collections::BTreeMap;

use aperture_common::UserIdentity;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Status};

/// Who is asking, and where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated caller, absent when authentication is not wired
    pub user: Option<UserIdentity>,
    /// Namespace of the request, empty for cluster scope or all namespaces
    pub namespace: String,
}

impl RequestContext {
    /// Context for `namespace`
    pub fn new(user: Option<UserIdentity>, namespace: impl Into<String>) -> Self {
        Self {
            user,
            namespace: namespace.into(),
        }
    }
}

/// One requirement of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `key=value` or `key==value`
    Equals(String, String),
    /// `key!=value`
    NotEquals(String, String),
    /// `key`
    Exists(String),
    /// `!key`
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, values: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => values.get(k) == Some(v),
            Requirement::NotEquals(k, v) => values.get(k) != Some(v),
            Requirement::Exists(k) => values.contains_key(k),
            Requirement::DoesNotExist(k) => !values.contains_key(k),
        }
    }
}

/// Equality-based selector; every requirement must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(pub Vec<Requirement>);

impl Selector {
    /// Parse `a=b,c!=d,e,!f`
    pub fn parse(raw: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let key = match &requirement {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::DoesNotExist(k) => k,
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(Error::BadRequest(format!("invalid selector term {:?}", term)));
            }
            requirements.push(requirement);
        }
        Ok(Self(requirements))
    }

    /// Whether `values` satisfies every requirement
    pub fn matches(&self, values: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| r.matches(values))
    }

    /// No requirements
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Options for list and watch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Selector over object labels
    pub label_selector: Selector,
    /// Selector over `metadata.name` and `metadata.namespace`
    pub field_selector: Selector,
    /// Version to list or watch from, passed through to the store
    pub resource_version: Option<String>,
}

impl ListOptions {
    /// Options from raw query values
    pub fn parse(
        label_selector: Option<&str>,
        field_selector: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            label_selector: Selector::parse(label_selector.unwrap_or_default())?,
            field_selector: Selector::parse(field_selector.unwrap_or_default())?,
            resource_version: resource_version
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        })
    }

    /// Whether an object with these coordinates and labels is selected
    pub fn matches(&self, name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.label_selector.matches(labels) {
            return false;
        }
        if self.field_selector.is_empty() {
            return true;
        }
        let fields = BTreeMap::from([
            ("metadata.name".to_string(), name.to_string()),
            ("metadata.namespace".to_string(), namespace.to_string()),
        ]);
        self.field_selector.matches(&fields)
    }
}

/// A list response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList<T> {
    /// `group/version`
    pub api_version: String,
    /// `<Kind>List`
    pub kind: String,
    /// List metadata
    #[serde(default)]
    pub metadata: ListMeta,
    /// Items
    pub items: Vec<T>,
}

impl<T> ResourceList<T> {
    /// List of `items`; the delegate fills in `apiVersion` and `kind`
    pub fn new(items: Vec<T>) -> Self {
        Self {
            api_version: String::new(),
            kind: String::new(),
            metadata: ListMeta::default(),
            items,
        }
    }
}

/// One event of a watch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<T> {
    /// Object created, or present when the watch started
    Added(T),
    /// Object changed
    Modified(T),
    /// Object removed; carries its last state
    Deleted(T),
    /// The stream failed
    Error(Status),
}

/// Stream of watch events
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>>>;

/// Create, update, get, list, watch and delete for one resource kind
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Persist a new object
    async fn create(&self, ctx: &RequestContext, object: T) -> Result<T>;

    /// Replace an existing object
    async fn update(&self, ctx: &RequestContext, object: T) -> Result<T>;

    /// Fetch one object by name
    async fn get(&self, ctx: &RequestContext, name: &str) -> Result<T>;

    /// List objects matching `options`
    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> Result<ResourceList<T>>;

    /// Stream changes to objects matching `options`
    async fn watch(&self, ctx: &RequestContext, options: &ListOptions) -> Result<WatchStream<T>>;

    /// Remove one object by name
    async fn delete(&self, ctx: &RequestContext, name: &str) -> Result<()>;
}
