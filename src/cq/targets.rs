//! Continuous-Query Targets
//!
//! A target consumes the value a continuous query produced: either a
//! search result or a group-by map. Target types are resolved through a
//! registry of factories so deployments can plug their own in; `log`
//! and `webhook` ship built in.

use crate::meta::ContinuousQuery;
use crate::store::SearchResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CqError {
    #[error("target '{0}' is unsupported")]
    UnsupportedTarget(String),

    #[error("{0}")]
    BadArguments(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("target errors:\n\t{}", join_errors(.0))]
    Multiple(Vec<String>),
}

fn join_errors(errors: &[String]) -> String {
    errors.join("\n\t")
}

/// What an evaluation produced.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CqValue {
    Search(SearchResult),
    Groups(BTreeMap<String, u64>),
}

/// One resolved delivery target.
#[async_trait]
pub trait CqTarget: Send + Sync {
    async fn deliver(&self, cq: &ContinuousQuery, value: &CqValue) -> Result<(), CqError>;
}

/// Builds a target from a continuous query and its argument list.
pub type TargetFactory =
    Box<dyn Fn(&ContinuousQuery, &[String]) -> Result<Box<dyn CqTarget>, CqError> + Send + Sync>;

/// The resolved targets of one continuous query. Invocation is
/// sequential; a failing target never stops the rest.
pub struct CallbackChain {
    targets: Vec<Box<dyn CqTarget>>,
}

impl CallbackChain {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn invoke(&self, cq: &ContinuousQuery, value: &CqValue) -> Result<(), CqError> {
        let mut errors = Vec::new();
        for target in &self.targets {
            if let Err(e) = target.deliver(cq, value).await {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CqError::Multiple(errors))
        }
    }
}

/// Factory registry for target types.
pub struct TargetRegistry {
    factories: Mutex<HashMap<String, TargetFactory>>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    /// A registry with the built-in `log` and `webhook` targets.
    pub fn new() -> Self {
        let registry = Self {
            factories: Mutex::new(HashMap::new()),
        };
        registry.register("log", |_, args| {
            Ok(Box::new(LogTarget {
                prefix: args.first().cloned().unwrap_or_else(|| "cq".to_string()),
            }) as Box<dyn CqTarget>)
        });
        registry.register("webhook", |_, args| {
            let url = args
                .first()
                .cloned()
                .ok_or_else(|| CqError::BadArguments("webhook needs a url".to_string()))?;
            Ok(Box::new(WebhookTarget {
                url,
                client: reqwest::Client::new(),
            }) as Box<dyn CqTarget>)
        });
        registry
    }

    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ContinuousQuery, &[String]) -> Result<Box<dyn CqTarget>, CqError>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .lock()
            .insert(kind.to_string(), Box::new(factory));
    }

    /// Resolve every target of `cq` into a callback chain.
    pub fn resolve(&self, cq: &ContinuousQuery) -> Result<CallbackChain, CqError> {
        let factories = self.factories.lock();
        let mut targets = Vec::with_capacity(cq.targets.len());
        for t in &cq.targets {
            let factory = factories
                .get(&t.kind)
                .ok_or_else(|| CqError::UnsupportedTarget(t.kind.clone()))?;
            targets.push(factory(cq, &t.arguments)?);
        }
        Ok(CallbackChain { targets })
    }
}

/// Writes a one-line summary of each delivery to the log.
struct LogTarget {
    prefix: String,
}

#[async_trait]
impl CqTarget for LogTarget {
    async fn deliver(&self, cq: &ContinuousQuery, value: &CqValue) -> Result<(), CqError> {
        match value {
            CqValue::Search(result) => tracing::info!(
                "[{}] continuous query matched {} documents",
                self.prefix,
                result.total_hits
            ),
            CqValue::Groups(groups) => tracing::info!(
                "[{}] continuous query grouped by '{}' into {} buckets",
                self.prefix,
                cq.group_by,
                groups.len()
            ),
        }
        Ok(())
    }
}

/// POSTs the value as JSON to a fixed URL.
struct WebhookTarget {
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl CqTarget for WebhookTarget {
    async fn deliver(&self, cq: &ContinuousQuery, value: &CqValue) -> Result<(), CqError> {
        let body = serde_json::json!({
            "group_by": cq.group_by,
            "fields": cq.fields,
            "value": value,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CqError::Delivery(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| CqError::Delivery(e.to_string()))?;
        Ok(())
    }
}
