//! Name-based component registry
//!
//! Built-in components are registered explicitly in `with_builtins`; external
//! crates add their own factories through the same `register_*` methods.

use super::balancers::BalancedBalancer;
use super::classifiers::{LinearSvm, LogisticRegression, NaiveBayes};
use super::features::TfidfExtractor;
use super::queriers::{MaxQuerier, MaxRandomQuerier, RandomQuerier, TopDownQuerier, UncertaintyQuerier};
use super::{Balancer, Classifier, FeatureExtractor, Params, Querier};
use crate::error::{Result, SiftError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type Factory<T> = Arc<dyn Fn(&Params) -> Result<T> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Classifier,
    Querier,
    Balancer,
    FeatureExtractor,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Classifier => "classifier",
            ComponentKind::Querier => "querier",
            ComponentKind::Balancer => "balancer",
            ComponentKind::FeatureExtractor => "feature extractor",
        };
        f.write_str(name)
    }
}

/// Factories for every component kind, keyed by registered name
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    classifiers: HashMap<String, Factory<Box<dyn Classifier>>>,
    queriers: HashMap<String, Factory<Box<dyn Querier>>>,
    balancers: HashMap<String, Factory<Box<dyn Balancer>>>,
    feature_extractors: HashMap<String, Factory<Box<dyn FeatureExtractor>>>,
}

impl ComponentRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_classifier(NaiveBayes::NAME, |p| {
            Ok(Box::new(NaiveBayes::from_params(p)?) as Box<dyn Classifier>)
        });
        registry.register_classifier(LogisticRegression::NAME, |p| {
            Ok(Box::new(LogisticRegression::from_params(p)?) as Box<dyn Classifier>)
        });
        registry.register_classifier(LinearSvm::NAME, |p| {
            Ok(Box::new(LinearSvm::from_params(p)?) as Box<dyn Classifier>)
        });

        registry.register_querier(MaxQuerier::NAME, |p| {
            no_params(ComponentKind::Querier, MaxQuerier::NAME, p)?;
            Ok(Box::new(MaxQuerier) as Box<dyn Querier>)
        });
        registry.register_querier(UncertaintyQuerier::NAME, |p| {
            no_params(ComponentKind::Querier, UncertaintyQuerier::NAME, p)?;
            Ok(Box::new(UncertaintyQuerier) as Box<dyn Querier>)
        });
        registry.register_querier(TopDownQuerier::NAME, |p| {
            no_params(ComponentKind::Querier, TopDownQuerier::NAME, p)?;
            Ok(Box::new(TopDownQuerier) as Box<dyn Querier>)
        });
        registry.register_querier(RandomQuerier::NAME, |p| {
            Ok(Box::new(RandomQuerier::from_params(p)?) as Box<dyn Querier>)
        });
        registry.register_querier(MaxRandomQuerier::NAME, |p| {
            Ok(Box::new(MaxRandomQuerier::from_params(p)?) as Box<dyn Querier>)
        });

        registry.register_balancer(BalancedBalancer::NAME, |p| {
            Ok(Box::new(BalancedBalancer::from_params(p)?) as Box<dyn Balancer>)
        });

        registry.register_feature_extractor(TfidfExtractor::NAME, |p| {
            Ok(Box::new(TfidfExtractor::from_params(p)?) as Box<dyn FeatureExtractor>)
        });

        registry
    }

    pub fn register_classifier<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Params) -> Result<Box<dyn Classifier>> + Send + Sync + 'static,
    {
        self.classifiers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_querier<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Params) -> Result<Box<dyn Querier>> + Send + Sync + 'static,
    {
        self.queriers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_balancer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Params) -> Result<Box<dyn Balancer>> + Send + Sync + 'static,
    {
        self.balancers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_feature_extractor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Params) -> Result<Box<dyn FeatureExtractor>> + Send + Sync + 'static,
    {
        self.feature_extractors.insert(name.into(), Arc::new(factory));
    }

    pub fn classifier(&self, name: &str, params: &Params) -> Result<Box<dyn Classifier>> {
        build(&self.classifiers, ComponentKind::Classifier, name, params)
    }

    pub fn querier(&self, name: &str, params: &Params) -> Result<Box<dyn Querier>> {
        build(&self.queriers, ComponentKind::Querier, name, params)
    }

    pub fn balancer(&self, name: &str, params: &Params) -> Result<Box<dyn Balancer>> {
        build(&self.balancers, ComponentKind::Balancer, name, params)
    }

    pub fn feature_extractor(&self, name: &str, params: &Params) -> Result<Box<dyn FeatureExtractor>> {
        build(&self.feature_extractors, ComponentKind::FeatureExtractor, name, params)
    }

    /// Registered names of one kind, sorted
    pub fn list(&self, kind: ComponentKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            ComponentKind::Classifier => self.classifiers.keys().cloned().collect(),
            ComponentKind::Querier => self.queriers.keys().cloned().collect(),
            ComponentKind::Balancer => self.balancers.keys().cloned().collect(),
            ComponentKind::FeatureExtractor => self.feature_extractors.keys().cloned().collect(),
        };
        names.sort();
        names
    }
}

fn build<T>(
    factories: &HashMap<String, Factory<T>>,
    kind: ComponentKind,
    name: &str,
    params: &Params,
) -> Result<T> {
    let factory = factories.get(name).ok_or_else(|| {
        let mut known: Vec<&str> = factories.keys().map(String::as_str).collect();
        known.sort_unstable();
        SiftError::config(format!(
            "unknown {} '{}' (registered: {})",
            kind,
            name,
            known.join(", ")
        ))
    })?;
    (**factory)(params)
}

fn no_params(kind: ComponentKind, name: &str, params: &Params) -> Result<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(SiftError::config(format!(
            "{} '{}' takes no parameters",
            kind, name
        )))
    }
}
