//! Component renderer registry.
//!
//! Maps each component kind to a renderer producing the ordered desired
//! object graph. New kinds register at startup; nothing else in the engine
//! knows what a component renders to.

pub mod common;
pub mod dashboards;
pub mod logs;
pub mod metrics;
pub mod traces;

use std::collections::BTreeMap;

use handlebars::Handlebars;
use kube::ResourceExt;
use serde_json::{json, Value};

use crate::crds::{ComponentKind, ComponentSpec, ObservabilityPlatform};
use crate::error::{Error, Result};

pub use common::RenderInput;

/// One desired cluster object with its identity pulled out of the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub manifest: Value,
}

impl DesiredObject {
    pub fn from_manifest(manifest: Value) -> Result<Self> {
        let api_version = manifest["apiVersion"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?
            .to_string();
        let kind = manifest["kind"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?
            .to_string();
        let name = manifest["metadata"]["name"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?
            .to_string();
        let namespace = manifest["metadata"]["namespace"]
            .as_str()
            .ok_or(Error::MissingObjectKey)?
            .to_string();
        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
            manifest,
        })
    }

    /// Stable identity used for diffing and the status registry.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A renderer for one component kind.
pub trait ComponentRenderer: Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Produce the ordered manifest list: config, service, workload,
    /// optional PDB. Must be deterministic.
    fn render(&self, handlebars: &Handlebars<'static>, input: &RenderInput<'_>)
        -> Result<Vec<Value>>;
}

/// Template data shared by every component config template.
#[must_use]
pub fn template_data(input: &RenderInput<'_>, port: i32) -> Value {
    let global = input.platform.spec.global.as_ref();
    let external_labels: BTreeMap<String, String> = global
        .map(|g| g.external_labels.clone())
        .unwrap_or_default();
    json!({
        "platform": input.platform_name(),
        "component": input.kind.to_string(),
        "port": port,
        "interval": input.component.interval.clone().unwrap_or_else(|| "1m".to_string()),
        "retention": input.component.retention.clone().unwrap_or_else(|| "30d".to_string()),
        "log_level": global.and_then(|g| g.log_level.clone()).unwrap_or_else(|| "info".to_string()),
        "has_external_labels": !external_labels.is_empty(),
        "external_labels": external_labels,
        "settings": input.component.settings,
    })
}

/// Registry of component renderers, built once at startup.
pub struct RendererRegistry {
    handlebars: Handlebars<'static>,
    renderers: BTreeMap<ComponentKind, Box<dyn ComponentRenderer>>,
}

impl RendererRegistry {
    /// Registry with the four built-in renderers.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self {
            handlebars: Handlebars::new(),
            renderers: BTreeMap::new(),
        };
        registry.register(
            Box::new(metrics::MetricsRenderer),
            metrics::TEMPLATE_NAME,
            metrics::TEMPLATE,
        )?;
        registry.register(
            Box::new(dashboards::DashboardsRenderer),
            dashboards::TEMPLATE_NAME,
            dashboards::TEMPLATE,
        )?;
        registry.register(
            Box::new(logs::LogsRenderer),
            logs::TEMPLATE_NAME,
            logs::TEMPLATE,
        )?;
        registry.register(
            Box::new(traces::TracesRenderer),
            traces::TEMPLATE_NAME,
            traces::TEMPLATE,
        )?;
        Ok(registry)
    }

    /// Register a renderer and its config template.
    pub fn register(
        &mut self,
        renderer: Box<dyn ComponentRenderer>,
        template_name: &str,
        template: &str,
    ) -> Result<()> {
        self.handlebars
            .register_template_string(template_name, template)
            .map_err(|e| Error::ConfigError(format!("template {template_name}: {e}")))?;
        self.renderers.insert(renderer.kind(), renderer);
        Ok(())
    }

    #[must_use]
    pub fn supports(&self, kind: ComponentKind) -> bool {
        self.renderers.contains_key(&kind)
    }

    /// Render one component's object graph.
    pub fn render_component(
        &self,
        platform: &ObservabilityPlatform,
        kind: ComponentKind,
        component: &ComponentSpec,
    ) -> Result<Vec<DesiredObject>> {
        let renderer = self
            .renderers
            .get(&kind)
            .ok_or_else(|| Error::InvalidSpec(format!("no renderer registered for '{kind}'")))?;
        let input = RenderInput {
            platform,
            component,
            kind,
        };
        renderer
            .render(&self.handlebars, &input)?
            .into_iter()
            .map(DesiredObject::from_manifest)
            .collect()
    }

    /// Render the full desired graph for every enabled component.
    ///
    /// Apply order: per-component graphs in dependency order (stores before
    /// dashboards, config before workload), then every PDB last.
    pub fn render_platform(
        &self,
        platform: &ObservabilityPlatform,
    ) -> Result<Vec<DesiredObject>> {
        let mut main = Vec::new();
        let mut budgets = Vec::new();
        for (kind, component) in platform.spec.components.iter() {
            if !component.enabled {
                continue;
            }
            for object in self.render_component(platform, kind, component)? {
                if object.kind == "PodDisruptionBudget" {
                    budgets.push(object);
                } else {
                    main.push(object);
                }
            }
        }
        main.extend(budgets);
        Ok(main)
    }

    /// Label selector matching every object owned by the platform.
    #[must_use]
    pub fn owned_selector(platform: &ObservabilityPlatform) -> String {
        format!(
            "app.kubernetes.io/instance={},app.kubernetes.io/managed-by=platform-controller",
            platform.name_any()
        )
    }
}
