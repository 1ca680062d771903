//! Trace store renderer: stateless collector/query workload.

use handlebars::Handlebars;
use serde_json::Value;

use super::common::{self, RenderInput, WorkloadParams};
use super::{template_data, ComponentRenderer};
use crate::crds::ComponentKind;
use crate::error::{Error, Result};

pub const TEMPLATE_NAME: &str = "traces-config";
pub const TEMPLATE: &str = include_str!("../../templates/traces.yml.hbs");

const PORT: i32 = 16686;

pub struct TracesRenderer;

impl ComponentRenderer for TracesRenderer {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Traces
    }

    fn render(
        &self,
        handlebars: &Handlebars<'static>,
        input: &RenderInput<'_>,
    ) -> Result<Vec<Value>> {
        let config = handlebars
            .render(TEMPLATE_NAME, &template_data(input, PORT))
            .map_err(|e| Error::ConfigError(format!("traces config render: {e}")))?;

        let params = WorkloadParams {
            image: format!("jaegertracing/all-in-one:{}", input.component.version),
            port: PORT,
            port_name: "query",
            config_filename: "traces.yml",
            config_mount_path: "/etc/traces",
            args: vec!["--config-file=/etc/traces/traces.yml".to_string()],
            stateful: false,
            data_mount_path: "/data",
        };

        let mut objects = vec![
            common::config_map(input, params.config_filename, &config),
            common::service(input, PORT, params.port_name),
            common::workload(input, &params),
        ];
        if let Some(pdb) = common::pod_disruption_budget(input) {
            objects.push(pdb);
        }
        Ok(objects)
    }
}
