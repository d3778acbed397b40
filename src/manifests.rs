//! Manifest rendering.
//!
//! Manifests are Jinja-style templates loaded from a directory at run time
//! and rendered per cluster or per agent with the parameters the bring-up
//! workflows compute. Rendering is pure; applying the result is the calling
//! handler's business.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

/// File extension for manifest templates.
const TEMPLATE_SUFFIX: &str = ".yaml.j2";

pub struct ManifestRenderer {
    environment: Environment<'static>,
}

impl ManifestRenderer {
    /// Renderer loading templates from `template_dir` on demand.
    pub fn new(template_dir: &Path) -> Self {
        let mut environment = Environment::new();
        environment.set_loader(minijinja::path_loader(template_dir));
        Self { environment }
    }

    /// Render the named template (`<name>.yaml.j2`) with `params`.
    pub fn render(&self, name: &str, params: impl Serialize) -> Result<String> {
        let template = self
            .environment
            .get_template(&format!("{name}{TEMPLATE_SUFFIX}"))
            .with_context(|| format!("loading manifest template {name}"))?;
        template
            .render(params)
            .with_context(|| format!("rendering manifest {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer_with(template: &str) -> (tempfile::TempDir, ManifestRenderer) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("namespace.yaml.j2"), template).unwrap();
        let renderer = ManifestRenderer::new(dir.path());
        (dir, renderer)
    }

    #[test]
    fn renders_parameters() {
        let (_dir, renderer) = renderer_with(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {{ cluster_identifier }}\n",
        );
        let rendered = renderer
            .render("namespace", json!({"cluster_identifier": "swarm-17-0"}))
            .unwrap();
        assert!(rendered.contains("name: swarm-17-0"));
    }

    #[test]
    fn missing_template_is_an_error() {
        let (_dir, renderer) = renderer_with("kind: Namespace\n");
        assert!(renderer.render("infraenv", json!({})).is_err());
    }

    #[test]
    fn conditionals_follow_parameters() {
        let (_dir, renderer) = renderer_with(
            "{% if single_node %}mode: single\n{% else %}mode: ha\n{% endif %}",
        );
        let single = renderer
            .render("namespace", json!({"single_node": true}))
            .unwrap();
        assert!(single.contains("mode: single"));
        let multi = renderer
            .render("namespace", json!({"single_node": false}))
            .unwrap();
        assert!(multi.contains("mode: ha"));
    }
}
