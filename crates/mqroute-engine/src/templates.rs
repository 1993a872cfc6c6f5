//! Directory-backed template engine.
//!
//! `template = "alert.txt"` in a rule renders `<templates_dir>/alert.txt`
//! with the same `{key}` formatter used for titles and messages.

use std::path::{Component, Path, PathBuf};

use mqroute_core::error::{Result, RouterError};
use mqroute_core::traits::TemplateEngine;
use mqroute_core::types::TransformData;

use crate::format::format;

#[derive(Debug, Clone)]
pub struct DirTemplates {
    root: PathBuf,
}

impl DirTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(RouterError::Template(format!(
                "template name `{name}` must be relative to the templates directory"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl TemplateEngine for DirTemplates {
    fn render(&self, name: &str, data: &TransformData) -> Result<String> {
        let path = self.path_of(name)?;
        let source = std::fs::read_to_string(&path)
            .map_err(|e| RouterError::Template(format!("cannot read {}: {e}", path.display())))?;
        format(&source, data).map_err(|e| RouterError::Template(format!("{name}: {e}")))
    }
}
