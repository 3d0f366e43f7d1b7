use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use plait_core::error::{PlaitError, Result};
use plait_core::template::Template;
use plait_core::traits::{ProfileStore, TemplateStore};
use plait_core::types::ModelProfile;

/// Templates and profiles held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    templates: HashMap<String, Template>,
    profiles: HashMap<String, ModelProfile>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.insert_template(template);
        self
    }

    pub fn with_profile(mut self, profile: ModelProfile) -> Self {
        self.insert_profile(profile);
        self
    }

    pub fn insert_template(&mut self, template: Template) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn insert_profile(&mut self, profile: ModelProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Catalog seeded with the profiles declared in config.
    pub fn from_profiles(profiles: impl IntoIterator<Item = ModelProfile>) -> Self {
        profiles
            .into_iter()
            .fold(Self::new(), |catalog, profile| catalog.with_profile(profile))
    }
}

impl TemplateStore for InMemoryCatalog {
    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Template>> {
        let id = id.to_string();
        Box::pin(async move {
            self.templates
                .get(&id)
                .cloned()
                .ok_or(PlaitError::TemplateNotFound(id))
        })
    }
}

impl ProfileStore for InMemoryCatalog {
    fn load_profile(&self, id: &str) -> BoxFuture<'_, Result<ModelProfile>> {
        let id = id.to_string();
        Box::pin(async move {
            self.profiles
                .get(&id)
                .cloned()
                .ok_or(PlaitError::ProfileNotFound(id))
        })
    }
}

/// Loads `<dir>/<id>.json` template documents.
#[derive(Debug, Clone)]
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        valid.then(|| self.dir.join(format!("{id}.json")))
    }
}

/// Parse a template document, mapping errors to the template's id.
pub fn parse_template(id: &str, content: &str) -> Result<Template> {
    let template: Template = serde_json::from_str(content)
        .map_err(|e| PlaitError::template(id, format!("invalid template document: {e}")))?;
    if template.id != id {
        return Err(PlaitError::template(
            id,
            format!("document declares id '{}'", template.id),
        ));
    }
    Ok(template)
}

impl TemplateStore for DirTemplateStore {
    fn load_template(&self, id: &str) -> BoxFuture<'_, Result<Template>> {
        let id = id.to_string();
        Box::pin(async move {
            let path = self
                .path_for(&id)
                .ok_or_else(|| PlaitError::TemplateNotFound(id.clone()))?;
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(PlaitError::TemplateNotFound(id));
                }
                Err(e) => return Err(e.into()),
            };
            debug!(template_id = %id, path = %path.display(), "Loaded template");
            parse_template(&id, &content)
        })
    }
}
