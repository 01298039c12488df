use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DISPLAY_NAME_PLACEHOLDER: &str = "{name}";
/// Older backend catalogs use the Spanish placeholder.
pub const LEGACY_DISPLAY_NAME_PLACEHOLDER: &str = "{nombre}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: BTreeMap<String, String>,
}

impl Template {
    /// Message bodies in key order with the display name substituted.
    pub fn render(&self, display_name: &str) -> Vec<String> {
        self.messages
            .values()
            .map(|body| {
                body.replace(DISPLAY_NAME_PLACEHOLDER, display_name)
                    .replace(LEGACY_DISPLAY_NAME_PLACEHOLDER, display_name)
            })
            .collect()
    }

    pub fn preview(&self, display_name: &str) -> String {
        self.render(display_name).join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCatalog {
    source: CatalogSource,
    templates: Vec<Template>,
}

impl TemplateCatalog {
    /// The built-in four-option catalog.
    pub fn builtin() -> Self {
        let entries = [
            (
                "1",
                "Web design & development",
                "Hi {name}! Thanks for reaching out.\nDid you know most visitors judge a business by its website? Tell us about yours and whether you already have a site.",
            ),
            (
                "2",
                "Social media management",
                "Hi {name}! Thanks for reaching out.\nBusinesses that manage their social channels well grow faster. What is your biggest social media challenge right now?",
            ),
            (
                "3",
                "Digital marketing",
                "Hi {name}! Thanks for reaching out.\nThe difference between spending and results is strategy. How are your current campaigns performing?",
            ),
            (
                "4",
                "Branding & design",
                "Hi {name}! Thanks for reaching out.\nA brand people recognise sells on its own. Are you starting your branding from scratch or refreshing it?",
            ),
        ];

        let templates = entries
            .into_iter()
            .map(|(id, name, body)| Template {
                id: id.to_owned(),
                name: name.to_owned(),
                messages: BTreeMap::from([("1".to_owned(), body.to_owned())]),
            })
            .collect();

        Self {
            source: CatalogSource::Static,
            templates,
        }
    }

    /// A backend-provided catalog that has not arrived yet.
    pub fn pending() -> Self {
        Self {
            source: CatalogSource::Dynamic,
            templates: Vec::new(),
        }
    }

    pub fn dynamic(templates: Vec<Template>) -> Self {
        Self {
            source: CatalogSource::Dynamic,
            templates,
        }
    }

    pub fn source(&self) -> &CatalogSource {
        &self.source
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|template| template.id == id)
    }

    pub fn default_id(&self) -> Option<&str> {
        self.templates.first().map(|template| template.id.as_str())
    }
}
