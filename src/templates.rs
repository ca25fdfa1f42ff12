//! Template catalog read from the provider configuration directory.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound applied when a template omits `maxNumber`.
pub const DEFAULT_MAX_NUMBER: u32 = 1_000;

/// One machine template offered to the host factory.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Identifier referenced by `requestMachines`.
    pub template_id: String,
    /// Maximum number of machines the host factory may request at once.
    #[serde(default = "default_max_number")]
    pub max_number: u32,
    /// Scaleway commercial type, for example `DEV1-S`.
    pub instance_type: String,
    /// Image label or identifier used for new servers.
    pub image: String,
    /// Zone override; the provider default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Extra tags applied to every server created from this template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Host factory attributes, passed through verbatim.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Any further fields, preserved on output.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_max_number() -> u32 {
    DEFAULT_MAX_NUMBER
}

/// Errors raised when loading the template catalog.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when the catalog file cannot be read.
    #[error("failed to read templates file {path}: {message}")]
    Io {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the catalog is not valid JSON.
    #[error("failed to parse templates file {path}: {message}")]
    Parse {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when a template entry is unusable.
    #[error("invalid template in {path}: {message}")]
    Invalid {
        /// Catalog path.
        path: Utf8PathBuf,
        /// Description of the problem.
        message: String,
    },
}

/// Parsed `{"templates": [...]}` document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TemplateCatalog {
    /// Templates in file order.
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl TemplateCatalog {
    /// Reads and validates the catalog at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] when the file is missing, malformed, or
    /// contains a template without an id, instance type or image, or with a
    /// duplicate id.
    pub fn load(path: &Utf8Path) -> Result<Self, TemplateError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| TemplateError::Invalid {
            path: path.to_path_buf(),
            message: String::from("templates path is missing a file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            TemplateError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| TemplateError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::parse(path, &contents)
    }

    /// Parses catalog JSON, attributing errors to `path`.
    ///
    /// # Errors
    ///
    /// See [`TemplateCatalog::load`].
    pub fn parse(path: &Utf8Path, contents: &str) -> Result<Self, TemplateError> {
        let catalog: Self = serde_json::from_str(contents).map_err(|err| TemplateError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        catalog.validate(path)?;
        Ok(catalog)
    }

    /// Looks up a template by id.
    #[must_use]
    pub fn find(&self, template_id: &str) -> Option<&Template> {
        self.templates
            .iter()
            .find(|template| template.template_id == template_id)
    }

    fn validate(&self, path: &Utf8Path) -> Result<(), TemplateError> {
        let invalid = |message: String| TemplateError::Invalid {
            path: path.to_path_buf(),
            message,
        };
        let mut seen = BTreeSet::new();
        for template in &self.templates {
            let id = template.template_id.trim();
            if id.is_empty() {
                return Err(invalid(String::from("templateId must not be empty")));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("duplicate templateId {id}")));
            }
            if template.instance_type.trim().is_empty() {
                return Err(invalid(format!("template {id} has no instanceType")));
            }
            if template.image.trim().is_empty() {
                return Err(invalid(format!("template {id} has no image")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PATH: &str = "conf/hostprov_templates.json";

    #[rstest]
    fn parses_catalog_and_applies_defaults() {
        let raw = r#"{"templates":[{"templateId":"small","instanceType":"DEV1-S",
            "image":"ubuntu_noble","attributes":{"ncpus":["Numeric","2"]},"priority":5}]}"#;

        let catalog = TemplateCatalog::parse(Utf8Path::new(PATH), raw)
            .unwrap_or_else(|err| panic!("catalog should parse: {err}"));

        let Some(template) = catalog.find("small") else {
            panic!("template should be present");
        };
        assert_eq!(template.max_number, DEFAULT_MAX_NUMBER);
        assert!(template.attributes.contains_key("ncpus"));
        assert_eq!(template.extra.get("priority"), Some(&Value::from(5)));
        assert!(catalog.find("large").is_none());
    }

    #[rstest]
    #[case(r#"{"templates":[{"templateId":" ","instanceType":"A","image":"B"}]}"#, "templateId")]
    #[case(
        r#"{"templates":[{"templateId":"a","instanceType":"A","image":"B"},
            {"templateId":"a","instanceType":"A","image":"B"}]}"#,
        "duplicate"
    )]
    #[case(r#"{"templates":[{"templateId":"a","instanceType":"","image":"B"}]}"#, "instanceType")]
    #[case(r#"{"templates":[{"templateId":"a","instanceType":"A","image":""}]}"#, "image")]
    fn rejects_invalid_templates(#[case] raw: &str, #[case] needle: &str) {
        let Err(err) = TemplateCatalog::parse(Utf8Path::new(PATH), raw) else {
            panic!("catalog should be rejected");
        };
        assert!(matches!(err, TemplateError::Invalid { .. }), "unexpected error {err}");
        assert!(err.to_string().contains(needle), "error should mention {needle}: {err}");
    }

    #[rstest]
    fn malformed_json_is_a_parse_error() {
        let Err(err) = TemplateCatalog::parse(Utf8Path::new(PATH), "[") else {
            panic!("catalog should be rejected");
        };
        assert!(matches!(err, TemplateError::Parse { .. }));
    }
}
