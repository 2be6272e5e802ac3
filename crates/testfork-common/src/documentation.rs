// Builds links into the user guide for error messages.

use anyhow::{Context, Result};
use url::Url;

/// Resolves user-guide pages and sections against a configurable base URL.
#[derive(Debug, Clone)]
pub struct DocumentationRegistry {
    base_url: Url,
}

impl DocumentationRegistry {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid documentation URL '{base_url}'"))?;
        // Url::join replaces the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Link to `page`, e.g. `documentation_for("test_execution", None)`.
    pub fn documentation_for(&self, page: &str, section: Option<&str>) -> String {
        let mut url = match self.base_url.join(&format!("{page}.html")) {
            Ok(url) => url,
            Err(_) => self.base_url.clone(),
        };
        url.set_fragment(section);
        url.to_string()
    }
}

impl Default for DocumentationRegistry {
    fn default() -> Self {
        Self {
            base_url: Url::parse(crate::constants::DEFAULT_DOCUMENTATION_URL)
                .unwrap_or_else(|_| unreachable!("default documentation URL is valid")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_section_are_joined() {
        let docs = DocumentationRegistry::new("https://docs.example.com/guide").unwrap();
        assert_eq!(
            docs.documentation_for("java_testing", Some("sec:test_execution")),
            "https://docs.example.com/guide/java_testing.html#sec:test_execution"
        );
    }

    #[test]
    fn default_registry_has_no_fragment_without_section() {
        let docs = DocumentationRegistry::default();
        let link = docs.documentation_for("test_execution", None);
        assert!(link.ends_with("/userguide/test_execution.html"));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(DocumentationRegistry::new("not a url").is_err());
    }
}
