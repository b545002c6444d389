// =============================================================================
// Prompt template library
// =============================================================================
//
// A directory of UTF-8 `.txt` files; each filename stem is a template name,
// addressed by the engine at call time. Grounded on the reference prompt
// manager's named-file addressing with degrade-to-default behavior, but
// trimmed to a plain in-memory map loaded once at startup rather than a
// watched/reloadable singleton — no process-global mutable state.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

pub const DEFAULT_TEMPLATE_NAME: &str = "default";

const FALLBACK_DEFAULT_TEMPLATE: &str = "\
You are an autonomous crypto-derivatives trading analyst. You manage a live \
account and must reason carefully about risk before proposing any action. \
Favor capital preservation over chasing every opportunity.";

#[derive(Clone)]
pub struct TemplateLibrary {
    templates: HashMap<String, String>,
}

impl TemplateLibrary {
    /// Loads every `*.txt` file in `dir` as a named template. Missing or
    /// unreadable directories degrade to an empty library (callers still get
    /// the compiled-in fallback default via `get`).
    pub async fn load(dir: &Path) -> Self {
        let mut templates = HashMap::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
                    match tokio::fs::read_to_string(&path).await {
                        Ok(content) => {
                            templates.insert(stem.to_string(), content);
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to read prompt template"),
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "prompt template directory unavailable, using compiled-in default only");
            }
        }
        Self { templates }
    }

    pub fn from_map(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// Looks up `name`; degrades to the `default` template (on disk, or the
    /// compiled-in fallback text if even `default` is missing) when absent.
    pub fn get(&self, name: &str) -> &str {
        if let Some(text) = self.templates.get(name) {
            return text;
        }
        if name != DEFAULT_TEMPLATE_NAME {
            warn!(requested = name, "prompt template not found, falling back to default");
        }
        self.templates
            .get(DEFAULT_TEMPLATE_NAME)
            .map(String::as_str)
            .unwrap_or(FALLBACK_DEFAULT_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_template_degrades_to_default() {
        let mut map = HashMap::new();
        map.insert("default".to_string(), "DEFAULT TEXT".to_string());
        let lib = TemplateLibrary::from_map(map);
        assert_eq!(lib.get("aggressive"), "DEFAULT TEXT");
    }

    #[test]
    fn known_template_is_returned() {
        let mut map = HashMap::new();
        map.insert("default".to_string(), "DEFAULT TEXT".to_string());
        map.insert("conservative".to_string(), "CONSERVATIVE TEXT".to_string());
        let lib = TemplateLibrary::from_map(map);
        assert_eq!(lib.get("conservative"), "CONSERVATIVE TEXT");
    }

    #[test]
    fn empty_library_falls_back_to_compiled_in_text() {
        let lib = TemplateLibrary::from_map(HashMap::new());
        assert_eq!(lib.get("default"), FALLBACK_DEFAULT_TEMPLATE);
    }
}
