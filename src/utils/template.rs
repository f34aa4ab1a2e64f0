//! String template rendering utilities.

use std::collections::BTreeMap;

pub struct TemplateVars;

impl TemplateVars {
    pub const RELEASE_PATH: &'static str = "release_path";
    pub const RELEASE_ID: &'static str = "release_id";
    pub const DEPLOY_PATH: &'static str = "deploy_path";
    pub const SHARED_PATH: &'static str = "shared_path";
}

pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

/// Render with values passed through `escape` (e.g. shell quoting for secrets).
pub fn render_map_with(
    template: &str,
    variables: &BTreeMap<String, String>,
    escape: impl Fn(&str) -> String,
) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, &escape(value));
        }
    }

    result
}

pub fn is_present(template: &str, key: &str) -> bool {
    let placeholder = format!("{{{{{}}}}}", key);
    template.contains(&placeholder)
}
