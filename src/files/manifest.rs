use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Packages generated apps may add on top of the preset manifest.
pub const ALLOWED_DEPENDENCIES: &[&str] = &[
    "axios",
    "lodash",
    "date-fns",
    "uuid",
    "clsx",
    "zustand",
    "react-hook-form",
    "zod",
    "recharts",
    "lucide-react",
    "framer-motion",
    "react-router-dom",
    "react-query",
    "@tanstack/react-query",
];

static AUTO_APPROVED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^@types/").expect("valid regex"));
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

pub fn is_dependency_allowed(name: &str) -> bool {
    ALLOWED_DEPENDENCIES.contains(&name) || AUTO_APPROVED.is_match(name)
}

/// Parses a manifest, retrying once with trailing commas removed.
pub fn parse_lenient(raw: &str, label: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(manifest = label, error = %error, "manifest is not valid JSON, retrying without trailing commas");
            let repaired = TRAILING_COMMA.replace_all(raw, "$1");
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::warn!(manifest = label, error = %error, "manifest repair failed");
                    None
                }
            }
        }
    }
}

fn string_map(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

fn merge_section(preset: &Value, generated: &Value, section: &str) -> (Map<String, Value>, Vec<String>) {
    let mut merged = string_map(preset.get(section));
    let mut rejected = Vec::new();
    for (name, version) in string_map(generated.get(section)) {
        if merged.contains_key(&name) {
            continue;
        }
        if is_dependency_allowed(&name) {
            merged.insert(name, version);
        } else {
            rejected.push(name);
        }
    }
    (merged, rejected)
}

/// Combines the preset manifest with a generated one. Preset versions win for
/// packages both declare; new packages are admitted only when allow-listed.
/// Any parse or serialization failure yields the preset manifest unchanged.
pub fn merge_package_json(preset_raw: &str, generated_raw: &str) -> String {
    let Some(preset) = parse_lenient(preset_raw, "preset") else {
        return preset_raw.to_string();
    };
    let Some(generated) = parse_lenient(generated_raw, "generated") else {
        return preset_raw.to_string();
    };
    let Value::Object(mut merged) = preset.clone() else {
        return preset_raw.to_string();
    };

    let (dependencies, rejected) = merge_section(&preset, &generated, "dependencies");
    let (dev_dependencies, rejected_dev) = merge_section(&preset, &generated, "devDependencies");
    if !rejected.is_empty() || !rejected_dev.is_empty() {
        tracing::warn!(
            rejected = ?rejected,
            rejected_dev = ?rejected_dev,
            "dropped dependencies outside the allow-list"
        );
    }
    merged.insert("dependencies".to_string(), Value::Object(dependencies));
    merged.insert("devDependencies".to_string(), Value::Object(dev_dependencies));

    match serde_json::to_string_pretty(&Value::Object(merged)) {
        Ok(serialized) if serde_json::from_str::<Value>(&serialized).is_ok() => serialized,
        _ => preset_raw.to_string(),
    }
}

/// Result of writing approved dependencies into the install manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Injection {
    pub manifest: String,
    pub injected: Vec<String>,
    pub rejected: Vec<String>,
}

pub fn inject_dependencies(manifest_raw: &str, approved: &BTreeMap<String, String>) -> AppResult<Injection> {
    let mut manifest: Value = serde_json::from_str(manifest_raw)
        .map_err(|error| AppError::Internal(format!("package.json is not valid JSON: {}", error)))?;
    let Some(root) = manifest.as_object_mut() else {
        return Err(AppError::Internal("package.json root is not an object".to_string()));
    };

    let dependencies = root
        .entry("dependencies")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(dependencies) = dependencies.as_object_mut() else {
        return Err(AppError::Internal("package.json dependencies is not an object".to_string()));
    };

    let mut injection = Injection::default();
    for (name, version) in approved {
        if is_dependency_allowed(name) {
            dependencies.insert(name.clone(), Value::String(version.clone()));
            injection.injected.push(name.clone());
        } else {
            injection.rejected.push(name.clone());
        }
    }
    injection.manifest = serde_json::to_string_pretty(&manifest)?;
    Ok(injection)
}

#[cfg(test)]
mod tests {
    use super::{inject_dependencies, is_dependency_allowed, merge_package_json, parse_lenient};
    use std::collections::BTreeMap;

    const PRESET: &str = r#"{"name":"app","dependencies":{"react":"^18.3.1"},"devDependencies":{"vite":"^5.4.0"}}"#;

    #[test]
    fn allow_list_includes_type_packages() {
        assert!(is_dependency_allowed("zod"));
        assert!(is_dependency_allowed("@types/lodash"));
        assert!(!is_dependency_allowed("left-pad"));
    }

    #[test]
    fn preset_versions_win() {
        let merged = merge_package_json(PRESET, r#"{"dependencies":{"react":"^17.0.0","clsx":"^2.1.0"}}"#);
        let value: serde_json::Value = serde_json::from_str(&merged).expect("json");
        assert_eq!(value["dependencies"]["react"], "^18.3.1");
        assert_eq!(value["dependencies"]["clsx"], "^2.1.0");
        assert_eq!(value["name"], "app");
    }

    #[test]
    fn dev_dependencies_use_the_same_gate() {
        let merged = merge_package_json(
            PRESET,
            r#"{"devDependencies":{"@types/uuid":"^9.0.0","webpack":"^5.0.0"}}"#,
        );
        let value: serde_json::Value = serde_json::from_str(&merged).expect("json");
        assert_eq!(value["devDependencies"]["@types/uuid"], "^9.0.0");
        assert!(value["devDependencies"].get("webpack").is_none());
    }

    #[test]
    fn invalid_generated_manifest_falls_back_to_preset() {
        assert_eq!(merge_package_json(PRESET, "not json"), PRESET);
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let value = parse_lenient(r#"{"dependencies": {"zod": "^3.23.0",},}"#, "test").expect("repaired");
        assert_eq!(value["dependencies"]["zod"], "^3.23.0");
    }

    #[test]
    fn injection_skips_unapproved_packages() {
        let mut approved = BTreeMap::new();
        approved.insert("recharts".to_string(), "^2.12.0".to_string());
        approved.insert("shady-lib".to_string(), "1.0.0".to_string());
        let injection = inject_dependencies(PRESET, &approved).expect("inject");
        assert_eq!(injection.injected, vec!["recharts".to_string()]);
        assert_eq!(injection.rejected, vec!["shady-lib".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&injection.manifest).expect("json");
        assert_eq!(value["dependencies"]["recharts"], "^2.12.0");
        assert_eq!(value["dependencies"]["react"], "^18.3.1");
    }
}
