//! `package.json` synthesis.

use serde_json::{json, Map, Value};

/// Packages resolved to a fixed version range. Everything else is `latest`,
/// so two builds of the same submission may resolve different versions.
const PINNED: &[(&str, &str)] = &[
    ("express", "^4.18.2"),
    ("axios", "^1.6.0"),
    ("dotenv", "^16.0.0"),
    ("cors", "^2.8.5"),
    ("body-parser", "^1.20.2"),
];

pub fn pinned_version(package: &str) -> Option<&'static str> {
    PINNED
        .iter()
        .find(|(name, _)| *name == package)
        .map(|(_, version)| *version)
}

/// Build the dependency manifest for a service image.
pub fn render(container_name: &str, dependencies: &[String]) -> Value {
    let mut deps = Map::new();
    for dep in dependencies {
        let dep = dep.trim();
        if dep.is_empty() {
            continue;
        }
        let version = pinned_version(dep).unwrap_or("latest");
        deps.insert(dep.to_string(), Value::String(version.to_string()));
    }

    json!({
        "name": container_name,
        "version": "1.0.0",
        "main": "index.js",
        "scripts": { "start": "node index.js" },
        "dependencies": deps,
    })
}
