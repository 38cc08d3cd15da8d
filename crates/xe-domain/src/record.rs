use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A concrete package produced by resolution.
///
/// The wire casing (`Name`, `Version`, `DownloadURL`, `Hash`) is the stable
/// solution-document schema; lowercase aliases are accepted on read so older
/// documents keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Version", alias = "version")]
    pub version: String,
    #[serde(rename = "DownloadURL", alias = "download_url", alias = "url", default)]
    pub url: String,
    #[serde(
        rename = "Hash",
        alias = "hash",
        alias = "sha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sha256: Option<String>,
}

/// The full flat resolution for a requirement set against one interpreter.
/// Immutable once persisted under its solve key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveGraph {
    pub python_version: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
}

/// Collapse duplicate records by `(lowercase name, version)`, keeping the
/// last occurrence, and return them sorted by `(name, version)`.
pub fn dedupe_packages(packages: Vec<PackageRecord>) -> Vec<PackageRecord> {
    let mut seen: BTreeMap<(String, String), PackageRecord> = BTreeMap::new();
    for pkg in packages {
        let key = (pkg.name.to_lowercase(), pkg.version.clone());
        seen.insert(key, pkg);
    }
    let mut out: Vec<PackageRecord> = seen.into_values().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    out
}

/// Identity used when matching a record against an installed `.dist-info`
/// entry: lowercase with `-` and `.` folded to `_`, the way wheel metadata
/// directories spell names on disk.
pub fn normalize_package_identity(name: &str) -> String {
    name.trim().to_lowercase().replace(['-', '.'], "_")
}

pub fn package_identity_key(name: &str, version: &str) -> String {
    format!("{}=={}", normalize_package_identity(name), version.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: version.to_string(),
            url: format!("https://files.example/{name}-{version}.whl"),
            sha256: None,
        }
    }

    #[test]
    fn dedupe_collapses_case_variants_and_sorts() {
        let out = dedupe_packages(vec![
            record("Requests", "2.32.0"),
            record("idna", "3.7"),
            record("requests", "2.32.0"),
            record("idna", "3.6"),
        ]);
        let names: Vec<_> = out
            .iter()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect();
        assert_eq!(
            names,
            vec!["idna==3.6", "idna==3.7", "requests==2.32.0"]
        );
    }

    #[test]
    fn identity_folds_separators() {
        assert_eq!(normalize_package_identity("Foo-Bar.baz"), "foo_bar_baz");
        assert_eq!(
            package_identity_key("typing-extensions", " 4.12.2 "),
            "typing_extensions==4.12.2"
        );
    }

    #[test]
    fn solution_document_uses_stable_casing() {
        let graph = SolveGraph {
            python_version: "3.12".into(),
            requirements: vec!["requests".into()],
            packages: vec![PackageRecord {
                name: "requests".into(),
                version: "2.32.0".into(),
                url: "https://files.example/requests.whl".into(),
                sha256: Some("ab".repeat(32)),
            }],
        };
        let json = serde_json::to_value(&graph).expect("encode");
        assert_eq!(json["packages"][0]["Name"], "requests");
        assert!(json["packages"][0]["DownloadURL"].is_string());
        assert!(json["packages"][0]["Hash"].is_string());

        let legacy = serde_json::json!({
            "python_version": "3.12",
            "packages": [{"name": "idna", "version": "3.7", "url": "u"}],
        });
        let decoded: SolveGraph = serde_json::from_value(legacy).expect("decode legacy casing");
        assert_eq!(decoded.packages[0].name, "idna");
        assert_eq!(decoded.packages[0].sha256, None);
    }
}
