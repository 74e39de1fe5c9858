use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use esmcdn_common::{CdnError, Result};

/// The slice of package.json the pipeline reads. `exports` and `imports`
/// stay raw; condition resolution happens in the build job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageJson {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type", default)]
    pub pkg_type: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub typings: Option<String>,
    #[serde(default)]
    pub exports: Option<Value>,
    #[serde(default)]
    pub imports: Option<Value>,
    #[serde(default, deserialize_with = "de_browser")]
    pub browser: BTreeMap<String, BrowserEntry>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(rename = "peerDependencies", default)]
    pub peer_dependencies: BTreeMap<String, String>,
}

/// A browser-field substitution: a replacement specifier, or exclusion
/// (`false` in package.json) yielding an empty module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEntry {
    Replace(String),
    Exclude,
}

/// The browser field is either a bare string (an alternate main) or a map of
/// specifier → replacement-or-false. Both normalize to a map; the bare form
/// becomes a `"."` entry.
fn de_browser<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, BrowserEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    match value {
        Value::String(main) => {
            map.insert(".".to_string(), BrowserEntry::Replace(main));
        }
        Value::Object(entries) => {
            for (key, entry) in entries {
                match entry {
                    Value::String(to) => {
                        map.insert(key, BrowserEntry::Replace(to));
                    }
                    Value::Bool(false) => {
                        map.insert(key, BrowserEntry::Exclude);
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(map)
}

impl PackageJson {
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("package.json");
        let raw = tokio::fs::read(&path).await.map_err(|e| {
            CdnError::Install(format!("missing package.json in {}: {e}", dir.display()))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| CdnError::Install(format!("invalid package.json in {}: {e}", dir.display())))
    }

    /// The declared ES-module entry, when the package has one.
    pub fn es_module_entry(&self) -> Option<&str> {
        if let Some(module) = self.module.as_deref() {
            return Some(module);
        }
        if self.pkg_type.as_deref() == Some("module") {
            return self.main.as_deref().or(Some("index.js"));
        }
        None
    }

    /// The CJS main entry (`main` or the implied `index.js`).
    pub fn main_entry(&self) -> &str {
        self.main.as_deref().unwrap_or("index.js")
    }

    pub fn types_entry(&self) -> Option<&str> {
        self.types.as_deref().or(self.typings.as_deref())
    }

    /// Look up a specifier in the browser map, trying the exact form and the
    /// common `./`-prefixed relative form.
    pub fn browser_substitution(&self, specifier: &str) -> Option<&BrowserEntry> {
        self.browser.get(specifier).or_else(|| {
            specifier
                .strip_prefix("./")
                .and_then(|bare| self.browser.get(bare))
                .or_else(|| self.browser.get(&format!("./{specifier}")))
        })
    }
}
