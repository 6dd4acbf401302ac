use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use semver::{Version, VersionReq};
use serde::{
    de::{self, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};

use super::{error::ModelError, metadata::Digest};

static MODEL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("model id pattern is valid")
});

#[must_use]
pub fn is_valid_model_id(model_id: &str) -> bool {
    MODEL_ID_PATTERN.is_match(model_id) && !model_id.contains("..")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    #[serde(rename = "fp32")]
    Fp32,
    #[serde(rename = "fp16")]
    Fp16,
    #[serde(rename = "int8")]
    Int8,
    #[serde(rename = "int4")]
    Int4,
    #[serde(rename = "q4-k-m", alias = "q4_k_m")]
    Q4KM,
    #[serde(rename = "q5-k-m", alias = "q5_k_m")]
    Q5KM,
    #[serde(rename = "q8-0", alias = "q8_0")]
    Q80,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VersionRecord {
    pub version: Version,
    pub checksum: Digest,
    pub download_url: String,
    pub size_bytes: u64,
    pub compatibility: Vec<VersionReq>,
    pub release_date: Option<String>,
    pub changelog: String,
    pub deprecated: bool,
    pub security: bool,
    pub minimum_ram_gb: Option<f64>,
    pub recommended_ram_gb: Option<f64>,
    pub variant: Option<ModelVariant>,
}

impl VersionRecord {
    /// An empty compatibility list accepts every host version.
    #[must_use]
    pub fn is_compatible_with(&self, host: &Version) -> bool {
        self.compatibility.is_empty() || self.compatibility.iter().any(|req| req.matches(host))
    }

    #[must_use]
    pub fn compatibility_ranges(&self) -> Vec<String> {
        self.compatibility.iter().map(ToString::to_string).collect()
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        filename_from_uri(&self.download_url).unwrap_or_else(|| "model.bin".into())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub name: String,
    pub description: String,
    pub current_version: Version,
    pub versions: BTreeMap<Version, VersionRecord>,
    pub tags: Vec<String>,
    pub category: Option<String>,
}

impl ModelDescriptor {
    #[must_use]
    pub fn version(&self, version: &Version) -> Option<&VersionRecord> {
        self.versions.get(version)
    }

    #[must_use]
    pub fn current(&self) -> Option<&VersionRecord> {
        self.versions.get(&self.current_version)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuarantinedEntry {
    pub model_id: String,
    pub version: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    Url(String),
    File(PathBuf),
}

impl RegistrySource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            RegistrySource::Url(trimmed.to_string())
        } else if let Some(path) = trimmed.strip_prefix("file://") {
            RegistrySource::File(PathBuf::from(path))
        } else {
            RegistrySource::File(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrySource::Url(url) => f.write_str(url),
            RegistrySource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Immutable view of one registry fetch. Refreshing replaces the whole value.
#[derive(Debug, Clone, Serialize)]
pub struct Registry {
    pub registry_version: Option<String>,
    pub last_updated: Option<String>,
    models: BTreeMap<String, ModelDescriptor>,
    quarantined: Vec<QuarantinedEntry>,
}

impl Registry {
    pub fn fetch(source: &RegistrySource, client: &Client) -> Result<Self, ModelError> {
        let bytes = match source {
            RegistrySource::Url(url) => fetch_url(url, client)?,
            RegistrySource::File(path) => fetch_file(path)?,
        };
        let registry = Self::from_json(&bytes)?;
        tracing::info!(
            "Loaded registry from {source}: {} model(s), {} quarantined entr(ies)",
            registry.models.len(),
            registry.quarantined.len()
        );
        Ok(registry)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let document: RegistryDocument =
            serde_json::from_slice(bytes).map_err(|error| ModelError::RegistryMalformed {
                reason: error.to_string(),
            })?;
        document.validate()
    }

    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(model_id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    #[must_use]
    pub fn quarantined(&self) -> &[QuarantinedEntry] {
        &self.quarantined
    }

    /// Resolves `version`, or the model's current version when `None`.
    pub fn resolve(
        &self,
        model_id: &str,
        version: Option<&Version>,
    ) -> Result<&VersionRecord, ModelError> {
        let descriptor = self.model(model_id).ok_or(ModelError::UnknownModel)?;
        let wanted = version.unwrap_or(&descriptor.current_version);
        descriptor
            .version(wanted)
            .ok_or_else(|| ModelError::UnknownVersion {
                version: wanted.clone(),
            })
    }
}

fn fetch_url(url: &str, client: &Client) -> Result<Vec<u8>, ModelError> {
    let unreachable = |reason: String| ModelError::RegistryUnreachable {
        source_name: url.to_string(),
        reason,
    };
    let response = client
        .get(url)
        .send()
        .map_err(|error| unreachable(error.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(unreachable(format!("HTTP {status}")));
    }
    response
        .bytes()
        .map(|bytes| bytes.to_vec())
        .map_err(|error| unreachable(error.to_string()))
}

fn fetch_file(path: &Path) -> Result<Vec<u8>, ModelError> {
    fs::read(path).map_err(|error| ModelError::RegistryUnreachable {
        source_name: path.display().to_string(),
        reason: error.to_string(),
    })
}

#[derive(Deserialize)]
struct RegistryDocument {
    #[serde(deserialize_with = "unique_models")]
    models: Vec<(String, RawModel)>,
    #[serde(default)]
    registry_version: Option<String>,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Deserialize)]
struct RawModel {
    #[serde(default)]
    model_id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    current_version: String,
    versions: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
struct RawVersion {
    #[serde(default)]
    version: Option<String>,
    checksum: String,
    download_url: String,
    size_bytes: u64,
    #[serde(default)]
    compatibility: Vec<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    changelog: String,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    security: bool,
    #[serde(default)]
    minimum_ram_gb: Option<f64>,
    #[serde(default)]
    recommended_ram_gb: Option<f64>,
    #[serde(default)]
    variant: Option<ModelVariant>,
}

fn unique_models<'de, D>(deserializer: D) -> Result<Vec<(String, RawModel)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueModels;

    impl<'de> Visitor<'de> for UniqueModels {
        type Value = Vec<(String, RawModel)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of model_id to model descriptor")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries: Vec<(String, RawModel)> = Vec::new();
            while let Some((key, model)) = map.next_entry::<String, RawModel>()? {
                if entries.iter().any(|(existing, _)| existing == &key) {
                    return Err(de::Error::custom(format!("duplicate model_id `{key}`")));
                }
                entries.push((key, model));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(UniqueModels)
}

impl RegistryDocument {
    fn validate(self) -> Result<Registry, ModelError> {
        let mut models = BTreeMap::new();
        let mut quarantined = Vec::new();

        for (key, raw) in self.models {
            if let Some(declared) = &raw.model_id {
                if declared != &key {
                    return Err(ModelError::RegistryMalformed {
                        reason: format!("entry `{key}` declares model_id `{declared}`"),
                    });
                }
            }
            let current_version = Version::parse(raw.current_version.trim()).map_err(|error| {
                ModelError::RegistryMalformed {
                    reason: format!(
                        "model `{key}` has invalid current_version `{}`: {error}",
                        raw.current_version
                    ),
                }
            })?;

            if !is_valid_model_id(&key) {
                quarantine(&mut quarantined, &key, None, "model_id is not a safe identifier");
                continue;
            }

            let mut versions = BTreeMap::new();
            for (version_key, value) in raw.versions {
                match parse_version_entry(&version_key, value) {
                    Ok(record) => {
                        versions.insert(record.version.clone(), record);
                    }
                    Err(reason) => quarantine(&mut quarantined, &key, Some(&version_key), &reason),
                }
            }

            if !versions.contains_key(&current_version) {
                quarantine(
                    &mut quarantined,
                    &key,
                    None,
                    &format!("current_version {current_version} has no valid version entry"),
                );
                continue;
            }

            models.insert(
                key.clone(),
                ModelDescriptor {
                    model_id: key,
                    name: raw.name,
                    description: raw.description,
                    current_version,
                    versions,
                    tags: raw.tags,
                    category: raw.category,
                },
            );
        }

        Ok(Registry {
            registry_version: self.registry_version,
            last_updated: self.last_updated,
            models,
            quarantined,
        })
    }
}

fn quarantine(
    quarantined: &mut Vec<QuarantinedEntry>,
    model_id: &str,
    version: Option<&str>,
    reason: &str,
) {
    match version {
        Some(version) => {
            tracing::warn!("Skipping registry entry {model_id}@{version}: {reason}")
        }
        None => tracing::warn!("Skipping registry model {model_id}: {reason}"),
    }
    quarantined.push(QuarantinedEntry {
        model_id: model_id.to_string(),
        version: version.map(ToOwned::to_owned),
        reason: reason.to_string(),
    });
}

fn parse_version_entry(key: &str, value: serde_json::Value) -> Result<VersionRecord, String> {
    let version =
        Version::parse(key.trim()).map_err(|error| format!("invalid version key: {error}"))?;
    let raw: RawVersion =
        serde_json::from_value(value).map_err(|error| format!("invalid entry: {error}"))?;

    if let Some(declared) = &raw.version {
        let declared = Version::parse(declared.trim())
            .map_err(|error| format!("invalid version field: {error}"))?;
        if declared != version {
            return Err(format!("version field {declared} does not match key"));
        }
    }

    let checksum: Digest = raw
        .checksum
        .parse()
        .map_err(|error| format!("invalid checksum: {error}"))?;

    let url = reqwest::Url::parse(&raw.download_url)
        .map_err(|error| format!("invalid download_url: {error}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported download_url scheme `{}`", url.scheme()));
    }

    if raw.size_bytes == 0 {
        return Err("size_bytes must be greater than zero".into());
    }

    let compatibility = raw
        .compatibility
        .iter()
        .map(|range| {
            VersionReq::parse(range.trim())
                .map_err(|error| format!("invalid compatibility range `{range}`: {error}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VersionRecord {
        version,
        checksum,
        download_url: raw.download_url,
        size_bytes: raw.size_bytes,
        compatibility,
        release_date: raw.release_date,
        changelog: raw.changelog,
        deprecated: raw.deprecated,
        security: raw.security,
        minimum_ram_gb: raw.minimum_ram_gb,
        recommended_ram_gb: raw.recommended_ram_gb,
        variant: raw.variant,
    })
}

fn filename_from_uri(uri: &str) -> Option<String> {
    let last_segment = uri.split('/').last()?;
    let clean = last_segment.split('?').next()?.split('#').next()?.trim();
    if clean.is_empty() || clean == ".." || clean == "." {
        None
    } else {
        Some(clean.to_string())
    }
}
