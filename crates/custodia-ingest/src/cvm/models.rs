//! CVM artifact and catalog models

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use url::Url;

use super::listing::ListingEntry;
use super::{timestamp, CvmError, Result};

/// The two families of CVM fund files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Fund register (cadastro)
    Register,
    /// Daily quota and equity report (informe diário)
    Position,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Register, ArtifactKind::Position];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Register => "register",
            ArtifactKind::Position => "position",
        }
    }

    /// Listing paths relative to the base URL: (path, is_historical)
    pub fn remote_paths(&self) -> [(&'static str, bool); 2] {
        match self {
            ArtifactKind::Register => [("CAD/DADOS/", false), ("CAD/DADOS/HIST/", true)],
            ArtifactKind::Position => [
                ("DOC/INF_DIARIO/DADOS/", false),
                ("DOC/INF_DIARIO/DADOS/HIST/", true),
            ],
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = CvmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "register" => Ok(ArtifactKind::Register),
            "position" => Ok(ArtifactKind::Position),
            other => Err(CvmError::UnknownKind(other.to_string())),
        }
    }
}

/// One listing page to mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub kind: ArtifactKind,
    pub is_historical: bool,
    pub url: Url,
}

impl RemoteSource {
    /// The four standard CVM sources under `base`
    pub fn standard(base: &Url) -> Result<Vec<RemoteSource>> {
        let mut sources = Vec::new();
        for kind in ArtifactKind::ALL {
            for (path, is_historical) in kind.remote_paths() {
                sources.push(RemoteSource {
                    kind,
                    is_historical,
                    url: base.join(path)?,
                });
            }
        }
        Ok(sources)
    }
}

/// A remote file that can be compared against the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    /// File name without extension
    pub name: String,
    pub href: String,
    pub url: String,
    pub size: Option<i64>,
    pub last_modified: NaiveDateTime,
    pub is_historical: bool,
}

impl ArtifactDescriptor {
    /// Build a descriptor from a listing row.
    ///
    /// Directories (no size) and undated rows yield `None`.
    pub fn from_listing(source: &RemoteSource, entry: &ListingEntry) -> Option<Self> {
        let size = entry.size?;
        let last_modified = entry.last_modified?;
        Some(Self {
            kind: source.kind,
            name: artifact_name(&entry.name),
            href: entry.href.clone(),
            url: entry.url.to_string(),
            size: i64::try_from(size).ok(),
            last_modified,
            is_historical: source.is_historical,
        })
    }
}

/// Base identifier of a remote file: no extension, no dots
pub fn artifact_name(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    stem.replace('.', "_")
}

/// Row of the catalog journal
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CatalogEntry {
    pub url: String,
    pub source: String,
    pub kind: String,
    pub name: String,
    pub href: String,
    pub size: Option<i64>,
    pub last_modified: String,
    pub is_historical: bool,
    pub first_seen: String,
    pub last_downloaded: Option<String>,
    pub last_processed: Option<String>,
    pub needs_processing: bool,
    pub active: bool,
}

impl CatalogEntry {
    pub fn artifact_kind(&self) -> Result<ArtifactKind> {
        self.kind.parse()
    }

    pub fn last_modified_at(&self) -> Result<NaiveDateTime> {
        timestamp::parse(&self.last_modified)
    }

    pub fn last_downloaded_at(&self) -> Result<Option<NaiveDateTime>> {
        self.last_downloaded.as_deref().map(timestamp::parse).transpose()
    }

    pub fn last_processed_at(&self) -> Result<Option<NaiveDateTime>> {
        self.last_processed.as_deref().map(timestamp::parse).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_standard_sources() {
        let base = Url::parse("https://dados.cvm.gov.br/dados/FI/").unwrap();
        let sources = RemoteSource::standard(&base).unwrap();
        let urls: Vec<String> = sources.iter().map(|s| s.url.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://dados.cvm.gov.br/dados/FI/CAD/DADOS/",
                "https://dados.cvm.gov.br/dados/FI/CAD/DADOS/HIST/",
                "https://dados.cvm.gov.br/dados/FI/DOC/INF_DIARIO/DADOS/",
                "https://dados.cvm.gov.br/dados/FI/DOC/INF_DIARIO/DADOS/HIST/",
            ]
        );
        assert!(sources[1].is_historical);
        assert_eq!(sources[2].kind, ArtifactKind::Position);
    }

    #[test]
    fn test_artifact_name_strips_extension() {
        assert_eq!(artifact_name("inf_diario_fi_202401.zip"), "inf_diario_fi_202401");
        assert_eq!(artifact_name("cad_fi.csv"), "cad_fi");
        assert_eq!(artifact_name("extrato.v2.csv"), "extrato_v2");
        assert_eq!(artifact_name("README"), "README");
    }

    #[test]
    fn test_descriptor_filters_directories_and_undated_rows() {
        let source = RemoteSource {
            kind: ArtifactKind::Register,
            is_historical: false,
            url: Url::parse("https://example.test/CAD/DADOS/").unwrap(),
        };
        let stamp = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(8, 0, 0);
        let mut entry = ListingEntry {
            name: "cad_fi.csv".to_string(),
            href: "cad_fi.csv".to_string(),
            url: Url::parse("https://example.test/CAD/DADOS/cad_fi.csv").unwrap(),
            size: Some(1024),
            last_modified: stamp,
        };
        let descriptor = ArtifactDescriptor::from_listing(&source, &entry).unwrap();
        assert_eq!(descriptor.name, "cad_fi");
        assert_eq!(descriptor.size, Some(1024));

        entry.size = None;
        assert!(ArtifactDescriptor::from_listing(&source, &entry).is_none());
        entry.size = Some(1);
        entry.last_modified = None;
        assert!(ArtifactDescriptor::from_listing(&source, &entry).is_none());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in ArtifactKind::ALL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
        assert!(matches!(
            "quota".parse::<ArtifactKind>(),
            Err(CvmError::UnknownKind(_))
        ));
    }
}
