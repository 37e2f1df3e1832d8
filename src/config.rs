// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Externals description layout.
//!
//! An __externals description__ is a small configuration file that declares a
//! set of externals. Each external is a source tree pinned to some reference
//! of a remote repository, checked out at a path relative to the directory
//! that holds the description.
//!
//! # General Layout
//!
//! A description is made of sections. The `externals_description` section
//! carries metadata, most importantly the schema version. Every other section
//! declares one external, and the name of the section is the name of the
//! external.
//!
//! ```ini
//! [externals_description]
//! schema_version = 1.0.0
//!
//! [simp_tag]
//! local_path = externals/simp_tag
//! protocol = git
//! repo_url = ${REPO_ROOT}/simple-ext.git
//! tag = tag1
//! required = True
//! ```
//!
//! Oxternals reads descriptions written either as INI (the traditional
//! `externals.cfg`) or as TOML (any file ending in `.toml`). Both syntaxes
//! are first flattened into a [`RawDescription`], i.e., plain string values,
//! before being validated into a [`DescriptionDocument`]. Unrecognized items
//! are ignored so that newer minor schema revisions can add fields.

use crate::path::{normalize_relative, paths_overlap};

use ini::Ini;
use semver::Version;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Name of metadata section.
pub const DESCRIPTION_SECTION: &str = "externals_description";

/// Name of schema version item in metadata section.
pub const VERSION_ITEM: &str = "schema_version";

/// Major schema version understood by this build.
pub const SUPPORTED_MAJOR_VERSION: u64 = 1;

const LOCAL_PATH: &str = "local_path";
const PATH_ALIAS: &str = "path";
const PROTOCOL: &str = "protocol";
const REPO_URL: &str = "repo_url";
const TAG: &str = "tag";
const BRANCH: &str = "branch";
const HASH: &str = "hash";
const REQUIRED: &str = "required";
const EXTERNALS: &str = "externals";

/// Untyped description: section name to item name to value.
pub type RawDescription = BTreeMap<String, BTreeMap<String, String>>;

/// Validated externals description.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescriptionDocument {
    /// Schema version the description was written against.
    pub schema_version: Version,

    /// Declared externals keyed by name.
    pub entries: BTreeMap<String, DependencyEntry>,
}

impl DescriptionDocument {
    /// Load description from file.
    ///
    /// Descriptions ending in ".toml" are parsed as TOML, everything else is
    /// parsed as INI.
    ///
    /// # Errors
    ///
    /// - Return [`DescriptionError::Read`] if file cannot be read.
    /// - Return [`DescriptionError::Toml`] or [`DescriptionError::Ini`] for
    ///   syntax errors.
    /// - Return any validation error of [`DescriptionDocument::from_raw`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = read_to_string(path).map_err(|err| DescriptionError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        match DescriptionFormat::from_path(path) {
            DescriptionFormat::Toml => data.parse(),
            DescriptionFormat::Ini => Self::from_ini_str(&data),
        }
    }

    /// Parse description written in INI syntax.
    pub fn from_ini_str(data: &str) -> Result<Self> {
        let ini = Ini::load_from_str(data)?;
        let mut raw = RawDescription::new();

        // INVARIANT: Items outside of any section carry no meaning.
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                continue;
            };

            let items = raw.entry(section.to_string()).or_default();
            for (key, value) in properties.iter() {
                items.insert(key.to_string(), value.to_string());
            }
        }

        Self::from_raw(raw)
    }

    /// Validate raw description.
    ///
    /// Checks schema version first, so that a description written against an
    /// unknown schema is never interpreted any further.
    ///
    /// # Errors
    ///
    /// - Return [`DescriptionError::Schema`] if schema version is missing,
    ///   invalid, or unsupported.
    /// - Return [`DescriptionError::MalformedEntry`] if any external is
    ///   malformed, or two externals share a destination.
    ///
    /// A repository URL that refers to an unset environment variable does not
    /// fail validation. It is kept on its external as
    /// [`DependencyEntry::unresolved`], so that only that external fails.
    pub fn from_raw(mut raw: RawDescription) -> Result<Self> {
        let metadata = raw
            .remove(DESCRIPTION_SECTION)
            .ok_or(SchemaError::MissingSection)?;
        let version = metadata
            .get(VERSION_ITEM)
            .ok_or(SchemaError::MissingVersion)?
            .trim();
        let schema_version = Version::parse(version).map_err(|err| SchemaError::Invalid {
            source: err,
            version: version.to_string(),
        })?;
        if schema_version.major != SUPPORTED_MAJOR_VERSION {
            return Err(SchemaError::Unsupported(schema_version).into());
        }

        let mut entries = BTreeMap::new();
        for (name, items) in raw {
            let entry = DependencyEntry::from_items(name.clone(), &items)?;
            entries.insert(name, entry);
        }

        check_destinations(&entries)?;

        Ok(Self {
            schema_version,
            entries,
        })
    }
}

impl FromStr for DescriptionDocument {
    type Err = DescriptionError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let table: toml::Table = toml::de::from_str(data).map_err(DescriptionError::Toml)?;
        let mut raw = RawDescription::new();

        // INVARIANT: Anything that is not a plain value in a section is an
        //   unrecognized item, and is skipped like any other.
        for (section, value) in table {
            let toml::Value::Table(items) = value else {
                continue;
            };

            let flat = items
                .into_iter()
                .filter_map(|(key, value)| match value {
                    toml::Value::String(value) => Some((key, value)),
                    toml::Value::Boolean(value) => Some((key, value.to_string())),
                    toml::Value::Integer(value) => Some((key, value.to_string())),
                    toml::Value::Float(value) => Some((key, value.to_string())),
                    _ => None,
                })
                .collect();
            raw.insert(section, flat);
        }

        Self::from_raw(raw)
    }
}

impl Display for DescriptionDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut table = toml::Table::new();
        table.insert(
            DESCRIPTION_SECTION.into(),
            toml::Value::try_from(MetadataLayout {
                schema_version: self.schema_version.to_string(),
            })
            .map_err(DescriptionError::Serialize)?,
        );
        for entry in self.entries.values() {
            table.insert(
                entry.name.clone(),
                toml::Value::try_from(EntryLayout::from(entry)).map_err(DescriptionError::Serialize)?,
            );
        }

        fmt.write_str(
            toml::ser::to_string_pretty(&table)
                .map_err(DescriptionError::Serialize)?
                .as_str(),
        )
    }
}

/// Syntax a description file is written in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionFormat {
    #[default]
    Ini,
    Toml,
}

impl DescriptionFormat {
    /// Select syntax by file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Ini,
        }
    }
}

/// One declared external.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DependencyEntry {
    /// Name of external, unique in its description.
    pub name: String,

    /// Destination relative to the directory holding the description.
    pub path: PathBuf,

    /// Backend to manage external with.
    pub protocol: Protocol,

    /// Remote to obtain external from, with environment expanded.
    pub repo_url: Option<String>,

    /// Reference to pin external to.
    pub reference: Option<Reference>,

    /// Whether external must be present.
    pub required: bool,

    /// Name of nested description expected inside external's working tree.
    pub externals: Option<String>,

    /// Variable of repository URL that could not be expanded.
    ///
    /// The URL is kept as written when set.
    pub unresolved: Option<UnresolvedVariable>,
}

impl DependencyEntry {
    fn from_items(name: String, items: &BTreeMap<String, String>) -> Result<Self> {
        let item = |key: &str| {
            items
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
        };
        let malformed = |reason: String| DescriptionError::MalformedEntry {
            entry: name.clone(),
            reason,
        };

        let protocol = item(PROTOCOL)
            .ok_or_else(|| malformed("missing protocol".into()))?
            .parse::<Protocol>()
            .map_err(|err| malformed(err.to_string()))?;

        let required = match item(REQUIRED) {
            Some(value) => parse_bool(value)
                .ok_or_else(|| malformed(format!("required must be true or false, not {value:?}")))?,
            None => true,
        };

        let externals = item(EXTERNALS)
            .filter(|value| !value.eq_ignore_ascii_case("none"))
            .map(ToString::to_string);

        let path = item(LOCAL_PATH)
            .or_else(|| item(PATH_ALIAS))
            .unwrap_or(name.as_str());
        let path = normalize_relative(path)
            .ok_or_else(|| malformed(format!("path {path:?} must be relative")))?;

        let mut references = Vec::new();
        if let Some(tag) = item(TAG) {
            references.push(Reference::Tag(tag.to_string()));
        }
        if let Some(branch) = item(BRANCH) {
            references.push(Reference::Branch(branch.to_string()));
        }
        if let Some(hash) = item(HASH) {
            references.push(Reference::Hash(hash.to_string()));
        }

        if protocol == Protocol::ExternalsOnly {
            if externals.is_none() {
                return Err(malformed("externals_only requires externals".into()));
            }

            return Ok(Self {
                name,
                path,
                protocol,
                repo_url: None,
                reference: None,
                required,
                externals,
                unresolved: None,
            });
        }

        if path.as_os_str().is_empty() {
            return Err(malformed("path must not be the description directory".into()));
        }

        if references.len() > 1 {
            return Err(malformed("only one of tag, branch, or hash may be set".into()));
        }
        let reference = references
            .pop()
            .ok_or_else(|| malformed("one of tag, branch, or hash must be set".into()))?;

        let repo_url = item(REPO_URL).ok_or_else(|| malformed("missing repo_url".into()))?;
        let (repo_url, unresolved) = match shellexpand::full(repo_url) {
            Ok(expanded) => (expanded.into_owned(), None),
            Err(err) => (
                repo_url.to_string(),
                Some(UnresolvedVariable {
                    entry: name.clone(),
                    variable: err.var_name,
                    source: err.cause,
                }),
            ),
        };

        Ok(Self {
            name,
            path,
            protocol,
            repo_url: Some(repo_url),
            reference: Some(reference),
            required,
            externals,
            unresolved,
        })
    }

    /// Declared target of external.
    ///
    /// Only externals backed by a repository have a target.
    pub fn target(&self) -> Option<Target> {
        match (&self.repo_url, &self.reference) {
            (Some(url), Some(reference)) => Some(Target::new(url.clone(), reference.clone())),
            _ => None,
        }
    }
}

/// Backend protocol of an external.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[default]
    Git,
    Svn,

    /// No repository of its own, only points at a nested description.
    ExternalsOnly,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Svn => "svn",
            Self::ExternalsOnly => "externals_only",
        }
    }
}

impl FromStr for Protocol {
    type Err = DescriptionError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "svn" => Ok(Self::Svn),
            "externals_only" => Ok(Self::ExternalsOnly),
            _ => Err(DescriptionError::UnknownProtocol(data.to_string())),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Reference into a repository's history.
///
/// Serves both as the pinned reference of an external, and as the reference
/// a working tree currently sits on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Branch(String),
    Hash(String),
}

impl Reference {
    /// Name of reference without its kind.
    pub fn value(&self) -> &str {
        match self {
            Self::Tag(value) | Self::Branch(value) | Self::Hash(value) => value.as_str(),
        }
    }
}

impl Display for Reference {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Tag(tag) => write!(fmt, "tag {tag}"),
            Self::Branch(branch) => write!(fmt, "branch {branch}"),
            Self::Hash(hash) => write!(fmt, "hash {hash}"),
        }
    }
}

/// Remote and reference an external is declared to sit on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub url: String,
    pub reference: Reference,
}

impl Target {
    pub fn new(url: impl Into<String>, reference: Reference) -> Self {
        Self {
            url: url.into(),
            reference,
        }
    }
}

impl Display for Target {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} at {}", self.reference, self.url)
    }
}

#[derive(Serialize)]
struct MetadataLayout {
    schema_version: String,
}

#[derive(Serialize)]
struct EntryLayout<'a> {
    local_path: String,
    protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
    required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    externals: Option<&'a str>,
}

impl<'a> From<&'a DependencyEntry> for EntryLayout<'a> {
    fn from(entry: &'a DependencyEntry) -> Self {
        let (tag, branch, hash) = match &entry.reference {
            Some(Reference::Tag(tag)) => (Some(tag.as_str()), None, None),
            Some(Reference::Branch(branch)) => (None, Some(branch.as_str()), None),
            Some(Reference::Hash(hash)) => (None, None, Some(hash.as_str())),
            None => (None, None, None),
        };

        Self {
            local_path: match entry.path.as_os_str().is_empty() {
                true => ".".into(),
                false => entry.path.to_string_lossy().into_owned(),
            },
            protocol: entry.protocol.as_str(),
            repo_url: entry.repo_url.as_deref(),
            tag,
            branch,
            hash,
            required: entry.required,
            externals: entry.externals.as_deref(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

// INVARIANT: Sibling externals never share or nest destinations.
//   - Externals only entries point into existing directories, so they are
//     exempt.
fn check_destinations(entries: &BTreeMap<String, DependencyEntry>) -> Result<()> {
    let managed = entries
        .values()
        .filter(|entry| entry.protocol != Protocol::ExternalsOnly)
        .collect::<Vec<_>>();

    for (index, first) in managed.iter().enumerate() {
        for second in &managed[index + 1..] {
            if paths_overlap(&first.path, &second.path) {
                return Err(DescriptionError::MalformedEntry {
                    entry: second.name.clone(),
                    reason: format!(
                        "destination {:?} overlaps destination {:?} of {}",
                        second.path.display(),
                        first.path.display(),
                        first.name
                    ),
                });
            }
        }
    }

    Ok(())
}

/// Schema version error types.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Metadata section is absent.
    #[error("missing [externals_description] section")]
    MissingSection,

    /// Schema version item is absent.
    #[error("missing schema_version in [externals_description] section")]
    MissingVersion,

    /// Schema version is not a valid version.
    #[error("invalid schema version {version:?}")]
    Invalid {
        #[source]
        source: semver::Error,
        version: String,
    },

    /// Schema version is valid, but has unknown major version.
    #[error("unsupported schema version {0}, expected 1.x.x")]
    Unsupported(Version),
}

/// Description error types.
#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    /// Description file cannot be read.
    #[error("failed to read description at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to parse description as TOML.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Failed to parse description as INI.
    #[error(transparent)]
    Ini(#[from] ini::ParseError),

    /// Failed to serialize description.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Schema version cannot be accepted.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// An external is malformed.
    #[error("external {entry:?} is malformed: {reason}")]
    MalformedEntry { entry: String, reason: String },

    /// Protocol is not known.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

}

/// Repository URL of an external refers to unset environment variable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("external {entry:?} refers to unset variable {variable:?}")]
pub struct UnresolvedVariable {
    #[source]
    pub source: std::env::VarError,
    pub entry: String,
    pub variable: String,
}

impl From<DescriptionError> for FmtError {
    fn from(_: DescriptionError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = DescriptionError> = std::result::Result<T, E>;
