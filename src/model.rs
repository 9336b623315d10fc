// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! The store data model: content addresses, derivations, derived paths,
//! realisations and garbage-collection options.
//!
//! Everything here is immutable once constructed; the printable forms are
//! canonical and are what travels on the wire.

use crate::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Hash algorithm usable in a content address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgo {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::Protocol(format!("HashAlgo({})", s))),
        }
    }
}

/// How the contents fed to an add-to-store operation are turned into a
/// content address. The rendered form ("text:sha256", "fixed:r:sha256", ...)
/// is the operation's wire argument on protocol minor 25+.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaMethod {
    /// Flat text, always SHA-256.
    Text,
    /// A flat file hashed as-is.
    Flat(HashAlgo),
    /// An archive of a file tree, hashed recursively.
    Recursive(HashAlgo),
}

impl CaMethod {
    pub fn render(&self) -> String {
        match self {
            Self::Text => "text:sha256".into(),
            Self::Flat(algo) => format!("fixed:{}", algo),
            Self::Recursive(algo) => format!("fixed:r:{}", algo),
        }
    }
}

/// An assertion that a store path is content-addressed, eg.
/// `fixed:r:sha256:1a2b...`. The empty rendering stands for "none" on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentAddress {
    /// Flat text addressed by its SHA-256 hash.
    Text { hash: String },
    /// A flat file addressed by a hash of its contents.
    Flat { algo: HashAlgo, hash: String },
    /// A file tree addressed by a hash over its archive serialisation.
    Recursive { algo: HashAlgo, hash: String },
}

impl ContentAddress {
    pub fn render(&self) -> String {
        match self {
            Self::Text { hash } => format!("text:sha256:{}", hash),
            Self::Flat { algo, hash } => format!("fixed:{}:{}", algo, hash),
            Self::Recursive { algo, hash } => format!("fixed:r:{}:{}", algo, hash),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("ContentAddress({})", s)))?;
        match prefix {
            "text" => {
                let hash = rest
                    .strip_prefix("sha256:")
                    .ok_or_else(|| Error::Protocol(format!("ContentAddress({})", s)))?;
                Ok(Self::Text { hash: hash.into() })
            }
            "fixed" => {
                let (recursive, rest) = match rest.strip_prefix("r:") {
                    Some(rest) => (true, rest),
                    None => (false, rest),
                };
                let (algo, hash) = rest
                    .split_once(':')
                    .ok_or_else(|| Error::Protocol(format!("ContentAddress({})", s)))?;
                let algo = algo.parse()?;
                let hash = hash.to_string();
                Ok(if recursive {
                    Self::Recursive { algo, hash }
                } else {
                    Self::Flat { algo, hash }
                })
            }
            _ => Err(Error::Protocol(format!("ContentAddress({})", s))),
        }
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Which outputs of a derivation a [`DerivedPath::Built`] wants realised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputsSpec {
    /// All outputs, rendered as `*`.
    All,
    /// A specific non-empty set of output names.
    Names(BTreeSet<String>),
}

impl OutputsSpec {
    pub fn render(&self) -> String {
        match self {
            Self::All => "*".into(),
            Self::Names(names) => names.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Self::All
        } else {
            Self::Names(s.split(',').map(str::to_string).collect())
        }
    }
}

/// Something the daemon can be asked to realise: either a store path that
/// must simply exist, or outputs of a derivation (whose path may itself be
/// the output of another derivation, hence the recursion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedPath {
    /// A plain store path.
    Opaque(String),
    /// Outputs of a derivation.
    Built {
        drv_path: Box<DerivedPath>,
        outputs: OutputsSpec,
    },
}

impl DerivedPath {
    /// Convenience constructor for the common one-level case.
    pub fn built(drv_path: impl Into<String>, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Built {
            drv_path: Box::new(Self::Opaque(drv_path.into())),
            outputs: OutputsSpec::Names(outputs.into_iter().map(Into::into).collect()),
        }
    }

    /// The `!`-separated printable form used on the wire, eg.
    /// `/depot/store/aaaa-hello.drv!out`.
    pub fn render(&self) -> String {
        match self {
            Self::Opaque(path) => path.clone(),
            Self::Built { drv_path, outputs } => {
                format!("{}!{}", drv_path.render(), outputs.render())
            }
        }
    }

    pub fn parse(s: &str) -> Self {
        let mut segments = s.split('!');
        let mut path = Self::Opaque(segments.next().unwrap_or_default().to_string());
        for outputs in segments {
            path = Self::Built {
                drv_path: Box::new(path),
                outputs: OutputsSpec::parse(outputs),
            };
        }
        path
    }

    /// The store path at the root of this derived path.
    pub fn base_store_path(&self) -> &str {
        match self {
            Self::Opaque(path) => path,
            Self::Built { drv_path, .. } => drv_path.base_store_path(),
        }
    }
}

impl std::fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// One output slot of a [`Derivation`].
///
/// For input-addressed derivations `path` is fixed up front and the hash
/// fields are empty; fixed-output derivations carry the expected hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    pub path: String,
    pub hash_algo: String,
    pub hash: String,
}

/// A self-contained description of how to build one or more outputs.
///
/// Output names are unique by construction and must be non-empty; `out` is
/// the conventional default.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Derivation {
    pub outputs: BTreeMap<String, DerivationOutput>,
    /// Derivations whose outputs this one consumes, by output name.
    pub input_drvs: BTreeMap<String, BTreeSet<String>>,
    /// Plain store paths this derivation consumes.
    pub input_srcs: Vec<String>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// The identity of a specific output of a content-addressed derivation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DrvOutput {
    /// Hash modulo of the derivation.
    pub drv_hash: String,
    /// Name of the output.
    pub output: String,
}

impl DrvOutput {
    pub fn render(&self) -> String {
        format!("{}!{}", self.drv_hash, self.output)
    }
}

impl std::fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for DrvOutput {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (drv_hash, output) = s
            .split_once('!')
            .ok_or_else(|| Error::Protocol(format!("DrvOutput({})", s)))?;
        Ok(Self {
            drv_hash: drv_hash.into(),
            output: output.into(),
        })
    }
}

impl Serialize for DrvOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

impl<'de> Deserialize<'de> for DrvOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The resolved mapping from a [`DrvOutput`] to a concrete store path after
/// building. Travels as a JSON-encoded byte-string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: String,
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Realisations this one depends on, keyed by rendered [`DrvOutput`].
    #[serde(default)]
    pub dependent_realisations: BTreeMap<String, String>,
}

impl Realisation {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("realisation serialisation cannot fail")
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|err| Error::Protocol(format!("Realisation: {}", err)))
    }
}

/// What a garbage-collection run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum GcAction {
    /// Return the set of paths reachable from (i.e. in the closure of) the roots.
    ReturnLive = 0,
    /// Return the set of paths not reachable from the roots.
    ReturnDead = 1,
    /// Delete all dead paths.
    DeleteDead = 2,
    /// Delete the paths listed in [`GcOptions::paths_to_delete`], refusing if
    /// any are alive unless liveness is ignored.
    DeleteSpecific = 3,
}
impl From<TryFromPrimitiveError<GcAction>> for Error {
    fn from(value: TryFromPrimitiveError<GcAction>) -> Self {
        Self::Protocol(format!("GcAction({:x})", value.number))
    }
}

/// Options for [`crate::store::Store::collect_garbage()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcOptions {
    pub action: GcAction,
    /// Paths to delete when action is [`GcAction::DeleteSpecific`].
    pub paths_to_delete: Vec<String>,
    /// Delete paths even when they are reachable from a root.
    pub ignore_liveness: bool,
    /// Stop after freeing this many bytes.
    pub max_freed: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            paths_to_delete: Vec::new(),
            ignore_liveness: false,
            max_freed: u64::MAX,
        }
    }
}

/// What a garbage-collection run did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcResults {
    /// Depending on the action: live paths, dead paths, or deleted paths.
    pub paths: Vec<String>,
    pub bytes_freed: u64,
}

/// One entry in the reply to
/// [`crate::store::Store::query_substitutable_path_infos()`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubstitutablePathInfo {
    pub deriver: Option<String>,
    pub references: Vec<String>,
    pub download_size: u64,
    pub nar_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_address_roundtrip() {
        for s in [
            "text:sha256:0yjycizc8v9950dz9a69a7qlzcba9gl2gls8svi1g1i75xxf206d",
            "fixed:sha1:k3v6nv2ca2hzv06vhnzmlisp3d1pb9hw",
            "fixed:r:sha256:17hx6jdm0gajj4cmsszlzbwzjxq8cypws73rz5fcij7yq3s6q4iw",
        ] {
            assert_eq!(s, ContentAddress::parse(s).unwrap().render());
        }
    }

    #[test]
    fn test_content_address_bad() {
        assert!(ContentAddress::parse("fixed").is_err());
        assert!(ContentAddress::parse("text:md5:abcd").is_err());
        assert!(ContentAddress::parse("dynamic:sha256:abcd").is_err());
    }

    #[test]
    fn test_ca_method_render() {
        assert_eq!("text:sha256", CaMethod::Text.render());
        assert_eq!("fixed:sha256", CaMethod::Flat(HashAlgo::Sha256).render());
        assert_eq!("fixed:r:sha256", CaMethod::Recursive(HashAlgo::Sha256).render());
    }

    #[test]
    fn test_derived_path_opaque() {
        let p = DerivedPath::parse("/depot/store/ffffffffffffffffffffffffffffffff-zlib-1.3");
        assert_eq!(
            DerivedPath::Opaque("/depot/store/ffffffffffffffffffffffffffffffff-zlib-1.3".into()),
            p
        );
        assert_eq!("/depot/store/ffffffffffffffffffffffffffffffff-zlib-1.3", p.render());
    }

    #[test]
    fn test_derived_path_built() {
        let p = DerivedPath::built("/depot/store/aaaa-hello.drv", ["dev", "out"]);
        assert_eq!("/depot/store/aaaa-hello.drv!dev,out", p.render());
        assert_eq!(p, DerivedPath::parse("/depot/store/aaaa-hello.drv!dev,out"));
        assert_eq!("/depot/store/aaaa-hello.drv", p.base_store_path());
    }

    #[test]
    fn test_derived_path_dynamic() {
        // A derivation whose path is itself the output of a derivation.
        let p = DerivedPath::parse("/depot/store/aaaa-gen.drv!out!dev");
        assert_eq!(
            DerivedPath::Built {
                drv_path: Box::new(DerivedPath::Built {
                    drv_path: Box::new(DerivedPath::Opaque("/depot/store/aaaa-gen.drv".into())),
                    outputs: OutputsSpec::parse("out"),
                }),
                outputs: OutputsSpec::parse("dev"),
            },
            p
        );
        assert_eq!("/depot/store/aaaa-gen.drv!out!dev", p.render());
    }

    #[test]
    fn test_outputs_spec_all() {
        assert_eq!(OutputsSpec::All, OutputsSpec::parse("*"));
        assert_eq!("*", OutputsSpec::All.render());
    }

    #[test]
    fn test_drv_output_roundtrip() {
        let id: DrvOutput = "sha256:3c126cf4c0fec8c85cf9791ccdaf670877f9f9fa!out"
            .parse()
            .unwrap();
        assert_eq!("sha256:3c126cf4c0fec8c85cf9791ccdaf670877f9f9fa", id.drv_hash);
        assert_eq!("out", id.output);
        assert_eq!("sha256:3c126cf4c0fec8c85cf9791ccdaf670877f9f9fa!out", id.render());
        assert!("no-separator".parse::<DrvOutput>().is_err());
    }

    #[test]
    fn test_realisation_json() {
        let r = Realisation {
            id: "sha256:abcd!out".parse().unwrap(),
            out_path: "/depot/store/ffffffffffffffffffffffffffffffff-hello-1.0".into(),
            signatures: vec!["cache.example.org-1:deadbeef".into()],
            dependent_realisations: BTreeMap::new(),
        };
        let json = r.to_json();
        assert!(json.contains("\"id\":\"sha256:abcd!out\""), "{}", json);
        assert!(json.contains("\"outPath\""), "{}", json);
        assert_eq!(r, Realisation::from_json(&json).unwrap());
    }

    #[test]
    fn test_realisation_json_defaults() {
        let r = Realisation::from_json(
            r#"{"id":"sha256:abcd!out","outPath":"/depot/store/aaaa-hello"}"#,
        )
        .unwrap();
        assert_eq!(Vec::<String>::new(), r.signatures);
        assert!(r.dependent_realisations.is_empty());
    }
}
