// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! depot-daemon
//! ============
//!
//! This library exposes an asynchronous client for the worker protocol spoken
//! by a depot build daemon: a privileged process that owns a content-addressed
//! object store and realises, inserts and garbage-collects immutable artifacts
//! on behalf of local clients.
//!
//! - To talk to a daemon, build a [`store::DaemonStore`] (through the
//!   [`store::Store`] trait). Connections are managed by a bounded,
//!   failure-aware [`pool::Pool`] so one store can be shared across tasks.
//! - Out-of-band log lines, activities and progress results that the daemon
//!   interleaves with every reply are delivered to a [`Logger`] of your
//!   choosing; [`TracingLogger`] forwards them to `tracing`.
//!
//! The protocol is negotiated at connection time: the daemon announces its
//! version, the client answers with its own, and the lower of the two gates
//! every message shape from then on. Daemons older than protocol minor 21 are
//! rejected; newer daemons run in compatibility mode, so an old build of this
//! crate keeps working against newer daemons.

pub mod daemon;
pub mod model;
pub mod pool;
pub mod store;

use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use std::collections::BTreeMap;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) trait ResultExt<T, E> {
    fn with_field(self, f: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T, E> for Result<T, E> {
    fn with_field(self, f: &'static str) -> Result<T> {
        self.map_err(|err| Error::Field(f, Box::new(err.into())))
    }
}

/// Error enum for the library.
#[derive(Debug, Error)]
pub enum Error {
    /// This error was encountered while reading/writing a specific field.
    #[error("`{0}`: {1}")]
    Field(&'static str, #[source] Box<Error>),

    /// The peer sent something the wire grammar does not allow: a bad magic
    /// number, an unknown frame tag, an oversized or misaligned byte-string.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation (or one of its argument encodings) is not available at
    /// the negotiated protocol version.
    #[error("unsupported by the daemon: {0}")]
    Unsupported(String),

    /// Opening a connection failed once; the pool refuses to try again.
    #[error("opening a connection to the daemon previously failed")]
    PoolFailed,

    /// Error returned from the daemon.
    #[error("{0}")]
    Remote(DaemonError),

    /// A realisation expected to exist after a build could not be resolved.
    #[error("cannot operate on output `{0}`: no realisation was found")]
    MissingRealisation(String),

    /// IO error on the underlying transport.
    #[error(transparent)]
    Io(std::io::Error),

    /// The peer closed the stream in the middle of a frame.
    #[error("unexpected end of file")]
    EndOfFile,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::EndOfFile
        } else {
            Self::Io(err)
        }
    }
}

impl Error {
    /// Whether a connection that observed this error must be assumed out of
    /// sync and closed rather than returned to the pool.
    pub fn poisons_connection(&self) -> bool {
        match self {
            Self::Field(_, inner) => inner.poisons_connection(),
            Self::Protocol(_) | Self::Remote(_) | Self::Io(_) | Self::EndOfFile => true,
            Self::Unsupported(_) | Self::PoolFailed | Self::MissingRealisation(_) => false,
        }
    }
}

/// A thrown exception from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonError {
    pub level: Verbosity,
    pub msg: String,
    pub traces: Vec<String>,
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.level, self.msg)?;
        for trace in self.traces.iter() {
            write!(f, "\n\t{}", trace)?;
        }
        Ok(())
    }
}

/// Type of a [`StderrStartActivity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrActivityType {
    Unknown = 0,
    CopyPath = 100,
    FileTransfer = 101,
    Realise = 102,
    CopyPaths = 103,
    Builds = 104,
    Build = 105,
    OptimiseStore = 106,
    VerifyPaths = 107,
    Substitute = 108,
    QueryPathInfo = 109,
    PostBuildHook = 110,
    BuildWaiting = 111,
}
impl From<TryFromPrimitiveError<StderrActivityType>> for Error {
    fn from(value: TryFromPrimitiveError<StderrActivityType>) -> Self {
        Self::Protocol(format!("StderrActivityType({:x})", value.number))
    }
}

/// Notification that an activity (such as a build) has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrStartActivity {
    /// Activity ID. The same act_id is passed to [`Logger::stop_activity`]
    /// and in any [`StderrResult`] for this activity.
    pub act_id: u64,
    /// Log level of this activity.
    pub level: Verbosity,
    /// Type of the activity.
    pub kind: StderrActivityType,
    /// Log message.
    pub s: String,
    /// Additional fields. The meaning of these depend on the value of .kind.
    pub fields: Vec<StderrField>,
    /// Parent activity, or 0 if this is the top-level one.
    pub parent_id: u64,
}

/// Type of a [`StderrResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrResultType {
    FileLinked = 100,
    BuildLogLine = 101,
    UntrustedPath = 102,
    CorruptedPath = 103,
    SetPhase = 104,
    Progress = 105,
    SetExpected = 106,
    PostBuildLogLine = 107,
}
impl From<TryFromPrimitiveError<StderrResultType>> for Error {
    fn from(value: TryFromPrimitiveError<StderrResultType>) -> Self {
        Self::Protocol(format!("StderrResultType({:x})", value.number))
    }
}

/// Notification that a result of some kind (see [`StderrResultType`]) has been produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrResult {
    /// Activity ID of the [`StderrStartActivity`] this result belongs to.
    pub act_id: u64,
    /// Type of the result.
    pub kind: StderrResultType,
    /// Additional fields. The meaning of these depend on the value of .kind.
    pub fields: Vec<StderrField>,
}

/// A raw field used in [`StderrStartActivity`] and [`StderrResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrField {
    Int(u64),
    String(String),
}

impl StderrField {
    /// If this is a Self::Int, return the value, else None.
    pub fn as_int(&self) -> Option<&u64> {
        if let Self::Int(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// If this is a Self::String, return the value, else None.
    pub fn as_string(&self) -> Option<&String> {
        if let Self::String(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

/// Verbosity of a log line, activity or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Verbosity {
    Error = 0,
    Warn,
    Notice,
    Info,
    Talkative,
    Chatty,
    Debug,
    Vomit,
}
impl From<TryFromPrimitiveError<Verbosity>> for Error {
    fn from(value: TryFromPrimitiveError<Verbosity>) -> Self {
        Self::Protocol(format!("Verbosity({:x})", value.number))
    }
}

/// Whether the daemon considers this client trusted. Only announced by
/// daemons speaking protocol minor 35 or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedFlag {
    Trusted,
    NotTrusted,
}

/// Receives the out-of-band log lines, activities and progress results the
/// daemon interleaves with every reply.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// middle of the protocol loop.
pub trait Logger: Send + Sync {
    /// A plain log line, delivered at the given level.
    fn log(&self, level: Verbosity, msg: &str);
    fn start_activity(&self, act: &StderrStartActivity);
    fn stop_activity(&self, act_id: u64);
    fn result(&self, result: &StderrResult);
}

/// Default [`Logger`] forwarding everything to [`tracing`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Verbosity, msg: &str) {
        match level {
            Verbosity::Error => tracing::error!("{}", msg),
            Verbosity::Warn | Verbosity::Notice => tracing::warn!("{}", msg),
            Verbosity::Info => tracing::info!("{}", msg),
            Verbosity::Talkative | Verbosity::Chatty => tracing::debug!("{}", msg),
            Verbosity::Debug | Verbosity::Vomit => tracing::trace!("{}", msg),
        }
    }

    fn start_activity(&self, act: &StderrStartActivity) {
        tracing::debug!(act_id = act.act_id, kind = ?act.kind, parent = act.parent_id, "{}", act.s);
    }

    fn stop_activity(&self, act_id: u64) {
        tracing::debug!(act_id, "activity finished");
    }

    fn result(&self, result: &StderrResult) {
        tracing::trace!(act_id = result.act_id, kind = ?result.kind, fields = ?result.fields, "progress");
    }
}

/// Passed to [`store::Store::build_paths()`] and [`store::Store::build_paths_with_results()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildMode {
    Normal,
    Repair,
    Check,
}
impl From<TryFromPrimitiveError<BuildMode>> for Error {
    fn from(value: TryFromPrimitiveError<BuildMode>) -> Self {
        Self::Protocol(format!("BuildMode({:x})", value.number))
    }
}

/// Status code for a [`BuildResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildResultStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    /// Possibly transient; callers may retry.
    TransientFailure = 6,
    CachedFailure = 7,
    /// Retryable by the caller.
    TimedOut = 8,
    MiscFailure = 9,
    /// Terminal failure with a secondary cause in the error message.
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
    ResolvesToAlreadyValid = 13,
    NoSubstituters = 14,
}
impl From<TryFromPrimitiveError<BuildResultStatus>> for Error {
    fn from(value: TryFromPrimitiveError<BuildResultStatus>) -> Self {
        Self::Protocol(format!("BuildResultStatus({:x})", value.number))
    }
}

impl BuildResultStatus {
    /// The build (or an equivalent substitution) produced valid outputs.
    pub fn success(&self) -> bool {
        matches!(
            self,
            Self::Built | Self::Substituted | Self::AlreadyValid | Self::ResolvesToAlreadyValid
        )
    }
}

/// Returned from [`store::Store::build_paths_with_results()`] and
/// [`store::Store::build_derivation()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Status code, see [`BuildResultStatus`].
    pub status: BuildResultStatus,
    /// Verbatim error message, or "" if none.
    pub error_msg: String,
    /// How many times this derivation was built. Only present on minor 29+.
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    /// Map of output name to realisation. Only present on minor 28+.
    pub built_outputs: BTreeMap<String, model::Realisation>,
}

/// Passed to [`store::Store::set_options()`], and applied once to every fresh
/// connection right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Whether to keep temporary directories of failed builds.
    ///
    /// Default: `false`
    pub keep_failed: bool,

    /// Whether to keep building derivations when another build fails.
    ///
    /// Default: `false`
    pub keep_going: bool,

    /// Whether to fall back to building from source if a binary substitution fails.
    ///
    /// Default: `false`
    pub try_fallback: bool,

    /// Verbosity.
    ///
    /// Default: [`Verbosity::Error`].
    pub verbosity: Verbosity,

    /// Number of derivations the daemon will attempt to build in parallel.
    ///
    /// 0 = no local builds, only remote builds and substitutions.
    ///
    /// Default: `1`
    pub max_build_jobs: u64,

    /// Number of seconds a build is allowed to produce no stdout or stderr
    /// output before it is killed.
    ///
    /// Default: `0`
    pub max_silent_time: u64,

    /// Whether to show build log output in real time.
    pub verbose_build: bool,

    /// How many cores an individual build may use. 0 = all available cores on
    /// the builder machine. This is different from
    /// [`ClientSettings::max_build_jobs`], which controls how many builds run
    /// in parallel.
    ///
    /// Default: `0`
    pub build_cores: u64,

    /// Whether to use binary substitutes if available.
    ///
    /// Default: `true`
    pub use_substitutes: bool,

    /// Free-form setting overrides, sent verbatim in lexicographic order.
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Error,
            max_build_jobs: 1,
            max_silent_time: 0,
            verbose_build: true,
            build_cores: 0,
            use_substitutes: true,
            overrides: BTreeMap::default(),
        }
    }
}

/// Metadata for one valid store path, like `depot path-info` would return.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathInfo {
    /// The first derivation that produced this path, if any. May no longer be
    /// in the store; use [`store::Store::query_valid_derivers()`] for the
    /// derivers that are.
    pub deriver: Option<String>,

    /// Other store paths referenced by this path.
    pub references: Vec<String>,

    /// Archive hash, in the form "(algo)-(hash)".
    pub nar_hash: String,
    /// Archive size.
    pub nar_size: u64,

    /// Is this path "ultimately trusted", eg. built locally?
    pub ultimate: bool,
    /// Optional signatures, eg. from a binary cache.
    pub signatures: Vec<String>,
    /// An assertion that this path is content-addressed.
    pub ca: Option<String>,

    /// When the path was registered, eg. placed into the local store.
    pub registration_time: DateTime<Utc>,
}

/// Returned from [`store::Store::query_missing()`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Missing {
    /// Paths that will be built.
    pub will_build: Vec<String>,
    /// Paths that will be substituted.
    pub will_substitute: Vec<String>,
    /// Paths we don't know what will happen to.
    pub unknown: Vec<String>,
    /// Despite the name, the extracted size of all substituted paths.
    pub download_size: u64,
    /// Total size of all archives to download from a substituter.
    pub nar_size: u64,
}
