// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! The public store interface and its daemon-backed implementation.
//!
//! [`Store`] is the seam between callers and store backends: every backend
//! speaks the same operation grammar, whether it reaches a daemon over a
//! local socket, a remote one over SSH, or something else entirely.
//! [`DaemonStore`] is the worker-protocol implementation: it keeps a
//! [`Pool`] of handshaken connections, borrows one per operation, poisons
//! it when an operation leaves the stream in an unknown state, and papers
//! over version differences by emulating newer operations on older daemons.

use crate::daemon::{wire, DaemonConnection, Proto};
use crate::model::{
    CaMethod, ContentAddress, Derivation, DerivedPath, DrvOutput, GcOptions, GcResults,
    OutputsSpec, Realisation, SubstitutablePathInfo,
};
use crate::pool::{Pool, PoolGuard};
use crate::{
    BuildMode, BuildResult, BuildResultStatus, ClientSettings, Error, Logger, Missing, PathInfo,
    Result, TracingLogger, TrustedFlag, Verbosity,
};
use chrono::DateTime;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::instrument;

/// One path in a batch upload: its store path, metadata, and archive bytes.
#[derive(Debug)]
pub struct PathToCopy<R> {
    pub path: String,
    pub info: PathInfo,
    pub nar: R,
}

/// Generic interface to a build store.
///
/// All methods take `&self`; implementations provide their own internal
/// synchronisation so one store can be shared across tasks.
pub trait Store: Send + Sync {
    /// Returns whether a store path is valid.
    fn is_valid_path(&self, path: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Returns which of the passed paths are valid.
    fn query_valid_paths(
        &self,
        paths: &[String],
        use_substituters: bool,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns every valid path in the store.
    fn query_all_valid_paths(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns which of the passed paths a substituter can provide.
    fn query_substitutable_paths(
        &self,
        paths: &[String],
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns substitution metadata (deriver, references, sizes) for the
    /// given paths, keyed by path.
    fn query_substitutable_path_infos(
        &self,
        paths: &BTreeMap<String, Option<ContentAddress>>,
    ) -> impl Future<Output = Result<HashMap<String, SubstitutablePathInfo>>> + Send;

    /// Returns a [`PathInfo`] for the given path, or `None` if invalid.
    fn query_path_info(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Option<PathInfo>>> + Send;

    /// Returns the paths that reference the given path.
    fn query_referrers(&self, path: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns the derivations in the store that can produce a path. Unlike
    /// [`PathInfo::deriver`], this doesn't lie to you.
    fn query_valid_derivers(&self, path: &str)
        -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns the known output paths of a derivation.
    fn query_derivation_outputs(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns a map of output name to store path (where known) for the
    /// given derivation, unioned with a statically-known map if supplied.
    fn query_partial_derivation_output_map(
        &self,
        path: &str,
        static_outputs: Option<HashMap<String, Option<String>>>,
    ) -> impl Future<Output = Result<HashMap<String, Option<String>>>> + Send;

    /// Looks up a store path by the hash part of its base name.
    fn query_path_from_hash_part(
        &self,
        hash_part: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Takes a list of targets and queries which would be built, substituted
    /// or unknown, with size estimates.
    fn query_missing(
        &self,
        targets: &[DerivedPath],
    ) -> impl Future<Output = Result<Missing>> + Send;

    /// Queries the realisation of a derivation output. Returns `None` (with
    /// a warning) against daemons that predate realisations.
    fn query_realisation(
        &self,
        id: &DrvOutput,
    ) -> impl Future<Output = Result<Option<Realisation>>> + Send;

    /// Adds data to the store under a content address; returns the resulting
    /// path and its metadata.
    fn add_ca_to_store<R: AsyncRead + Unpin + Send>(
        &self,
        name: &str,
        method: CaMethod,
        refs: &[String],
        repair: bool,
        source: R,
    ) -> impl Future<Output = Result<(String, PathInfo)>> + Send;

    /// Adds a text file to the store (content-addressed, SHA-256).
    fn add_text_to_store(
        &self,
        name: &str,
        text: &str,
        refs: &[String],
        repair: bool,
    ) -> impl Future<Output = Result<(String, PathInfo)>> + Send;

    /// Imports a path with known metadata plus its archive bytes.
    fn add_to_store_nar<R: AsyncRead + Unpin + Send>(
        &self,
        path: &str,
        info: &PathInfo,
        repair: bool,
        check_sigs: bool,
        source: R,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Imports several paths in one go.
    fn add_multiple_to_store<R: AsyncRead + Unpin + Send>(
        &self,
        paths: Vec<PathToCopy<R>>,
        repair: bool,
        check_sigs: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Adds signatures to a store path.
    fn add_signatures(
        &self,
        path: &str,
        sigs: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Creates a temporary GC root, which persists until the client
    /// disconnects.
    fn add_temp_root(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Attaches a build log to a derivation.
    fn add_build_log(
        &self,
        drv_path: &str,
        log: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Registers a realisation of a derivation output.
    fn register_drv_output(
        &self,
        realisation: &Realisation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Builds the specified targets, failing fast on the first error.
    fn build_paths(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Like [`Store::build_paths`], but returns a [`BuildResult`] per
    /// target, keyed by the target's printable form.
    fn build_paths_with_results(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> impl Future<Output = Result<HashMap<String, BuildResult>>> + Send;

    /// Builds one derivation from its in-memory description.
    fn build_derivation(
        &self,
        drv_path: &str,
        drv: &Derivation,
        mode: BuildMode,
    ) -> impl Future<Output = Result<BuildResult>> + Send;

    /// Ensures the specified store path exists, substituting if needed.
    fn ensure_path(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Applies client options to the store.
    fn set_options(&self, settings: &ClientSettings) -> impl Future<Output = Result<()>> + Send;

    /// Returns the `(link, target)` of all known GC roots.
    fn find_roots(&self) -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// Runs the garbage collector.
    fn collect_garbage(
        &self,
        options: &GcOptions,
    ) -> impl Future<Output = Result<GcResults>> + Send;

    /// Deduplicates identical files in the store.
    fn optimise_store(&self) -> impl Future<Output = Result<()>> + Send;

    /// Checks store consistency; returns true if errors remain.
    fn verify_store(
        &self,
        check_contents: bool,
        repair: bool,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Streams the archive of a store path into `sink`.
    fn nar_from_path<W: AsyncWrite + Unpin + Send>(
        &self,
        path: &str,
        sink: W,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Configures and opens a [`DaemonStore`].
pub struct DaemonStoreBuilder {
    max_connections: usize,
    max_connection_age: Duration,
    settings: ClientSettings,
    logger: Arc<dyn Logger>,
}

impl Default for DaemonStoreBuilder {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_connection_age: Duration::from_secs(u64::MAX >> 1),
            settings: ClientSettings::default(),
            logger: Arc::new(TracingLogger),
        }
    }
}

impl DaemonStoreBuilder {
    /// Upper bound on concurrently open connections. Default: 1.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Connections older than this are closed instead of reused.
    /// Default: unbounded.
    pub fn max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = age;
        self
    }

    /// Client settings, applied to every fresh connection after its
    /// handshake.
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Where out-of-band daemon output goes. Default: [`TracingLogger`].
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Connects to a daemon via a unix socket, usually
    /// `/var/depot/daemon-socket/socket`.
    ///
    /// ```no_run
    /// use depot_daemon::store::{DaemonStore, Store};
    ///
    /// # async {
    /// let store = DaemonStore::builder()
    ///     .connect_unix("/var/depot/daemon-socket/socket")
    ///     .await?;
    /// let valid = store.is_valid_path("/depot/store/...").await?;
    /// # Ok::<_, depot_daemon::Error>(())
    /// # };
    /// ```
    pub async fn connect_unix<P: AsRef<std::path::Path>>(
        self,
        path: P,
    ) -> Result<DaemonStore<UnixStream>> {
        let path = path.as_ref().to_owned();
        self.connect_with(move || {
            let path = path.clone();
            async move { Ok(UnixStream::connect(path).await?) }
        })
        .await
    }

    /// Opens a store over streams produced by `connect` - one fresh stream
    /// per pooled connection. The first connection is opened (and its
    /// handshake run) eagerly, so a misconfigured daemon fails here rather
    /// than on first use.
    pub async fn connect_with<C, F, Fut>(self, connect: F) -> Result<DaemonStore<C>>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let settings = self.settings;
        let logger = self.logger.clone();
        let max_age = self.max_connection_age;

        let pool = Pool::new(
            self.max_connections,
            move || {
                let settings = settings.clone();
                let logger = logger.clone();
                let conn = connect();
                async move {
                    DaemonConnection::handshake(conn.await?, &settings, &*logger).await
                }
            },
            move |conn: &DaemonConnection<C>| conn.is_good() && conn.age() < max_age,
        );

        let store = DaemonStore {
            pool,
            logger: self.logger,
            path_info_cache: Mutex::new(HashMap::new()),
        };
        store.pool.get().await?;
        Ok(store)
    }
}

/// Store backed by a build daemon over the worker protocol.
///
/// Cloning is not needed: all methods take `&self`, and the connection pool
/// serialises access to each underlying connection.
pub struct DaemonStore<C: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    pool: Arc<Pool<DaemonConnection<C>>>,
    logger: Arc<dyn Logger>,
    path_info_cache: Mutex<HashMap<String, Option<PathInfo>>>,
}

impl DaemonStore<UnixStream> {
    /// Returns a builder.
    pub fn builder() -> DaemonStoreBuilder {
        DaemonStoreBuilder::default()
    }
}

/// A remote error produced while parsing a derivation, against an old
/// daemon, most likely means the daemon predates dependencies on dynamic
/// derivations; extend the message so users stand a chance. Advisory only:
/// the error kind is unchanged.
fn translate_remote_error(err: Error, minor: u8) -> Error {
    match err {
        Error::Remote(mut remote)
            if minor <= 35
                && remote.msg.contains("parsing derivation")
                && remote.msg.contains("expected string")
                && remote.msg.contains("Derive([") =>
        {
            remote.msg.push_str(
                ", this might be because the daemon is too old to understand dependencies on \
                 dynamic derivations; check whether the raw derivation is in the form \
                 'DrvWithVersion(..)'",
            );
            Error::Remote(remote)
        }
        err => err,
    }
}

fn synthesised_result(status: BuildResultStatus) -> BuildResult {
    BuildResult {
        status,
        error_msg: String::new(),
        times_built: 0,
        is_non_deterministic: false,
        start_time: DateTime::default(),
        stop_time: DateTime::default(),
        built_outputs: BTreeMap::new(),
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin + Send + 'static> DaemonStore<C> {
    /// The protocol version negotiated with the daemon.
    pub async fn protocol(&self) -> Result<Proto> {
        Ok(self.pool.get().await?.proto())
    }

    /// The daemon's self-reported version string, if it announces one.
    pub async fn daemon_version(&self) -> Result<Option<String>> {
        Ok(self.pool.get().await?.daemon_version().map(str::to_owned))
    }

    /// Whether the daemon trusts this client (`None` = unknown).
    pub async fn is_trusted_client(&self) -> Result<Option<TrustedFlag>> {
        Ok(self.pool.get().await?.trusted())
    }

    /// Settles an operation: connections that observed a poisoning error are
    /// closed instead of returned to the pool, and remote errors get the
    /// compatibility translation applied.
    fn finish<T>(&self, mut conn: PoolGuard<DaemonConnection<C>>, res: Result<T>) -> Result<T> {
        match res {
            Ok(v) => Ok(v),
            Err(err) => {
                let minor = conn.proto().1;
                if err.poisons_connection() {
                    conn.mark_bad();
                }
                Err(translate_remote_error(err, minor))
            }
        }
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin + Send + 'static> Store for DaemonStore<C> {
    #[instrument(skip(self))]
    async fn is_valid_path(&self, path: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let res = conn.is_valid_path(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_valid_paths(
        &self,
        paths: &[String],
        use_substituters: bool,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn
            .query_valid_paths(paths, use_substituters, &*self.logger)
            .await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_all_valid_paths(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_all_valid_paths(&*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_substitutable_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_substitutable_paths(paths, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, paths))]
    async fn query_substitutable_path_infos(
        &self,
        paths: &BTreeMap<String, Option<ContentAddress>>,
    ) -> Result<HashMap<String, SubstitutablePathInfo>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.pool.get().await?;
        let res = conn
            .query_substitutable_path_infos(paths, &*self.logger)
            .await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_path_info(&self, path: &str) -> Result<Option<PathInfo>> {
        if let Some(hit) = self.path_info_cache.lock().unwrap().get(path) {
            return Ok(hit.clone());
        }
        let mut conn = self.pool.get().await?;
        let res = conn.query_pathinfo(path, &*self.logger).await;
        let info = self.finish(conn, res)?;
        self.path_info_cache
            .lock()
            .unwrap()
            .insert(path.to_owned(), info.clone());
        Ok(info)
    }

    #[instrument(skip(self))]
    async fn query_referrers(&self, path: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_referrers(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_valid_derivers(&self, path: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_valid_derivers(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_derivation_outputs(&self, path: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        if conn.proto().since(22) {
            // The output map subsumes the legacy query.
            drop(conn);
            let map = self.query_partial_derivation_output_map(path, None).await?;
            return Ok(map.into_values().flatten().collect());
        }
        let res = conn.query_derivation_outputs(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, static_outputs))]
    async fn query_partial_derivation_output_map(
        &self,
        path: &str,
        static_outputs: Option<HashMap<String, Option<String>>>,
    ) -> Result<HashMap<String, Option<String>>> {
        let mut conn = self.pool.get().await?;
        if !conn.proto().since(22) {
            // Old daemons can't answer this; the statically-known map is an
            // under-approximation, but those daemons don't handle
            // floating-CA derivations either, so nothing is lost.
            drop(conn);
            return Ok(static_outputs.unwrap_or_default());
        }
        let res = conn.query_derivation_output_map(path, &*self.logger).await;
        let dynamic = self.finish(conn, res)?;
        match static_outputs {
            None => Ok(dynamic),
            Some(mut outputs) => {
                // A dynamic entry overrides the static one only when it names
                // a path; a dynamic entry that is present but empty still
                // registers the output as unknown.
                for (name, opt_path) in dynamic {
                    if opt_path.is_some() {
                        outputs.insert(name, opt_path);
                    } else {
                        outputs.entry(name).or_insert(None);
                    }
                }
                Ok(outputs)
            }
        }
    }

    #[instrument(skip(self))]
    async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_path_from_hash_part(hash_part, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, targets))]
    async fn query_missing(&self, targets: &[DerivedPath]) -> Result<Missing> {
        let mut conn = self.pool.get().await?;
        let res = conn.query_missing(targets, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>> {
        let mut conn = self.pool.get().await?;
        if !conn.proto().since(27) {
            // Never writes the opcode: the daemon cannot answer it.
            self.logger.log(
                Verbosity::Warn,
                "the daemon is too old to support content-addressed derivations, please upgrade it",
            );
            return Ok(None);
        }
        let res = conn.query_realisation(id, &*self.logger).await;
        Ok(self.finish(conn, res)?.into_iter().next())
    }

    #[instrument(skip(self, refs, source))]
    async fn add_ca_to_store<R: AsyncRead + Unpin + Send>(
        &self,
        name: &str,
        method: CaMethod,
        refs: &[String],
        repair: bool,
        mut source: R,
    ) -> Result<(String, PathInfo)> {
        let mut conn = self.pool.get().await?;

        if conn.proto().since(25) {
            // The source may itself call back into this store, so make room
            // for a nested borrow while it streams.
            let _capacity = self.pool.inc_capacity();
            let res = conn
                .add_ca_to_store(name, method, refs, repair, &mut source, &*self.logger)
                .await;
            return self.finish(conn, res);
        }

        if repair {
            let res = Err(Error::Unsupported(
                "repairing is not supported before protocol minor 25".into(),
            ));
            return self.finish(conn, res);
        }

        let path = match method {
            CaMethod::Text => {
                let mut text = Vec::new();
                source.read_to_end(&mut text).await?;
                let text = String::from_utf8_lossy(&text).to_string();
                let res = conn
                    .add_text_to_store_legacy(name, &text, refs, &*self.logger)
                    .await;
                self.finish(conn, res)?
            }
            method => {
                let _capacity = self.pool.inc_capacity();
                let res = conn
                    .add_to_store_legacy(name, method, &mut source, &*self.logger)
                    .await;
                self.finish(conn, res)?
            }
        };

        // The connection was released above; resolving the metadata through
        // the pool again cannot deadlock on our own borrow.
        let info = self.query_path_info(&path).await?.ok_or_else(|| {
            Error::Protocol(format!("daemon did not register path '{}'", path))
        })?;
        Ok((path, info))
    }

    #[instrument(skip(self, text, refs))]
    async fn add_text_to_store(
        &self,
        name: &str,
        text: &str,
        refs: &[String],
        repair: bool,
    ) -> Result<(String, PathInfo)> {
        self.add_ca_to_store(name, CaMethod::Text, refs, repair, text.as_bytes())
            .await
    }

    #[instrument(skip(self, info, source))]
    async fn add_to_store_nar<R: AsyncRead + Unpin + Send>(
        &self,
        path: &str,
        info: &PathInfo,
        repair: bool,
        check_sigs: bool,
        mut source: R,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn
            .add_to_store_nar(path, info, repair, !check_sigs, &mut source, &*self.logger)
            .await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, paths))]
    async fn add_multiple_to_store<R: AsyncRead + Unpin + Send>(
        &self,
        mut paths: Vec<PathToCopy<R>>,
        repair: bool,
        check_sigs: bool,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        if !conn.proto().since(32) {
            // No batch operation on this daemon; upload the paths one by one.
            drop(conn);
            for p in paths.iter_mut() {
                self.add_to_store_nar(&p.path, &p.info, repair, check_sigs, &mut p.nar)
                    .await?;
            }
            return Ok(());
        }

        // Encode the batch into an in-process pipe while the connection
        // streams it out through the framed sink.
        let (mut pipe_w, mut pipe_r) = tokio::io::duplex(64 * 1024);
        let encode = async {
            wire::write_u64(&mut pipe_w, paths.len() as u64)
                .await
                .map_err(Error::from)?;
            for p in paths.iter_mut() {
                wire::write_string(&mut pipe_w, &p.path)
                    .await
                    .map_err(Error::from)?;
                wire::write_pathinfo(&mut pipe_w, &p.info).await?;
                wire::copy_nar(&mut p.nar, &mut pipe_w).await?;
            }
            pipe_w.shutdown().await.map_err(Error::from)?;
            Ok(())
        };
        let upload = conn.add_multiple_to_store(repair, !check_sigs, &mut pipe_r, &*self.logger);

        let (enc_res, up_res) = tokio::join!(encode, upload);
        let res = up_res.and(enc_res);
        self.finish(conn, res)
    }

    #[instrument(skip(self, sigs))]
    async fn add_signatures(&self, path: &str, sigs: &[String]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.add_signatures(path, sigs, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn add_temp_root(&self, path: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.add_temp_root(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, log))]
    async fn add_build_log(&self, drv_path: &str, log: &[u8]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.add_build_log(drv_path, log, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, realisation))]
    async fn register_drv_output(&self, realisation: &Realisation) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.register_drv_output(realisation, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, targets))]
    async fn build_paths(&self, targets: &[DerivedPath], mode: BuildMode) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.build_paths(targets, mode, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, targets))]
    async fn build_paths_with_results(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<HashMap<String, BuildResult>> {
        let mut conn = self.pool.get().await?;
        if conn.proto().since(34) {
            let res = conn
                .build_paths_with_results(targets, mode, &*self.logger)
                .await;
            return self.finish(conn, res);
        }

        // Old daemons only have the fail-fast build; run it, then synthesise
        // a per-target result by resolving outputs. Release the connection
        // first so the nested operations can borrow it.
        drop(conn);
        self.build_paths(targets, mode).await?;

        let mut results = HashMap::with_capacity(targets.len());
        for target in targets {
            match target {
                DerivedPath::Opaque(_) => {
                    results.insert(
                        target.render(),
                        synthesised_result(BuildResultStatus::Substituted),
                    );
                }
                DerivedPath::Built { drv_path, outputs } => {
                    let drv = drv_path.base_store_path();
                    let output_map = self
                        .query_partial_derivation_output_map(drv, None)
                        .await?;
                    let wanted: Vec<String> = match outputs {
                        OutputsSpec::All => output_map.keys().cloned().collect(),
                        OutputsSpec::Names(names) => names.iter().cloned().collect(),
                    };

                    let mut result = synthesised_result(BuildResultStatus::Built);
                    for name in wanted {
                        let out_path = output_map
                            .get(&name)
                            .cloned()
                            .flatten()
                            .ok_or_else(|| {
                                Error::MissingRealisation(format!("{}!{}", drv, name))
                            })?;
                        result.built_outputs.insert(
                            name.clone(),
                            Realisation {
                                id: DrvOutput {
                                    drv_hash: drv.to_owned(),
                                    output: name,
                                },
                                out_path,
                                signatures: Vec::new(),
                                dependent_realisations: BTreeMap::new(),
                            },
                        );
                    }
                    results.insert(target.render(), result);
                }
            }
        }
        Ok(results)
    }

    #[instrument(skip(self, drv))]
    async fn build_derivation(
        &self,
        drv_path: &str,
        drv: &Derivation,
        mode: BuildMode,
    ) -> Result<BuildResult> {
        let mut conn = self.pool.get().await?;
        let res = conn.build_derivation(drv_path, drv, mode, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.ensure_path(path, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, settings))]
    async fn set_options(&self, settings: &ClientSettings) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.set_options(settings, &*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn find_roots(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.pool.get().await?;
        let res = conn.find_roots(&*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self, options))]
    async fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults> {
        let mut conn = self.pool.get().await?;
        let res = conn.collect_garbage(options, &*self.logger).await;
        let results = self.finish(conn, res)?;
        // Anything may have been deleted; cached path infos are stale now.
        self.path_info_cache.lock().unwrap().clear();
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn optimise_store(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.optimise_store(&*self.logger).await;
        self.finish(conn, res)
    }

    #[instrument(skip(self))]
    async fn verify_store(&self, check_contents: bool, repair: bool) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let res = conn.verify_store(check_contents, repair, &*self.logger).await;
        let errors = self.finish(conn, res)?;
        if repair {
            self.path_info_cache.lock().unwrap().clear();
        }
        Ok(errors)
    }

    #[instrument(skip(self, sink))]
    async fn nar_from_path<W: AsyncWrite + Unpin + Send>(
        &self,
        path: &str,
        mut sink: W,
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let res = conn.nar_from_path(path, &mut sink, &*self.logger).await;
        self.finish(conn, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_remote_error_matches() {
        let err = Error::Remote(crate::DaemonError {
            level: Verbosity::Error,
            msg: "error: expected string 'Derive([' while parsing derivation".into(),
            traces: vec![],
        });
        match translate_remote_error(err, 35) {
            Error::Remote(remote) => {
                assert!(remote.msg.contains("dynamic derivations"), "{}", remote.msg)
            }
            other => panic!("kind changed: {:?}", other),
        }
    }

    #[test]
    fn test_translate_remote_error_skips_new_daemons() {
        let msg = "error: expected string 'Derive([' while parsing derivation";
        let err = Error::Remote(crate::DaemonError {
            level: Verbosity::Error,
            msg: msg.into(),
            traces: vec![],
        });
        match translate_remote_error(err, 36) {
            Error::Remote(remote) => assert_eq!(msg, remote.msg),
            other => panic!("kind changed: {:?}", other),
        }
    }

    #[test]
    fn test_translate_remote_error_ignores_other_kinds() {
        assert!(matches!(
            translate_remote_error(Error::PoolFailed, 35),
            Error::PoolFailed
        ));
    }
}
