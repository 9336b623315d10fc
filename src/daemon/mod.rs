// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! One connection to the daemon: handshake, version negotiation, the
//! out-of-band frame loop, the framed upload subprotocol, and the
//! request/reply encoding of every operation.
//!
//! A [`DaemonConnection`] is driven by exactly one borrower at a time;
//! requests on it are strictly FIFO, and a request's frame loop must finish
//! before the next opcode may be written. Sharing and re-use across callers
//! is the job of [`crate::pool`] and [`crate::store`].

pub mod wire;

use crate::model::{
    CaMethod, ContentAddress, Derivation, DerivedPath, DrvOutput, GcOptions, GcResults,
    Realisation, SubstitutablePathInfo,
};
use crate::{
    BuildMode, BuildResult, ClientSettings, Error, Logger, Missing, PathInfo, Result, ResultExt,
    TrustedFlag, Verbosity,
};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tracing::{instrument, trace};

/// Minimum supported daemon protocol minor. Anything older is rejected
/// during the handshake.
const MIN_MINOR: u8 = 21;

/// The protocol version this client speaks. Newer daemons fall back to it;
/// older daemons (down to [`MIN_MINOR`]) make us fall back instead.
const PROTOCOL_VERSION: Proto = Proto(1, 37);

/// Size of the scratch buffer used for framed uploads and source reads.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Protocol version, packed on the wire as `(major << 8) | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Proto(pub u8, pub u8);

impl From<u64> for Proto {
    fn from(raw: u64) -> Self {
        Self(((raw & 0xFF00) >> 8) as u8, (raw & 0x00FF) as u8)
    }
}
impl From<Proto> for u64 {
    fn from(v: Proto) -> Self {
        ((v.0 as u64) << 8) | (v.1 as u64)
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

impl Proto {
    /// Whether this version includes minor `v`.
    pub fn since(&self, v: u8) -> bool {
        self.1 >= v
    }
}

/// One duplex byte stream to the daemon, its negotiated version, age, and
/// poisoned bit.
///
/// The stream is split at construction: all request traffic goes through the
/// buffered write half, all reply traffic through the read half. During a
/// framed upload the two halves are driven by two concurrent futures, which
/// is the only point where anything runs in parallel on one connection.
pub struct DaemonConnection<C: AsyncRead + AsyncWrite + Unpin + Send> {
    r: BufReader<ReadHalf<C>>,
    w: BufWriter<WriteHalf<C>>,
    /// Negotiated protocol version.
    proto: Proto,
    daemon_version: Option<String>,
    trusted: Option<TrustedFlag>,
    since: Instant,
    bad: bool,
    buffer: Vec<u8>,
}

impl<C: AsyncRead + AsyncWrite + Unpin + Send> std::fmt::Debug for DaemonConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConnection")
            .field("proto", &self.proto)
            .field("daemon_version", &self.daemon_version)
            .field("bad", &self.bad)
            .finish_non_exhaustive()
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin + Send> DaemonConnection<C> {
    fn new(conn: C) -> Self {
        let (r, w) = tokio::io::split(conn);
        Self {
            r: BufReader::new(r),
            w: BufWriter::new(w),
            proto: Proto(0, 0),
            daemon_version: None,
            trusted: None,
            since: Instant::now(),
            bad: false,
            buffer: vec![0u8; COPY_BUF_SIZE],
        }
    }

    #[cfg(test)]
    fn with_proto(conn: C, proto: Proto) -> Self {
        let mut this = Self::new(conn);
        this.proto = proto;
        this
    }

    /// Performs the handshake on a fresh stream and applies the client
    /// settings, leaving the connection ready for its first operation.
    #[instrument(skip_all)]
    pub async fn handshake(
        conn: C,
        settings: &ClientSettings,
        logger: &dyn Logger,
    ) -> Result<Self> {
        let mut this = Self::new(conn);

        // Exchange magic numbers.
        wire::write_u64(&mut this.w, wire::WORKER_MAGIC_1)
            .await
            .with_field("magic1")?;
        this.w.flush().await.map_err(Error::from)?;
        match wire::read_u64(&mut this.r).await {
            Ok(wire::WORKER_MAGIC_2) => Ok(()),
            Ok(v) => Err(Error::Protocol(format!("protocol mismatch: {:#x}", v))),
            Err(err) => Err(err.into()),
        }
        .with_field("magic2")?;

        // Check that we're talking to a new enough daemon, tell it our
        // version; the lower of the two gates everything from here on.
        let daemon_proto = wire::read_proto(&mut this.r)
            .await
            .with_field("daemon_proto")?;
        if daemon_proto.0 != PROTOCOL_VERSION.0 {
            return Err(Error::Unsupported(format!(
                "daemon protocol {} has the wrong major version",
                daemon_proto
            )));
        }
        if daemon_proto.1 < MIN_MINOR {
            return Err(Error::Unsupported(format!(
                "daemon too old: protocol {}, minimum supported is {}.{}",
                daemon_proto, PROTOCOL_VERSION.0, MIN_MINOR
            )));
        }
        this.proto = Proto(PROTOCOL_VERSION.0, daemon_proto.1.min(PROTOCOL_VERSION.1));
        wire::write_proto(&mut this.w, PROTOCOL_VERSION)
            .await
            .with_field("client_proto")?;

        // Two obsolete fields, kept for wire compatibility.
        wire::write_u64(&mut this.w, 0)
            .await
            .with_field("__obsolete_cpu_affinity")?;
        wire::write_bool(&mut this.w, false)
            .await
            .with_field("__obsolete_reserve_space")?;
        this.w.flush().await.map_err(Error::from)?;

        if this.proto.since(33) {
            this.daemon_version = Some(
                wire::read_string(&mut this.r)
                    .await
                    .with_field("daemon_version")?,
            );
        }
        if this.proto.since(35) {
            this.trusted = wire::read_trusted_flag(&mut this.r)
                .await
                .with_field("remote_trust")?;
        }

        // Drain stderr; there shouldn't be anything of note here anyway.
        this.process_stderr(logger).await?;

        this.set_options(settings, logger).await?;
        trace!(proto = %this.proto, version = ?this.daemon_version, "handshake done");
        Ok(this)
    }

    /// Negotiated protocol version.
    pub fn proto(&self) -> Proto {
        self.proto
    }

    /// The daemon's self-reported version string (minor 33+).
    pub fn daemon_version(&self) -> Option<&str> {
        self.daemon_version.as_deref()
    }

    /// Whether the daemon trusts us (minor 35+; `None` = unknown).
    pub fn trusted(&self) -> Option<TrustedFlag> {
        self.trusted
    }

    /// How long ago this connection was opened.
    pub fn age(&self) -> Duration {
        self.since.elapsed()
    }

    /// Whether the connection may still be used. Once poisoned, never again.
    pub fn is_good(&self) -> bool {
        !self.bad
    }

    /// Poisons the connection; it will be closed instead of reused.
    pub fn mark_bad(&mut self) {
        self.bad = true;
    }

    /// Fails with `Unsupported` unless the negotiated minor is at least
    /// `minor`. Called before the opcode is written, so an unsupported
    /// operation leaves no trace on the wire.
    fn require(&self, minor: u8, what: &str) -> Result<()> {
        if self.proto.since(minor) {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "{} requires protocol minor {}, daemon has {}",
                what, minor, self.proto
            )))
        }
    }

    /// Runs the frame loop until the daemon signals the end of the request,
    /// forwarding log lines and activities to `logger`. A captured error
    /// frame is returned once the loop exits.
    pub async fn process_stderr(&mut self, logger: &dyn Logger) -> Result<()> {
        self.process_stderr_with(
            Option::<&mut tokio::io::Sink>::None,
            Option::<&mut tokio::io::Empty>::None,
            logger,
        )
        .await
    }

    /// Like [`Self::process_stderr`], but with a sink for `Write` frames
    /// and/or a source for `Read` frames. A `Read` answered with fewer bytes
    /// than requested signals end-of-input for that source.
    pub async fn process_stderr_with<SK, SR>(
        &mut self,
        mut sink: Option<&mut SK>,
        mut source: Option<&mut SR>,
        logger: &dyn Logger,
    ) -> Result<()>
    where
        SK: AsyncWrite + Unpin + Send,
        SR: AsyncRead + Unpin + Send,
    {
        self.w.flush().await.map_err(Error::from)?;
        loop {
            match wire::read_frame(&mut self.r, self.proto).await? {
                wire::Frame::Last => return Ok(()),
                wire::Frame::Error(err) => return Err(Error::Remote(err)),
                wire::Frame::Next(msg) => logger.log(Verbosity::Error, msg.trim_end()),
                wire::Frame::StartActivity(act) => logger.start_activity(&act),
                wire::Frame::StopActivity { act_id } => logger.stop_activity(act_id),
                wire::Frame::Result(res) => logger.result(&res),
                wire::Frame::Write(bytes) => {
                    let sink = sink
                        .as_deref_mut()
                        .ok_or_else(|| Error::Protocol("Write frame without a sink".into()))?;
                    sink.write_all(&bytes).await.map_err(Error::from)?;
                }
                wire::Frame::Read(n) => {
                    let source = source
                        .as_deref_mut()
                        .ok_or_else(|| Error::Protocol("Read frame without a source".into()))?;
                    let n = (n as usize).min(self.buffer.len());
                    let len = source.read(&mut self.buffer[..n]).await?;
                    wire::write_bytes(&mut self.w, &self.buffer[..len])
                        .await
                        .with_field("Read.<data>")?;
                    self.w.flush().await.map_err(Error::from)?;
                }
            }
        }
    }

    /// Streams `source` to the daemon in length-prefixed frames while a
    /// concurrent future drains the frame loop, so the daemon can interleave
    /// logs and activities with the upload. The terminating zero-length frame
    /// is written even when the producer fails; an error captured by the
    /// frame loop takes precedence over a producer error.
    ///
    /// Ordering on the socket is maintained because only the producer future
    /// writes and only the frame-loop future reads.
    #[instrument(skip_all, level = "debug")]
    pub async fn with_framed_source<R>(&mut self, source: &mut R, logger: &dyn Logger) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.w.flush().await.map_err(Error::from)?;

        let proto = self.proto;
        let Self { r, w, buffer, .. } = self;

        let produce = async {
            let res = wire::copy_to_framed(source, w, buffer).await;
            if res.is_err() {
                // The source failed between frames; terminate the stream so
                // the daemon stops waiting for input.
                let _ = wire::write_u64(w, 0).await;
            }
            let flushed = w.flush().await.map_err(Error::from);
            res.and(flushed)
        };

        let demux = async {
            loop {
                match wire::read_frame(r, proto).await? {
                    wire::Frame::Last => return Ok(()),
                    wire::Frame::Error(err) => return Err(Error::Remote(err)),
                    wire::Frame::Next(msg) => logger.log(Verbosity::Error, msg.trim_end()),
                    wire::Frame::StartActivity(act) => logger.start_activity(&act),
                    wire::Frame::StopActivity { act_id } => logger.stop_activity(act_id),
                    wire::Frame::Result(res) => logger.result(&res),
                    frame => {
                        return Err(Error::Protocol(format!(
                            "unexpected frame during framed upload: {:?}",
                            frame
                        )))
                    }
                }
            }
        };

        let (demux_res, produce_res) = tokio::join!(demux, produce);
        demux_res.and(produce_res)
    }

    /// Applies client options. This changes the behaviour of future commands
    /// on this connection.
    #[instrument(skip(self, logger))]
    pub async fn set_options(
        &mut self,
        settings: &ClientSettings,
        logger: &dyn Logger,
    ) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::SetOptions)
            .await
            .with_field("SetOptions.<op>")?;
        wire::write_client_settings(&mut self.w, settings)
            .await
            .with_field("SetOptions.clientSettings")?;
        self.process_stderr(logger).await
    }

    /// Returns whether a store path is valid.
    #[instrument(skip(self, logger))]
    pub async fn is_valid_path(&mut self, path: &str, logger: &dyn Logger) -> Result<bool> {
        wire::write_op(&mut self.w, wire::Op::IsValidPath)
            .await
            .with_field("IsValidPath.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("IsValidPath.path")?;
        self.process_stderr(logger).await?;
        Ok(wire::read_bool(&mut self.r).await?)
    }

    /// Returns which of the passed paths are valid.
    #[instrument(skip(self, paths, logger))]
    pub async fn query_valid_paths(
        &mut self,
        paths: &[String],
        use_substituters: bool,
        logger: &dyn Logger,
    ) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryValidPaths)
            .await
            .with_field("QueryValidPaths.<op>")?;
        wire::write_strings(&mut self.w, paths)
            .await
            .with_field("QueryValidPaths.paths")?;
        if self.proto.since(27) {
            wire::write_bool(&mut self.w, use_substituters)
                .await
                .with_field("QueryValidPaths.use_substituters")?;
        }
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<_>>>()
            .await
            .with_field("QueryValidPaths.valid_paths")
    }

    /// Returns every valid path in the store. Can be enormous.
    #[instrument(skip(self, logger))]
    pub async fn query_all_valid_paths(&mut self, logger: &dyn Logger) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryAllValidPaths)
            .await
            .with_field("QueryAllValidPaths.<op>")?;
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<_>>>()
            .await
            .with_field("QueryAllValidPaths.paths")
    }

    /// Returns which of the passed paths can be substituted.
    #[instrument(skip(self, paths, logger))]
    pub async fn query_substitutable_paths(
        &mut self,
        paths: &[String],
        logger: &dyn Logger,
    ) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QuerySubstitutablePaths)
            .await
            .with_field("QuerySubstitutablePaths.<op>")?;
        wire::write_strings(&mut self.w, paths)
            .await
            .with_field("QuerySubstitutablePaths.paths")?;
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<_>>>()
            .await
            .with_field("QuerySubstitutablePaths.paths")
    }

    /// Returns substitution metadata for the given paths. Before minor 22
    /// the request carries a plain path set; from 22 a path-to-CA map.
    #[instrument(skip(self, paths, logger))]
    pub async fn query_substitutable_path_infos(
        &mut self,
        paths: &BTreeMap<String, Option<ContentAddress>>,
        logger: &dyn Logger,
    ) -> Result<HashMap<String, SubstitutablePathInfo>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QuerySubstitutablePathInfos)
            .await
            .with_field("QuerySubstitutablePathInfos.<op>")?;
        if self.proto.since(22) {
            wire::write_u64(&mut self.w, paths.len() as u64)
                .await
                .with_field("QuerySubstitutablePathInfos.paths.<count>")?;
            for (path, ca) in paths {
                wire::write_string(&mut self.w, path)
                    .await
                    .with_field("QuerySubstitutablePathInfos.paths[].path")?;
                wire::write_string(&mut self.w, ca.as_ref().map(|ca| ca.render()).unwrap_or_default())
                    .await
                    .with_field("QuerySubstitutablePathInfos.paths[].ca")?;
            }
        } else {
            wire::write_strings(&mut self.w, paths.keys())
                .await
                .with_field("QuerySubstitutablePathInfos.paths")?;
        }
        self.process_stderr(logger).await?;

        let count = wire::read_u64(&mut self.r)
            .await
            .with_field("QuerySubstitutablePathInfos.infos.<count>")?;
        let mut infos = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let path = wire::read_string(&mut self.r)
                .await
                .with_field("QuerySubstitutablePathInfos.infos[].path")?;
            let deriver = wire::read_string(&mut self.r)
                .await
                .map(|s| (!s.is_empty()).then_some(s))
                .with_field("QuerySubstitutablePathInfos.infos[].deriver")?;
            let references = wire::read_strings(&mut self.r)
                .collect::<Result<Vec<_>>>()
                .await
                .with_field("QuerySubstitutablePathInfos.infos[].references")?;
            let download_size = wire::read_u64(&mut self.r)
                .await
                .with_field("QuerySubstitutablePathInfos.infos[].download_size")?;
            let nar_size = wire::read_u64(&mut self.r)
                .await
                .with_field("QuerySubstitutablePathInfos.infos[].nar_size")?;
            infos.insert(
                path,
                SubstitutablePathInfo {
                    deriver,
                    references,
                    download_size,
                    nar_size,
                },
            );
        }
        Ok(infos)
    }

    /// Returns a [`PathInfo`] for the given path, or `None` if it is not
    /// valid. Daemons report invalidity as a remote error; that one error is
    /// translated back to `None` here.
    #[instrument(skip(self, logger))]
    pub async fn query_pathinfo(
        &mut self,
        path: &str,
        logger: &dyn Logger,
    ) -> Result<Option<PathInfo>> {
        wire::write_op(&mut self.w, wire::Op::QueryPathInfo)
            .await
            .with_field("QueryPathInfo.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("QueryPathInfo.path")?;
        match self.process_stderr(logger).await {
            Ok(()) => {}
            Err(Error::Remote(err)) if err.msg.contains("is not valid") => return Ok(None),
            Err(err) => return Err(err),
        }

        if wire::read_bool(&mut self.r).await? {
            Ok(Some(
                wire::read_pathinfo(&mut self.r)
                    .await
                    .with_field("QueryPathInfo.info")?,
            ))
        } else {
            Ok(None)
        }
    }

    /// Returns the paths that reference the given path.
    #[instrument(skip(self, logger))]
    pub async fn query_referrers(
        &mut self,
        path: &str,
        logger: &dyn Logger,
    ) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryReferrers)
            .await
            .with_field("QueryReferrers.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("QueryReferrers.path")?;
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<_>>>()
            .await
            .with_field("QueryReferrers.paths")
    }

    /// Returns the derivations in the store that can produce a path.
    #[instrument(skip(self, logger))]
    pub async fn query_valid_derivers(
        &mut self,
        path: &str,
        logger: &dyn Logger,
    ) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryValidDerivers)
            .await
            .with_field("QueryValidDerivers.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("QueryValidDerivers.path")?;
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("QueryValidDerivers.paths")
    }

    /// Legacy output query for pre-22 daemons; newer ones answer the output
    /// map instead.
    #[instrument(skip(self, logger))]
    pub async fn query_derivation_outputs(
        &mut self,
        path: &str,
        logger: &dyn Logger,
    ) -> Result<Vec<String>> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryDerivationOutputs)
            .await
            .with_field("QueryDerivationOutputs.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("QueryDerivationOutputs.path")?;
        self.process_stderr(logger).await?;
        wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("QueryDerivationOutputs.paths")
    }

    /// Returns a map of output name to (possibly unknown) store path for the
    /// given derivation.
    #[instrument(skip(self, logger))]
    pub async fn query_derivation_output_map(
        &mut self,
        path: &str,
        logger: &dyn Logger,
    ) -> Result<HashMap<String, Option<String>>> {
        self.require(22, "QueryDerivationOutputMap")?;
        wire::write_op(&mut self.w, wire::Op::QueryDerivationOutputMap)
            .await
            .with_field("QueryDerivationOutputMap.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("QueryDerivationOutputMap.path")?;
        self.process_stderr(logger).await?;

        let count = wire::read_u64(&mut self.r)
            .await
            .with_field("QueryDerivationOutputMap.outputs.<count>")?;
        let mut outputs = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let name = wire::read_string(&mut self.r)
                .await
                .with_field("QueryDerivationOutputMap.outputs[].name")?;
            let path = wire::read_string(&mut self.r)
                .await
                .map(|s| (!s.is_empty()).then_some(s))
                .with_field("QueryDerivationOutputMap.outputs[].path")?;
            outputs.insert(name, path);
        }
        Ok(outputs)
    }

    /// Looks up a store path by the hash part of its base name.
    #[instrument(skip(self, logger))]
    pub async fn query_path_from_hash_part(
        &mut self,
        hash_part: &str,
        logger: &dyn Logger,
    ) -> Result<Option<String>> {
        wire::write_op(&mut self.w, wire::Op::QueryPathFromHashPart)
            .await
            .with_field("QueryPathFromHashPart.<op>")?;
        wire::write_string(&mut self.w, hash_part)
            .await
            .with_field("QueryPathFromHashPart.hash_part")?;
        self.process_stderr(logger).await?;
        Ok(wire::read_string(&mut self.r)
            .await
            .map(|s| (!s.is_empty()).then_some(s))
            .with_field("QueryPathFromHashPart.path")?)
    }

    /// Takes a list of targets and queries which would be built, substituted
    /// or unknown, with size estimates.
    #[instrument(skip(self, targets, logger))]
    pub async fn query_missing(
        &mut self,
        targets: &[DerivedPath],
        logger: &dyn Logger,
    ) -> Result<Missing> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::QueryMissing)
            .await
            .with_field("QueryMissing.<op>")?;
        wire::write_strings(&mut self.w, targets.iter().map(|t| t.render()).collect::<Vec<_>>())
            .await
            .with_field("QueryMissing.targets")?;
        self.process_stderr(logger).await?;

        let will_build = wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("QueryMissing.will_build")?;
        let will_substitute = wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("QueryMissing.will_substitute")?;
        let unknown = wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("QueryMissing.unknown")?;
        let download_size = wire::read_u64(&mut self.r)
            .await
            .with_field("QueryMissing.download_size")?;
        let nar_size = wire::read_u64(&mut self.r)
            .await
            .with_field("QueryMissing.nar_size")?;
        Ok(Missing {
            will_build,
            will_substitute,
            unknown,
            download_size,
            nar_size,
        })
    }

    /// Queries the realisations of a derivation output. Requires minor 27;
    /// pre-31 daemons answer with bare output paths.
    #[instrument(skip(self, logger))]
    pub async fn query_realisation(
        &mut self,
        id: &DrvOutput,
        logger: &dyn Logger,
    ) -> Result<Vec<Realisation>> {
        use tokio_stream::StreamExt;

        self.require(27, "QueryRealisation")?;
        wire::write_op(&mut self.w, wire::Op::QueryRealisation)
            .await
            .with_field("QueryRealisation.<op>")?;
        wire::write_string(&mut self.w, id.render())
            .await
            .with_field("QueryRealisation.id")?;
        self.process_stderr(logger).await?;

        if self.proto.since(31) {
            wire::read_strings(&mut self.r)
                .collect::<Result<Vec<String>>>()
                .await
                .with_field("QueryRealisation.realisations")?
                .iter()
                .map(|json| Realisation::from_json(json))
                .collect::<Result<Vec<_>>>()
                .with_field("QueryRealisation.realisations")
        } else {
            Ok(wire::read_strings(&mut self.r)
                .collect::<Result<Vec<String>>>()
                .await
                .with_field("QueryRealisation.out_paths")?
                .into_iter()
                .map(|out_path| Realisation {
                    id: id.clone(),
                    out_path,
                    signatures: Vec::new(),
                    dependent_realisations: BTreeMap::new(),
                })
                .collect())
        }
    }

    /// Adds data to the store under a content address (minor 25+ encoding).
    /// The payload is streamed through the framed-sink subprotocol.
    #[instrument(skip(self, refs, source, logger))]
    pub async fn add_ca_to_store<R: AsyncRead + Unpin + Send>(
        &mut self,
        name: &str,
        method: CaMethod,
        refs: &[String],
        repair: bool,
        source: &mut R,
        logger: &dyn Logger,
    ) -> Result<(String, PathInfo)> {
        self.require(25, "AddToStore")?;
        wire::write_op(&mut self.w, wire::Op::AddToStore)
            .await
            .with_field("AddToStore.<op>")?;
        wire::write_string(&mut self.w, name)
            .await
            .with_field("AddToStore.name")?;
        wire::write_string(&mut self.w, method.render())
            .await
            .with_field("AddToStore.camStr")?;
        wire::write_strings(&mut self.w, refs)
            .await
            .with_field("AddToStore.refs")?;
        wire::write_bool(&mut self.w, repair)
            .await
            .with_field("AddToStore.repair")?;

        self.with_framed_source(source, logger).await?;

        Ok((
            wire::read_string(&mut self.r)
                .await
                .with_field("AddToStore.path")?,
            wire::read_pathinfo(&mut self.r)
                .await
                .with_field("AddToStore.info")?,
        ))
    }

    /// Legacy add-to-store for pre-25 daemons: flat or recursive ingestion
    /// with the old flag encoding, the archive sent unframed. Returns the
    /// store path only.
    #[instrument(skip(self, source, logger))]
    pub async fn add_to_store_legacy<R: AsyncRead + Unpin + Send>(
        &mut self,
        name: &str,
        method: CaMethod,
        source: &mut R,
        logger: &dyn Logger,
    ) -> Result<String> {
        let (recursive, algo) = match method {
            CaMethod::Recursive(algo) => (true, algo),
            CaMethod::Flat(algo) => (false, algo),
            CaMethod::Text => {
                return Err(Error::Unsupported(
                    "text ingestion uses AddTextToStore before protocol minor 25".into(),
                ))
            }
        };

        wire::write_op(&mut self.w, wire::Op::AddToStore)
            .await
            .with_field("AddToStore.<op>")?;
        wire::write_string(&mut self.w, name)
            .await
            .with_field("AddToStore.name")?;
        // Backwards compatibility hack: fixed flag is 0 for sha256+recursive.
        wire::write_bool(
            &mut self.w,
            !(algo == crate::model::HashAlgo::Sha256 && recursive),
        )
        .await
        .with_field("AddToStore.fixed")?;
        wire::write_bool(&mut self.w, recursive)
            .await
            .with_field("AddToStore.recursive")?;
        wire::write_string(&mut self.w, algo.as_str())
            .await
            .with_field("AddToStore.hash_algo")?;

        if recursive {
            // The source is already an archive; forward it verbatim.
            tokio::io::copy(source, &mut self.w)
                .await
                .map_err(Error::from)
                .with_field("AddToStore.<dump>")?;
        } else {
            // Wrap the raw contents in a single-file archive.
            let mut contents = Vec::new();
            source.read_to_end(&mut contents).await?;
            wire::write_string(&mut self.w, wire::NAR_VERSION_MAGIC_1)
                .await
                .with_field("AddToStore.<dump>")?;
            wire::write_string(&mut self.w, "(").await.with_field("AddToStore.<dump>")?;
            wire::write_string(&mut self.w, "type")
                .await
                .with_field("AddToStore.<dump>")?;
            wire::write_string(&mut self.w, "regular")
                .await
                .with_field("AddToStore.<dump>")?;
            wire::write_string(&mut self.w, "contents")
                .await
                .with_field("AddToStore.<dump>")?;
            wire::write_bytes(&mut self.w, &contents)
                .await
                .with_field("AddToStore.<dump>")?;
            wire::write_string(&mut self.w, ")").await.with_field("AddToStore.<dump>")?;
        }

        self.process_stderr(logger).await?;
        wire::read_string(&mut self.r)
            .await
            .with_field("AddToStore.path")
    }

    /// Legacy text insertion for pre-25 daemons.
    #[instrument(skip(self, text, refs, logger))]
    pub async fn add_text_to_store_legacy(
        &mut self,
        name: &str,
        text: &str,
        refs: &[String],
        logger: &dyn Logger,
    ) -> Result<String> {
        wire::write_op(&mut self.w, wire::Op::AddTextToStore)
            .await
            .with_field("AddTextToStore.<op>")?;
        wire::write_string(&mut self.w, name)
            .await
            .with_field("AddTextToStore.name")?;
        wire::write_string(&mut self.w, text)
            .await
            .with_field("AddTextToStore.text")?;
        wire::write_strings(&mut self.w, refs)
            .await
            .with_field("AddTextToStore.refs")?;
        self.process_stderr(logger).await?;
        wire::read_string(&mut self.r)
            .await
            .with_field("AddTextToStore.path")
    }

    /// Imports a path with known metadata plus its archive bytes. Framed on
    /// minor 23+; older daemons pull the archive through `Read` frames.
    #[instrument(skip(self, info, source, logger))]
    pub async fn add_to_store_nar<R: AsyncRead + Unpin + Send>(
        &mut self,
        path: &str,
        info: &PathInfo,
        repair: bool,
        dont_check_sigs: bool,
        source: &mut R,
        logger: &dyn Logger,
    ) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::AddToStoreNar)
            .await
            .with_field("AddToStoreNar.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("AddToStoreNar.path")?;
        wire::write_string(&mut self.w, info.deriver.as_deref().unwrap_or(""))
            .await
            .with_field("AddToStoreNar.deriver")?;
        wire::write_string(&mut self.w, &info.nar_hash)
            .await
            .with_field("AddToStoreNar.nar_hash")?;
        wire::write_strings(&mut self.w, &info.references)
            .await
            .with_field("AddToStoreNar.references")?;
        wire::write_datetime(&mut self.w, info.registration_time)
            .await
            .with_field("AddToStoreNar.registration_time")?;
        wire::write_u64(&mut self.w, info.nar_size)
            .await
            .with_field("AddToStoreNar.nar_size")?;
        wire::write_bool(&mut self.w, info.ultimate)
            .await
            .with_field("AddToStoreNar.ultimate")?;
        wire::write_strings(&mut self.w, &info.signatures)
            .await
            .with_field("AddToStoreNar.signatures")?;
        wire::write_string(&mut self.w, info.ca.as_deref().unwrap_or(""))
            .await
            .with_field("AddToStoreNar.ca")?;
        wire::write_bool(&mut self.w, repair)
            .await
            .with_field("AddToStoreNar.repair")?;
        wire::write_bool(&mut self.w, dont_check_sigs)
            .await
            .with_field("AddToStoreNar.dont_check_sigs")?;

        if self.proto.since(23) {
            self.with_framed_source(source, logger).await
        } else {
            self.process_stderr_with(Option::<&mut tokio::io::Sink>::None, Some(source), logger)
                .await
        }
    }

    /// Uploads a batch of paths as one framed stream (minor 32+): a count
    /// followed by path, metadata and archive bytes for each entry. The
    /// stream in `source` must already have that shape.
    #[instrument(skip(self, source, logger))]
    pub async fn add_multiple_to_store<R: AsyncRead + Unpin + Send>(
        &mut self,
        repair: bool,
        dont_check_sigs: bool,
        source: &mut R,
        logger: &dyn Logger,
    ) -> Result<()> {
        self.require(32, "AddMultipleToStore")?;
        wire::write_op(&mut self.w, wire::Op::AddMultipleToStore)
            .await
            .with_field("AddMultipleToStore.<op>")?;
        wire::write_bool(&mut self.w, repair)
            .await
            .with_field("AddMultipleToStore.repair")?;
        wire::write_bool(&mut self.w, dont_check_sigs)
            .await
            .with_field("AddMultipleToStore.dont_check_sigs")?;
        self.with_framed_source(source, logger).await
    }

    /// Adds signatures to a store path.
    #[instrument(skip(self, sigs, logger))]
    pub async fn add_signatures(
        &mut self,
        path: &str,
        sigs: &[String],
        logger: &dyn Logger,
    ) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::AddSignatures)
            .await
            .with_field("AddSignatures.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("AddSignatures.path")?;
        wire::write_strings(&mut self.w, sigs)
            .await
            .with_field("AddSignatures.sigs")?;
        self.process_stderr(logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Creates a temporary GC root, which persists until the client
    /// disconnects.
    #[instrument(skip(self, logger))]
    pub async fn add_temp_root(&mut self, path: &str, logger: &dyn Logger) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::AddTempRoot)
            .await
            .with_field("AddTempRoot.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("AddTempRoot.path")?;
        self.process_stderr(logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Attaches a build log to a derivation (minor 32+), framed.
    #[instrument(skip(self, log, logger))]
    pub async fn add_build_log(
        &mut self,
        drv_path: &str,
        log: &[u8],
        logger: &dyn Logger,
    ) -> Result<()> {
        self.require(32, "AddBuildLog")?;
        wire::write_op(&mut self.w, wire::Op::AddBuildLog)
            .await
            .with_field("AddBuildLog.<op>")?;
        wire::write_string(&mut self.w, drv_path)
            .await
            .with_field("AddBuildLog.path")?;
        let mut source = log;
        self.with_framed_source(&mut source, logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Registers a realisation of a derivation output (minor 27+).
    #[instrument(skip(self, realisation, logger))]
    pub async fn register_drv_output(
        &mut self,
        realisation: &Realisation,
        logger: &dyn Logger,
    ) -> Result<()> {
        self.require(27, "RegisterDrvOutput")?;
        wire::write_op(&mut self.w, wire::Op::RegisterDrvOutput)
            .await
            .with_field("RegisterDrvOutput.<op>")?;
        if self.proto.since(31) {
            wire::write_string(&mut self.w, realisation.to_json())
                .await
                .with_field("RegisterDrvOutput.realisation")?;
        } else {
            wire::write_string(&mut self.w, realisation.id.render())
                .await
                .with_field("RegisterDrvOutput.id")?;
            wire::write_string(&mut self.w, &realisation.out_path)
                .await
                .with_field("RegisterDrvOutput.out_path")?;
        }
        self.process_stderr(logger).await
    }

    /// Builds the specified targets, failing fast on the first error.
    #[instrument(skip(self, targets, logger))]
    pub async fn build_paths(
        &mut self,
        targets: &[DerivedPath],
        mode: BuildMode,
        logger: &dyn Logger,
    ) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::BuildPaths)
            .await
            .with_field("BuildPaths.<op>")?;
        wire::write_strings(&mut self.w, targets.iter().map(|t| t.render()).collect::<Vec<_>>())
            .await
            .with_field("BuildPaths.targets")?;
        wire::write_build_mode(&mut self.w, mode)
            .await
            .with_field("BuildPaths.build_mode")?;
        self.process_stderr(logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Builds the specified targets and returns a result per target
    /// (minor 34+).
    #[instrument(skip(self, targets, logger))]
    pub async fn build_paths_with_results(
        &mut self,
        targets: &[DerivedPath],
        mode: BuildMode,
        logger: &dyn Logger,
    ) -> Result<HashMap<String, BuildResult>> {
        self.require(34, "BuildPathsWithResults")?;
        wire::write_op(&mut self.w, wire::Op::BuildPathsWithResults)
            .await
            .with_field("BuildPathsWithResults.<op>")?;
        wire::write_strings(&mut self.w, targets.iter().map(|t| t.render()).collect::<Vec<_>>())
            .await
            .with_field("BuildPathsWithResults.targets")?;
        wire::write_build_mode(&mut self.w, mode)
            .await
            .with_field("BuildPathsWithResults.build_mode")?;
        self.process_stderr(logger).await?;

        let count = wire::read_u64(&mut self.r)
            .await
            .with_field("BuildPathsWithResults.results.<count>")?;
        let mut results = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let target = wire::read_string(&mut self.r)
                .await
                .with_field("BuildPathsWithResults.results[].target")?;
            let result = wire::read_build_result(&mut self.r, self.proto)
                .await
                .with_field("BuildPathsWithResults.results[].result")?;
            results.insert(target, result);
        }
        Ok(results)
    }

    /// Builds one derivation from its in-memory description.
    #[instrument(skip(self, drv, logger))]
    pub async fn build_derivation(
        &mut self,
        drv_path: &str,
        drv: &Derivation,
        mode: BuildMode,
        logger: &dyn Logger,
    ) -> Result<BuildResult> {
        wire::write_op(&mut self.w, wire::Op::BuildDerivation)
            .await
            .with_field("BuildDerivation.<op>")?;
        wire::write_string(&mut self.w, drv_path)
            .await
            .with_field("BuildDerivation.drv_path")?;

        wire::write_u64(&mut self.w, drv.outputs.len() as u64)
            .await
            .with_field("BuildDerivation.outputs.<count>")?;
        for (name, output) in &drv.outputs {
            wire::write_string(&mut self.w, name)
                .await
                .with_field("BuildDerivation.outputs[].name")?;
            wire::write_string(&mut self.w, &output.path)
                .await
                .with_field("BuildDerivation.outputs[].path")?;
            wire::write_string(&mut self.w, &output.hash_algo)
                .await
                .with_field("BuildDerivation.outputs[].hash_algo")?;
            wire::write_string(&mut self.w, &output.hash)
                .await
                .with_field("BuildDerivation.outputs[].hash")?;
        }
        wire::write_strings(&mut self.w, &drv.input_srcs)
            .await
            .with_field("BuildDerivation.input_srcs")?;
        wire::write_string(&mut self.w, &drv.platform)
            .await
            .with_field("BuildDerivation.platform")?;
        wire::write_string(&mut self.w, &drv.builder)
            .await
            .with_field("BuildDerivation.builder")?;
        wire::write_strings(&mut self.w, &drv.args)
            .await
            .with_field("BuildDerivation.args")?;
        wire::write_string_map(&mut self.w, &drv.env)
            .await
            .with_field("BuildDerivation.env")?;

        wire::write_build_mode(&mut self.w, mode)
            .await
            .with_field("BuildDerivation.build_mode")?;
        self.process_stderr(logger).await?;
        wire::read_build_result(&mut self.r, self.proto)
            .await
            .with_field("BuildDerivation.result")
    }

    /// Ensures the specified store path exists, substituting if needed.
    #[instrument(skip(self, logger))]
    pub async fn ensure_path(&mut self, path: &str, logger: &dyn Logger) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::EnsurePath)
            .await
            .with_field("EnsurePath.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("EnsurePath.path")?;
        self.process_stderr(logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Returns the `(link, target)` of all known GC roots.
    #[instrument(skip(self, logger))]
    pub async fn find_roots(&mut self, logger: &dyn Logger) -> Result<HashMap<String, String>> {
        wire::write_op(&mut self.w, wire::Op::FindRoots)
            .await
            .with_field("FindRoots.<op>")?;
        self.process_stderr(logger).await?;

        let count = wire::read_u64(&mut self.r)
            .await
            .with_field("FindRoots.roots.<count>")?;
        let mut roots = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let link = wire::read_string(&mut self.r)
                .await
                .with_field("FindRoots.roots[].link")?;
            let target = wire::read_string(&mut self.r)
                .await
                .with_field("FindRoots.roots[].target")?;
            roots.insert(link, target);
        }
        Ok(roots)
    }

    /// Runs the garbage collector. The three trailing zeros are removed
    /// options that must stay on the wire.
    #[instrument(skip(self, options, logger))]
    pub async fn collect_garbage(
        &mut self,
        options: &GcOptions,
        logger: &dyn Logger,
    ) -> Result<GcResults> {
        use tokio_stream::StreamExt;

        wire::write_op(&mut self.w, wire::Op::CollectGarbage)
            .await
            .with_field("CollectGarbage.<op>")?;
        wire::write_u64(&mut self.w, options.action.into())
            .await
            .with_field("CollectGarbage.action")?;
        wire::write_strings(&mut self.w, &options.paths_to_delete)
            .await
            .with_field("CollectGarbage.paths_to_delete")?;
        wire::write_bool(&mut self.w, options.ignore_liveness)
            .await
            .with_field("CollectGarbage.ignore_liveness")?;
        wire::write_u64(&mut self.w, options.max_freed)
            .await
            .with_field("CollectGarbage.max_freed")?;
        for _ in 0..3 {
            wire::write_u64(&mut self.w, 0)
                .await
                .with_field("CollectGarbage.__obsolete")?;
        }
        self.process_stderr(logger).await?;

        let paths = wire::read_strings(&mut self.r)
            .collect::<Result<Vec<String>>>()
            .await
            .with_field("CollectGarbage.paths")?;
        let bytes_freed = wire::read_u64(&mut self.r)
            .await
            .with_field("CollectGarbage.bytes_freed")?;
        wire::read_u64(&mut self.r)
            .await
            .with_field("CollectGarbage.__obsolete")?;
        Ok(GcResults { paths, bytes_freed })
    }

    /// Deduplicates identical files in the store.
    #[instrument(skip(self, logger))]
    pub async fn optimise_store(&mut self, logger: &dyn Logger) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::OptimiseStore)
            .await
            .with_field("OptimiseStore.<op>")?;
        self.process_stderr(logger).await?;
        wire::read_u64(&mut self.r).await.with_field("__unused__")?;
        Ok(())
    }

    /// Checks store consistency; returns true if errors remain.
    #[instrument(skip(self, logger))]
    pub async fn verify_store(
        &mut self,
        check_contents: bool,
        repair: bool,
        logger: &dyn Logger,
    ) -> Result<bool> {
        wire::write_op(&mut self.w, wire::Op::VerifyStore)
            .await
            .with_field("VerifyStore.<op>")?;
        wire::write_bool(&mut self.w, check_contents)
            .await
            .with_field("VerifyStore.check_contents")?;
        wire::write_bool(&mut self.w, repair)
            .await
            .with_field("VerifyStore.repair")?;
        self.process_stderr(logger).await?;
        Ok(wire::read_bool(&mut self.r).await?)
    }

    /// Streams the archive of a store path into `sink`. The archive bytes
    /// follow the frame loop as one raw, self-delimiting stream.
    #[instrument(skip(self, sink, logger))]
    pub async fn nar_from_path<W: AsyncWrite + Unpin + Send>(
        &mut self,
        path: &str,
        sink: &mut W,
        logger: &dyn Logger,
    ) -> Result<()> {
        wire::write_op(&mut self.w, wire::Op::NarFromPath)
            .await
            .with_field("NarFromPath.<op>")?;
        wire::write_string(&mut self.w, path)
            .await
            .with_field("NarFromPath.path")?;
        self.process_stderr_with(Some(&mut *sink), Option::<&mut tokio::io::Empty>::None, logger)
            .await?;
        wire::copy_nar(&mut self.r, sink)
            .await
            .with_field("NarFromPath.nar")?;
        sink.flush().await.map_err(Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TracingLogger;
    use tokio_test::io::Builder;

    // Sanity check for version comparisons.
    #[test]
    fn test_version_ord() {
        assert!(Proto(0, 1) > Proto(0, 0));
        assert!(Proto(1, 0) > Proto(0, 0));
        assert!(Proto(1, 0) > Proto(0, 1));
        assert!(Proto(1, 1) > Proto(1, 0));
    }

    #[test]
    fn test_version_packing() {
        assert_eq!(0x0123u64, u64::from(Proto(1, 0x23)));
        assert_eq!(Proto(1, 0x23), Proto::from(0x0123u64));
    }

    fn le(v: u64) -> [u8; 8] {
        v.to_le_bytes()
    }

    fn pad_str<const L: usize>(s: &str) -> [u8; L] {
        assert!(L % 8 == 0);
        let mut v = [0u8; L];
        v[..s.len()].copy_from_slice(s.as_bytes());
        v
    }

    #[tokio::test]
    async fn test_handshake_minor_35() {
        let mock = Builder::new()
            .write(&le(wire::WORKER_MAGIC_1))
            .read(&le(wire::WORKER_MAGIC_2))
            .read(&le(Proto(1, 35).into())) // daemon version
            .write(&le(Proto(1, 37).into())) // client version
            .write(&le(0)) // obsolete cpu affinity
            .write(&le(0)) // obsolete reserve space
            .read(&le(6))
            .read(&pad_str::<8>("2.18.1")) // daemon version string
            .read(&le(1)) // trusted
            .read(&le(wire::FrameKind::Last as u64))
            // SetOptions for the defaults.
            .write(&le(wire::Op::SetOptions as u64))
            .write(&le(0)) // keep_failed
            .write(&le(0)) // keep_going
            .write(&le(0)) // try_fallback
            .write(&le(0)) // verbosity
            .write(&le(1)) // max_build_jobs
            .write(&le(0)) // max_silent_time
            .write(&le(1)) // obsolete use_build_hook
            .write(&le(0)) // verbose_build -> Error
            .write(&le(0)) // obsolete log type
            .write(&le(0)) // obsolete print build trace
            .write(&le(0)) // build_cores
            .write(&le(1)) // use_substitutes
            .write(&le(0)) // overrides count
            .read(&le(wire::FrameKind::Last as u64))
            .build();

        let conn = DaemonConnection::handshake(mock, &ClientSettings::default(), &TracingLogger)
            .await
            .expect("handshake failed");
        assert_eq!(Proto(1, 35), conn.proto());
        assert_eq!(Some("2.18.1"), conn.daemon_version());
        assert_eq!(Some(TrustedFlag::Trusted), conn.trusted());
        assert!(conn.is_good());
    }

    #[tokio::test]
    async fn test_handshake_magic_mismatch() {
        let mock = Builder::new()
            .write(&le(wire::WORKER_MAGIC_1))
            .read(&le(0x1234))
            .build();
        match DaemonConnection::handshake(mock, &ClientSettings::default(), &TracingLogger).await {
            Err(Error::Field("magic2", inner)) => {
                assert!(matches!(*inner, Error::Protocol(_)), "{:?}", inner)
            }
            other => panic!("expected protocol mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_daemon_too_old() {
        let mock = Builder::new()
            .write(&le(wire::WORKER_MAGIC_1))
            .read(&le(wire::WORKER_MAGIC_2))
            .read(&le(Proto(1, 20).into()))
            .build();
        match DaemonConnection::handshake(mock, &ClientSettings::default(), &TracingLogger).await {
            Err(Error::Unsupported(msg)) => assert!(msg.contains("daemon too old"), "{}", msg),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_wrong_major() {
        let mock = Builder::new()
            .write(&le(wire::WORKER_MAGIC_1))
            .read(&le(wire::WORKER_MAGIC_2))
            .read(&le(Proto(2, 35).into()))
            .build();
        match DaemonConnection::handshake(mock, &ClientSettings::default(), &TracingLogger).await {
            Err(Error::Unsupported(msg)) => assert!(msg.contains("major"), "{}", msg),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_caps_at_client_version() {
        // A daemon newer than us negotiates down to our minor.
        let mock = Builder::new()
            .write(&le(wire::WORKER_MAGIC_1))
            .read(&le(wire::WORKER_MAGIC_2))
            .read(&le(Proto(1, 99).into()))
            .write(&le(Proto(1, 37).into()))
            .write(&le(0))
            .write(&le(0))
            .read(&le(3))
            .read(&pad_str::<8>("3.0"))
            .read(&le(0)) // trust unknown
            .read(&le(wire::FrameKind::Last as u64))
            .write(&le(wire::Op::SetOptions as u64))
            .write(&le(0))
            .write(&le(0))
            .write(&le(0))
            .write(&le(0))
            .write(&le(1))
            .write(&le(0))
            .write(&le(1))
            .write(&le(0))
            .write(&le(0))
            .write(&le(0))
            .write(&le(0))
            .write(&le(1))
            .write(&le(0))
            .read(&le(wire::FrameKind::Last as u64))
            .build();

        let conn = DaemonConnection::handshake(mock, &ClientSettings::default(), &TracingLogger)
            .await
            .expect("handshake failed");
        assert_eq!(Proto(1, 37), conn.proto());
        assert_eq!(None, conn.trusted());
    }

    #[tokio::test]
    async fn test_is_valid_path_false() {
        let mock = Builder::new()
            .write(&le(wire::Op::IsValidPath as u64))
            .write(&le(53))
            .write(&pad_str::<56>(
                "/depot/store/ffffffffffffffffffffffffffffffff-invalid",
            ))
            .read(&le(wire::FrameKind::Last as u64))
            .read(&le(0))
            .build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 35));
        let valid = conn
            .is_valid_path(
                "/depot/store/ffffffffffffffffffffffffffffffff-invalid",
                &TracingLogger,
            )
            .await
            .unwrap();
        assert_eq!(false, valid);
    }

    #[tokio::test]
    async fn test_query_valid_paths_skips_flag_below_27() {
        let mock = Builder::new()
            .write(&le(wire::Op::QueryValidPaths as u64))
            .write(&le(0)) // no paths, and no substitute flag follows
            .read(&le(wire::FrameKind::Last as u64))
            .read(&le(0)) // empty reply
            .build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 26));
        let paths = conn
            .query_valid_paths(&[], true, &TracingLogger)
            .await
            .unwrap();
        assert_eq!(Vec::<String>::new(), paths);
    }

    #[tokio::test]
    async fn test_query_realisation_gated_below_27() {
        // No reads or writes: the opcode must never hit the wire.
        let mock = Builder::new().build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 26));
        let id: DrvOutput = "sha256:abcd!out".parse().unwrap();
        match conn.query_realisation(&id, &TracingLogger).await {
            Err(Error::Unsupported(msg)) => assert!(msg.contains("QueryRealisation"), "{}", msg),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_build_paths_with_results_gated_below_34() {
        let mock = Builder::new().build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 33));
        match conn
            .build_paths_with_results(&[], BuildMode::Normal, &TracingLogger)
            .await
        {
            Err(Error::Unsupported(msg)) => {
                assert!(msg.contains("BuildPathsWithResults"), "{}", msg)
            }
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_pathinfo_invalid_is_none() {
        // A remote "is not valid" error decodes to None instead of an error.
        let mock = Builder::new()
            .write(&le(wire::Op::QueryPathInfo as u64))
            .write(&le(50))
            .write(&pad_str::<56>(
                "/depot/store/ffffffffffffffffffffffffffffffff-nope",
            ))
            .read(&le(wire::FrameKind::Error as u64))
            .read(&le(5))
            .read(&pad_str::<8>("Error"))
            .read(&le(0))
            .read(&le(5))
            .read(&pad_str::<8>("Error"))
            .read(&le(17))
            .read(&pad_str::<24>("path is not valid"))
            .read(&le(0))
            .read(&le(0))
            .build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 35));
        let info = conn
            .query_pathinfo(
                "/depot/store/ffffffffffffffffffffffffffffffff-nope",
                &TracingLogger,
            )
            .await
            .unwrap();
        assert_eq!(None, info);
    }

    #[tokio::test]
    async fn test_add_build_log_gated_below_32() {
        let mock = Builder::new().build();
        let mut conn = DaemonConnection::with_proto(mock, Proto(1, 31));
        match conn
            .add_build_log("/depot/store/aaaa-hello.drv", b"log line\n", &TracingLogger)
            .await
        {
            Err(Error::Unsupported(msg)) => assert!(msg.contains("AddBuildLog"), "{}", msg),
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }
}
