// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! Low-level helpers for the daemon wire format.
//!
//! Everything is little-endian and 8-byte aligned: integers are u64,
//! byte-strings carry a u64 length and are zero-padded to the next 8-byte
//! boundary, sequences and maps are a u64 count followed by their elements,
//! and variants are a u64 discriminator followed by the payload. The codec is
//! stateless and symmetric; the same functions serve both directions.

use crate::daemon::Proto;
use crate::model::{DrvOutput, Realisation};
use crate::{
    BuildMode, BuildResult, BuildResultStatus, ClientSettings, DaemonError, Error, PathInfo,
    Result, ResultExt, StderrField, StderrResult, StderrStartActivity, TrustedFlag, Verbosity,
};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tap::{Tap, TapFallible};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::Stream;
use tracing::{instrument, trace};

/// Magic number sent by the client.
pub const WORKER_MAGIC_1: u64 = 0x6e697863;
/// Magic number sent by the daemon.
pub const WORKER_MAGIC_2: u64 = 0x6478696f;
/// Magic string opening every archive stream.
pub const NAR_VERSION_MAGIC_1: &str = "nix-archive-1";

/// Opcodes.
///
/// Numeric values are stable across protocol versions: new operations get new
/// numbers, old operations are never renumbered. Gaps are operations that
/// were obsolete before the earliest protocol minor we support (21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Op {
    IsValidPath = 1,
    QueryReferrers = 6,
    AddToStore = 7,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    QueryPathFromHashPart = 29,
    QuerySubstitutablePathInfos = 30,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
    RegisterDrvOutput = 42,
    QueryRealisation = 43,
    AddMultipleToStore = 44,
    AddBuildLog = 45,
    BuildPathsWithResults = 46,

    /// Obsolete on minor 25+, where AddToStore takes a rendered CA method.
    AddTextToStore = 8,
    /// Obsolete on minor 22+, where the output map subsumes it.
    QueryDerivationOutputs = 22,
}
impl From<TryFromPrimitiveError<Op>> for Error {
    fn from(value: TryFromPrimitiveError<Op>) -> Self {
        Self::Protocol(format!("Op({:x})", value.number))
    }
}

/// Tags of the out-of-band frames interleaved with every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum FrameKind {
    Next = 0x6f6c6d67,
    Read = 0x64617461,
    Write = 0x64617416,
    Last = 0x616c7473,
    Error = 0x63787470,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
}

/// One decoded out-of-band frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A plain log line.
    Next(String),
    /// The daemon wants up to this many bytes from the caller's source.
    Read(u64),
    /// Bulk data for the caller's sink.
    Write(Vec<u8>),
    /// Terminal: the reply follows.
    Last,
    /// Terminal: the operation failed remotely.
    Error(DaemonError),
    StartActivity(StderrStartActivity),
    StopActivity { act_id: u64 },
    Result(StderrResult),
}

fn padding(len: u64) -> u64 {
    (8 - len % 8) % 8
}

/// Read a u64 from the stream (little endian).
#[instrument(skip(r), level = "trace")]
pub async fn read_u64<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<u64> {
    r.read_u64_le().await.tap_ok(|v| trace!(v, "<-"))
}
/// Write a u64 to the stream (little endian).
#[instrument(skip(w, v), level = "trace")]
pub async fn write_u64<W: AsyncWriteExt + Unpin>(w: &mut W, v: u64) -> std::io::Result<()> {
    w.write_u64_le(v.tap(|v| trace!(v, "->"))).await
}

/// Read a boolean from the stream, encoded as u64 (>0 is true).
#[instrument(skip(r), level = "trace")]
pub async fn read_bool<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<bool> {
    read_u64(r).await.map(|v| v > 0).tap_ok(|v| trace!(v, "<-"))
}
/// Write a boolean to the stream, encoded as u64.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_bool<W: AsyncWriteExt + Unpin>(w: &mut W, v: bool) -> std::io::Result<()> {
    write_u64(w, if v { 1 } else { 0 }).await
}

/// Read a timestamp (seconds since the epoch) from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_datetime<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<DateTime<Utc>> {
    read_u64(r).await.map_err(Into::into).and_then(|ts| {
        DateTime::from_timestamp(ts as i64, 0)
            .ok_or_else(|| Error::Protocol(format!("timestamp {}", ts)))
            .tap_ok(|dt| trace!(?dt, "<-"))
    })
}
/// Write a timestamp (seconds since the epoch) to the stream.
#[instrument(skip(w, dt), level = "trace")]
pub async fn write_datetime<W: AsyncWriteExt + Unpin>(w: &mut W, dt: DateTime<Utc>) -> Result<()> {
    let ts: u64 = dt
        .timestamp()
        .try_into()
        .map_err(|_| Error::Protocol(format!("pre-epoch timestamp {}", dt)))?;
    Ok(write_u64(w, ts).await?)
}

/// Read a protocol version from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_proto<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Proto> {
    read_u64(r)
        .await
        .map(Proto::from)
        .tap_ok(|v| trace!(?v, "<-"))
}
/// Write a protocol version to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_proto<W: AsyncWriteExt + Unpin>(w: &mut W, v: Proto) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await
}

/// Read an opcode from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_op<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Op> {
    Ok(read_u64(r).await?.try_into().tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write an opcode to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_op<W: AsyncWriteExt + Unpin>(w: &mut W, v: Op) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await
}

/// Read a verbosity level from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_verbosity<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Verbosity> {
    Ok(read_u64(r).await?.try_into().tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write a verbosity level to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_verbosity<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: Verbosity,
) -> std::io::Result<()> {
    write_u64(w, v.into()).await
}

/// Read a build mode from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_build_mode<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<BuildMode> {
    Ok(read_u64(r).await?.try_into().tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write a build mode to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_build_mode<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: BuildMode,
) -> std::io::Result<()> {
    write_u64(w, v.into()).await
}

/// Read a build result status from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_build_result_status<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> Result<BuildResultStatus> {
    Ok(read_u64(r).await?.try_into().tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write a build result status to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_build_result_status<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: BuildResultStatus,
) -> std::io::Result<()> {
    write_u64(w, v.into()).await
}

/// Read a tri-state trust flag (0 unknown, 1 trusted, 2 not trusted).
#[instrument(skip(r), level = "trace")]
pub async fn read_trusted_flag<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Option<TrustedFlag>> {
    match read_u64(r).await? {
        0 => Ok(None),
        1 => Ok(Some(TrustedFlag::Trusted)),
        2 => Ok(Some(TrustedFlag::NotTrusted)),
        v => Err(Error::Protocol(format!("TrustedFlag({})", v))),
    }
    .tap_ok(|v| trace!(?v, "<-"))
}
/// Write a tri-state trust flag.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_trusted_flag<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: Option<TrustedFlag>,
) -> std::io::Result<()> {
    write_u64(
        w,
        match v {
            None => 0,
            Some(TrustedFlag::Trusted) => 1,
            Some(TrustedFlag::NotTrusted) => 2,
        },
    )
    .await
}

/// Read a byte-string from the stream: a u64 length, the data, then zero
/// padding up to the next 8-byte boundary. Lengths above 2^32 and non-zero
/// padding bytes are rejected.
#[instrument(skip(r), level = "trace")]
pub async fn read_bytes<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(r).await?;
    if len > u32::MAX as u64 {
        return Err(Error::Protocol(format!(
            "byte-string length {:#x} out of range",
            len
        )));
    }
    let len = len as usize;
    let padded_len = len + padding(len as u64) as usize;
    let mut buf = vec![0u8; padded_len];
    r.read_exact(&mut buf).await?;
    if buf[len..].iter().any(|&b| b != 0) {
        return Err(Error::Protocol("non-zero byte-string padding".into()));
    }
    buf.truncate(len);
    trace!(len, "<-");
    Ok(buf)
}

/// Write a byte-string to the stream. See [`read_bytes`] for the encoding.
#[instrument(skip(w, b), level = "trace")]
pub async fn write_bytes<W: AsyncWriteExt + Unpin>(w: &mut W, b: &[u8]) -> std::io::Result<()> {
    write_u64(w, b.len() as u64).await?;
    if !b.is_empty() {
        w.write_all(b).await?;
        let pad_len = padding(b.len() as u64) as usize;
        if pad_len > 0 {
            let pad_buf = [0u8; 7];
            w.write_all(&pad_buf[..pad_len]).await?;
            trace!(pad_len, "[ padding ]");
        }
    }
    Ok(())
}

/// Read a string from the stream: a byte-string decoded as (lossy) UTF-8.
#[instrument(skip(r), level = "trace")]
pub async fn read_string<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<String> {
    let buf = read_bytes(r).await?;
    Ok(String::from_utf8_lossy(&buf).to_string()).tap_ok(|v| trace!(v, "<-"))
}

/// Write a string to the stream, truncated at the first NUL.
#[instrument(skip(w, s), level = "trace")]
pub async fn write_string<W: AsyncWriteExt + Unpin, S: AsRef<str> + Debug>(
    w: &mut W,
    s: S,
) -> std::io::Result<()> {
    trace!(v = ?s, "->");
    let truncated = s.as_ref().split('\0').next().unwrap_or_default();
    write_bytes(w, truncated.as_bytes()).await
}

/// Expect an exact string from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn expect_string<R: AsyncReadExt + Unpin>(r: &mut R, expected: &str) -> Result<()> {
    let s = read_string(r).await?;
    if s == expected {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "expected '{}', got '{}'",
            expected, s
        )))
    }
}

/// Read a list (or set) of strings from the stream - a u64 count, followed by
/// that many strings using the normal `read_string()` encoding.
#[instrument(skip(r), level = "trace")]
pub fn read_strings<R: AsyncReadExt + Unpin>(r: &mut R) -> impl Stream<Item = Result<String>> + '_ {
    try_stream! {
        let count = read_u64(r).await.with_field("<count>")?;
        for _ in 0..count {
            yield read_string(r).await?;
        }
    }
}
/// Write a list of strings to the stream.
#[instrument(skip(w, si), level = "trace")]
pub async fn write_strings<W: AsyncWriteExt + Unpin, I>(w: &mut W, si: I) -> std::io::Result<()>
where
    I: IntoIterator + Send,
    I::IntoIter: ExactSizeIterator + Send,
    I::Item: AsRef<str> + Send + Sync,
{
    let si = si.into_iter();
    write_u64(w, si.len() as u64).await?;
    for s in si {
        write_string(w, s.as_ref()).await?;
    }
    Ok(())
}

/// Read a string-to-string map: a u64 count followed by key/value pairs.
#[instrument(skip(r), level = "trace")]
pub async fn read_string_map<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> Result<BTreeMap<String, String>> {
    let count = read_u64(r).await.with_field("<count>")?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = read_string(r).await?;
        let value = read_string(r).await?;
        map.insert(key, value);
    }
    Ok(map)
}
/// Write a string-to-string map in iteration (lexicographic) order.
#[instrument(skip(w, map), level = "trace")]
pub async fn write_string_map<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    map: &BTreeMap<String, String>,
) -> std::io::Result<()> {
    write_u64(w, map.len() as u64).await?;
    for (key, value) in map {
        write_string(w, key).await?;
        write_string(w, value).await?;
    }
    Ok(())
}

/// Read a structured error payload from the stream (protocol minor 26+).
#[instrument(skip(r), level = "trace")]
pub async fn read_error<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<DaemonError> {
    expect_string(r, "Error")
        .await
        .with_field("Error.__unused_type_1")?;

    let level = read_verbosity(r).await.with_field("Error.level")?;

    expect_string(r, "Error")
        .await
        .with_field("Error.__unused_type_2")?;

    let msg = read_string(r).await.with_field("Error.msg")?;

    read_u64(r).await.with_field("Error.__unused_err_pos")?;

    let num_traces = read_u64(r).await.with_field("Error.traces[].<count>")?;
    let mut traces = Vec::with_capacity(num_traces.try_into().unwrap_or_default());
    for _ in 0..num_traces {
        read_u64(r)
            .await
            .with_field("Error.traces[].__unused_pos")?;
        traces.push(read_string(r).await.with_field("Error.traces[].hint")?);
    }

    Ok(DaemonError { level, msg, traces })
}

/// Write a structured error payload to the stream (protocol minor 26+).
#[instrument(skip(w, v), level = "trace")]
pub async fn write_error<W: AsyncWriteExt + Unpin>(w: &mut W, v: &DaemonError) -> Result<()> {
    write_string(w, "Error")
        .await
        .with_field("Error.__unused_type_1")?;

    write_verbosity(w, v.level).await.with_field("Error.level")?;

    write_string(w, "Error")
        .await
        .with_field("Error.__unused_type_2")?;

    write_string(w, &v.msg).await.with_field("Error.msg")?;

    write_u64(w, 0).await.with_field("Error.__unused_err_pos")?;

    write_u64(w, v.traces.len() as u64)
        .await
        .with_field("Error.traces[].<count>")?;
    for trace in v.traces.iter() {
        write_u64(w, 0)
            .await
            .with_field("Error.traces[].__unused_pos")?;
        write_string(w, trace)
            .await
            .with_field("Error.traces[].hint")?;
    }

    Ok(())
}

/// Read one out-of-band frame. The protocol version selects between the
/// structured (minor 26+) and the legacy (message, status) error payloads.
#[instrument(skip(r), level = "trace")]
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R, proto: Proto) -> Result<Frame> {
    let kind = FrameKind::try_from(read_u64(r).await?)
        .map_err(|TryFromPrimitiveError { number }| {
            Error::Protocol(format!("frame tag {:#x}", number))
        })?
        .tap(|kind| trace!(?kind, "<-"));

    match kind {
        FrameKind::Last => Ok(Frame::Last),
        FrameKind::Next => Ok(Frame::Next(read_string(r).await?)),
        FrameKind::Read => Ok(Frame::Read(read_u64(r).await?)),
        FrameKind::Write => Ok(Frame::Write(read_bytes(r).await?)),
        FrameKind::Error => {
            if proto.since(26) {
                Ok(Frame::Error(read_error(r).await?))
            } else {
                let msg = read_string(r).await.with_field("Error.msg")?;
                read_u64(r).await.with_field("Error.status")?;
                Ok(Frame::Error(DaemonError {
                    level: Verbosity::Error,
                    msg,
                    traces: Vec::new(),
                }))
            }
        }
        FrameKind::StartActivity => Ok(Frame::StartActivity(read_start_activity(r).await?)),
        FrameKind::StopActivity => Ok(Frame::StopActivity {
            act_id: read_u64(r).await?,
        }),
        FrameKind::Result => Ok(Frame::Result(read_stderr_result(r).await?)),
    }
    .tap_ok(|frame| trace!(?frame, "<-"))
}

/// Write one out-of-band frame; the other half of [`read_frame`].
#[instrument(skip(w, v), level = "trace")]
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: &Frame,
    proto: Proto,
) -> Result<()> {
    trace!(?v, "->");
    match v {
        Frame::Last => write_u64(w, FrameKind::Last.into()).await?,
        Frame::Next(s) => {
            write_u64(w, FrameKind::Next.into()).await?;
            write_string(w, s).await?;
        }
        Frame::Read(n) => {
            write_u64(w, FrameKind::Read.into()).await?;
            write_u64(w, *n).await?;
        }
        Frame::Write(bytes) => {
            write_u64(w, FrameKind::Write.into()).await?;
            write_bytes(w, bytes).await?;
        }
        Frame::Error(err) => {
            write_u64(w, FrameKind::Error.into()).await?;
            if proto.since(26) {
                write_error(w, err).await?;
            } else {
                write_string(w, &err.msg).await?;
                write_u64(w, 1).await?;
            }
        }
        Frame::StartActivity(start) => {
            write_u64(w, FrameKind::StartActivity.into()).await?;
            write_u64(w, start.act_id).await?;
            write_verbosity(w, start.level).await?;
            write_u64(w, start.kind.into()).await?;
            write_string(w, &start.s).await?;
            write_stderr_fields(w, &start.fields).await?;
            write_u64(w, start.parent_id).await?;
        }
        Frame::StopActivity { act_id } => {
            write_u64(w, FrameKind::StopActivity.into()).await?;
            write_u64(w, *act_id).await?;
        }
        Frame::Result(res) => {
            write_u64(w, FrameKind::Result.into()).await?;
            write_u64(w, res.act_id).await?;
            write_u64(w, res.kind.into()).await?;
            write_stderr_fields(w, &res.fields).await?;
        }
    }
    Ok(())
}

#[instrument(skip(r), level = "trace")]
async fn read_start_activity<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<StderrStartActivity> {
    Ok(StderrStartActivity {
        act_id: read_u64(r).await?,
        level: read_verbosity(r).await?,
        kind: read_u64(r).await?.try_into()?,
        s: read_string(r).await?,
        fields: read_stderr_fields(r).await?,
        parent_id: read_u64(r).await?,
    }
    .tap(|act| trace!(?act, "<-")))
}

#[instrument(skip(r), level = "trace")]
async fn read_stderr_result<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<StderrResult> {
    Ok(StderrResult {
        act_id: read_u64(r).await?,
        kind: read_u64(r).await?.try_into()?,
        fields: read_stderr_fields(r).await?,
    }
    .tap(|res| trace!(?res, "<-")))
}

#[instrument(skip(r), level = "trace")]
pub async fn read_stderr_fields<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<StderrField>> {
    let count = read_u64(r).await.with_field("fields.<count>")? as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(
            match read_u64(r).await.with_field("fields[].<type>")? {
                0 => Ok(StderrField::Int(read_u64(r).await?)),
                1 => Ok(StderrField::String(read_string(r).await?)),
                v => Err(Error::Protocol(format!("field type {}", v))),
            }
            .with_field("fields[]")?,
        )
    }
    Ok(fields)
}

#[instrument(skip(w, vs), level = "trace")]
pub async fn write_stderr_fields<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    vs: &[StderrField],
) -> Result<()> {
    write_u64(w, vs.len() as u64)
        .await
        .with_field("fields.<count>")?;
    for field in vs {
        match field {
            StderrField::Int(v) => {
                write_u64(w, 0).await.with_field("fields[].<type>")?;
                write_u64(w, *v).await.with_field("fields[]")?;
            }
            StderrField::String(v) => {
                write_u64(w, 1).await.with_field("fields[].<type>")?;
                write_string(w, v).await.with_field("fields[]")?;
            }
        }
    }
    Ok(())
}

/// Read a build result from the stream. The time and determinism fields only
/// exist on minor 29+, the built-outputs map on minor 28+.
#[instrument(skip(r), level = "trace")]
pub async fn read_build_result<R: AsyncReadExt + Unpin>(
    r: &mut R,
    proto: Proto,
) -> Result<BuildResult> {
    let status = read_build_result_status(r)
        .await
        .with_field("BuildResult.status")?;
    let error_msg = read_string(r).await.with_field("BuildResult.error_msg")?;

    let mut br = BuildResult {
        status,
        error_msg,
        times_built: 0,
        is_non_deterministic: false,
        start_time: DateTime::default(),
        stop_time: DateTime::default(),
        built_outputs: BTreeMap::default(),
    };

    if proto.since(29) {
        br.times_built = read_u64(r).await.with_field("BuildResult.times_built")?;
        br.is_non_deterministic = read_bool(r)
            .await
            .with_field("BuildResult.is_non_deterministic")?;
        br.start_time = read_datetime(r)
            .await
            .with_field("BuildResult.start_time")?;
        br.stop_time = read_datetime(r).await.with_field("BuildResult.stop_time")?;
    }
    if proto.since(28) {
        let count = read_u64(r)
            .await
            .with_field("BuildResult.built_outputs.<count>")?;
        for _ in 0..count {
            let id: DrvOutput = read_string(r)
                .await
                .with_field("BuildResult.built_outputs[].id")?
                .parse()
                .with_field("BuildResult.built_outputs[].id")?;
            let realisation = read_string(r)
                .await
                .map_err(Error::from)
                .and_then(|s| Realisation::from_json(&s))
                .with_field("BuildResult.built_outputs[].realisation")?;
            br.built_outputs.insert(id.output, realisation);
        }
    }

    Ok(br)
}

/// Write a build result to the stream; the other half of [`read_build_result`].
#[instrument(skip(w, result), level = "trace")]
pub async fn write_build_result<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    result: &BuildResult,
    proto: Proto,
) -> Result<()> {
    write_build_result_status(w, result.status)
        .await
        .with_field("BuildResult.status")?;
    write_string(w, &result.error_msg)
        .await
        .with_field("BuildResult.error_msg")?;

    if proto.since(29) {
        write_u64(w, result.times_built)
            .await
            .with_field("BuildResult.times_built")?;
        write_bool(w, result.is_non_deterministic)
            .await
            .with_field("BuildResult.is_non_deterministic")?;
        write_datetime(w, result.start_time)
            .await
            .with_field("BuildResult.start_time")?;
        write_datetime(w, result.stop_time)
            .await
            .with_field("BuildResult.stop_time")?;
    }
    if proto.since(28) {
        write_u64(w, result.built_outputs.len() as u64)
            .await
            .with_field("BuildResult.built_outputs.<count>")?;
        for realisation in result.built_outputs.values() {
            write_string(w, realisation.id.render())
                .await
                .with_field("BuildResult.built_outputs[].id")?;
            write_string(w, realisation.to_json())
                .await
                .with_field("BuildResult.built_outputs[].realisation")?;
        }
    }

    Ok(())
}

/// Read a ClientSettings structure from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_client_settings<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<ClientSettings> {
    let keep_failed = read_bool(r).await.with_field("ClientSettings.keep_failed")?;
    let keep_going = read_bool(r).await.with_field("ClientSettings.keep_going")?;
    let try_fallback = read_bool(r)
        .await
        .with_field("ClientSettings.try_fallback")?;
    let verbosity = read_verbosity(r)
        .await
        .with_field("ClientSettings.verbosity")?;
    let max_build_jobs = read_u64(r)
        .await
        .with_field("ClientSettings.max_build_jobs")?;
    let max_silent_time = read_u64(r)
        .await
        .with_field("ClientSettings.max_silent_time")?;
    read_u64(r)
        .await
        .with_field("ClientSettings.__obsolete_use_build_hook")?;
    let verbose_build = read_verbosity(r)
        .await
        .map(|v| v == Verbosity::Error)
        .with_field("ClientSettings.verbose_build")?;
    read_u64(r)
        .await
        .with_field("ClientSettings.__obsolete_log_type")?;
    read_u64(r)
        .await
        .with_field("ClientSettings.__obsolete_print_build_trace")?;
    let build_cores = read_u64(r).await.with_field("ClientSettings.build_cores")?;
    let use_substitutes = read_bool(r)
        .await
        .with_field("ClientSettings.use_substitutes")?;
    let overrides = read_string_map(r)
        .await
        .with_field("ClientSettings.overrides")?;

    Ok(ClientSettings {
        keep_failed,
        keep_going,
        try_fallback,
        verbosity,
        max_build_jobs,
        max_silent_time,
        verbose_build,
        build_cores,
        use_substitutes,
        overrides,
    })
}

/// Write a ClientSettings structure to the stream. The zeroed fields are
/// obsolete but must stay on the wire.
#[instrument(skip(w, cs), level = "trace")]
pub async fn write_client_settings<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    cs: &ClientSettings,
) -> Result<()> {
    write_bool(w, cs.keep_failed)
        .await
        .with_field("ClientSettings.keep_failed")?;
    write_bool(w, cs.keep_going)
        .await
        .with_field("ClientSettings.keep_going")?;
    write_bool(w, cs.try_fallback)
        .await
        .with_field("ClientSettings.try_fallback")?;
    write_verbosity(w, cs.verbosity)
        .await
        .with_field("ClientSettings.verbosity")?;
    write_u64(w, cs.max_build_jobs)
        .await
        .with_field("ClientSettings.max_build_jobs")?;
    write_u64(w, cs.max_silent_time)
        .await
        .with_field("ClientSettings.max_silent_time")?;
    write_u64(w, 1)
        .await
        .with_field("ClientSettings.__obsolete_use_build_hook")?;
    write_verbosity(
        w,
        if cs.verbose_build {
            Verbosity::Error
        } else {
            Verbosity::Vomit
        },
    )
    .await
    .with_field("ClientSettings.verbose_build")?;
    write_u64(w, 0)
        .await
        .with_field("ClientSettings.__obsolete_log_type")?;
    write_u64(w, 0)
        .await
        .with_field("ClientSettings.__obsolete_print_build_trace")?;
    write_u64(w, cs.build_cores)
        .await
        .with_field("ClientSettings.build_cores")?;
    write_bool(w, cs.use_substitutes)
        .await
        .with_field("ClientSettings.use_substitutes")?;
    write_string_map(w, &cs.overrides)
        .await
        .with_field("ClientSettings.overrides")?;

    Ok(())
}

fn empty_to_none(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Read a PathInfo structure (without its path) from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_pathinfo<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<PathInfo> {
    use tokio_stream::StreamExt;

    let deriver = read_string(r)
        .await
        .map(empty_to_none) // "" -> None.
        .with_field("PathInfo.deriver")?;
    let nar_hash = read_string(r).await.with_field("PathInfo.nar_hash")?;
    let references = read_strings(r)
        .collect::<Result<Vec<_>>>()
        .await
        .with_field("PathInfo.references")?;
    let registration_time = read_datetime(r)
        .await
        .with_field("PathInfo.registration_time")?;
    let nar_size = read_u64(r).await.with_field("PathInfo.nar_size")?;
    let ultimate = read_bool(r).await.with_field("PathInfo.ultimate")?;
    let signatures = read_strings(r)
        .collect::<Result<Vec<_>>>()
        .await
        .with_field("PathInfo.signatures")?;
    let ca = read_string(r)
        .await
        .map(empty_to_none)
        .with_field("PathInfo.ca")?;

    Ok(PathInfo {
        deriver,
        nar_hash,
        references,
        registration_time,
        nar_size,
        ultimate,
        signatures,
        ca,
    })
}

/// Write a PathInfo structure (without its path) to the stream.
#[instrument(skip(w, pi), level = "trace")]
pub async fn write_pathinfo<W: AsyncWriteExt + Unpin>(w: &mut W, pi: &PathInfo) -> Result<()> {
    write_string(w, pi.deriver.as_deref().unwrap_or(""))
        .await
        .with_field("PathInfo.deriver")?;
    write_string(w, pi.nar_hash.as_str())
        .await
        .with_field("PathInfo.nar_hash")?;
    write_strings(w, &pi.references)
        .await
        .with_field("PathInfo.references")?;
    write_datetime(w, pi.registration_time)
        .await
        .with_field("PathInfo.registration_time")?;
    write_u64(w, pi.nar_size)
        .await
        .with_field("PathInfo.nar_size")?;
    write_bool(w, pi.ultimate)
        .await
        .with_field("PathInfo.ultimate")?;
    write_strings(w, &pi.signatures)
        .await
        .with_field("PathInfo.signatures")?;
    write_string(w, pi.ca.as_deref().unwrap_or(""))
        .await
        .with_field("PathInfo.ca")?;
    Ok(())
}

/// Copy everything from `r` into length-prefixed frames on `w`, terminated by
/// a zero-length frame. This is the producer half of the framed-sink
/// subprotocol used by bulk uploads.
#[instrument(skip_all, level = "trace")]
pub async fn copy_to_framed<R: AsyncReadExt + Unpin, W: AsyncWriteExt + Unpin>(
    r: &mut R,
    w: &mut W,
    buf: &mut [u8],
) -> Result<()> {
    loop {
        let len = r.read(buf).await?;
        write_u64(w, len as u64).await?;
        if len == 0 {
            trace!("Done");
            return Ok(());
        }
        w.write_all(&buf[..len]).await?;
        trace!(len, "Copied frame...");
    }
}

/// Copy exactly one well-formed archive stream from `r` to `w` without
/// interpreting it. The archive grammar is a magic string followed by a
/// parenthesised token tree; value tokens (file contents, symlink targets,
/// entry names) are streamed through a bounded buffer, so arbitrarily large
/// files pass through in constant memory.
#[instrument(skip_all, level = "trace")]
pub async fn copy_nar<R: AsyncReadExt + Unpin, W: AsyncWriteExt + Unpin>(
    r: &mut R,
    w: &mut W,
) -> Result<()> {
    expect_string(r, NAR_VERSION_MAGIC_1)
        .await
        .with_field("Nar.magic")?;
    write_string(w, NAR_VERSION_MAGIC_1)
        .await
        .with_field("Nar.magic")?;

    let mut buf = [0u8; 64 * 1024];
    let mut depth = 0u64;
    let mut expect_value = false;
    loop {
        if expect_value {
            copy_token(r, w, &mut buf).await.with_field("Nar.value")?;
            expect_value = false;
            continue;
        }
        let tok = read_string(r).await.with_field("Nar.token")?;
        write_string(w, &tok).await.with_field("Nar.token")?;
        match tok.as_str() {
            "(" => depth += 1,
            ")" => {
                depth -= 1;
                if depth == 0 {
                    trace!("Done");
                    return Ok(());
                }
            }
            // These keys are followed by a single opaque value token.
            "type" | "contents" | "target" | "name" | "executable" => expect_value = true,
            _ => {}
        }
    }
}

/// Copy one byte-string (with its length and padding) verbatim.
async fn copy_token<R: AsyncReadExt + Unpin, W: AsyncWriteExt + Unpin>(
    r: &mut R,
    w: &mut W,
    buf: &mut [u8],
) -> Result<()> {
    let len = read_u64(r).await?;
    write_u64(w, len).await?;
    let mut remaining = len + padding(len);
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..n]).await?;
        w.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}
