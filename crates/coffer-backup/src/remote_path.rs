// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Bidirectional mapping between local backup files and remote object
//! keys.
//!
//! The object store has no directory semantics, so the key layout *is*
//! the index: instants are formatted `yyyyMMddHHmm`, which sorts
//! lexicographically, so prefix scans over keys double as time scans.
//! Data keys follow
//! `<base>/<prefix>/<reverse(app)>/<token>/<instant>/<ks>/<cf>/<TAG>/<file>`;
//! commit logs drop the column-family segment and use the pseudo-keyspace
//! `commitlog`; meta keys live under `<root>/META/`.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use strum::{Display, EnumString};

use crate::error::{BackupError, BackupResult};

/// Minute-resolution instant format embedded in every key.
pub const TIME_FORMAT: &str = "%Y%m%d%H%M";

/// Pseudo-keyspace commit-log keys are filed under.
pub const COMMIT_LOG_KEYSPACE: &str = "commitlog";

const V1_META_SUFFIX: &str = "-meta.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum FileKind {
    #[strum(serialize = "SNAP")]
    Snapshot,
    #[strum(serialize = "SST")]
    SsTable,
    #[strum(serialize = "CL")]
    CommitLog,
    #[strum(serialize = "META")]
    Meta,
    #[strum(serialize = "META_V2")]
    MetaV2,
}

impl FileKind {
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            FileKind::Snapshot | FileKind::SsTable | FileKind::CommitLog
        )
    }
}

pub fn format_instant(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn parse_instant(s: &str) -> BackupResult<DateTime<Utc>> {
    if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BackupError::malformed_key(s, "instant is not yyyyMMddHHmm"));
    }
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| BackupError::malformed_key(s, err.to_string()))
}

pub fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    let seconds = time.timestamp();
    Utc.timestamp_opt(seconds - seconds.rem_euclid(60), 0)
        .single()
        .expect("whole-minute timestamp is always representable")
}

/// Everything before the last `-` of an SSTable file name, shared by all
/// components of one table generation.
pub fn sstable_base_name(file_name: &str) -> Option<&str> {
    file_name.rfind('-').map(|idx| &file_name[..idx])
}

/// Key-context shared by every path of one node: where in the store the
/// cluster lives and which ring position this node holds.
#[derive(Clone, Debug)]
pub struct KeyLayout {
    pub base: String,
    pub prefix: String,
    pub cluster: String,
    pub token: String,
}

impl KeyLayout {
    pub fn new(
        base: impl Into<String>,
        prefix: impl Into<String>,
        cluster: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into(),
            prefix: prefix.into(),
            cluster: cluster.into(),
            token: token.into(),
        }
    }

    /// `<base>/<prefix>/<reverse(cluster)>/<token>`. The cluster name is
    /// reversed to spread keys across object-store hash partitions.
    pub fn root(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base,
            self.prefix,
            reverse_cluster(&self.cluster),
            self.token
        )
    }

    pub fn meta_root(&self) -> String {
        format!("{}/META", self.root())
    }
}

pub fn reverse_cluster(name: &str) -> String {
    name.chars().rev().collect()
}

/// One backed-up (or to-be-backed-up) file. Immutable; transfer state
/// lives on `TransferRecord`, never here.
///
/// The remote key is a total function of the identity fields and is
/// computed once at construction; equality and ordering are defined over
/// it.
#[derive(Clone, Debug)]
pub struct BackupPath {
    kind: FileKind,
    cluster: String,
    token: String,
    keyspace: String,
    column_family: String,
    time: DateTime<Utc>,
    file_name: String,
    remote_key: String,
    pub size: u64,
    pub compressed_size: u64,
    pub last_modified: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub local_path: Option<PathBuf>,
}

impl BackupPath {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        layout: &KeyLayout,
        kind: FileKind,
        keyspace: impl Into<String>,
        column_family: impl Into<String>,
        time: DateTime<Utc>,
        file_name: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
        local_path: Option<PathBuf>,
    ) -> BackupResult<Self> {
        let keyspace = keyspace.into();
        let column_family = column_family.into();
        let file_name = file_name.into();
        let time = truncate_to_minute(time);
        if kind.is_data() && (keyspace.is_empty() || file_name.is_empty()) {
            return Err(BackupError::Config(format!(
                "{kind} path requires a keyspace and file name"
            )));
        }
        let remote_key = encode_key(
            layout,
            kind,
            &keyspace,
            &column_family,
            time,
            &file_name,
        );
        Ok(Self {
            kind,
            cluster: layout.cluster.clone(),
            token: layout.token.clone(),
            keyspace,
            column_family,
            time,
            file_name,
            remote_key,
            size,
            compressed_size: 0,
            last_modified: truncate_to_minute(last_modified),
            uploaded_at: None,
            local_path,
        })
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn column_family(&self) -> &str {
        &self.column_family
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }
}

impl PartialEq for BackupPath {
    fn eq(&self, other: &Self) -> bool {
        self.remote_key == other.remote_key
    }
}

impl Eq for BackupPath {}

impl PartialOrd for BackupPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackupPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.remote_key.cmp(&other.remote_key)
    }
}

impl std::hash::Hash for BackupPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.remote_key.hash(state);
    }
}

fn encode_key(
    layout: &KeyLayout,
    kind: FileKind,
    keyspace: &str,
    column_family: &str,
    time: DateTime<Utc>,
    file_name: &str,
) -> String {
    let root = layout.root();
    let instant = format_instant(time);
    match kind {
        FileKind::Snapshot | FileKind::SsTable => {
            format!("{root}/{instant}/{keyspace}/{column_family}/{kind}/{file_name}")
        }
        FileKind::CommitLog => {
            format!("{root}/{instant}/{COMMIT_LOG_KEYSPACE}/CL/{file_name}")
        }
        FileKind::MetaV2 => format!("{root}/META/{instant}/{file_name}"),
        FileKind::Meta => format!("{root}/META/{instant}{V1_META_SUFFIX}"),
    }
}

/// Encodes a `BackupPath` into its remote key. Deterministic; the inverse
/// of [`decode`] on well-formed keys.
pub fn encode(path: &BackupPath) -> &str {
    path.remote_key()
}

/// Decodes a remote key back into a [`BackupPath`]. Size fields are zero
/// and there is no local handle; callers fill those in from their own
/// context.
pub fn decode(key: &str) -> BackupResult<BackupPath> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < 6 {
        return Err(BackupError::malformed_key(key, "too few segments"));
    }
    let (base, prefix, reversed, token) = (segments[0], segments[1], segments[2], segments[3]);
    if [base, prefix, reversed, token].iter().any(|s| s.is_empty()) {
        return Err(BackupError::malformed_key(key, "empty leading segment"));
    }
    let layout = KeyLayout::new(base, prefix, reverse_cluster(reversed), token);

    let (kind, keyspace, column_family, time, file_name) = if segments[4] == "META" {
        match segments.len() {
            // <root>/META/<instant>-meta.json
            6 => {
                let file_name = segments[5];
                let instant = file_name.strip_suffix(V1_META_SUFFIX).ok_or_else(|| {
                    BackupError::malformed_key(key, "meta leaf is not <instant>-meta.json")
                })?;
                (FileKind::Meta, "", "", parse_instant(instant)?, file_name)
            }
            // <root>/META/<instant>/<name>
            7 => (
                FileKind::MetaV2,
                "",
                "",
                parse_instant(segments[5])?,
                segments[6],
            ),
            _ => return Err(BackupError::malformed_key(key, "unexpected meta key shape")),
        }
    } else {
        let time = parse_instant(segments[4])?;
        match segments.len() {
            // <root>/<instant>/<ks>/CL/<file>
            8 => {
                if segments[6] != "CL" {
                    return Err(BackupError::malformed_key(key, "expected CL tag"));
                }
                (FileKind::CommitLog, segments[5], "", time, segments[7])
            }
            // <root>/<instant>/<ks>/<cf>/<TAG>/<file>
            9 => {
                let kind: FileKind = segments[7]
                    .parse()
                    .map_err(|_| BackupError::malformed_key(key, "unknown type tag"))?;
                if !matches!(kind, FileKind::Snapshot | FileKind::SsTable) {
                    return Err(BackupError::malformed_key(key, "unexpected type tag"));
                }
                (kind, segments[5], segments[6], time, segments[8])
            }
            _ => return Err(BackupError::malformed_key(key, "unexpected key shape")),
        }
    };
    if file_name.is_empty() {
        return Err(BackupError::malformed_key(key, "empty file name"));
    }

    BackupPath::new(
        &layout,
        kind,
        keyspace,
        column_family,
        time,
        file_name,
        0,
        time,
        None,
    )
    .map_err(|err| BackupError::malformed_key(key, err.to_string()))
}

/// Longest key prefix covering every data key of `token` in the given
/// time range: both endpoints are formatted as instants and their shared
/// prefix is appended to the layout root. Used to scope listings.
pub fn encode_partial(layout: &KeyLayout, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let start = format_instant(start);
    let end = format_instant(end);
    let shared: String = start
        .chars()
        .zip(end.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect();
    format!("{}/{shared}", layout.root())
}
