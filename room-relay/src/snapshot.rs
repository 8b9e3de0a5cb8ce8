//! Persistence sidecar for the room store.
//!
//! The whole store is written as one JSON document after every mutation and
//! read back wholesale at startup.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    error::SnapshotError,
    store::{Room, TokenRecord},
};

/// Default snapshot file name, relative to the working directory.
pub const DEFAULT_SNAPSHOT_FILE: &str = "room_manager.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub rooms: BTreeMap<String, Room>,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenRecord>,
    #[serde(default, with = "timestamp::option")]
    pub saved_at: Option<OffsetDateTime>,
}

impl Snapshot {
    pub(crate) fn capture(
        rooms: &BTreeMap<String, Room>,
        tokens: &BTreeMap<String, TokenRecord>,
    ) -> Self {
        Self {
            rooms: rooms.clone(),
            tokens: tokens.clone(),
            saved_at: Some(OffsetDateTime::now_utc()),
        }
    }
}

/// Somewhere a [`Snapshot`] can be saved to and loaded from.
pub trait Persistence: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Returns `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Snapshot>, SnapshotError>;

    /// Moves an unreadable snapshot out of the way so the next save does not
    /// replace it. Returns where it went.
    fn set_aside(&self) -> Result<PathBuf, SnapshotError>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }
}

impl Persistence for JsonFile {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        // Write then rename so a crash mid-write never leaves a torn file.
        let temp = self.sibling(".tmp");
        fs::write(&temp, encoded)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_aside(&self) -> Result<PathBuf, SnapshotError> {
        let corrupt = self.sibling(".corrupt");
        fs::rename(&self.path, &corrupt)?;
        Ok(corrupt)
    }
}

/// Timestamps are written as RFC 3339. Older snapshots carry Unix epoch
/// seconds, or an ISO 8601 time without an offset which is read as UTC.
pub(crate) mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use time::{
        OffsetDateTime, PrimitiveDateTime,
        format_description::well_known::{Iso8601, Rfc3339},
    };

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        time::serde::rfc3339::serialize(value, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Epoch(seconds) => from_epoch(seconds).map_err(D::Error::custom),
            Raw::Text(text) => parse_text(&text).map_err(D::Error::custom),
        }
    }

    fn from_epoch(seconds: f64) -> Result<OffsetDateTime, String> {
        if !seconds.is_finite() {
            return Err(format!("timestamp {seconds} is not a finite number"));
        }
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9).round() as i128;
        OffsetDateTime::from_unix_timestamp_nanos(whole as i128 * 1_000_000_000 + nanos)
            .map_err(|err| err.to_string())
    }

    fn parse_text(text: &str) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(text, &Rfc3339).or_else(|_| {
            PrimitiveDateTime::parse(text, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc)
        })
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        #[derive(Deserialize)]
        struct Stamp(#[serde(deserialize_with = "super::deserialize")] OffsetDateTime);

        pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            time::serde::rfc3339::option::serialize(value, serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<Stamp>::deserialize(deserializer)?.map(|Stamp(stamp)| stamp))
        }
    }
}
