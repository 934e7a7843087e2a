use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{fmt, time::Duration};

/// Descripción inmutable de algo reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Identificador que entiende el motor (URL, ruta, id de búsqueda).
    pub source: String,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<Duration>,
}

impl Track {
    pub fn new(source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: title.into(),
            author: None,
            duration: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// Entrada de la cola: el track copiado al encolar, quién lo pidió y cuándo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTrack {
    pub track: Track,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl QueuedTrack {
    pub fn new(track: Track, requested_by: UserId) -> Self {
        Self {
            track,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn title(&self) -> &str {
        &self.track.title
    }
}

/// Opaque reference to one playback start, echoed back by the engine in its
/// events. Monotonically increasing per session, so a stale event is one whose
/// reference no longer matches what the session believes is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackRef(pub u64);

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
