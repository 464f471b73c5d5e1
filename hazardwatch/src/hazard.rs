//! Hazard records and the in-memory catalog they live in.
use std::{cell::RefCell, collections::HashMap, rc::Rc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::geometry::LatLng;

/// What kind of hazard a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HazardKind {
    /// Speed camera.
    #[default]
    Radar,
    /// Traffic accident.
    Accident,
    /// Road work.
    Roadwork,
    /// Police control.
    Police,
    /// Anything the catalog sends that we don't know about.
    #[serde(other)]
    Other,
}

/// A point hazard from the catalog.
///
/// On the wire the record is flat: everything besides the known fields
/// ends up in [`Hazard::metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hazard {
    /// Unique id.
    pub id: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
    /// Hazard type.
    #[serde(rename = "type", default)]
    pub kind: HazardKind,
    /// When the catalog first saw the hazard.
    #[serde(
        default,
        alias = "createdAt",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    /// Free-form attributes (name, speed limit, status, ...).
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Hazard {
    /// Create a hazard without metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, location: LatLng, kind: HazardKind) -> Self {
        Self {
            id: id.into(),
            lat: location.lat,
            lng: location.lng,
            kind,
            created_at: None,
            metadata: Map::new(),
        }
    }

    /// Position of the hazard.
    #[must_use]
    pub const fn location(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    /// Check the record is usable for matching.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty id or out of range coordinates.
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.id.is_empty() {
            return Err(DeltaError::MissingId);
        }
        if !self.location().is_valid() {
            return Err(DeltaError::InvalidLocation {
                id: self.id.clone(),
                lat: self.lat,
                lng: self.lng,
            });
        }
        Ok(())
    }

    /// Shallow-merge `patch` into `self`. Fields present in the patch win.
    fn merge(&mut self, patch: &HazardPatch) {
        if let Some(lat) = patch.lat {
            self.lat = lat;
        }
        if let Some(lng) = patch.lng {
            self.lng = lng;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if patch.created_at.is_some() {
            self.created_at = patch.created_at;
        }
        for (k, v) in &patch.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }
}

/// A partial hazard record carried in [`DeltaSet::updated`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HazardPatch {
    /// Id of the hazard to update.
    pub id: String,
    /// New latitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// New longitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// New hazard type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<HazardKind>,
    /// New creation time.
    #[serde(
        default,
        alias = "createdAt",
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    /// Attributes to overwrite, key by key.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// Incremental catalog changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSet {
    /// New hazards.
    #[serde(default)]
    pub added: Vec<Hazard>,
    /// Partial updates to existing hazards.
    #[serde(default)]
    pub updated: Vec<HazardPatch>,
    /// Ids to remove.
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl DeltaSet {
    /// Decode a delta entry by entry, so one malformed record doesn't
    /// poison the rest. Entries that fail to decode are returned as errors.
    #[must_use]
    pub fn from_value_lenient(value: &Value) -> (Self, Vec<DeltaError>) {
        fn entries<T: for<'de> Deserialize<'de>>(
            value: &Value,
            key: &str,
            errors: &mut Vec<DeltaError>,
        ) -> Vec<T> {
            let Some(items) = value.get(key).and_then(Value::as_array) else {
                return Vec::new();
            };

            items
                .iter()
                .filter_map(|item| match T::deserialize(item) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        errors.push(DeltaError::Decode(e));
                        None
                    }
                })
                .collect()
        }

        let mut errors = Vec::new();
        let delta = Self {
            added: entries(value, "added", &mut errors),
            updated: entries(value, "updated", &mut errors),
            deleted: entries(value, "deleted", &mut errors),
        };

        (delta, errors)
    }

    /// Whether the delta carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// A delta entry that was rejected.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// The record has an empty id.
    #[error("hazard without id")]
    MissingId,
    /// The record's coordinates are not usable.
    #[error("hazard {id} has invalid location ({lat}, {lng})")]
    InvalidLocation {
        /// Hazard id.
        id: String,
        /// Offending latitude.
        lat: f64,
        /// Offending longitude.
        lng: f64,
    },
    /// The JSON entry could not be decoded.
    #[error("decode delta entry failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// What [`HazardCache::apply_delta`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Hazards that did not exist before.
    pub added: usize,
    /// Existing hazards whose contents changed.
    pub updated: usize,
    /// Hazards removed.
    pub removed: usize,
    /// Entries rejected by validation or referring to unknown ids.
    pub skipped: usize,
}

/// The authoritative set of known hazards, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct HazardCache {
    hazards: HashMap<String, Hazard>,
}

/// A cache shared between the components running on one thread.
pub type SharedCache = Rc<RefCell<HazardCache>>;

impl HazardCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the cache for sharing between the scanner and the route matcher.
    #[must_use]
    pub fn into_shared(self) -> SharedCache {
        Rc::new(RefCell::new(self))
    }

    /// Insert or replace a hazard, returning the previous record.
    pub fn insert(&mut self, hazard: Hazard) -> Option<Hazard> {
        self.hazards.insert(hazard.id.clone(), hazard)
    }

    /// Remove a hazard by id.
    pub fn remove(&mut self, id: &str) -> Option<Hazard> {
        self.hazards.remove(id)
    }

    /// The hazard with id `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Hazard> {
        self.hazards.get(id)
    }

    /// Iterate over all hazards in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Hazard> {
        self.hazards.values()
    }

    /// Snapshot of all hazards in no particular order.
    #[must_use]
    pub fn list(&self) -> Vec<Hazard> {
        self.hazards.values().cloned().collect()
    }

    /// Hazards of one kind.
    pub fn by_kind(&self, kind: HazardKind) -> impl Iterator<Item = &Hazard> {
        self.iter().filter(move |h| h.kind == kind)
    }

    /// Number of hazards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hazards.len()
    }

    /// Whether the cache holds no hazards.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hazards.is_empty()
    }

    /// Drop every hazard.
    pub fn clear(&mut self) {
        self.hazards.clear();
    }

    /// Replace the whole catalog with a full snapshot. Invalid records are
    /// skipped; the number of records kept is returned.
    pub fn load(&mut self, hazards: impl IntoIterator<Item = Hazard>) -> usize {
        self.hazards.clear();

        for hazard in hazards {
            match hazard.validate() {
                Ok(()) => {
                    self.insert(hazard);
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    warn!("skipping hazard: {_e}");
                }
            }
        }

        self.len()
    }

    /// Merge a delta into the cache.
    ///
    /// `added` is applied first, then `updated` is shallow-merged on top
    /// (so a hazard both added and updated ends up merged), then everything
    /// in `deleted` is removed. Applying the same delta again changes
    /// nothing.
    pub fn apply_delta(&mut self, delta: &DeltaSet) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();
        let mut staged: HashMap<&str, Hazard> = HashMap::new();

        for hazard in &delta.added {
            staged.insert(&hazard.id, hazard.clone());
        }

        for patch in &delta.updated {
            if !staged.contains_key(patch.id.as_str()) {
                let Some(existing) = self.hazards.get(&patch.id) else {
                    #[cfg(feature = "tracing")]
                    debug!(id = %patch.id, "update for unknown hazard");
                    outcome.skipped += 1;
                    continue;
                };
                staged.insert(&patch.id, existing.clone());
            }

            if let Some(target) = staged.get_mut(patch.id.as_str()) {
                target.merge(patch);
            }
        }

        for (id, hazard) in staged {
            if delta.deleted.iter().any(|d| d == id) {
                continue;
            }

            if let Err(_e) = hazard.validate() {
                #[cfg(feature = "tracing")]
                warn!("skipping malformed delta entry: {_e}");
                outcome.skipped += 1;
                continue;
            }

            match self.hazards.get(id).map(|existing| *existing == hazard) {
                Some(true) => {}
                Some(false) => {
                    outcome.updated += 1;
                    self.insert(hazard);
                }
                None => {
                    outcome.added += 1;
                    self.insert(hazard);
                }
            }
        }

        for id in &delta.deleted {
            if self.hazards.remove(id).is_some() {
                outcome.removed += 1;
            }
        }

        #[cfg(feature = "tracing")]
        debug!(?outcome, total = self.len(), "applied delta");

        outcome
    }
}
