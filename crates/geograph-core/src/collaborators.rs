//! Capability interfaces for external collaborators.
//!
//! Downloaders and label makers interact with the core only through these
//! traits plus the connector's public contract. The connector never
//! interprets their internals; it only orders the calls so that graph
//! invariants hold before a collaborator reads the tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::connector::{Connector, RasterRecord};

/// Produces raster rows (and file artifacts) for a vector feature.
///
/// One call is one download attempt for one feature; the connector drives
/// attempts until the feature's target raster count is met or the downloader
/// gives up. Returned rows are integrated one at a time, each as its own
/// atomic mutation.
pub trait RasterDownloader {
    /// Attempt to download rasters for `feature_id`.
    ///
    /// An empty result means no further products are available for this
    /// feature.
    fn download(
        &mut self,
        connector: &Connector,
        feature_id: &str,
        params: &DownloadParams,
    ) -> std::result::Result<Vec<RasterRecord>, DownloadError>;
}

/// Writes label artifacts for a set of rasters.
pub trait LabelMaker {
    /// Create labels for the given rasters.
    fn make_labels(&mut self, connector: &Connector, raster_ids: &[String]) -> anyhow::Result<()>;

    /// Delete labels for the given rasters.
    fn delete_labels(&mut self, connector: &Connector, raster_ids: &[String])
        -> anyhow::Result<()>;

    /// Delete and re-create labels whose inputs changed.
    fn recompute_labels(
        &mut self,
        connector: &Connector,
        raster_ids: &[String],
    ) -> anyhow::Result<()> {
        self.delete_labels(connector, raster_ids)?;
        self.make_labels(connector, raster_ids)
    }
}

/// Parameters for a download run.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    /// Stop downloading for a feature once this many rasters contain it.
    pub target_raster_count: i64,
    /// Free-form parameters passed through to the downloader
    /// (product type, cloud cover limits, date ranges, ...).
    pub extra: JsonMap<String, Value>,
}

impl Default for DownloadParams {
    fn default() -> Self {
        Self {
            target_raster_count: 1,
            extra: JsonMap::new(),
        }
    }
}

/// Error raised by a downloader for one attempt.
#[derive(Debug)]
pub struct DownloadError {
    /// Id of the raster the downloader was fetching, when it got far enough
    /// to know one.
    pub raster_id: Option<String>,
    /// The underlying cause.
    pub source: anyhow::Error,
}

impl DownloadError {
    /// An error with no raster id attached.
    pub fn new(source: anyhow::Error) -> Self {
        Self {
            raster_id: None,
            source,
        }
    }

    /// An error for a specific raster.
    pub fn for_raster(raster_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            raster_id: Some(raster_id.into()),
            source,
        }
    }
}

/// A recorded failed download attempt.
///
/// Failure records live outside the rasters table (they have no geometry and
/// never enter the spatial index); they are keyed by the attempted raster id,
/// falling back to the requesting feature id when the attempt died before a
/// raster id existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadFailure {
    /// Attempted raster id, or the requesting feature id as a fallback key.
    pub raster_id: String,
    /// Feature the download was requested for.
    pub feature_id: String,
    /// Human-readable cause.
    pub error: String,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Outcome of a [`Connector::download_rasters`] run.
///
/// Collaborator failures do not roll back already-integrated rasters from
/// the same run; they are aggregated here instead.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    /// Raster ids successfully downloaded and integrated.
    pub downloaded: Vec<String>,
    /// Feature ids skipped because their target count was already met.
    pub skipped: Vec<String>,
    /// Failed attempts recorded during this run.
    pub failures: Vec<DownloadFailure>,
}
