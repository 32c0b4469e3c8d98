//! Error types for geograph-core.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GeographError>;

/// Domain-specific errors for connector operations.
#[derive(Error, Debug)]
pub enum GeographError {
    /// An identifier is already in use within the named scope.
    #[error("Duplicate id `{id}` in {scope}.")]
    DuplicateId {
        /// The colliding identifier.
        id: String,
        /// Where the collision occurred (`vectors`, `rasters`, `spatial index`).
        scope: String,
    },

    /// An identifier was not found in the named scope.
    #[error("Unknown id `{id}` in {scope}.")]
    UnknownId {
        /// The missing identifier.
        id: String,
        /// Where the lookup happened.
        scope: String,
    },

    /// The vector and raster id namespaces must be disjoint.
    #[error("Id `{id}` is already registered in the other table; vector and raster ids share one namespace.")]
    IdNamespaceCollision {
        /// The colliding identifier.
        id: String,
    },

    /// A geometry failed validation.
    #[error("Invalid geometry for `{id}`: {reason}")]
    InvalidGeometry {
        /// Row id the geometry belongs to.
        id: String,
        /// Why validation rejected it.
        reason: String,
    },

    /// No transform is available between the given CRS pair.
    #[error("Unsupported CRS transform: EPSG:{from_epsg} -> EPSG:{to_epsg}")]
    UnsupportedCrs {
        /// Source EPSG code.
        from_epsg: u32,
        /// Target EPSG code.
        to_epsg: u32,
    },

    /// Reprojection produced a degenerate geometry.
    #[error("Reprojection of `{id}` from EPSG:{from_epsg} to EPSG:{to_epsg} produced non-finite coordinates")]
    ReprojectionFailed {
        /// Row id the geometry belongs to.
        id: String,
        /// Source EPSG code.
        from_epsg: u32,
        /// Target EPSG code.
        to_epsg: u32,
    },

    /// A required column is absent from a table.
    #[error("Table `{table}` is missing required column `{column}`.")]
    MissingColumn {
        /// The missing column.
        column: String,
        /// The table checked.
        table: String,
    },

    /// A value does not match the kind established for its column.
    #[error("Column `{column}` in table `{table}` holds {expected} values, got {actual}.")]
    ColumnKindMismatch {
        /// The offending column.
        column: String,
        /// The table checked.
        table: String,
        /// Kind established by earlier values.
        expected: String,
        /// Kind of the rejected value.
        actual: String,
    },

    /// The column is managed by the connector and cannot be written directly.
    #[error("Column `{column}` in table `{table}` is reserved and cannot be written or altered by callers.")]
    ReservedColumn {
        /// The reserved column.
        column: String,
        /// The table it belongs to.
        table: String,
    },

    /// A column with this name already exists.
    #[error("Column `{column}` already exists in table `{table}`.")]
    ColumnExists {
        /// The colliding column name.
        column: String,
        /// The table checked.
        table: String,
    },

    /// A named column does not exist.
    #[error("No column `{column}` in table `{table}`.")]
    UnknownColumn {
        /// The missing column.
        column: String,
        /// The table checked.
        table: String,
    },

    /// An edge between these endpoints already exists (with either label).
    #[error("Edge between raster `{raster}` and feature `{feature}` already exists.")]
    EdgeExists {
        /// Raster endpoint.
        raster: String,
        /// Feature endpoint.
        feature: String,
    },

    /// No edge exists between these endpoints.
    #[error("No edge between raster `{raster}` and feature `{feature}`.")]
    EdgeNotFound {
        /// Raster endpoint.
        raster: String,
        /// Feature endpoint.
        feature: String,
    },

    /// The dataset attributes are invalid (duplicate or conflicting classes).
    #[error("Invalid dataset attributes: {reason}")]
    InvalidAttrs {
        /// Description of the problem.
        reason: String,
    },

    /// A self-consistency audit failed.
    ///
    /// Only reachable through internal bugs or direct tampering with the
    /// tables outside the mutation API.
    #[error("Consistency audit failed: {detail}")]
    InvariantViolation {
        /// What the audit found.
        detail: String,
    },

    /// The connector directory holds some but not all component files.
    #[error("Connector directory `{connector_dir}` is inconsistent; missing: {missing}")]
    DataDirInconsistent {
        /// The connector directory inspected.
        connector_dir: PathBuf,
        /// Comma-joined list of absent files.
        missing: String,
    },

    /// A connector file exists but cannot be parsed.
    #[error("Corrupt connector file `{path}`: {message}")]
    CorruptConnectorFile {
        /// Path to the unreadable file.
        path: PathBuf,
        /// Description of the parse failure.
        message: String,
    },

    /// The on-disk format is newer than this build understands.
    #[error("Connector file `{path}` has format version {found}, expected {expected}.")]
    UnsupportedFormatVersion {
        /// Path to the versioned file.
        path: PathBuf,
        /// Version found on disk.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// A downloader or label maker failed.
    ///
    /// Carries the offending id; already-integrated items from the same
    /// batch are kept.
    #[error("Collaborator failed for `{id}`")]
    Collaborator {
        /// Feature or raster id the collaborator was working on.
        id: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
