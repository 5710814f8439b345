//! # Carbon Ingest Library
//!
//! Pulls usage and carbon data from cloud provider APIs, normalizes it into a
//! canonical [`Activity`] record and processes activity batches through a
//! durable, database-backed scheduler.
//!
//! ## Architecture
//!
//! - [`ingestion`] - Shared building blocks: token-bucket rate limiting,
//!   pagination state, error classification and the retrying HTTP client
//! - [`connectors`] - Provider connectors (AWS, Azure, GCP) and the canonical
//!   taxonomy tables they map into
//! - [`batch`] - Job model, SQLite-backed store, scheduler and the management
//!   service
//! - [`collaborators`] - Emissions calculator and activity store seams
//! - [`pipeline`] - Ingest, persist and submit in one call
//! - [`metrics`] - Counters, histograms and the Prometheus exporter
//!
//! ## Quick Start
//!
//! ```no_run
//! use carbon_ingest::batch::{BatchService, BatchStore, SubmitJob};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = BatchStore::connect("sqlite://./carbon.db").await?;
//! let service = BatchService::new(store);
//! let job_id = service
//!     .submit(SubmitJob::new("org-1", "ws-1", vec!["act-1".to_string()]))
//!     .await?;
//! println!("submitted {job_id}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Batch job model, persistence, scheduling and management surface
pub mod batch;

/// CLI command implementations
pub mod cli;

/// External collaborator seams (calculator, activity store)
pub mod collaborators;

/// YAML configuration
pub mod config;

/// Provider connectors
pub mod connectors;

/// Rate limiting, pagination, classification and HTTP retry
pub mod ingestion;

/// Metrics emission
pub mod metrics;

/// Ingest-and-submit orchestration
pub mod pipeline;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

pub use ingestion::classify::{ClassifiedError, ErrorClass, ErrorClassifier};

/// Origin of an activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivitySource {
    /// AWS carbon footprint and cost-and-usage data
    #[serde(rename = "cloud-a")]
    CloudA,
    /// Azure emissions data
    #[serde(rename = "cloud-b")]
    CloudB,
    /// GCP carbon footprint export
    #[serde(rename = "cloud-c")]
    CloudC,
    /// Entered by hand
    #[serde(rename = "manual")]
    Manual,
    /// Imported from a file upload
    #[serde(rename = "file-import")]
    FileImport,
}

impl ActivitySource {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivitySource::CloudA => "cloud-a",
            ActivitySource::CloudB => "cloud-b",
            ActivitySource::CloudC => "cloud-c",
            ActivitySource::Manual => "manual",
            ActivitySource::FileImport => "file-import",
        }
    }
}

impl std::fmt::Display for ActivitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActivitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud-a" => Ok(ActivitySource::CloudA),
            "cloud-b" => Ok(ActivitySource::CloudB),
            "cloud-c" => Ok(ActivitySource::CloudC),
            "manual" => Ok(ActivitySource::Manual),
            "file-import" => Ok(ActivitySource::FileImport),
            _ => Err(format!("Invalid activity source: {s}")),
        }
    }
}

/// Normalized usage category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Virtual machines and general compute
    Compute,
    /// Functions / serverless compute
    ComputeServerless,
    /// Managed containers and Kubernetes
    ComputeContainers,
    /// Managed databases and caches
    Database,
    /// Object and block storage
    Storage,
    /// Networking
    Network,
    /// Content delivery
    Cdn,
    /// Data transfer between regions or out to the internet
    DataTransfer,
    /// Stream and batch processing
    DataProcessing,
    /// Analytical warehouses
    DataWarehouse,
    /// Anything the taxonomy does not know
    Other,
}

impl Category {
    /// Stable string form used in storage and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Compute => "compute",
            Category::ComputeServerless => "compute_serverless",
            Category::ComputeContainers => "compute_containers",
            Category::Database => "database",
            Category::Storage => "storage",
            Category::Network => "network",
            Category::Cdn => "cdn",
            Category::DataTransfer => "data_transfer",
            Category::DataProcessing => "data_processing",
            Category::DataWarehouse => "data_warehouse",
            Category::Other => "other",
        }
    }

    /// Whether `unit` belongs to the normalized unit set of this category.
    ///
    /// Emission, energy and cost units are valid for every category because
    /// provider carbon reports attribute them per service.
    pub fn allows_unit(&self, unit: Unit) -> bool {
        if unit.is_universal() {
            return true;
        }
        match self {
            Category::Compute | Category::ComputeContainers => {
                matches!(unit, Unit::Hours | Unit::GbSeconds | Unit::Requests)
            }
            Category::ComputeServerless => {
                matches!(unit, Unit::GbSeconds | Unit::Requests | Unit::Hours)
            }
            Category::Database => matches!(unit, Unit::Hours | Unit::GbMonth | Unit::Requests),
            Category::Storage => matches!(unit, Unit::GbMonth | Unit::Gb | Unit::Requests),
            Category::Network | Category::Cdn | Category::DataTransfer => {
                matches!(unit, Unit::Gb | Unit::Requests)
            }
            Category::DataProcessing | Category::DataWarehouse => {
                matches!(unit, Unit::Hours | Unit::Gb | Unit::GbSeconds)
            }
            Category::Other => true,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compute" => Ok(Category::Compute),
            "compute_serverless" => Ok(Category::ComputeServerless),
            "compute_containers" => Ok(Category::ComputeContainers),
            "database" => Ok(Category::Database),
            "storage" => Ok(Category::Storage),
            "network" => Ok(Category::Network),
            "cdn" => Ok(Category::Cdn),
            "data_transfer" => Ok(Category::DataTransfer),
            "data_processing" => Ok(Category::DataProcessing),
            "data_warehouse" => Ok(Category::DataWarehouse),
            "other" => Ok(Category::Other),
            _ => Err(format!("Invalid category: {s}")),
        }
    }
}

/// Normalized physical or cost unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Instance or resource hours
    #[serde(rename = "hours")]
    Hours,
    /// Gigabyte-months of storage
    #[serde(rename = "GB-month")]
    GbMonth,
    /// Gigabytes transferred or processed
    #[serde(rename = "GB")]
    Gb,
    /// Gigabyte-seconds of function memory
    #[serde(rename = "GB-seconds")]
    GbSeconds,
    /// Request count
    #[serde(rename = "requests")]
    Requests,
    /// Kilowatt-hours of electricity
    #[serde(rename = "kWh")]
    KilowattHours,
    /// Kilograms of CO2 equivalent
    #[serde(rename = "kgCO2e")]
    KgCo2e,
    /// Metric tonnes of CO2 equivalent
    #[serde(rename = "tCO2e")]
    TonneCo2e,
    /// US dollars
    #[serde(rename = "USD")]
    Usd,
    /// Provider unit with no normalized counterpart
    #[serde(rename = "other")]
    Other,
}

impl Unit {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Hours => "hours",
            Unit::GbMonth => "GB-month",
            Unit::Gb => "GB",
            Unit::GbSeconds => "GB-seconds",
            Unit::Requests => "requests",
            Unit::KilowattHours => "kWh",
            Unit::KgCo2e => "kgCO2e",
            Unit::TonneCo2e => "tCO2e",
            Unit::Usd => "USD",
            Unit::Other => "other",
        }
    }

    /// Units that any category may carry
    pub fn is_universal(&self) -> bool {
        matches!(
            self,
            Unit::KilowattHours | Unit::KgCo2e | Unit::TonneCo2e | Unit::Usd | Unit::Other
        )
    }

    /// Whether the unit already expresses emissions
    pub fn is_emissions(&self) -> bool {
        matches!(self, Unit::KgCo2e | Unit::TonneCo2e)
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hours" => Ok(Unit::Hours),
            "GB-month" => Ok(Unit::GbMonth),
            "GB" => Ok(Unit::Gb),
            "GB-seconds" => Ok(Unit::GbSeconds),
            "requests" => Ok(Unit::Requests),
            "kWh" => Ok(Unit::KilowattHours),
            "kgCO2e" => Ok(Unit::KgCo2e),
            "tCO2e" => Ok(Unit::TonneCo2e),
            "USD" => Ok(Unit::Usd),
            "other" => Ok(Unit::Other),
            _ => Err(format!("Invalid unit: {s}")),
        }
    }
}

/// How an activity quantity was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    /// Reported directly by the provider
    Measured,
    /// Derived or modelled
    Estimated,
}

impl DataQuality {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Measured => "measured",
            DataQuality::Estimated => "estimated",
        }
    }
}

impl FromStr for DataQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "measured" => Ok(DataQuality::Measured),
            "estimated" => Ok(DataQuality::Estimated),
            _ => Err(format!("Invalid data quality: {s}")),
        }
    }
}

/// Activity validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActivityError {
    /// Identifier missing
    #[error("activity id cannot be empty")]
    EmptyId,
    /// Tenant scoping missing
    #[error("activity {field} cannot be empty")]
    EmptyTenant {
        /// Which tenant field was empty
        field: &'static str,
    },
    /// Negative or non-finite quantity
    #[error("invalid quantity: {0}")]
    InvalidQuantity(f64),
    /// Unit outside the category's normalized set
    #[error("unit {unit} is not valid for category {category}")]
    UnitNotAllowed {
        /// Offending unit
        unit: Unit,
        /// Category it was paired with
        category: Category,
    },
    /// period_start must precede period_end
    #[error("period end ({end}) must be after period start ({start})")]
    InvalidPeriod {
        /// Start of the period
        start: DateTime<Utc>,
        /// End of the period
        end: DateTime<Utc>,
    },
}

/// Canonical activity record produced by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Opaque unique identifier assigned at conversion time
    pub id: String,
    /// Owning organization
    pub org_id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Where the record came from
    pub source: ActivitySource,
    /// Normalized usage category
    pub category: Category,
    /// Amount in `unit`
    pub quantity: f64,
    /// Normalized unit
    pub unit: Unit,
    /// Canonical region code
    pub region: String,
    /// Inclusive start of the covered period
    pub period_start: DateTime<Utc>,
    /// Exclusive end of the covered period
    pub period_end: DateTime<Utc>,
    /// Provider-native fields kept for audit
    #[serde(default)]
    pub raw_metadata: BTreeMap<String, String>,
    /// Provider record identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// How the quantity was obtained
    pub data_quality: DataQuality,
    /// When the record was converted
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// Validate invariants of the canonical record
    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.id.trim().is_empty() {
            return Err(ActivityError::EmptyId);
        }
        if self.org_id.trim().is_empty() {
            return Err(ActivityError::EmptyTenant { field: "org_id" });
        }
        if self.workspace_id.trim().is_empty() {
            return Err(ActivityError::EmptyTenant {
                field: "workspace_id",
            });
        }
        if !self.quantity.is_finite() || self.quantity < 0.0 {
            return Err(ActivityError::InvalidQuantity(self.quantity));
        }
        if !self.category.allows_unit(self.unit) {
            return Err(ActivityError::UnitNotAllowed {
                unit: self.unit,
                category: self.category,
            });
        }
        if self.period_start >= self.period_end {
            return Err(ActivityError::InvalidPeriod {
                start: self.period_start,
                end: self.period_end,
            });
        }
        Ok(())
    }
}
