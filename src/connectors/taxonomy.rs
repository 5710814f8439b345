//! Canonical taxonomy tables
//!
//! Provider service codes, region codes and units are mapped onto the
//! canonical [`Category`], region and [`Unit`] sets. Codes missing from a
//! table fall back to [`Category::Other`] / [`GLOBAL`] and are logged and
//! counted so gaps in the tables surface in monitoring.

use crate::metrics::record_taxonomy_unmapped;
use crate::{Category, Unit};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::{debug, warn};

/// United States, east
pub const US_EAST: &str = "US-EAST";
/// United States, west
pub const US_WEST: &str = "US-WEST";
/// United States, central
pub const US_CENTRAL: &str = "US-CENTRAL";
/// United States, south
pub const US_SOUTH: &str = "US-SOUTH";
/// Western Europe and the UK
pub const EU_WEST: &str = "EU-WEST";
/// Central Europe
pub const EU_CENTRAL: &str = "EU-CENTRAL";
/// Nordics
pub const EU_NORTH: &str = "EU-NORTH";
/// Asia and Oceania
pub const ASIA_PACIFIC: &str = "ASIA-PACIFIC";
/// Latin America
pub const LATAM: &str = "LATAM";
/// Middle East and North Africa
pub const MENA: &str = "MENA";
/// Sub-Saharan Africa
pub const AFRICA: &str = "AFRICA";
/// Unknown or global
pub const GLOBAL: &str = "GLOBAL";

/// Every canonical region code
pub const CANONICAL_REGIONS: &[&str] = &[
    US_EAST,
    US_WEST,
    US_CENTRAL,
    US_SOUTH,
    EU_WEST,
    EU_CENTRAL,
    EU_NORTH,
    ASIA_PACIFIC,
    LATAM,
    MENA,
    AFRICA,
    GLOBAL,
];

static AWS_SERVICES: Lazy<HashMap<&'static str, Category>> = Lazy::new(|| {
    HashMap::from([
        ("AmazonEC2", Category::Compute),
        ("AmazonRDS", Category::Database),
        ("AmazonDynamoDB", Category::Database),
        ("AmazonElastiCache", Category::Database),
        ("AmazonS3", Category::Storage),
        ("AWSLambda", Category::ComputeServerless),
        ("AmazonCloudFront", Category::Cdn),
        ("AmazonEKS", Category::ComputeContainers),
        ("AmazonECS", Category::ComputeContainers),
        ("AWSDataTransfer", Category::DataTransfer),
    ])
});

static AWS_REGIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("us-east-1", US_EAST),
        ("us-east-2", US_EAST),
        ("ca-central-1", US_EAST),
        ("us-west-1", US_WEST),
        ("us-west-2", US_WEST),
        ("eu-west-1", EU_WEST),
        ("eu-west-2", EU_WEST),
        ("eu-west-3", EU_WEST),
        ("eu-central-1", EU_CENTRAL),
        ("eu-north-1", EU_NORTH),
        ("sa-east-1", LATAM),
        ("me-south-1", MENA),
        ("af-south-1", AFRICA),
    ])
});

static AWS_UNITS: Lazy<HashMap<&'static str, Unit>> = Lazy::new(|| {
    HashMap::from([
        ("Hrs", Unit::Hours),
        ("GB-Mo", Unit::GbMonth),
        ("GB", Unit::Gb),
        ("Requests", Unit::Requests),
        ("Lambda-GB-Second", Unit::GbSeconds),
        ("Lambda-GB-Sec", Unit::GbSeconds),
    ])
});

static AZURE_SERVICES: Lazy<HashMap<&'static str, Category>> = Lazy::new(|| {
    HashMap::from([
        ("Virtual Machines", Category::Compute),
        ("App Service", Category::ComputeServerless),
        ("Azure Functions", Category::ComputeServerless),
        ("Azure SQL Database", Category::Database),
        ("Azure Cosmos DB", Category::Database),
        ("Storage", Category::Storage),
        ("Storage Account", Category::Storage),
        ("Content Delivery Network", Category::Cdn),
        ("CDN", Category::Cdn),
        ("Azure Kubernetes Service", Category::ComputeContainers),
        ("Container Instances", Category::ComputeContainers),
        ("Bandwidth", Category::DataTransfer),
        ("Data Factory", Category::DataProcessing),
        ("Synapse Analytics", Category::DataWarehouse),
    ])
});

static AZURE_REGIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("eastus", US_EAST),
        ("eastus2", US_EAST),
        ("westus", US_WEST),
        ("westus2", US_WEST),
        ("westus3", US_WEST),
        ("centralus", US_CENTRAL),
        ("southcentralus", US_SOUTH),
        ("northeurope", EU_NORTH),
        ("swedencentral", EU_NORTH),
        ("westeurope", EU_WEST),
        ("uksouth", EU_WEST),
        ("ukwest", EU_WEST),
        ("germanywestcentral", EU_CENTRAL),
        ("switzerlandnorth", EU_CENTRAL),
        ("switzerlandwest", EU_CENTRAL),
        ("japaneast", ASIA_PACIFIC),
        ("japanwest", ASIA_PACIFIC),
        ("australiaeast", ASIA_PACIFIC),
        ("australiasoutheast", ASIA_PACIFIC),
        ("southeastasia", ASIA_PACIFIC),
        ("eastasia", ASIA_PACIFIC),
        ("koreacentral", ASIA_PACIFIC),
        ("southindia", ASIA_PACIFIC),
        ("centralindia", ASIA_PACIFIC),
        ("brazilsouth", LATAM),
        ("uaenorth", MENA),
        ("southafricanorth", AFRICA),
    ])
});

static GCP_SERVICES: Lazy<HashMap<&'static str, Category>> = Lazy::new(|| {
    HashMap::from([
        ("6F81-5844-456A", Category::Compute),
        ("95FF-2EF5-5EA1", Category::ComputeContainers),
        ("A21B-3453-0BA2", Category::Database),
        ("6002-A0B2-FB9F", Category::Database),
        ("24E6-581D-38E5", Category::Storage),
        ("FEAB-9939-3218", Category::Storage),
        ("4ED8-1D4C-39A9", Category::Cdn),
        ("8FC7-9B88-F69D", Category::DataProcessing),
        ("A4C6-3B37-4BA7", Category::DataWarehouse),
    ])
});

static GCP_REGIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("us-central1", US_CENTRAL),
        ("us-east1", US_EAST),
        ("us-east4", US_EAST),
        ("northamerica-northeast1", US_EAST),
        ("us-west1", US_WEST),
        ("us-west2", US_WEST),
        ("us-west3", US_WEST),
        ("us-west4", US_WEST),
        ("us-south1", US_SOUTH),
        ("europe-west1", EU_WEST),
        ("europe-west2", EU_WEST),
        ("europe-west3", EU_WEST),
        ("europe-west6", EU_WEST),
        ("europe-southwest1", EU_WEST),
        ("europe-north1", EU_NORTH),
        ("southamerica-east1", LATAM),
        ("me-west1", MENA),
        ("africa-south1", AFRICA),
    ])
});

fn unmapped_category(provider: &'static str, code: &str) -> Category {
    warn!(provider, code, "Unmapped service code, using category 'other'");
    record_taxonomy_unmapped(provider, "category");
    Category::Other
}

fn unmapped_region(provider: &'static str, code: &str) -> &'static str {
    if !code.is_empty() {
        debug!(provider, code, "Unmapped region code, using GLOBAL");
        record_taxonomy_unmapped(provider, "region");
    }
    GLOBAL
}

/// Category for an AWS service code (`AmazonEC2`, `AWSLambda`, ...)
pub fn aws_category(service_code: &str) -> Category {
    match AWS_SERVICES.get(service_code) {
        Some(category) => *category,
        None => unmapped_category("aws", service_code),
    }
}

/// Canonical region for an AWS region code
pub fn aws_region(code: &str) -> &'static str {
    if let Some(region) = AWS_REGIONS.get(code).copied() {
        return region;
    }
    if code.starts_with("ap-") {
        return ASIA_PACIFIC;
    }
    unmapped_region("aws", code)
}

/// Normalized unit for a CUR usage unit; `None` when unknown
pub fn aws_unit(unit: &str) -> Option<Unit> {
    AWS_UNITS.get(unit).copied()
}

/// Category for an Azure service name, falling back to the resource type
pub fn azure_category(service_name: &str, resource_type: &str) -> Category {
    if let Some(category) = AZURE_SERVICES.get(service_name) {
        return *category;
    }
    if resource_type.to_lowercase().contains("virtualmachine") {
        return Category::Compute;
    }
    unmapped_category("azure", service_name)
}

/// Canonical region for an Azure location (case-insensitive)
pub fn azure_region(location: &str) -> &'static str {
    let lower = location.to_lowercase().replace(' ', "");
    match AZURE_REGIONS.get(lower.as_str()).copied() {
        Some(region) => region,
        None => unmapped_region("azure", location),
    }
}

/// Category for a GCP billing service id, falling back to its description
pub fn gcp_category(service_id: &str, description: &str) -> Category {
    if let Some(category) = GCP_SERVICES.get(service_id) {
        return *category;
    }
    let lower = description.to_lowercase();
    if lower.contains("compute") {
        Category::Compute
    } else if lower.contains("sql") || lower.contains("database") {
        Category::Database
    } else if lower.contains("storage") {
        Category::Storage
    } else {
        unmapped_category("gcp", service_id)
    }
}

/// Canonical region for a GCP location
pub fn gcp_region(location: &str) -> &'static str {
    if let Some(region) = GCP_REGIONS.get(location).copied() {
        return region;
    }
    if location.starts_with("asia-") || location.starts_with("australia-") {
        return ASIA_PACIFIC;
    }
    unmapped_region("gcp", location)
}
