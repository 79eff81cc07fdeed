/// Provider name constants to keep CLI arguments, routes, store names and
/// response tags consistent across the codebase

// Lowercase identifiers (CLI, URL paths, store name prefixes)
pub const AWS_API: &str = "aws";
pub const AZURE_API: &str = "azure";
pub const GCP_API: &str = "gcp";

// Display names (the `provider` tag on query responses)
pub const AWS_NAME: &str = "AWS";
pub const AZURE_NAME: &str = "Azure";
pub const GCP_NAME: &str = "GCP";

// Default per-provider store names under the data directory
pub const AWS_STORE: &str = "aws_2025";
pub const AZURE_STORE: &str = "azure_2025";
pub const GCP_STORE: &str = "gcp_2025";

pub const STORE_EXTENSION: &str = "csv";

/// Field names of a canonical record, in header order
pub const CANONICAL_FIELDS: [&str; 3] = ["date", "service", "cost_usd"];

pub const SERVICE_NAME: &str = "FinOps Cost API";

/// Get all supported provider identifiers
pub fn get_supported_apis() -> Vec<&'static str> {
    vec![AWS_API, AZURE_API, GCP_API]
}
