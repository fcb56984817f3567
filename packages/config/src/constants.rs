// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Skiff

// Deployment profile
pub const SKIFF_PROFILE: &str = "SKIFF_PROFILE"; // "local" or "production"
pub const SKIFF_BASE_DOMAIN: &str = "SKIFF_BASE_DOMAIN";
pub const SKIFF_APP_PORT: &str = "SKIFF_APP_PORT";
pub const SKIFF_PORT_RANGE_START: &str = "SKIFF_PORT_RANGE_START";
pub const SKIFF_PORT_RANGE_SIZE: &str = "SKIFF_PORT_RANGE_SIZE";
pub const SKIFF_LABEL_PREFIX: &str = "SKIFF_LABEL_PREFIX";

// Resource envelope
pub const SKIFF_MEMORY_REQUEST_MB: &str = "SKIFF_MEMORY_REQUEST_MB";
pub const SKIFF_MEMORY_LIMIT_MB: &str = "SKIFF_MEMORY_LIMIT_MB";
pub const SKIFF_CPU_REQUEST_MILLIS: &str = "SKIFF_CPU_REQUEST_MILLIS";
pub const SKIFF_CPU_LIMIT_MILLIS: &str = "SKIFF_CPU_LIMIT_MILLIS";

// Lifecycle timing
pub const SKIFF_DELETE_GRACE_MS: &str = "SKIFF_DELETE_GRACE_MS";
pub const SKIFF_RESTART_GRACE_MS: &str = "SKIFF_RESTART_GRACE_MS";
pub const SKIFF_READY_TIMEOUT_SECS: &str = "SKIFF_READY_TIMEOUT_SECS";
pub const SKIFF_READY_POLL_MS: &str = "SKIFF_READY_POLL_MS";
pub const SKIFF_STARTUP_WAIT_SECS: &str = "SKIFF_STARTUP_WAIT_SECS";
pub const SKIFF_SUPERVISOR_BACKOFF_SECS: &str = "SKIFF_SUPERVISOR_BACKOFF_SECS";

// Status registry
pub const SKIFF_STATUS_EXPIRY_HOURS: &str = "SKIFF_STATUS_EXPIRY_HOURS";
pub const SKIFF_STATUS_SWEEP_SECS: &str = "SKIFF_STATUS_SWEEP_SECS";

// Node package registry
pub const SKIFF_NPM_REGISTRY: &str = "SKIFF_NPM_REGISTRY"; // preset name or URL

// Docker backend paths
pub const SKIFF_CONFIG_ROOT: &str = "SKIFF_CONFIG_ROOT";
pub const SKIFF_ROUTES_DIR: &str = "SKIFF_ROUTES_DIR";
pub const SKIFF_ROUTE_ENTRYPOINT: &str = "SKIFF_ROUTE_ENTRYPOINT";

// CLI
pub const SKIFF_FILES_ROOT: &str = "SKIFF_FILES_ROOT";
