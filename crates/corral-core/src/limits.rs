//! Hard capacity bounds.
//!
//! The core targets a fixed memory envelope on embedded gateways; every
//! accumulating structure (caches, rings, outdated-item lists) is bounded
//! by one of these constants. Exceeding a bound is reported as
//! `ErrorKind::NoMemory`, never grown past.

/// Maximum length of any identifier string (node, item, image, subject).
pub const MAX_ID_LEN: usize = 64;

/// Maximum number of nodes in one unit.
pub const MAX_NODES: usize = 32;

/// Maximum number of service instances across the unit.
pub const MAX_INSTANCES: usize = 256;

/// Maximum number of update items tracked at once.
pub const MAX_UPDATE_ITEMS: usize = 64;

/// Maximum outdated items a partition keeps eligible for eviction.
pub const MAX_OUTDATED_ITEMS: usize = 64;

/// Alert de-duplication cache capacity.
pub const ALERTS_CACHE_SIZE: usize = 32;

/// Maximum alerts per transmitted package.
pub const ALERT_ITEMS_COUNT: usize = 10;

/// Monitoring sample ring capacity (per node / per instance).
pub const MONITORING_SAMPLE_WINDOW: usize = 32;

/// Monitoring state-transition ring capacity (per node / per instance).
pub const MONITORING_STATE_WINDOW: usize = 4;

/// Default image install worker pool size.
pub const INSTALL_WORKERS: usize = 5;
