//! Settings for the layers applied to the operator router.

use std::time::Duration;

/// Per-request timeout applied to every route.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
