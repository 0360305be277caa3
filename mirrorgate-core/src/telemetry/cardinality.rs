//! Bounded route labels.
//!
//! Route labels are derived from the request path, so a proxy in front of an
//! API with path parameters (`/users/123`) would otherwise create one time
//! series per entity. [`RouteLimiter`] admits the first `max_routes` distinct
//! routes and folds the rest into a single overflow series.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::warn;

/// Label value substituted once the limit is reached.
pub const OVERFLOW_LABEL: &str = "__other__";

/// Longest route label kept verbatim, in bytes.
pub const MAX_LABEL_LEN: usize = 128;

struct Admitted {
    routes: HashSet<String>,
    overflowed: bool,
}

/// Caps the number of distinct route labels handed to metric families.
pub struct RouteLimiter {
    admitted: Mutex<Admitted>,
    max_routes: usize,
}

impl RouteLimiter {
    pub fn new(max_routes: usize) -> Self {
        Self {
            admitted: Mutex::new(Admitted {
                routes: HashSet::new(),
                overflowed: false,
            }),
            max_routes,
        }
    }

    /// Metric label for `route`.
    ///
    /// Over-long routes are cut at [`MAX_LABEL_LEN`] (on a char boundary)
    /// before admission. The first overflow is logged once.
    pub fn label(&self, route: &str) -> String {
        let route = truncate(route, MAX_LABEL_LEN);

        let mut admitted = self.admitted.lock();
        if admitted.routes.contains(route) {
            return route.to_string();
        }
        if admitted.routes.len() < self.max_routes {
            admitted.routes.insert(route.to_string());
            return route.to_string();
        }
        if !admitted.overflowed {
            admitted.overflowed = true;
            drop(admitted);
            warn!(
                max_routes = self.max_routes,
                route = %route,
                "Route label limit reached, further routes reported as {}",
                OVERFLOW_LABEL
            );
        }
        OVERFLOW_LABEL.to_string()
    }

    /// Number of routes admitted so far.
    #[cfg(test)]
    pub fn admitted(&self) -> usize {
        self.admitted.lock().routes.len()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
