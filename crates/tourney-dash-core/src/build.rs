// Build identifier used to detect stale clients after a redeploy.

/// Set `TOURNEY_DASH_BUILD_ID` at compile time (e.g. to the git commit) to
/// stamp a build; otherwise the crate version is used.
pub const BUILD_ID: &str = match option_env!("TOURNEY_DASH_BUILD_ID") {
    Some(id) => id,
    None => env!("CARGO_PKG_VERSION"),
};
