//! # Logging Setup
//!
//! One call from `main`, built on `tracing_subscriber`'s fmt builder. The
//! default filter scopes the `shoal_node` and `shoal_protocol` targets to
//! the requested level and keeps everything else at `warn`, so dependency
//! chatter does not drown the substrate's own logs. Setting `RUST_LOG`
//! takes over the filter wholesale with the usual directive syntax.
//!
//! Output goes to stderr; stdout stays clean for the `get` subcommand's
//! result lines.

use tracing_subscriber::{fmt, EnvFilter};

/// Whether a `--log-format` value asks for JSON lines. Anything that is
/// not literally "json" means human-readable output.
pub fn wants_json(format: &str) -> bool {
    format.trim().eq_ignore_ascii_case("json")
}

/// Installs the global subscriber. Call once, before any component spawns.
pub fn init(level: &str, format: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(format!(
            "warn,shoal_node={level},shoal_protocol={level}"
        )),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if wants_json(format) {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }

    tracing::debug!(level, format, "subscriber installed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_detection_is_forgiving_about_case_and_whitespace() {
        assert!(wants_json("json"));
        assert!(wants_json("JSON"));
        assert!(wants_json(" json "));

        assert!(!wants_json("pretty"));
        assert!(!wants_json(""));
        assert!(!wants_json("jsonl"));
    }
}
