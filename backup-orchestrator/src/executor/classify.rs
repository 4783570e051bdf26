//! Fatal-marker classification of engine output.
//!
//! Engines report failures by printing `ERROR` or `Failed` somewhere in a
//! line, sometimes while still exiting with code 0. Any such line fails the
//! job. This is a plain substring match kept for compatibility with existing
//! engines; it does not try to interpret the line any further.

/// Case-sensitive substrings that mark a line as fatal.
pub const FATAL_MARKERS: [&str; 2] = ["ERROR", "Failed"];

pub fn is_fatal(line: &str) -> bool {
    FATAL_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Remembers the first fatal line seen during one engine invocation.
#[derive(Debug, Default)]
pub struct FatalMarkers {
    first: Option<String>,
}

impl FatalMarkers {
    pub fn observe(&mut self, line: &str) {
        if self.first.is_none() && is_fatal(line) {
            self.first = Some(line.to_string());
        }
    }

    pub fn into_first(self) -> Option<String> {
        self.first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_are_case_sensitive() {
        assert!(is_fatal("rsync ERROR: some files could not be transferred"));
        assert!(is_fatal("Failed to open /opt/nvr/config/db.sqlite"));
        assert!(!is_fatal("error count: 0"));
        assert!(!is_fatal("failed=0 copied=12"));
    }

    #[test]
    fn test_first_fatal_line_wins() {
        let mut markers = FatalMarkers::default();
        markers.observe("copying config");
        markers.observe("cp: Failed to copy a.db");
        markers.observe("ERROR: giving up");
        assert_eq!(
            markers.into_first().as_deref(),
            Some("cp: Failed to copy a.db")
        );
    }

    #[test]
    fn test_clean_output_has_no_marker() {
        let mut markers = FatalMarkers::default();
        markers.observe("copying config");
        markers.observe("sent 1024 bytes");
        assert!(markers.into_first().is_none());
    }
}
