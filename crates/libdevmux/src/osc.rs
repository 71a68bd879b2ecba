use std::path::PathBuf;

use percent_encoding::percent_decode_str;
use url::Url;
use vte::{Parser, Perform};

/// Shell-reported metadata changes found in PTY output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscUpdate {
    /// OSC 0 or OSC 2 window title.
    Title(String),
    /// OSC 7 `file://host/path` working directory.
    WorkingDir(PathBuf),
}

#[derive(Default)]
struct OscCollector {
    updates: Vec<OscUpdate>,
}

impl Perform for OscCollector {
    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        let Some((kind, rest)) = params.split_first() else {
            return;
        };
        match *kind {
            b"0" | b"2" => {
                // vte splits on ';', which is legal inside a title.
                let title = rest
                    .iter()
                    .map(|p| String::from_utf8_lossy(p))
                    .collect::<Vec<_>>()
                    .join(";");
                self.updates.push(OscUpdate::Title(title));
            }
            b"7" => {
                if let Some(path) = rest.first().and_then(|uri| parse_file_uri(uri)) {
                    self.updates.push(OscUpdate::WorkingDir(path));
                }
            }
            _ => {}
        }
    }
}

/// Incremental OSC scanner. Sequences split across reads are reassembled
/// by the parser state.
pub struct OscTracker {
    parser: Parser,
    collector: OscCollector,
}

impl OscTracker {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            collector: OscCollector::default(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<OscUpdate> {
        self.parser.advance(&mut self.collector, bytes);
        std::mem::take(&mut self.collector.updates)
    }
}

impl Default for OscTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of an OSC 7 `file://` URI. The host is whatever the shell thinks
/// the machine is called, so it is not checked.
fn parse_file_uri(uri: &[u8]) -> Option<PathBuf> {
    let url = Url::parse(std::str::from_utf8(uri).ok()?).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    let path = percent_decode_str(url.path()).decode_utf8().ok()?;
    Some(PathBuf::from(path.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_sequences_are_reported() {
        let mut tracker = OscTracker::new();
        let updates = tracker.feed(b"prompt$ \x1b]0;build: cargo\x07more");
        assert_eq!(updates, vec![OscUpdate::Title("build: cargo".to_string())]);

        let updates = tracker.feed(b"\x1b]2;a;b\x1b\\");
        assert_eq!(updates, vec![OscUpdate::Title("a;b".to_string())]);
    }

    #[test]
    fn working_dir_is_decoded() {
        let mut tracker = OscTracker::new();
        let updates = tracker.feed(b"\x1b]7;file://host/home/me/my%20proj\x07");
        assert_eq!(
            updates,
            vec![OscUpdate::WorkingDir(PathBuf::from("/home/me/my proj"))]
        );
    }

    #[test]
    fn working_dir_host_forms() {
        let mut tracker = OscTracker::new();
        for uri in [
            "file:///srv/app",
            "file://localhost/srv/app",
            "file://build-box.local/srv/app",
        ] {
            let seq = format!("\x1b]7;{uri}\x07");
            assert_eq!(
                tracker.feed(seq.as_bytes()),
                vec![OscUpdate::WorkingDir(PathBuf::from("/srv/app"))],
                "{uri}"
            );
        }
    }

    #[test]
    fn split_sequences_are_reassembled() {
        let mut tracker = OscTracker::new();
        assert!(tracker.feed(b"\x1b]0;vi").is_empty());
        let updates = tracker.feed(b"m\x07");
        assert_eq!(updates, vec![OscUpdate::Title("vim".to_string())]);
    }

    #[test]
    fn malformed_working_dir_is_ignored() {
        let mut tracker = OscTracker::new();
        assert!(tracker.feed(b"\x1b]7;http://x/y\x07").is_empty());
        assert!(tracker.feed(b"\x1b]7;file://host/bad%ff%fe\x07").is_empty());
        assert!(tracker.feed(b"\x1b]7;file://[bad/x\x07").is_empty());
        assert!(tracker.feed(b"plain output\r\n").is_empty());
    }
}
