//! Parser for the device's recursive long listing (`ls -Rl`).
//!
//! The listing is a sequence of blocks separated by blank lines. Each block
//! starts with a `<absolute-dir>:` header followed by one long-listing line per
//! entry:
//!
//! ```text
//! /sdcard/webkit/layout-tests/dom/html/level1/core:
//! -rw-rw-r-- root     sdcard_rw       96 2011-09-06 06:49 documentgetdoctypenodtd-expected.txt
//! drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 nested dir
//! ```
//!
//! Directories carry no size column, so the date/time pair is located by shape
//! rather than by position. A malformed line ends its block; parsing resumes at
//! the next header. Such lines are counted on the inventory and reported once
//! as a warning, because a truncated listing makes stale files look current.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use super::filter::PathFilter;

/// One file known to be present on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub relative_path: String,
    pub mtime: i64,
    pub size: u64,
    pub is_dir: bool,
}

/// A single parsed long-listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLine {
    pub name: String,
    pub mtime: i64,
    pub size: u64,
    pub is_dir: bool,
}

/// Files on the device keyed by test-root-relative path. Never holds
/// directories.
#[derive(Debug, Clone, Default)]
pub struct RemoteFileInventory {
    entries: BTreeMap<String, RemoteFileEntry>,
    malformed_lines: usize,
}

impl RemoteFileInventory {
    pub fn get(&self, relative_path: &str) -> Option<&RemoteFileEntry> {
        self.entries.get(relative_path)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.entries.contains_key(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteFileEntry> {
        self.entries.values()
    }

    /// Lines that cut a block short.
    pub fn malformed_lines(&self) -> usize {
        self.malformed_lines
    }

    fn insert(&mut self, entry: RemoteFileEntry) {
        debug_assert!(!entry.is_dir);
        self.entries.insert(entry.relative_path.clone(), entry);
    }
}

impl FromIterator<RemoteFileEntry> for RemoteFileInventory {
    fn from_iter<I: IntoIterator<Item = RemoteFileEntry>>(iter: I) -> Self {
        let mut inventory = Self::default();
        for entry in iter.into_iter().filter(|e| !e.is_dir) {
            inventory.insert(entry);
        }
        inventory
    }
}

/// Parse one long-listing line.
///
/// Returns `None` for blank, short or otherwise unrecognisable lines. The
/// minute-resolution timestamp is completed with `:59` seconds so that a host
/// file written within the same minute does not look newer than its upload.
pub fn parse_listing_line(line: &str) -> Option<ListingLine> {
    let line = line.trim();
    let tokens: Vec<(usize, &str)> = line
        .split_whitespace()
        .map(|tok| (tok.as_ptr() as usize - line.as_ptr() as usize, tok))
        .collect();
    if tokens.len() < 6 {
        return None;
    }

    let mode = tokens[0].1;
    let is_dir = mode.starts_with('d');

    // mode, owner and group always come first; the date follows an optional
    // size (and, on newer shells, a link count before the owner).
    let date_idx = (3..tokens.len() - 2)
        .find(|&i| looks_like_date(tokens[i].1) && looks_like_time(tokens[i + 1].1))?;

    let size = if is_dir {
        0
    } else {
        tokens[date_idx - 1].1.parse().unwrap_or(0)
    };

    let stamp = format!("{} {}:59", tokens[date_idx].1, tokens[date_idx + 1].1);
    let mtime = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc()
        .timestamp();

    let mut name = &line[tokens[date_idx + 2].0..];
    if mode.starts_with('l')
        && let Some((link, _target)) = name.split_once(" -> ")
    {
        name = link;
    }

    Some(ListingLine {
        name: name.to_string(),
        mtime,
        size,
        is_dir,
    })
}

fn looks_like_date(tok: &str) -> bool {
    let b = tok.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

fn looks_like_time(tok: &str) -> bool {
    let b = tok.as_bytes();
    b.len() == 5 && b[2] == b':' && b.iter().enumerate().all(|(i, c)| i == 2 || c.is_ascii_digit())
}

fn is_total_line(line: &str) -> bool {
    line.strip_prefix("total ")
        .is_some_and(|n| n.trim().chars().all(|c| c.is_ascii_digit()))
}

/// Turn a block header into a directory path relative to `base`.
fn header_dir(base: &str, header: &str) -> Option<String> {
    let rest = header.strip_prefix(base)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(rest.trim_matches('/').to_string())
}

enum State {
    /// Expecting a block header.
    Header,
    /// Inside a block; `None` means the header was outside `base`.
    Block(Option<String>),
    /// Discarding the rest of a block after a malformed line.
    Skip,
}

/// Parse `ls -Rl <base>` output into an inventory of non-excluded files.
pub fn parse_recursive_listing(
    base: &str,
    output: &str,
    filter: &dyn PathFilter,
) -> RemoteFileInventory {
    let base = base.trim_end_matches('/');
    let mut inventory = RemoteFileInventory::default();
    let mut state = State::Header;

    for raw in output.lines() {
        let line = raw.trim();
        state = match state {
            State::Header => {
                if line.is_empty() {
                    State::Header
                } else if let Some(path) = line.strip_suffix(':') {
                    let dir = header_dir(base, path);
                    if dir.is_none() {
                        tracing::debug!(header = %path, base = %base, "listing block outside base");
                    }
                    State::Block(dir)
                } else {
                    inventory.malformed_lines += 1;
                    State::Skip
                }
            }
            State::Block(dir) => {
                if line.is_empty() {
                    State::Header
                } else if is_total_line(line) {
                    State::Block(dir)
                } else {
                    match parse_listing_line(line) {
                        Some(entry) => {
                            if let Some(dir) = dir.as_deref()
                                && !entry.is_dir
                            {
                                let relative_path = if dir.is_empty() {
                                    entry.name
                                } else {
                                    format!("{dir}/{}", entry.name)
                                };
                                if !filter.excludes(&relative_path) {
                                    inventory.insert(RemoteFileEntry {
                                        relative_path,
                                        mtime: entry.mtime,
                                        size: entry.size,
                                        is_dir: false,
                                    });
                                }
                            }
                            State::Block(dir)
                        }
                        None => {
                            inventory.malformed_lines += 1;
                            State::Skip
                        }
                    }
                }
            }
            State::Skip => {
                if line.is_empty() {
                    State::Header
                } else {
                    State::Skip
                }
            }
        };
    }

    if inventory.malformed_lines > 0 {
        tracing::warn!(
            base = %base,
            malformed = inventory.malformed_lines,
            files = inventory.len(),
            "device listing had malformed lines; affected blocks were cut short"
        );
    }

    inventory
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        /sdcard/webkit/layout-tests:
drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 dom
drwxrwxr-x root     sdcard_rw          2011-09-20 10:23 fast
drwxrwxr-x root     sdcard_rw          2011-09-20 10:30 http
drwxrwxr-x root     sdcard_rw          2011-09-20 10:21 platform
drwxrwxr-x root     sdcard_rw          2011-09-20 10:22 storage

/sdcard/webkit/layout-tests/dom:
drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 html
drwxrwxr-x root     sdcard_rw          2011-09-20 10:29 xhtml

/sdcard/webkit/layout-tests/dom/html:
drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 level1
drwxrwxr-x root     sdcard_rw          2011-09-20 10:23 level2

/sdcard/webkit/layout-tests/dom/html/level1:
drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 core

/sdcard/webkit/layout-tests/dom/html/level1/core:
-rw-rw-r-- root     sdcard_rw       96 2011-09-06 06:49 documentgetdoctypenodtd-expected.txt
-rw-rw-r-- root     sdcard_rw      598 2011-09-06 06:49 documentgetdoctypenodtd.html
-rw-rw-r-- root     sdcard_rw     2922 2011-09-06 06:49 documentgetdoctypenodtd.js
"#;

    fn expected_not_synced(path: &str) -> bool {
        path.ends_with("-expected.txt")
    }

    #[test]
    fn test_parse_file_line() {
        let entry = parse_listing_line("-rw-r--r-- root group 96 2011-09-06 06:49 name.txt").unwrap();
        assert_eq!(entry.name, "name.txt");
        assert_eq!(entry.size, 96);
        assert!(!entry.is_dir);
        // 2011-09-06T06:49:59Z
        assert_eq!(entry.mtime, 1_315_291_799);
    }

    #[test]
    fn test_parse_directory_line_has_no_size() {
        let entry =
            parse_listing_line("drwxrwxr-x root     sdcard_rw          2011-09-20 10:25 dom").unwrap();
        assert!(entry.is_dir);
        assert_eq!(entry.size, 0);
        assert_eq!(entry.name, "dom");
    }

    #[test]
    fn test_parse_name_with_spaces() {
        let entry = parse_listing_line("-rw-rw-r-- root sdcard_rw 12 2011-09-06 06:49 a b  c.html").unwrap();
        assert_eq!(entry.name, "a b  c.html");

        let dir = parse_listing_line("drwxrwxr-x root sdcard_rw 2011-09-20 10:25 my dir").unwrap();
        assert_eq!(dir.name, "my dir");
        assert!(dir.is_dir);
    }

    #[test]
    fn test_parse_symlink_drops_target() {
        let entry = parse_listing_line(
            "lrwxrwxrwx root root 2011-09-20 10:25 sdcard -> /storage/emulated/legacy",
        )
        .unwrap();
        assert_eq!(entry.name, "sdcard");
        assert!(!entry.is_dir);
    }

    #[test]
    fn test_parse_line_with_link_count() {
        let entry =
            parse_listing_line("-rw-rw---- 1 root sdcard_rw 598 2011-09-06 06:49 a.html").unwrap();
        assert_eq!(entry.size, 598);
        assert_eq!(entry.name, "a.html");
    }

    #[test]
    fn test_parse_rejects_short_and_garbage() {
        assert!(parse_listing_line("").is_none());
        assert!(parse_listing_line("   ").is_none());
        assert!(parse_listing_line("/system/bin/drtunzip: No such file or directory").is_none());
        assert!(parse_listing_line("-rw-r--r-- root group 96 yesterday noon name.txt").is_none());
    }

    #[test]
    fn test_parse_recursive_listing() {
        let files = parse_recursive_listing(
            "/sdcard/webkit/layout-tests",
            LISTING,
            &expected_not_synced,
        );
        assert_eq!(
            files
                .get("dom/html/level1/core/documentgetdoctypenodtd.html")
                .unwrap()
                .mtime,
            1_315_291_799
        );
        assert!(files.get("dom/html/level1/core").is_none());
        assert!(files
            .get("dom/html/level1/core/documentgetdoctypenodtd-expected.txt")
            .is_none());
        assert_eq!(files.len(), 2);
        assert_eq!(files.malformed_lines(), 0);
    }

    #[test]
    fn test_directories_never_included() {
        let files = parse_recursive_listing("/sdcard/webkit/layout-tests", LISTING, &|_: &str| false);
        assert!(files.iter().all(|e| !e.is_dir));
        assert!(!files.contains("dom"));
        assert!(!files.contains("dom/html/level1/core"));
    }

    #[test]
    fn test_base_with_trailing_slash_and_root_files() {
        let listing = "/x:\n-rw-r--r-- root group 96 2011-09-06 06:49 name.txt\n";
        let files = parse_recursive_listing("/x/", listing, &|_: &str| false);
        let entry = files.get("name.txt").unwrap();
        assert_eq!(entry.mtime, 1_315_291_799);
        assert_eq!(entry.size, 96);
    }

    #[test]
    fn test_malformed_line_ends_block() {
        let listing = "/x/a:\n\
-rw-r--r-- root group 1 2011-09-06 06:49 one.html\n\
garbage\n\
-rw-r--r-- root group 1 2011-09-06 06:49 lost.html\n\
\n\
/x/b:\n\
-rw-r--r-- root group 1 2011-09-06 06:49 two.html\n";
        let files = parse_recursive_listing("/x", listing, &|_: &str| false);
        assert!(files.contains("a/one.html"));
        assert!(!files.contains("a/lost.html"));
        assert!(files.contains("b/two.html"));
        assert_eq!(files.malformed_lines(), 1);
    }

    #[test]
    fn test_truncated_trailing_block_keeps_parsed_entries() {
        let listing = "/x/a:\n-rw-r--r-- root group 1 2011-09-06 06:49 one.html\n-rw-r--r-- root gro";
        let files = parse_recursive_listing("/x", listing, &|_: &str| false);
        assert!(files.contains("a/one.html"));
        assert_eq!(files.malformed_lines(), 1);
    }

    #[test]
    fn test_total_lines_are_ignored() {
        let listing = "/x:\ntotal 16\n-rw-rw---- 1 root sdcard_rw 598 2011-09-06 06:49 a.html\n";
        let files = parse_recursive_listing("/x", listing, &|_: &str| false);
        assert!(files.contains("a.html"));
        assert_eq!(files.malformed_lines(), 0);
    }

    #[test]
    fn test_blocks_outside_base_are_skipped() {
        let listing = "/elsewhere:\n-rw-r--r-- root group 1 2011-09-06 06:49 one.html\n\n\
/x-other:\n-rw-r--r-- root group 1 2011-09-06 06:49 two.html\n";
        let files = parse_recursive_listing("/x", listing, &|_: &str| false);
        assert!(files.is_empty());
    }

    #[test]
    fn test_crlf_output() {
        let listing = "/x:\r\n-rw-r--r-- root group 96 2011-09-06 06:49 name.txt\r\n";
        let files = parse_recursive_listing("/x", listing, &|_: &str| false);
        assert!(files.contains("name.txt"));
    }
}
