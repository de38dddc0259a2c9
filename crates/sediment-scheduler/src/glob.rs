//! Glob patterns over file tree paths.

use regex::Regex;
use sediment_core::{Error, Result};

/// A compiled glob. `*` and `?` stay within one path segment, `**` crosses
/// segments. Patterns are anchored at the root: `/` matches only the root,
/// `/*` matches its direct children.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let normalized = normalize(pattern);
        let regex = Regex::new(&translate(&normalized))
            .map_err(|e| Error::InvalidPipeline(format!("invalid glob {:?}: {}", pattern, e)))?;
        Ok(Self {
            pattern: normalized,
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

fn normalize(pattern: &str) -> String {
    let trimmed = pattern.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn translate(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut class = String::from("[");
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    match next {
                        '\\' | '^' if class.len() > 1 => class.push('\\'),
                        '!' if class.len() == 1 => {
                            class.push('^');
                            continue;
                        }
                        _ => {}
                    }
                    class.push(next);
                }
                if closed {
                    class.push(']');
                    out.push_str(&class);
                } else {
                    out.push_str(&regex::escape(&class));
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_glob() {
        let glob = Glob::new("/").unwrap();
        assert!(glob.matches("/"));
        assert!(!glob.matches("/a"));
    }

    #[test]
    fn test_single_segment() {
        let glob = Glob::new("/*").unwrap();
        assert!(glob.matches("/a"));
        assert!(glob.matches("/dir"));
        assert!(!glob.matches("/dir/a"));
        assert!(!glob.matches("/"));
    }

    #[test]
    fn test_recursive() {
        let glob = Glob::new("/data/**").unwrap();
        assert!(glob.matches("/data/a"));
        assert!(glob.matches("/data/x/y"));
        assert!(!glob.matches("/other/a"));
    }

    #[test]
    fn test_relative_and_wildcards() {
        let glob = Glob::new("logs/*.txt").unwrap();
        assert_eq!(glob.as_str(), "/logs/*.txt");
        assert!(glob.matches("/logs/a.txt"));
        assert!(!glob.matches("/logs/a.csv"));

        let glob = Glob::new("/file?").unwrap();
        assert!(glob.matches("/file1"));
        assert!(!glob.matches("/file10"));
    }

    #[test]
    fn test_character_class() {
        let glob = Glob::new("/[ab]*").unwrap();
        assert!(glob.matches("/apple"));
        assert!(!glob.matches("/cherry"));
        let glob = Glob::new("/[!ab]*").unwrap();
        assert!(glob.matches("/cherry"));
    }

    #[test]
    fn test_literal_dots_are_escaped() {
        let glob = Glob::new("/a.b").unwrap();
        assert!(glob.matches("/a.b"));
        assert!(!glob.matches("/axb"));
    }
}
