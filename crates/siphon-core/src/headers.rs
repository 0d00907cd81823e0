use std::fmt;

use regex::Regex;

/// An ordered, case-insensitive, multi-valued header container.
///
/// Lookups ignore case; the name casing supplied on insertion is preserved
/// for output, matching the wire behavior of `ODictCaseless` in the original
/// mitmproxy implementation this type is modeled on.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, or `None` if absent.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order. Empty (not an error) if absent.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Appends a value without disturbing any existing values for `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Removes every existing value for `name`, then inserts a single value
    /// at the position of the first removed entry (or at the end if none
    /// existed). Mirrors `headers["Name"] = [value]` in the source ODict.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let first_idx = self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name));
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        let idx = first_idx.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries.insert(idx, (name, value.into()));
    }

    /// Removes every value for `name`, returning the removed values.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Bulk removal: drop every header named in `names`.
    pub fn remove_all(&mut self, names: &[&str]) {
        self.entries
            .retain(|(n, _)| !names.iter().any(|candidate| n.eq_ignore_ascii_case(candidate)));
    }

    /// True if any value of `name` contains `substring`.
    pub fn in_any(&self, name: &str, substring: &str, case_insensitive: bool) -> bool {
        self.get_all(name).into_iter().any(|v| {
            if case_insensitive {
                v.to_ascii_lowercase().contains(&substring.to_ascii_lowercase())
            } else {
                v.contains(substring)
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites `pattern` to `repl` in every header name and value.
    /// Returns the total number of substitutions made.
    pub fn replace(&mut self, pattern: &Regex, repl: &str) -> usize {
        let mut count = 0;
        for (name, value) in self.entries.iter_mut() {
            count += replace_in_place(name, pattern, repl);
            count += replace_in_place(value, pattern, repl);
        }
        count
    }
}

fn replace_in_place(s: &mut String, pattern: &Regex, repl: &str) -> usize {
    let count = pattern.find_iter(s).count();
    if count > 0 {
        *s = pattern.replace_all(s, repl).into_owned();
    }
    count
}

impl fmt::Display for HeaderMap {
    /// Renders `Name: value\r\n` lines, one per value, in insertion order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        let entries = iter.into_iter().map(|(n, v)| (n.to_string(), v.to_string())).collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut h = HeaderMap::new();
        h.add("Content-Type", "text/html");
        assert_eq!(h.get_first("content-type"), Some("text/html"));
        assert_eq!(h.get_first("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn preserves_casing_on_output() {
        let mut h = HeaderMap::new();
        h.add("X-Custom-Header", "1");
        assert_eq!(h.to_string(), "X-Custom-Header: 1\r\n");
    }

    #[test]
    fn get_all_is_multivalued_and_ordered() {
        let mut h = HeaderMap::new();
        h.add("Set-Cookie", "a=1");
        h.add("Set-Cookie", "b=2");
        assert_eq!(h.get_all("set-cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn missing_get_all_is_empty_not_error() {
        let h = HeaderMap::new();
        assert!(h.get_all("nope").is_empty());
        assert_eq!(h.get_first("nope"), None);
    }

    #[test]
    fn set_replaces_all_existing_values() {
        let mut h = HeaderMap::new();
        h.add("X-A", "1");
        h.add("X-A", "2");
        h.set("X-A", "3");
        assert_eq!(h.get_all("x-a"), vec!["3"]);
    }

    #[test]
    fn remove_all_strips_named_headers() {
        let mut h = HeaderMap::new();
        h.add("Connection", "keep-alive");
        h.add("Keep-Alive", "timeout=5");
        h.add("Host", "example.com");
        h.remove_all(&["Connection", "Keep-Alive"]);
        assert!(!h.contains("connection"));
        assert!(!h.contains("keep-alive"));
        assert!(h.contains("host"));
    }

    #[test]
    fn in_any_scans_all_values() {
        let mut h = HeaderMap::new();
        h.add("Accept", "text/html");
        h.add("Accept", "application/json");
        assert!(h.in_any("accept", "JSON", true));
        assert!(!h.in_any("accept", "JSON", false));
    }

    #[test]
    fn replace_rewrites_names_and_values_and_counts() {
        let mut h = HeaderMap::new();
        h.add("x-foo", "foo-value");
        h.add("X-Bar", "unrelated");
        let pattern = Regex::new("foo").unwrap();
        let count = h.replace(&pattern, "bar");
        assert_eq!(count, 2); // "x-foo" name + "foo-value" value, each renamed/rewritten once
        assert_eq!(h.get_first("x-bar"), Some("bar-value"));
    }
}
