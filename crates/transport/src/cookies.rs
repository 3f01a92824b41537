//! Cookie jar

/// Name of the cookie carrying the session
pub const SESSION_COOKIE: &str = "webvpn";

/// Ordered name/value cookie store
///
/// Setting an existing name replaces its value in place; setting an empty
/// value removes the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    entries: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        let pos = self.entries.iter().position(|(n, _)| n == name);
        match (pos, value.is_empty()) {
            (Some(i), true) => {
                self.entries.remove(i);
            }
            (Some(i), false) => self.entries[i].1 = value.to_string(),
            (None, true) => {}
            (None, false) => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Value of the `Cookie:` request header, if any cookies are set
    pub fn header_value(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .entries
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect();
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_by_name() {
        let mut jar = CookieJar::new();
        jar.set("a", "1");
        jar.set("webvpn", "first");
        jar.set("b", "2");
        jar.set("webvpn", "second");

        assert_eq!(jar.len(), 3);
        assert_eq!(jar.get("webvpn"), Some("second"));
        assert_eq!(
            jar.header_value().as_deref(),
            Some("a=1; webvpn=second; b=2")
        );

        jar.set("webvpn", "");
        assert_eq!(jar.get("webvpn"), None);
        assert_eq!(jar.len(), 2);
    }

    #[test]
    fn test_empty_value_for_unknown_name() {
        let mut jar = CookieJar::new();
        jar.set("x", "");
        assert!(jar.is_empty());
        assert!(jar.header_value().is_none());
    }

    #[test]
    fn test_clear() {
        let mut jar = CookieJar::new();
        jar.set("a", "1");
        jar.set("b", "2");
        jar.remove("a");
        assert_eq!(jar.iter().collect::<Vec<_>>(), [("b", "2")]);
        jar.clear();
        assert!(jar.is_empty());
    }
}
