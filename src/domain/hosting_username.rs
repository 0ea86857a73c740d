use crate::domain::DomainName;

/// Control-panel account username, derived deterministically from the site's
/// domain: the lowercase alphanumeric prefix of the primary label (at most 8
/// chars), suffixed with a 4-digit tenant-scoped counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostingUsername(String);

impl HostingUsername {
    pub fn derive(
        domain: &DomainName,
        counter: u32,
    ) -> Self {
        // a parsed label always starts and ends with an alphanumeric, so the
        // prefix is never empty
        let prefix: String = domain
            .primary_label()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(8)
            .collect();
        Self(format!("{prefix}{:04}", counter % 10_000))
    }
}

impl AsRef<str> for HostingUsername {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for HostingUsername {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
