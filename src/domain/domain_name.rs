/// A fully qualified domain name, lowercased on parse. Only the syntax rules
/// that matter for provisioning are enforced: at least two labels, each
/// 1-63 chars of `[a-z0-9-]`, no leading/trailing hyphen, 253 chars total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainName(String);

impl DomainName {
    pub fn parse(domain: String) -> Result<Self, String> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() || domain.len() > 253 {
            return Err(format!("Invalid domain: {domain:?}"));
        }
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 {
            return Err(format!("Domain must have at least two labels: {domain:?}"));
        }
        for label in &labels {
            let valid = !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-');
            if !valid {
                return Err(format!("Invalid domain label {label:?} in {domain:?}"));
            }
        }
        Ok(Self(domain))
    }

    /// The leftmost label; drives hosting username derivation.
    pub fn primary_label(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for DomainName {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
