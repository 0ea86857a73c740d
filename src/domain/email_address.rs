use validator::ValidateEmail;

use crate::domain::DomainName;

/// RFC 5321's cap on a complete address.
const MAX_ADDRESS_LEN: usize = 254;

/// An address we either bill (customer emails) or provision (mailboxes,
/// notification recipients). Parsing trims and folds to lowercase - mail
/// routing ignores case and the control panels reject mixed-case logins -
/// and enforces the length cap on top of syntax validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(email: String) -> Result<Self, String> {
        let email = email.trim().to_lowercase();
        if email.len() > MAX_ADDRESS_LEN {
            return Err(format!("Email address exceeds {MAX_ADDRESS_LEN} chars"));
        }
        if !email.validate_email() {
            return Err(format!("Invalid email: {email:?}"));
        }
        Ok(Self(email))
    }

    /// Build a mailbox address on a provisioned domain, e.g. the default
    /// `admin@<domain>` box created during provisioning.
    pub fn mailbox(
        local_part: &str,
        domain: &DomainName,
    ) -> Result<Self, String> {
        Self::parse(format!("{local_part}@{domain}"))
    }

    /// Everything before the `@`; doubles as the fallback display name for
    /// customers who never supplied one.
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    pub fn domain(&self) -> &str {
        self.0.rsplit('@').next().unwrap_or(&self.0)
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use claims::assert_err;
    use fake::faker::internet::en::SafeEmail;
    use fake::Fake;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::domain::DomainName;
    use crate::domain::EmailAddress;

    #[test]
    fn parse_trims_and_folds_case() {
        let email = EmailAddress::parse("  Alice@Example.COM ".to_string()).unwrap();
        assert_eq!(email.as_ref(), "alice@example.com");
    }

    #[test]
    fn local_part_and_domain_split() {
        let email = EmailAddress::parse("admin@alice.example.com".to_string()).unwrap();
        assert_eq!(email.local_part(), "admin");
        assert_eq!(email.domain(), "alice.example.com");
    }

    #[test]
    fn mailbox_on_a_provisioned_domain() {
        let domain = DomainName::parse("alice.example.com".to_string()).unwrap();
        let mailbox = EmailAddress::mailbox("admin", &domain).unwrap();
        assert_eq!(mailbox.as_ref(), "admin@alice.example.com");
    }

    #[test]
    fn mailbox_rejects_a_bad_local_part() {
        let domain = DomainName::parse("alice.example.com".to_string()).unwrap();
        assert_err!(EmailAddress::mailbox("", &domain));
        assert_err!(EmailAddress::mailbox("no spaces", &domain));
    }

    #[test]
    fn overlong_address_rejected() {
        let local = "a".repeat(250);
        assert_err!(EmailAddress::parse(format!("{local}@x.com")));
    }

    #[test]
    fn malformed_addresses_rejected() {
        for bad in ["", "alicefoo.com", "@foo.com", "alice@"] {
            assert_err!(EmailAddress::parse(bad.to_string()));
        }
    }

    #[test]
    fn generated_addresses_parse_and_split_cleanly() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let raw: String = SafeEmail().fake_with_rng(&mut rng);
            let email = EmailAddress::parse(raw.clone()).unwrap();
            assert_eq!(email.as_ref(), raw.to_lowercase());
            // local part and domain reassemble into the whole address
            assert_eq!(
                format!("{}@{}", email.local_part(), email.domain()),
                email.as_ref()
            );
        }
    }
}
