/// External identifier scoping a retryable operation (a provider event id, a
/// sweep marker, a step fingerprint). Scopes are fixed strings chosen by the
/// caller; keys come from outside and get validated here.
#[derive(Debug, Clone)]
pub struct IdempotencyKey(String);

impl TryFrom<String> for IdempotencyKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            anyhow::bail!("Idempotency key cannot be empty")
        }
        let max_chars = 100;
        if value.len() > max_chars {
            anyhow::bail!("Idempotency key cannot be longer than {max_chars} characters")
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str { &self.0 }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self { value.0 }
}
