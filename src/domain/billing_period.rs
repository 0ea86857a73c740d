use chrono::DateTime;
use chrono::Months;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Recurring billing cadence of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "billing_period", rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
    Biennial,
    Triennial,
}

impl BillingPeriod {
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
            Self::Biennial => 24,
            Self::Triennial => 36,
        }
    }

    /// The next billing instant after `from`.
    pub fn advance(
        &self,
        from: DateTime<Utc>,
    ) -> DateTime<Utc> {
        from + Months::new(self.months())
    }
}
