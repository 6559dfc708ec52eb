// src/balance.rs
use crate::UserId;
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Materialised running total for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: UserId,
    pub amount: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            amount: Decimal::new(0, crate::entry::AMOUNT_SCALE),
            version: 1,
            updated_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub(crate) fn apply(&mut self, delta: Decimal) {
        self.amount += delta;
        self.version += 1;
        self.updated_at = Utc::now().trunc_subsecs(6);
    }
}
