// src/entry.rs
use crate::{Result, WalletError};
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fractional digits of the wallet currency's minor unit.
pub const AMOUNT_SCALE: u32 = 2;

/// Non-nil user identifier. Deserialising goes through [`UserId::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct UserId(Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Result<Self> {
        if id.is_nil() {
            return Err(WalletError::Validation("userId must not be nil".to_string()));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl TryFrom<Uuid> for UserId {
    type Error = WalletError;

    fn try_from(id: Uuid) -> Result<Self> {
        Self::new(id)
    }
}

impl From<UserId> for Uuid {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl FromStr for UserId {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let id = Uuid::parse_str(s.trim())
            .map_err(|_| WalletError::Validation(format!("malformed userId: {:?}", s)))?;
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "CREDIT",
            Self::Debit => "DEBIT",
        }
    }

    /// Effect of an entry of this type on the balance.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit => amount,
            Self::Debit => -amount,
        }
    }
}

impl FromStr for EntryType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREDIT" => Ok(Self::Credit),
            "DEBIT" => Ok(Self::Debit),
            other => Err(WalletError::Validation(format!(
                "type must be CREDIT or DEBIT, got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one credit or debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn new(request: &NewTransaction) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: request.user_id,
            amount: request.amount,
            entry_type: request.entry_type,
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn signed_amount(&self) -> Decimal {
        self.entry_type.signed(self.amount)
    }
}

/// A validated `createTransaction` request.
///
/// Request JSON is deserialised through [`NewTransaction::new`], so amounts
/// arrive normalised and `"5"` and `"5.00"` are the same request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawTransaction")]
pub struct NewTransaction {
    pub user_id: UserId,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    user_id: UserId,
    amount: Decimal,
    #[serde(rename = "type")]
    entry_type: EntryType,
}

impl TryFrom<RawTransaction> for NewTransaction {
    type Error = WalletError;

    fn try_from(raw: RawTransaction) -> Result<Self> {
        Self::new(raw.user_id, raw.amount, raw.entry_type)
    }
}

impl NewTransaction {
    pub fn new(user_id: UserId, amount: Decimal, entry_type: EntryType) -> Result<Self> {
        Ok(Self {
            user_id,
            amount: normalize_amount(amount)?,
            entry_type,
        })
    }

    /// Re-validates a request whose fields were set directly.
    pub fn normalized(self) -> Result<Self> {
        Self::new(self.user_id, self.amount, self.entry_type)
    }

    pub fn credit(user_id: UserId, amount: Decimal) -> Result<Self> {
        Self::new(user_id, amount, EntryType::Credit)
    }

    pub fn debit(user_id: UserId, amount: Decimal) -> Result<Self> {
        Self::new(user_id, amount, EntryType::Debit)
    }

    /// Builds a request from the raw strings the request layer receives.
    pub fn parse(user_id: &str, amount: &str, entry_type: &str) -> Result<Self> {
        let amount = Decimal::from_str(amount.trim())
            .map_err(|_| WalletError::Validation(format!("malformed amount: {:?}", amount)))?;
        Self::new(user_id.parse()?, amount, entry_type.parse()?)
    }
}

/// Rejects non-positive amounts and sub-minor-unit precision, then fixes the
/// scale so equal amounts serialise identically.
pub fn normalize_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(WalletError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    let mut normalized = amount.normalize();
    if normalized.scale() > AMOUNT_SCALE {
        return Err(WalletError::Validation(format!(
            "amount {} has more than {} decimal places",
            amount, AMOUNT_SCALE
        )));
    }
    normalized.rescale(AMOUNT_SCALE);
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_amount() {
        assert_eq!(
            normalize_amount(Decimal::new(100, 0)).unwrap().to_string(),
            "100.00"
        );
        assert_eq!(
            normalize_amount(Decimal::new(1050, 3)).unwrap().to_string(),
            "1.05"
        );
        assert!(normalize_amount(Decimal::ZERO).is_err());
        assert!(normalize_amount(Decimal::new(-5, 0)).is_err());
        assert!(normalize_amount(Decimal::new(1001, 3)).is_err());
    }

    #[test]
    fn test_parse_request() {
        let user = UserId::generate();
        let req = NewTransaction::parse(&user.to_string(), "42.5", "DEBIT").unwrap();
        assert_eq!(req.amount, Decimal::new(4250, 2));
        assert_eq!(req.entry_type, EntryType::Debit);

        assert!(matches!(
            NewTransaction::parse("not-a-uuid", "1", "CREDIT"),
            Err(WalletError::Validation(_))
        ));
        assert!(matches!(
            NewTransaction::parse(&Uuid::nil().to_string(), "1", "CREDIT"),
            Err(WalletError::Validation(_))
        ));
        assert!(matches!(
            NewTransaction::parse(&user.to_string(), "1", "REFUND"),
            Err(WalletError::Validation(_))
        ));
        assert!(matches!(
            NewTransaction::parse(&user.to_string(), "abc", "CREDIT"),
            Err(WalletError::Validation(_))
        ));
    }

    #[test]
    fn test_entry_json_shape() {
        let user = UserId::generate();
        let req = NewTransaction::credit(user, Decimal::new(50, 0)).unwrap();
        let entry = LedgerEntry::new(&req);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["userId"], user.to_string());
        assert_eq!(json["amount"], "50.00");
        assert_eq!(json["type"], "CREDIT");
        assert!(json.get("createdAt").is_some());
        assert_eq!(entry.signed_amount(), Decimal::new(5000, 2));
    }

    #[test]
    fn test_request_json_is_validated() {
        let user = UserId::generate();
        let parse = |json: String| serde_json::from_str::<NewTransaction>(&json);

        let short = parse(format!(r#"{{"userId":"{}","amount":"5","type":"CREDIT"}}"#, user)).unwrap();
        let long =
            parse(format!(r#"{{"userId":"{}","amount":"5.00","type":"CREDIT"}}"#, user)).unwrap();
        assert_eq!(short, long);
        assert_eq!(
            serde_json::to_string(&short).unwrap(),
            serde_json::to_string(&long).unwrap()
        );
        assert_eq!(serde_json::to_value(&short).unwrap()["amount"], "5.00");

        let nil = format!(r#"{{"userId":"{}","amount":"5","type":"CREDIT"}}"#, Uuid::nil());
        assert!(parse(nil).is_err());
        assert!(parse(r#"{"userId":"nope","amount":"5","type":"CREDIT"}"#.to_string()).is_err());
        for amount in ["0", "-1", "5.001"] {
            let json = format!(r#"{{"userId":"{}","amount":"{}","type":"DEBIT"}}"#, user, amount);
            assert!(parse(json).is_err(), "amount {} accepted", amount);
        }
    }

    #[test]
    fn test_user_id_json() {
        let user = UserId::generate();
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, format!("\"{}\"", user));
        assert_eq!(serde_json::from_str::<UserId>(&json).unwrap(), user);
        assert!(serde_json::from_str::<UserId>(&format!("\"{}\"", Uuid::nil())).is_err());
    }
}
