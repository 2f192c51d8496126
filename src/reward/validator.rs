//! Reward request validation
//!
//! Pure checks against static limits; nothing here touches the ledger.

use serde::{Deserialize, Serialize};

use crate::error::InvalidRequest;
use crate::ledger::normalize_address;

/// Incoming grant request as received from the web tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRequest {
    pub requester_id: Option<String>,
    pub wallet_address: String,
    /// Signed so that non-positive inputs can be rejected rather than wrapped
    pub amount: i128,
}

impl RewardRequest {
    pub fn new(requester_id: Option<String>, wallet_address: impl Into<String>, amount: i128) -> Self {
        Self {
            requester_id,
            wallet_address: wallet_address.into(),
            amount,
        }
    }
}

/// A request that passed validation. Only the validator constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    requester_id: String,
    wallet_address: String,
    amount: u128,
}

impl ValidatedRequest {
    pub fn requester_id(&self) -> &str {
        &self.requester_id
    }

    /// Checksummed address
    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    pub fn amount(&self) -> u128 {
        self.amount
    }
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_amount: u128,
}

impl RequestValidator {
    pub fn new(max_amount: u128) -> Self {
        Self { max_amount }
    }

    pub fn max_amount(&self) -> u128 {
        self.max_amount
    }

    pub fn validate(&self, request: &RewardRequest) -> Result<ValidatedRequest, InvalidRequest> {
        let requester_id = request
            .requester_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(InvalidRequest::MissingRequester)?;

        let wallet_address = normalize_address(&request.wallet_address)
            .ok_or_else(|| InvalidRequest::MalformedAddress(request.wallet_address.clone()))?;

        if request.amount <= 0 {
            return Err(InvalidRequest::InvalidAmount(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        let amount = request.amount as u128;
        if amount > self.max_amount {
            return Err(InvalidRequest::InvalidAmount(format!(
                "amount {} exceeds per-request maximum {}",
                amount, self.max_amount
            )));
        }

        Ok(ValidatedRequest {
            requester_id: requester_id.to_string(),
            wallet_address,
            amount,
        })
    }
}

#[cfg(test)]
pub(crate) fn validated_for_tests(requester_id: &str, wallet_address: &str, amount: u128) -> ValidatedRequest {
    ValidatedRequest {
        requester_id: requester_id.to_string(),
        wallet_address: wallet_address.to_string(),
        amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    fn validator() -> RequestValidator {
        RequestValidator::new(1_000)
    }

    #[test]
    fn test_valid_request() {
        let request = RewardRequest::new(Some("user-1".into()), ADDRESS.to_ascii_lowercase(), 10);
        let validated = validator().validate(&request).unwrap();
        assert_eq!(validated.requester_id(), "user-1");
        assert_eq!(validated.wallet_address(), ADDRESS);
        assert_eq!(validated.amount(), 10);
    }

    #[test]
    fn test_missing_requester() {
        for requester in [None, Some(String::new()), Some("   ".to_string())] {
            let request = RewardRequest::new(requester, ADDRESS, 1);
            assert_eq!(validator().validate(&request), Err(InvalidRequest::MissingRequester));
        }
    }

    #[test]
    fn test_requester_checked_before_address() {
        let request = RewardRequest::new(None, "0xABC", 1);
        assert_eq!(validator().validate(&request), Err(InvalidRequest::MissingRequester));
    }

    #[test]
    fn test_malformed_address() {
        let request = RewardRequest::new(Some("user-1".into()), "0xABC", 1);
        assert!(matches!(
            validator().validate(&request),
            Err(InvalidRequest::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_non_positive_amounts() {
        for amount in [0, -1, i128::MIN] {
            let request = RewardRequest::new(Some("user-1".into()), ADDRESS, amount);
            assert!(matches!(
                validator().validate(&request),
                Err(InvalidRequest::InvalidAmount(_))
            ));
        }
    }

    #[test]
    fn test_amount_above_maximum() {
        let request = RewardRequest::new(Some("user-1".into()), ADDRESS, 1_001);
        assert!(matches!(
            validator().validate(&request),
            Err(InvalidRequest::InvalidAmount(_))
        ));

        let at_limit = RewardRequest::new(Some("user-1".into()), ADDRESS, 1_000);
        assert!(validator().validate(&at_limit).is_ok());
    }
}
