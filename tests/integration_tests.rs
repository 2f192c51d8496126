//! Integration tests for reward issuance
//!
//! These tests drive the full pipeline (validation, balance check, serialized
//! submission, confirmation) against the in-memory ledger.

use ctk_rewards::{
    ConfirmationMode, InMemoryLedger, IntentStatus, InvalidRequest, IssuerSettings, LedgerView, RewardError,
    RewardIssuer, RewardRequest, TransferState,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

const CUSTODIAL: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const USER: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";
const OTHER_USER: &str = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB";

fn manual_ledger(balance: u128) -> Arc<InMemoryLedger> {
    Arc::new(InMemoryLedger::new(CUSTODIAL, balance).with_confirmation_mode(ConfirmationMode::Manual))
}

fn start(ledger: Arc<InMemoryLedger>, settings: IssuerSettings) -> Arc<RewardIssuer> {
    let (issuer, _worker) = RewardIssuer::start(ledger, settings, None);
    Arc::new(issuer)
}

fn settings() -> IssuerSettings {
    IssuerSettings {
        max_amount: 1_000,
        ..IssuerSettings::default()
    }
}

fn request(requester: &str, address: &str, amount: i128) -> RewardRequest {
    RewardRequest::new(Some(requester.to_string()), address, amount)
}

// ============================================================================
// Submission Ordering
// ============================================================================

mod ordering {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_grants_reach_ledger_in_intent_order() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 1_000_000));
        ledger.set_ack_delay(Duration::from_millis(2)).await;
        let issuer = start(ledger.clone(), settings());

        let mut handles = Vec::new();
        for i in 1..=25i128 {
            let issuer = issuer.clone();
            handles.push(tokio::spawn(async move {
                issuer.grant(request(&format!("user-{}", i), USER, i)).await
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(ledger.max_concurrent_submits(), 1);

        outcomes.sort_by_key(|o| o.intent_id);
        let ids: Vec<u64> = outcomes.iter().map(|o| o.intent_id).collect();
        assert_eq!(ids, (1..=25).collect::<Vec<u64>>());

        // Each transfer's amount identifies it; the ledger saw them by intent id
        let expected: Vec<u128> = outcomes
            .iter()
            .map(|o| issuer.transfer(&o.transfer_ref).unwrap().amount)
            .collect();
        let observed: Vec<u128> = ledger.submit_calls().await.into_iter().map(|(_, amount)| amount).collect();
        assert_eq!(observed, expected);
    }
}

// ============================================================================
// Balance Safety
// ============================================================================

mod balance_safety {
    use super::*;

    #[tokio::test]
    async fn test_competing_grants_cannot_overdraw() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let (a, b) = tokio::join!(
            issuer.grant(request("alice", USER, 700)),
            issuer.grant(request("bob", OTHER_USER, 500)),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(RewardError::InsufficientBalance { .. })))
                .count(),
            1
        );
        assert_eq!(ledger.submit_count().await, 1);
    }

    #[tokio::test]
    async fn test_submitted_total_never_exceeds_balance() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let mut handles = Vec::new();
        for i in 0..40 {
            let issuer = issuer.clone();
            handles.push(tokio::spawn(async move {
                issuer.grant(request(&format!("user-{}", i), USER, 70)).await
            }));
        }

        let mut granted = 0u128;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 70,
                Err(RewardError::InsufficientBalance { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // 14 * 70 = 980 fits, a 15th would not
        assert_eq!(granted, 980);
        assert_eq!(ledger.total_submitted_amount().await, 980);
    }

    #[tokio::test]
    async fn test_confirmed_transfers_free_no_extra_funds() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let first = issuer.grant(request("alice", USER, 600)).await.unwrap();
        ledger.confirm(&first.transfer_ref).await;
        assert_eq!(issuer.poll_status(&first.transfer_ref).await, Ok(TransferState::Confirmed));

        // Ledger now shows 400; a 500 grant must still be refused
        let err = issuer.grant(request("bob", USER, 500)).await.unwrap_err();
        assert!(matches!(err, RewardError::InsufficientBalance { available: 400, .. }));
        assert!(issuer.grant(request("bob", USER, 400)).await.is_ok());
    }

    #[tokio::test]
    async fn test_ledger_unavailable_is_retryable_and_harmless() {
        let ledger = manual_ledger(1_000);
        ledger.fail_balance_reads(true).await;
        let issuer = start(ledger.clone(), settings());

        let err = issuer.grant(request("alice", USER, 10)).await.unwrap_err();
        assert!(matches!(err, RewardError::LedgerUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(ledger.submit_count().await, 0);

        ledger.fail_balance_reads(false).await;
        assert!(issuer.grant(request("alice", USER, 10)).await.is_ok());
    }
}

// ============================================================================
// Validation
// ============================================================================

mod validation {
    use super::*;

    #[tokio::test]
    async fn test_invalid_requests_make_no_ledger_calls() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let cases = [
            RewardRequest::new(None, USER, 10),
            RewardRequest::new(Some(String::new()), USER, 10),
            request("alice", "0x12", 10),
            request("alice", "0x5AAEB6053f3e94c9b9a09f33669435e7ef1beaed", 10),
            request("alice", USER, 0),
            request("alice", USER, -5),
            request("alice", USER, 1_001),
        ];

        for case in cases {
            let err = issuer.grant(case).await.unwrap_err();
            assert!(matches!(err, RewardError::Invalid(_)), "{err:?}");
        }

        assert_eq!(ledger.balance_read_count().await, 0);
        assert_eq!(ledger.submit_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_requester() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let err = issuer.grant(RewardRequest::new(None, USER, 10)).await.unwrap_err();
        assert_eq!(err, RewardError::Invalid(InvalidRequest::MissingRequester));
        assert_eq!(err.code(), "missing_requester");
        assert_eq!(ledger.submit_count().await, 0);
    }
}

// ============================================================================
// Submission Outcomes
// ============================================================================

mod outcomes {
    use super::*;

    #[tokio::test]
    async fn test_grant_returns_submitted_without_waiting() {
        let ledger = manual_ledger(1_000);
        ledger.script_transfer_refs(["tx123"]).await;
        let issuer = start(ledger.clone(), settings());

        let outcome = issuer.grant(request("alice", USER, 1)).await.unwrap();
        assert_eq!(outcome.transfer_ref.as_str(), "tx123");
        assert_eq!(outcome.state, TransferState::Submitted);
        // Nothing confirmed on the ledger side yet
        assert_eq!(ledger.status_read_count().await, 0);
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_is_outcome_unknown() {
        let ledger = manual_ledger(1_000);
        ledger.set_ack_delay(Duration::from_millis(400)).await;
        let issuer = start(
            ledger.clone(),
            IssuerSettings {
                ledger_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        let err = issuer.grant(request("alice", USER, 800)).await.unwrap_err();
        assert!(matches!(err, RewardError::OutcomeUnknown { .. }));
        assert!(!err.is_retryable());

        // The caller can follow up on the intent instead of resubmitting
        let intent_id = err.intent_id().unwrap();
        assert!(matches!(
            issuer.transfer_by_intent(intent_id).await,
            Ok(IntentStatus::Unresolved { amount: 800, .. })
        ));

        // The transfer may have landed: its funds stay reserved
        ledger.set_ack_delay(Duration::ZERO).await;
        let err = issuer.grant(request("bob", USER, 300)).await.unwrap_err();
        assert!(matches!(err, RewardError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_rejection_is_submission_failed() {
        let ledger = manual_ledger(1_000);
        ledger.reject_submissions(Some("nonce too low".to_string())).await;
        let issuer = start(ledger.clone(), settings());

        let err = issuer.grant(request("alice", USER, 10)).await.unwrap_err();
        assert!(matches!(err, RewardError::SubmissionFailed(_)));
        assert!(issuer.recent_transfers(10).is_empty());
        assert_eq!(issuer.stats().queue.failed, 1);
    }
}

// ============================================================================
// Confirmation
// ============================================================================

mod confirmation {
    use super::*;
    use ctk_rewards::TransferRef;

    #[tokio::test]
    async fn test_poll_is_idempotent_after_terminal_state() {
        let ledger = manual_ledger(1_000);
        let issuer = start(ledger.clone(), settings());

        let outcome = issuer.grant(request("alice", USER, 10)).await.unwrap();
        assert_eq!(issuer.poll_status(&outcome.transfer_ref).await, Ok(TransferState::Submitted));

        ledger.confirm(&outcome.transfer_ref).await;
        assert_eq!(issuer.poll_status(&outcome.transfer_ref).await, Ok(TransferState::Confirmed));

        let reads = ledger.status_read_count().await;
        for _ in 0..3 {
            assert_eq!(issuer.poll_status(&outcome.transfer_ref).await, Ok(TransferState::Confirmed));
        }
        assert_eq!(ledger.status_read_count().await, reads);
    }

    #[tokio::test]
    async fn test_unconfirmed_transfer_times_out_to_failed() {
        let ledger = manual_ledger(1_000);
        let issuer = start(
            ledger.clone(),
            IssuerSettings {
                confirmation_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        let outcome = issuer.grant(request("alice", USER, 10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(issuer.poll_status(&outcome.transfer_ref).await, Ok(TransferState::Failed));
        let transfer = issuer.transfer(&outcome.transfer_ref).unwrap();
        assert!(transfer.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_confirmation_loop_resolves_pending_transfers() {
        let ledger = Arc::new(InMemoryLedger::new(CUSTODIAL, 1_000));
        let issuer = start(ledger.clone(), settings());

        let outcome = issuer.grant(request("alice", USER, 10)).await.unwrap();

        let sweeper = tokio::spawn(ctk_rewards::run_confirmation_loop(
            issuer.reporter(),
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweeper.abort();

        let transfer = issuer.transfer(&outcome.transfer_ref).unwrap();
        assert_eq!(transfer.state, TransferState::Confirmed);
        assert_eq!(ledger.get_balance(USER).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_not_found() {
        let issuer = start(manual_ledger(1_000), settings());
        assert!(matches!(
            issuer.poll_status(&TransferRef::from("0xdead")).await,
            Err(RewardError::TransferNotFound(_))
        ));
    }
}
