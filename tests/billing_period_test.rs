use chrono::Duration;
use futures::future::join_all;
use tollgate::Clock;
use tollgate::billing::{AccountStore, PlanId};
use tollgate::testing::{TestAccount, TestBilling};

#[tokio::test]
async fn test_period_rolls_after_thirty_one_days() {
    let billing = TestBilling::new();
    let user = billing
        .insert(TestAccount::builder().with_requests_used(17))
        .await;

    billing.clock.advance(Duration::days(31));
    assert!(billing.periods().maybe_roll(&user.user_id).await.unwrap());

    let account = billing.store.get_account(&user.user_id).await.unwrap().unwrap();
    assert_eq!(account.requests_used, 0);
    assert_eq!(account.period.start, billing.clock.now());
    assert_eq!(account.period.end, billing.clock.now() + Duration::days(30));

    let quota = billing.store.get_quota(&user.user_id).await.unwrap().unwrap();
    assert_eq!(quota.used, 0);
    assert_eq!(quota.remaining, 20);
    assert_eq!(quota.next_reset_at, account.period.end);
}

#[tokio::test]
async fn test_maybe_roll_is_idempotent() {
    let billing = TestBilling::new();
    let user = billing.register().await;
    billing.clock.advance(Duration::days(40));

    let periods = billing.periods();
    assert!(periods.maybe_roll(&user.user_id).await.unwrap());
    let first = billing.store.get_account(&user.user_id).await.unwrap().unwrap();

    // Requests counted after the reset survive further roll attempts
    billing.ledger().increment(&user.user_id).await.unwrap();
    for _ in 0..5 {
        assert!(!periods.maybe_roll(&user.user_id).await.unwrap());
    }

    let after = billing.store.get_account(&user.user_id).await.unwrap().unwrap();
    assert_eq!(after.period, first.period);
    assert_eq!(after.requests_used, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rollers_reset_once() {
    let billing = TestBilling::new();
    let user = billing
        .insert(TestAccount::builder().on_plan(PlanId::Pro).with_requests_used(500))
        .await;
    billing.clock.advance(Duration::days(31));

    let tasks = (0..16).map(|_| {
        let periods = billing.periods();
        let user_id = user.user_id.clone();
        tokio::spawn(async move { periods.maybe_roll(&user_id).await })
    });
    let winners = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .filter(|rolled| *rolled)
        .count();

    assert_eq!(winners, 1);
    let account = billing.store.get_account(&user.user_id).await.unwrap().unwrap();
    assert_eq!(account.requests_used, 0);
    assert_eq!(account.period.start, billing.clock.now());

    let quota = billing.store.get_quota(&user.user_id).await.unwrap().unwrap();
    assert_eq!(quota.limit, 10_000);
}

#[tokio::test]
async fn test_gate_resets_before_counting() {
    let billing = TestBilling::new();
    let user = billing
        .insert(TestAccount::builder().with_requests_used(20))
        .await;
    let gate = billing.gate();

    assert!(gate.require(&user.user_id).await.is_err());

    billing.clock.advance(Duration::days(30) + Duration::seconds(1));
    let quota = gate.require(&user.user_id).await.unwrap();
    assert_eq!(quota.used, 1);
    assert_eq!(quota.remaining, 19);
}
