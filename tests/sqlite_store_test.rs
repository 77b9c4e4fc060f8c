use chrono::{TimeZone, Utc};
use coach_pricing::db::init_db;
use coach_pricing::domain::{
    Activation, AppliesTo, BuyerId, CoachId, Currency, DiscountCode, DiscountId, DiscountValue,
    Eligibility, Money, Payment, PaymentId, PayoutStatus, Percent, RateConfig, RateMutation,
    RateSnapshot, SessionTypeId,
};
use coach_pricing::repository::{DiscountRepository, PaymentRepository, RateConfigRepository};
use coach_pricing::{Repository, StoreError};
use tempfile::TempDir;

fn chf(amount: i64) -> Money {
    Money::from_minor(amount, "CHF").unwrap()
}

fn db_path(temp_dir: &TempDir) -> String {
    temp_dir
        .path()
        .join("pricing.db")
        .to_string_lossy()
        .to_string()
}

async fn open(path: &str) -> Repository {
    Repository::new(init_db(path).await.expect("init_db failed"))
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = db_path(&temp_dir);
    let coach = CoachId::new("coach-1");

    {
        let repo = open(&path).await;
        repo.create_if_absent(&RateConfig::onboarding_default(
            coach.clone(),
            Currency::new("CHF").unwrap(),
        ))
        .await
        .unwrap();
        repo.save(
            &coach,
            0,
            &RateMutation::SetSessionTypeRate {
                session_type_id: SessionTypeId::new("yoga"),
                rate: chf(12_000),
            },
        )
        .await
        .unwrap();

        repo.insert_discount(&DiscountCode {
            id: DiscountId::new("d1"),
            coach_id: coach.clone(),
            activation: Activation::Code {
                code: "SPRING".to_string(),
            },
            value: DiscountValue::fixed(chf(1_000)).unwrap(),
            applies_to: AppliesTo::PlatformWide,
            eligibility: Eligibility::All,
            is_active: true,
            start_date: None,
            expiry_date: None,
            usage_limit: Some(3),
            usage_count: 0,
            limit_to_one_per_customer: false,
            minimum_purchase_amount: Some(chf(5_000)),
        })
        .await
        .unwrap();
        repo.increment_usage(&DiscountId::new("d1"), Some(3), &BuyerId::new("b1"))
            .await
            .unwrap();

        repo.insert_payment(&Payment {
            id: PaymentId::new("p1"),
            coach_id: coach.clone(),
            gross_amount: chf(12_000),
            rate_snapshot: RateSnapshot {
                platform_fee_rate: Percent::from_str_canonical("9.9").unwrap(),
                vat_rate: Percent::zero(),
                processing_fee_rate: Percent::zero(),
            },
            refunds: vec![],
            payout_status: PayoutStatus::Pending,
        })
        .await
        .unwrap();
    }

    let repo = open(&path).await;

    let rates = repo.load(&coach).await.unwrap().unwrap();
    assert_eq!(rates.version, 1);
    assert_eq!(
        rates.session_type_rates.get(&SessionTypeId::new("yoga")),
        Some(&chf(12_000))
    );

    let code = repo.get_discount(&DiscountId::new("d1")).await.unwrap().unwrap();
    assert_eq!(code.usage_count, 1);
    assert_eq!(code.minimum_purchase_amount, Some(chf(5_000)));

    let payment = repo.get(&PaymentId::new("p1")).await.unwrap().unwrap();
    assert_eq!(
        payment.rate_snapshot.platform_fee_rate,
        Percent::from_str_canonical("9.9").unwrap()
    );
}

#[tokio::test]
async fn test_stale_version_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let repo = open(&db_path(&temp_dir)).await;
    let coach = CoachId::new("coach-1");
    repo.create_if_absent(&RateConfig::onboarding_default(
        coach.clone(),
        Currency::new("CHF").unwrap(),
    ))
    .await
    .unwrap();

    let mutation = RateMutation::SetBaseRate { rate: chf(9_000) };
    repo.save(&coach, 0, &mutation).await.unwrap();
    let err = repo.save(&coach, 0, &mutation).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict {
            expected: 0,
            current: 1
        }
    ));
}

#[tokio::test]
async fn test_paid_payments_leave_unpaid_listing() {
    let temp_dir = TempDir::new().unwrap();
    let repo = open(&db_path(&temp_dir)).await;
    let coach = CoachId::new("coach-1");

    for id in ["p1", "p2"] {
        repo.insert_payment(&Payment {
            id: PaymentId::new(id),
            coach_id: coach.clone(),
            gross_amount: chf(5_000),
            rate_snapshot: RateSnapshot {
                platform_fee_rate: Percent::zero(),
                vat_rate: Percent::zero(),
                processing_fee_rate: Percent::zero(),
            },
            refunds: vec![],
            payout_status: PayoutStatus::Pending,
        })
        .await
        .unwrap();
    }

    let paid_at = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    let changed = repo
        .mark_paid(&[PaymentId::new("p1"), PaymentId::new("p2")], paid_at)
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert!(repo.list_unpaid(&coach).await.unwrap().is_empty());
}
