//! # Ad-Watch Rate Limiter
//!
//! Decides how many credits one ad watch is worth, and whether it is
//! allowed at all, from the account's daily ad-stat record and the
//! current time. No I/O: the ledger engine calls it inside its account
//! transaction and persists the returned record with the award.
//!
//! ## Rules (defaults)
//!
//! ```text
//! reward(n) = max(10 - (n - 1), 1)      n = ads watched today, 1-indexed
//!
//!   ad #   1  2  3  4  5  6  7  8  9 10 11 12 ...
//!   pts   10  9  8  7  6  5  4  3  2  1  1  1 ...
//!
//! caps      100 ads/day, 145 points/day (last reward clamped to fit)
//! sessions  10 ads, then 5 minutes cooldown from the 10th ad
//! rollover  record dated before "today" (UTC+7) counts as empty
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::db::AdStatRecord;
use super::error::Reason;

/// Reward schedule and limits for ad watches.
#[derive(Debug, Clone, PartialEq)]
pub struct AdPolicy {
    pub max_ads_per_day: i32,
    pub max_points_per_day: i64,
    pub ads_per_session: i32,
    pub session_cooldown: Duration,
    pub first_reward: i64,
    pub decay_step: i64,
    pub floor_reward: i64,
}

impl Default for AdPolicy {
    fn default() -> Self {
        Self {
            max_ads_per_day: 100,
            max_points_per_day: 145,
            ads_per_session: 10,
            session_cooldown: Duration::minutes(5),
            first_reward: 10,
            decay_step: 1,
            floor_reward: 1,
        }
    }
}

impl AdPolicy {
    /// Reject configurations that could award nothing or loop forever.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_ads_per_day <= 0 || self.max_points_per_day <= 0 {
            return Err("daily caps must be positive".to_string());
        }
        if self.ads_per_session <= 0 {
            return Err("session size must be positive".to_string());
        }
        if self.floor_reward <= 0 || self.first_reward < self.floor_reward {
            return Err("rewards must satisfy first >= floor > 0".to_string());
        }
        if self.decay_step < 0 {
            return Err("decay step cannot be negative".to_string());
        }
        if self.session_cooldown < Duration::zero() {
            return Err("cooldown cannot be negative".to_string());
        }
        Ok(())
    }

    /// Nominal reward for the `n`th ad of the day (1-indexed).
    pub fn reward_for(&self, n: i32) -> i64 {
        let steps = i64::from(n.max(1) - 1);
        self.first_reward
            .saturating_sub(steps.saturating_mul(self.decay_step))
            .max(self.floor_reward)
    }
}

/// An accepted ad watch: the credits to award and the record to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct AdGrant {
    pub reward: i64,
    pub record: AdStatRecord,
}

/// The record as it should be read "today": the stored one if it is
/// dated today, otherwise a zeroed one.
pub fn current_record(
    stored: Option<&AdStatRecord>,
    account_id: &str,
    today: NaiveDate,
) -> AdStatRecord {
    match stored {
        Some(record) if record.stat_date == today => record.clone(),
        _ => AdStatRecord::fresh(account_id, today),
    }
}

/// Evaluate one ad watch.
///
/// ## Arguments
///
/// * `stored` - The account's ad-stat record, if any
/// * `account_id` - Owner, used when a fresh record is needed
/// * `today` - Calendar date in the reference timezone
/// * `now` - Current instant, for cooldown arithmetic
/// * `policy` - Schedule and limits
///
/// ## Returns
///
/// * `Ok(AdGrant)` - Reward and the updated record
/// * `Err(Reason)` - `MaxAdsReached`, `MaxAdPointsReached` or `SessionCooldown`
pub fn evaluate(
    stored: Option<&AdStatRecord>,
    account_id: &str,
    today: NaiveDate,
    now: DateTime<Utc>,
    policy: &AdPolicy,
) -> Result<AdGrant, Reason> {
    let mut record = current_record(stored, account_id, today);

    if record.total_ads_watched >= policy.max_ads_per_day {
        return Err(Reason::MaxAdsReached);
    }
    if record.points_earned >= policy.max_points_per_day {
        return Err(Reason::MaxAdPointsReached);
    }

    if record.current_session_ads >= policy.ads_per_session {
        match record.last_session_end {
            Some(ended) if now - ended < policy.session_cooldown => {
                return Err(Reason::SessionCooldown);
            }
            _ => record.current_session_ads = 0,
        }
    }

    let nominal = policy.reward_for(record.total_ads_watched + 1);
    let headroom = policy.max_points_per_day - record.points_earned;
    let reward = nominal.min(headroom);
    if reward <= 0 {
        return Err(Reason::MaxAdPointsReached);
    }

    record.total_ads_watched += 1;
    record.current_session_ads += 1;
    record.points_earned += reward;
    if record.current_session_ads >= policy.ads_per_session {
        record.sessions_completed += 1;
        record.last_session_end = Some(now);
    }
    record.updated_at = now;

    Ok(AdGrant { reward, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    /// Watch `n` ads back to back starting from `record`.
    fn watch(
        mut record: Option<AdStatRecord>,
        n: usize,
        now: DateTime<Utc>,
        policy: &AdPolicy,
    ) -> (Option<AdStatRecord>, Vec<i64>) {
        let mut rewards = Vec::new();
        for _ in 0..n {
            let grant = evaluate(record.as_ref(), "acct1", day(), now, policy).unwrap();
            rewards.push(grant.reward);
            record = Some(grant.record);
        }
        (record, rewards)
    }

    #[test]
    fn test_first_session_decays_ten_to_one() {
        let policy = AdPolicy::default();
        let (record, rewards) = watch(None, 10, at(1, 0, 0), &policy);
        assert_eq!(rewards, vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);

        let record = record.unwrap();
        assert_eq!(record.total_ads_watched, 10);
        assert_eq!(record.points_earned, 55);
        assert_eq!(record.sessions_completed, 1);
        assert_eq!(record.last_session_end, Some(at(1, 0, 0)));
    }

    #[test]
    fn test_cooldown_boundary() {
        let policy = AdPolicy::default();
        let (record, _) = watch(None, 10, at(1, 0, 0), &policy);

        let early = evaluate(record.as_ref(), "acct1", day(), at(1, 4, 59), &policy);
        assert_eq!(early, Err(Reason::SessionCooldown));

        let grant = evaluate(record.as_ref(), "acct1", day(), at(1, 5, 0), &policy).unwrap();
        assert_eq!(grant.reward, 1);
        assert_eq!(grant.record.current_session_ads, 1);
        assert_eq!(grant.record.total_ads_watched, 11);
    }

    #[test]
    fn test_point_cap_rejects_after_145() {
        let policy = AdPolicy {
            session_cooldown: Duration::zero(),
            ..AdPolicy::default()
        };
        // 55 points in the first ten ads, then 1 point each.
        let (record, rewards) = watch(None, 100, at(2, 0, 0), &policy);
        assert_eq!(rewards.iter().sum::<i64>(), 145);

        let next = evaluate(record.as_ref(), "acct1", day(), at(2, 0, 0), &policy);
        assert!(matches!(
            next,
            Err(Reason::MaxAdsReached) | Err(Reason::MaxAdPointsReached)
        ));
    }

    #[test]
    fn test_point_cap_clamps_last_reward() {
        let policy = AdPolicy {
            max_points_per_day: 20,
            ..AdPolicy::default()
        };
        let (record, rewards) = watch(None, 2, at(3, 0, 0), &policy);
        assert_eq!(rewards, vec![10, 9]);

        let grant = evaluate(record.as_ref(), "acct1", day(), at(3, 0, 0), &policy).unwrap();
        assert_eq!(grant.reward, 1);
        assert_eq!(grant.record.points_earned, 20);

        let capped = evaluate(Some(&grant.record), "acct1", day(), at(3, 0, 0), &policy);
        assert_eq!(capped, Err(Reason::MaxAdPointsReached));
    }

    #[test]
    fn test_ad_count_cap() {
        let policy = AdPolicy {
            max_ads_per_day: 3,
            ..AdPolicy::default()
        };
        let (record, _) = watch(None, 3, at(4, 0, 0), &policy);
        let next = evaluate(record.as_ref(), "acct1", day(), at(4, 0, 0), &policy);
        assert_eq!(next, Err(Reason::MaxAdsReached));
    }

    #[test]
    fn test_yesterday_record_is_zeroed() {
        let policy = AdPolicy::default();
        let yesterday = day().pred_opt().unwrap();
        let mut stale = AdStatRecord::fresh("acct1", yesterday);
        stale.total_ads_watched = 100;
        stale.points_earned = 145;
        stale.current_session_ads = 10;
        stale.last_session_end = Some(at(0, 59, 0));

        let grant = evaluate(Some(&stale), "acct1", day(), at(1, 0, 0), &policy).unwrap();
        assert_eq!(grant.reward, 10);
        assert_eq!(grant.record.stat_date, day());
        assert_eq!(grant.record.total_ads_watched, 1);
        assert_eq!(grant.record.points_earned, 10);
        assert_eq!(grant.record.sessions_completed, 0);
    }

    #[test]
    fn test_reward_for_respects_configured_shape() {
        let policy = AdPolicy {
            first_reward: 20,
            decay_step: 5,
            floor_reward: 2,
            ..AdPolicy::default()
        };
        let rewards: Vec<i64> = (1..=6).map(|n| policy.reward_for(n)).collect();
        assert_eq!(rewards, vec![20, 15, 10, 5, 2, 2]);
    }

    #[test]
    fn test_policy_validation() {
        assert!(AdPolicy::default().validate().is_ok());
        let bad = AdPolicy {
            floor_reward: 0,
            ..AdPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
