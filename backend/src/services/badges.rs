//! # Badges
//!
//! Fixed badge catalogue, evaluated against an account after every
//! applied award.

use crate::db::AccountRecord;

/// Condition under which a badge is earned.
#[derive(Debug, Clone, Copy)]
enum Rule {
    ImpactAtLeast(f64),
    ActivitiesAtLeast(usize),
    CreditsAtLeast(i64),
}

impl Rule {
    fn holds(&self, account: &AccountRecord) -> bool {
        match *self {
            Rule::ImpactAtLeast(min) => account.impact >= min,
            Rule::ActivitiesAtLeast(min) => account.completed_activities.len() >= min,
            Rule::CreditsAtLeast(min) => account.credits >= min,
        }
    }
}

const CATALOGUE: &[(&str, Rule)] = &[
    ("eco_starter", Rule::ImpactAtLeast(1.0)),
    ("eco_warrior", Rule::ImpactAtLeast(10.0)),
    ("recycler", Rule::ActivitiesAtLeast(5)),
    ("credit_collector", Rule::CreditsAtLeast(100)),
    ("eco_legend", Rule::CreditsAtLeast(1000)),
];

/// Badges `account` qualifies for but does not hold yet, in catalogue order.
pub fn newly_earned(account: &AccountRecord) -> Vec<String> {
    CATALOGUE
        .iter()
        .filter(|(id, rule)| rule.holds(account) && !account.badges.iter().any(|b| b == id))
        .map(|(id, _)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_fresh_account_has_nothing_to_earn() {
        let account = AccountRecord::new("acct1", Utc::now());
        assert!(newly_earned(&account).is_empty());
    }

    #[test]
    fn test_thresholds() {
        let mut account = AccountRecord::new("acct1", Utc::now());
        account.impact = 10.0;
        account.credits = 100;
        assert_eq!(
            newly_earned(&account),
            vec!["eco_starter", "eco_warrior", "credit_collector"]
        );

        account.completed_activities = (0..5).map(|i| format!("a{}", i)).collect();
        assert!(newly_earned(&account).contains(&"recycler".to_string()));
    }

    #[test]
    fn test_held_badges_are_not_repeated() {
        let mut account = AccountRecord::new("acct1", Utc::now());
        account.credits = 1000;
        account.badges = vec!["credit_collector".to_string()];
        assert_eq!(newly_earned(&account), vec!["eco_legend"]);
    }
}
