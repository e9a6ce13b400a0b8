use crate::amount::Amount;
use crate::error::BountyError;
use crate::types::Token;
use std::collections::BTreeMap;

/// Burn-and-remint plan for paying part of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub parent_id: String,
    pub recipient_coins: BTreeMap<String, Amount>,
    pub remainder_coins: BTreeMap<String, Amount>,
}

impl SplitPlan {
    /// Deterministic child ids so a replayed mint collides with the original.
    pub fn child_ids(&self, burn_request_id: &str) -> (String, String) {
        (
            child_token_id(&self.parent_id, burn_request_id, "recipient"),
            child_token_id(&self.parent_id, burn_request_id, "remainder"),
        )
    }

    /// Per-coin sum of both children equals the parent balance.
    pub fn conserves(&self, parent: &Token) -> bool {
        let mut kinds: Vec<&String> = parent
            .coins
            .keys()
            .chain(self.recipient_coins.keys())
            .chain(self.remainder_coins.keys())
            .collect();
        kinds.sort();
        kinds.dedup();

        kinds.into_iter().all(|coin| {
            let split_total = &self.recipient_coins.get(coin).cloned().unwrap_or_default()
                + &self.remainder_coins.get(coin).cloned().unwrap_or_default();
            split_total == parent.balance(coin)
        })
    }
}

/// Plan a split of `token` paying `amount` of `coin`.
///
/// The amount must be non-zero and strictly below the token's balance; equal
/// balances take the full-transfer path. Other coin kinds stay with the
/// remainder.
pub fn plan_split(token: &Token, coin: &str, amount: &Amount) -> Result<SplitPlan, BountyError> {
    let balance = token.balance(coin);
    if amount.is_zero() || *amount >= balance {
        return Err(BountyError::Validation(format!(
            "split of token '{}' needs 0 < amount < {balance}, got {amount}",
            token.id
        )));
    }

    let change = balance
        .checked_sub(amount)
        .ok_or_else(|| BountyError::Validation("split underflow".to_string()))?;

    let mut recipient_coins = BTreeMap::new();
    recipient_coins.insert(coin.to_string(), amount.clone());

    let mut remainder_coins = token.coins.clone();
    remainder_coins.insert(coin.to_string(), change);

    Ok(SplitPlan {
        parent_id: token.id.clone(),
        recipient_coins,
        remainder_coins,
    })
}

pub fn child_token_id(parent_id: &str, burn_request_id: &str, role: &str) -> String {
    blake3::hash(format!("split:{parent_id}:{burn_request_id}:{role}").as_bytes())
        .to_hex()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn split_of_1000_paying_300_leaves_700() {
        let token = Token::new("t1", "DIRECT://me", "x", Amount::from(1000));
        let plan = plan_split(&token, "x", &Amount::from(300)).unwrap();
        assert_eq!(plan.recipient_coins.get("x"), Some(&Amount::from(300)));
        assert_eq!(plan.remainder_coins.get("x"), Some(&Amount::from(700)));
        assert!(plan.conserves(&token));
    }

    #[test]
    fn exact_or_excess_amount_is_not_a_split() {
        let token = Token::new("t1", "DIRECT://me", "x", Amount::from(50));
        assert!(plan_split(&token, "x", &Amount::from(50)).is_err());
        assert!(plan_split(&token, "x", &Amount::from(51)).is_err());
        assert!(plan_split(&token, "x", &Amount::zero()).is_err());
    }

    #[test]
    fn child_ids_are_distinct_and_stable() {
        let token = Token::new("t1", "DIRECT://me", "x", Amount::from(9));
        let plan = plan_split(&token, "x", &Amount::from(4)).unwrap();
        let (a, b) = plan.child_ids("burn-1");
        assert_ne!(a, b);
        assert_eq!(plan.child_ids("burn-1"), (a, b));
    }

    proptest! {
        #[test]
        fn split_conserves_every_coin_kind(
            balance in 2u64..u64::MAX,
            pay_seed in any::<u64>(),
            other in 0u64..1_000_000,
        ) {
            let pay = 1 + pay_seed % (balance - 1);
            let mut token = Token::new("t", "DIRECT://me", "x", Amount::from(balance));
            token.coins.insert("y".to_string(), Amount::from(other));

            let plan = plan_split(&token, "x", &Amount::from(pay)).unwrap();
            prop_assert!(plan.conserves(&token));
            prop_assert_eq!(plan.recipient_coins.len(), 1);
        }
    }
}
