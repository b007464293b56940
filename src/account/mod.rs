use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::user::{Role, UserId};

pub mod db;
pub mod endpoints;
pub mod manager;
pub use endpoints::*;

/// Money in minor currency units.
pub type Amount = i64;

/// The ledger of one driver or business owner.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Account {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub role: Role,
    pub balance: Amount,
    pub pending: Amount,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: UserId, role: Role, now: DateTime<Utc>) -> Account {
        Account {
            id,
            role,
            balance: 0,
            pending: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn total(&self) -> Amount {
        self.balance + self.pending
    }

    /// Applies the move in place; leaves the account untouched and returns
    /// `false` if it would drive either field negative.
    pub fn apply(&mut self, ledger_move: LedgerMove, now: DateTime<Utc>) -> bool {
        match ledger_move.apply(self.balance, self.pending) {
            Some((balance, pending)) => {
                self.balance = balance;
                self.pending = pending;
                self.modified_at = now;
                true
            }
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LedgerField {
    Balance,
    Pending,
}

impl LedgerField {
    pub fn name(self) -> &'static str {
        match self {
            LedgerField::Balance => "balance",
            LedgerField::Pending => "pending",
        }
    }
}

/// Every way value may enter, leave or move within an account.
///
/// Internal moves keep `balance + pending` constant. Debits lower it by exactly
/// the amount and credits raise it by exactly the amount.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LedgerMove {
    CreditBalance(Amount),
    CreditPending(Amount),
    BalanceToPending(Amount),
    PendingToBalance(Amount),
    DebitBalance(Amount),
    DebitPending(Amount),
}

impl LedgerMove {
    pub fn amount(self) -> Amount {
        match self {
            LedgerMove::CreditBalance(amount)
            | LedgerMove::CreditPending(amount)
            | LedgerMove::BalanceToPending(amount)
            | LedgerMove::PendingToBalance(amount)
            | LedgerMove::DebitBalance(amount)
            | LedgerMove::DebitPending(amount) => amount,
        }
    }

    /// The field that must cover the amount, if any.
    pub fn source(self) -> Option<LedgerField> {
        match self {
            LedgerMove::CreditBalance(_) | LedgerMove::CreditPending(_) => None,
            LedgerMove::BalanceToPending(_) | LedgerMove::DebitBalance(_) => {
                Some(LedgerField::Balance)
            }
            LedgerMove::PendingToBalance(_) | LedgerMove::DebitPending(_) => {
                Some(LedgerField::Pending)
            }
        }
    }

    /// Signed changes to `(balance, pending)`.
    pub fn deltas(self) -> (Amount, Amount) {
        match self {
            LedgerMove::CreditBalance(amount) => (amount, 0),
            LedgerMove::CreditPending(amount) => (0, amount),
            LedgerMove::BalanceToPending(amount) => (-amount, amount),
            LedgerMove::PendingToBalance(amount) => (amount, -amount),
            LedgerMove::DebitBalance(amount) => (-amount, 0),
            LedgerMove::DebitPending(amount) => (0, -amount),
        }
    }

    pub fn apply(self, balance: Amount, pending: Amount) -> Option<(Amount, Amount)> {
        if self.amount() <= 0 {
            return None;
        }

        let (balance_delta, pending_delta) = self.deltas();
        let balance = balance.checked_add(balance_delta)?;
        let pending = pending.checked_add(pending_delta)?;
        if balance < 0 || pending < 0 {
            return None;
        }

        Some((balance, pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_moves_conserve_total() {
        let moves = [
            LedgerMove::BalanceToPending(300),
            LedgerMove::PendingToBalance(200),
        ];

        for ledger_move in moves {
            let (balance, pending) = ledger_move.apply(1000, 500).unwrap();
            assert_eq!(balance + pending, 1500, "{:?}", ledger_move);
        }
    }

    #[test]
    fn debits_lower_total_by_exact_amount() {
        assert_eq!(LedgerMove::DebitBalance(400).apply(5000, 0), Some((4600, 0)));
        assert_eq!(LedgerMove::DebitPending(400).apply(0, 500), Some((0, 100)));
    }

    #[test]
    fn moves_never_go_negative() {
        assert_eq!(LedgerMove::DebitBalance(6000).apply(5000, 10_000), None);
        assert_eq!(LedgerMove::BalanceToPending(1).apply(0, 0), None);
        assert_eq!(LedgerMove::PendingToBalance(501).apply(0, 500), None);
    }

    #[test]
    fn non_positive_amounts_are_refused() {
        assert_eq!(LedgerMove::CreditBalance(0).apply(0, 0), None);
        assert_eq!(LedgerMove::DebitBalance(-10).apply(0, 0), None);
    }

    #[test]
    fn account_apply_leaves_state_on_failure() {
        let now = Utc::now();
        let mut account = Account::new(UserId::new(), Role::Driver, now);
        account.balance = 100;

        assert!(!account.apply(LedgerMove::DebitBalance(101), now));
        assert_eq!(account.balance, 100);
        assert!(account.apply(LedgerMove::DebitBalance(100), now));
        assert_eq!(account.balance, 0);
    }
}
