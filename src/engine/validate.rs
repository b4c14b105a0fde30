use super::MutationError;
use crate::Amount;
use crate::model::{Account, TxKind};

/// Balance `account` would have after applying `kind` of `amount`.
///
/// - amount must be strictly positive
/// - a withdrawal may not exceed the current balance
/// - the result must fit the fixed-point range
pub(crate) fn next_balance(
    account: &Account,
    kind: TxKind,
    amount: Amount,
) -> Result<Amount, MutationError> {
    if !amount.is_positive() {
        return Err(MutationError::InvalidAmount(amount));
    }

    let overflow = || MutationError::Overflow {
        account: account.id,
        amount,
    };

    match kind {
        TxKind::Deposit => account.balance.checked_add(amount).ok_or_else(overflow),
        TxKind::Withdraw => {
            if amount > account.balance {
                return Err(MutationError::InsufficientFunds {
                    account: account.id,
                    balance: account.balance,
                    requested: amount,
                });
            }
            account.balance.checked_sub(amount).ok_or_else(overflow)
        }
    }
}
