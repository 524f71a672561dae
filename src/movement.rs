//! Planning the outputs of a transfer from selected records.
//!
//! Selection only reserves inputs. Turning them into a move means paying each
//! recipient from the selected records and returning what is left to a change
//! holder, keeping amounts of different issuers apart.

use serde::{Deserialize, Serialize};
use token_core::error::SelectionError;
use token_core::holder::Holder;
use token_core::objects::{total_quantity, Amount, IssuedTokenType, TokenRecord, TokenType};

/// An amount owed to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub recipient: Holder,
    pub amount: Amount<TokenType>,
}

impl Payment {
    pub fn new(recipient: Holder, amount: Amount<TokenType>) -> Self {
        Self { recipient, amount }
    }
}

/// A record to be produced by a move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutput {
    pub holder: Holder,
    pub amount: Amount<IssuedTokenType>,
}

/// Inputs consumed and outputs produced by a move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePlan {
    pub inputs: Vec<TokenRecord>,
    pub outputs: Vec<TokenOutput>,
}

/// The single amount that covers every payment
pub fn total_required(payments: &[Payment]) -> Result<Amount<TokenType>, SelectionError> {
    let Some(first) = payments.first() else {
        return Err(SelectionError::InvalidMove("no payments given".to_string()));
    };

    let mut quantity = 0u64;
    for payment in payments {
        if payment.amount.token != first.amount.token {
            return Err(SelectionError::InvalidMove(format!(
                "payments mix token types {} and {}",
                first.amount.token, payment.amount.token
            )));
        }
        quantity = quantity
            .checked_add(payment.amount.quantity)
            .ok_or(SelectionError::AmountOverflow)?;
    }
    Ok(Amount::new(quantity, first.amount.token.clone()))
}

/// Split `inputs` into one output per payment portion plus change outputs.
///
/// Inputs are grouped by issued token type in the order they appear. Each
/// payment is drawn from the most recently seen group first, so a payment
/// can be split over several issuers. Any remainder of a group becomes a
/// change output to `change_holder`.
pub fn plan_move(
    inputs: Vec<TokenRecord>,
    payments: &[Payment],
    change_holder: &Holder,
) -> Result<MovePlan, SelectionError> {
    let required = total_required(payments)?;

    let mut groups: Vec<(IssuedTokenType, u64)> = Vec::new();
    for record in &inputs {
        if !record.matches_token_type(&required.token) {
            return Err(SelectionError::InvalidMove(format!(
                "input {} holds {}, expected {}",
                record.id, record.token_type, required.token
            )));
        }
        let issued = record.issued_token_type();
        match groups.iter_mut().find(|(token, _)| *token == issued) {
            Some((_, remaining)) => {
                *remaining = remaining
                    .checked_add(record.quantity)
                    .ok_or(SelectionError::AmountOverflow)?
            }
            None => groups.push((issued, record.quantity)),
        }
    }

    let mut outputs = Vec::new();
    for payment in payments {
        let mut owed = payment.amount.quantity;
        while owed > 0 {
            let Some((token, remaining)) = groups.iter_mut().rev().find(|(_, r)| *r > 0) else {
                return Err(SelectionError::InvalidMove(format!(
                    "selected inputs do not cover {}",
                    required
                )));
            };
            let portion = owed.min(*remaining);
            *remaining -= portion;
            owed -= portion;
            outputs.push(TokenOutput {
                holder: payment.recipient.clone(),
                amount: Amount::new(portion, token.clone()),
            });
        }
    }

    for (token, remaining) in groups {
        if remaining > 0 {
            outputs.push(TokenOutput {
                holder: change_holder.clone(),
                amount: Amount::new(remaining, token),
            });
        }
    }

    Ok(MovePlan { inputs, outputs })
}

/// Change left after taking `exit_amount` out of `inputs`, which must all
/// carry the exit's issued token type.
///
/// # Returns
/// The change output, or `None` if the inputs match the exit exactly
pub fn generate_exit(
    inputs: &[TokenRecord],
    exit_amount: &Amount<IssuedTokenType>,
    change_holder: &Holder,
) -> Result<Option<TokenOutput>, SelectionError> {
    if let Some(record) = inputs
        .iter()
        .find(|r| r.issued_token_type() != exit_amount.token)
    {
        return Err(SelectionError::InvalidMove(format!(
            "exit of {} cannot consume {} of {}",
            exit_amount.token,
            record.id,
            record.issued_token_type()
        )));
    }

    let total = total_quantity(inputs)?;
    let change = total.checked_sub(exit_amount.quantity).ok_or_else(|| {
        SelectionError::InvalidMove(format!(
            "inputs hold {} but the exit needs {}",
            total, exit_amount.quantity
        ))
    })?;

    Ok((change > 0).then(|| TokenOutput {
        holder: change_holder.clone(),
        amount: Amount::new(change, exit_amount.token.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use token_core::id::{IdentityKey, RecordId};

    fn gbp() -> TokenType {
        TokenType::new("FiatCurrency", "GBP", 2)
    }

    fn record(owner: IdentityKey, issuer: IdentityKey, quantity: u64) -> TokenRecord {
        TokenRecord::new(RecordId::unique_for_tests(), owner, issuer, gbp(), quantity).unwrap()
    }

    #[test]
    fn test_total_required() {
        let alice = Holder::KeyIdentity(IdentityKey::unique_for_tests());
        let bob = Holder::KeyIdentity(IdentityKey::unique_for_tests());
        let payments = vec![
            Payment::new(alice.clone(), Amount::new(30, gbp())),
            Payment::new(bob, Amount::new(20, gbp())),
        ];
        assert_eq!(total_required(&payments).unwrap(), Amount::new(50, gbp()));

        let mixed = vec![
            Payment::new(alice.clone(), Amount::new(30, gbp())),
            Payment::new(alice, Amount::new(1, TokenType::new("FiatCurrency", "USD", 2))),
        ];
        assert!(matches!(total_required(&mixed), Err(SelectionError::InvalidMove(_))));
        assert!(matches!(total_required(&[]), Err(SelectionError::InvalidMove(_))));
    }

    #[test]
    fn test_plan_move_with_change() {
        let owner = IdentityKey::unique_for_tests();
        let issuer = IdentityKey::unique_for_tests();
        let recipient = Holder::KeyIdentity(IdentityKey::unique_for_tests());
        let change = Holder::KeyIdentity(owner);
        let inputs = vec![record(owner, issuer, 100), record(owner, issuer, 50)];

        let plan = plan_move(
            inputs.clone(),
            &[Payment::new(recipient.clone(), Amount::new(120, gbp()))],
            &change,
        )
        .unwrap();

        assert_eq!(plan.inputs, inputs);
        assert_eq!(
            plan.outputs,
            vec![
                TokenOutput {
                    holder: recipient,
                    amount: Amount::new(120, gbp().issued_by(issuer)),
                },
                TokenOutput {
                    holder: change,
                    amount: Amount::new(30, gbp().issued_by(issuer)),
                },
            ]
        );
    }

    #[test]
    fn test_plan_move_splits_across_issuers() {
        let owner = IdentityKey::unique_for_tests();
        let first_issuer = IdentityKey::unique_for_tests();
        let second_issuer = IdentityKey::unique_for_tests();
        let recipient = Holder::KeyIdentity(IdentityKey::unique_for_tests());
        let change = Holder::KeyIdentity(owner);
        let inputs = vec![record(owner, first_issuer, 40), record(owner, second_issuer, 30)];

        let plan = plan_move(
            inputs,
            &[Payment::new(recipient.clone(), Amount::new(50, gbp()))],
            &change,
        )
        .unwrap();

        // Last issuer group is drawn first
        assert_eq!(plan.outputs.len(), 3);
        assert_eq!(plan.outputs[0].amount, Amount::new(30, gbp().issued_by(second_issuer)));
        assert_eq!(plan.outputs[1].amount, Amount::new(20, gbp().issued_by(first_issuer)));
        assert_eq!(plan.outputs[2].holder, change);
        assert_eq!(plan.outputs[2].amount, Amount::new(20, gbp().issued_by(first_issuer)));
    }

    #[test]
    fn test_plan_move_rejects_insufficient_inputs() {
        let owner = IdentityKey::unique_for_tests();
        let recipient = Holder::KeyIdentity(IdentityKey::unique_for_tests());
        let err = plan_move(
            vec![record(owner, owner, 10)],
            &[Payment::new(recipient, Amount::new(11, gbp()))],
            &Holder::KeyIdentity(owner),
        )
        .unwrap_err();
        assert!(matches!(err, SelectionError::InvalidMove(_)));
    }

    #[test]
    fn test_generate_exit() {
        let owner = IdentityKey::unique_for_tests();
        let issuer = IdentityKey::unique_for_tests();
        let change = Holder::KeyIdentity(owner);
        let inputs = vec![record(owner, issuer, 70), record(owner, issuer, 30)];
        let token = gbp().issued_by(issuer);

        let output = generate_exit(&inputs, &Amount::new(60, token.clone()), &change).unwrap();
        assert_eq!(
            output,
            Some(TokenOutput {
                holder: change.clone(),
                amount: Amount::new(40, token.clone()),
            })
        );
        assert_eq!(
            generate_exit(&inputs, &Amount::new(100, token.clone()), &change).unwrap(),
            None
        );
        assert!(generate_exit(&inputs, &Amount::new(101, token), &change).is_err());

        let other = gbp().issued_by(owner);
        assert!(generate_exit(&inputs, &Amount::new(10, other), &change).is_err());
    }
}
