//! Feature settlement handlers.
//!
//! Each handler applies one feature mutation against the ledger state and is
//! called exclusively from inside a [`Store::transaction`] closure after
//! policy verification has passed. Handlers are synchronous and touch no
//! network.
//!
//! [`Store::transaction`]: crate::store::Store

use crate::{
    error::SettleError,
    intent::RecipientRef,
    store::{
        IdentityClaimRow, InvoiceRecord, InvoiceStatus, LedgerState, PaymentRecord, SwapRecord,
        YieldActionRecord,
    },
};
use envelop_common::field::hash_to_field;

/// Usernames are lowercase, 3 to 64 characters from `[a-z0-9._-]`.
pub(crate) fn validate_username(username: &str) -> bool {
    (3..=64).contains(&username.len())
        && username
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
}

/// Resolves a recipient reference to `(user_id, wallet_address)`.
///
/// The on-chain claim index is preferred; the legacy phone table and raw
/// user addresses are only consulted when `require_onchain` is off.
pub(crate) fn resolve_recipient(
    state: &LedgerState,
    recipient: &RecipientRef,
    require_onchain: bool,
) -> Result<(Option<u64>, String), SettleError> {
    match recipient {
        RecipientRef::Username(username) => {
            let claim = state
                .identity_claims
                .get(username)
                .ok_or(SettleError::RecipientUnresolved)?;
            let user_id = state.user_by_wallet(&claim.wallet_address).map(|u| u.user_id);
            Ok((user_id, claim.wallet_address.clone()))
        }
        RecipientRef::Phone(phone) => {
            if require_onchain {
                return Err(SettleError::RecipientUnresolved);
            }
            let user = state.user_by_phone(phone).ok_or(SettleError::RecipientUnresolved)?;
            Ok((Some(user.user_id), user.wallet_address.clone()))
        }
        RecipientRef::Address(address) => {
            if let Some(claim) =
                state.identity_claims.values().find(|c| &c.wallet_address == address)
            {
                let user_id = state.user_by_wallet(&claim.wallet_address).map(|u| u.user_id);
                return Ok((user_id, address.clone()));
            }
            if require_onchain {
                return Err(SettleError::RecipientUnresolved);
            }
            let user = state.user_by_wallet(address).ok_or(SettleError::RecipientUnresolved)?;
            Ok((Some(user.user_id), address.clone()))
        }
    }
}

/// Moves `amount` of `token` between cached balances. Only called in
/// backend-simulated ledger mode.
fn move_balance(
    state: &mut LedgerState,
    from: u64,
    to: Option<u64>,
    token: &str,
    amount: u64,
) -> Result<(), SettleError> {
    let debit_key = (from, token.to_owned());
    let held = state.balances.get(&debit_key).copied().unwrap_or(0);
    let remaining =
        held.checked_sub(amount).ok_or(SettleError::Conflict("insufficient balance"))?;
    state.balances.insert(debit_key, remaining);

    if let Some(to) = to {
        let credit = state.balances.entry((to, token.to_owned())).or_insert(0);
        *credit = credit.saturating_add(amount);
    }
    Ok(())
}

pub(crate) fn apply_swap(
    state: &mut LedgerState,
    owner_user_id: u64,
    quote_id: &str,
    tx_id: &str,
    now: u64,
    onchain_ledger: bool,
) -> Result<SwapRecord, SettleError> {
    let quote = state.swap_quotes.get(quote_id).ok_or(SettleError::NotFound("quote"))?.clone();

    if quote.owner_user_id != owner_user_id {
        return Err(SettleError::Forbidden("quote belongs to a different user"));
    }
    if quote.expires_at <= now {
        return Err(SettleError::Conflict("quote has expired"));
    }
    if state.swaps.iter().any(|swap| swap.quote_id == quote_id) {
        return Err(SettleError::Conflict("quote has already been settled"));
    }

    if !onchain_ledger {
        move_balance(state, owner_user_id, None, &quote.token_in, quote.amount_in_atomic)?;
        let credit = state
            .balances
            .entry((owner_user_id, quote.token_out.clone()))
            .or_insert(0);
        *credit = credit.saturating_add(quote.amount_out_atomic);
    }

    let record = SwapRecord {
        swap_id: state.swaps.len() as u64 + 1,
        quote_id: quote.quote_id,
        owner_user_id,
        token_in: quote.token_in,
        token_out: quote.token_out,
        amount_in_atomic: quote.amount_in_atomic,
        amount_out_atomic: quote.amount_out_atomic,
        aleo_tx_id: tx_id.to_owned(),
        created_at: now,
    };
    state.swaps.push(record.clone());
    Ok(record)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_payment(
    state: &mut LedgerState,
    sender_user_id: u64,
    recipient: &RecipientRef,
    token: &str,
    amount_atomic: u64,
    memo: Option<&str>,
    tx_id: &str,
    now: u64,
    onchain_ledger: bool,
    require_onchain: bool,
) -> Result<PaymentRecord, SettleError> {
    let (recipient_user_id, recipient_address) =
        resolve_recipient(state, recipient, require_onchain)?;

    if !onchain_ledger {
        move_balance(state, sender_user_id, recipient_user_id, token, amount_atomic)?;
    }

    let record = PaymentRecord {
        payment_id: state.payments.len() as u64 + 1,
        sender_user_id,
        recipient_user_id,
        recipient_address,
        token: token.to_owned(),
        amount_atomic,
        invoice_id: None,
        memo_hash: memo.map(hash_to_field),
        aleo_tx_id: tx_id.to_owned(),
        created_at: now,
    };
    state.payments.push(record.clone());
    Ok(record)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_invoice_create(
    state: &mut LedgerState,
    creator_user_id: u64,
    invoice_id: &str,
    token: &str,
    amount_atomic: u64,
    payer: Option<&RecipientRef>,
    memo: Option<&str>,
    tx_id: &str,
    now: u64,
    require_onchain: bool,
) -> Result<InvoiceRecord, SettleError> {
    if state.invoices.contains_key(invoice_id) {
        return Err(SettleError::Conflict("invoice id already exists"));
    }

    let payer_user_id = match payer {
        Some(reference) => {
            let (user_id, _) = resolve_recipient(state, reference, require_onchain)?;
            // A payer lock only makes sense against a known user row.
            Some(user_id.ok_or(SettleError::RecipientUnresolved)?)
        }
        None => None,
    };

    let record = InvoiceRecord {
        invoice_id: invoice_id.to_owned(),
        creator_user_id,
        token: token.to_owned(),
        amount_atomic,
        payer_user_id,
        memo_hash: memo.map(hash_to_field),
        status: InvoiceStatus::Open,
        create_tx_id: tx_id.to_owned(),
        paid_tx_id: None,
        created_at: now,
    };
    state.invoices.insert(invoice_id.to_owned(), record.clone());
    Ok(record)
}

pub(crate) fn apply_invoice_pay(
    state: &mut LedgerState,
    payer_user_id: u64,
    invoice_id: &str,
    tx_id: &str,
    now: u64,
    onchain_ledger: bool,
) -> Result<InvoiceRecord, SettleError> {
    let invoice =
        state.invoices.get(invoice_id).ok_or(SettleError::NotFound("invoice"))?.clone();

    if invoice.status != InvoiceStatus::Open {
        return Err(SettleError::Conflict("invoice is not open"));
    }
    if invoice.payer_user_id.is_some_and(|locked| locked != payer_user_id) {
        return Err(SettleError::Forbidden("invoice is locked to a different payer"));
    }

    let creator = state
        .users
        .get(&invoice.creator_user_id)
        .ok_or(SettleError::NotFound("invoice creator"))?;
    let recipient_address = creator.wallet_address.clone();

    if !onchain_ledger {
        move_balance(
            state,
            payer_user_id,
            Some(invoice.creator_user_id),
            &invoice.token,
            invoice.amount_atomic,
        )?;
    }

    let payment = PaymentRecord {
        payment_id: state.payments.len() as u64 + 1,
        sender_user_id: payer_user_id,
        recipient_user_id: Some(invoice.creator_user_id),
        recipient_address,
        token: invoice.token.clone(),
        amount_atomic: invoice.amount_atomic,
        invoice_id: Some(invoice_id.to_owned()),
        memo_hash: None,
        aleo_tx_id: tx_id.to_owned(),
        created_at: now,
    };
    state.payments.push(payment);

    let invoice = state.invoices.get_mut(invoice_id).expect("invoice presence checked");
    invoice.status = InvoiceStatus::Paid;
    invoice.paid_tx_id = Some(tx_id.to_owned());
    Ok(invoice.clone())
}

pub(crate) fn apply_yield_action(
    state: &mut LedgerState,
    owner_user_id: u64,
    yield_quote_id: &str,
    steps: Vec<(String, String, String)>,
    now: u64,
) -> Result<YieldActionRecord, SettleError> {
    let final_tx_id = steps
        .last()
        .map(|(_, _, tx_id)| tx_id.clone())
        .ok_or_else(|| SettleError::InvalidArgument("yield plan has no steps".to_owned()))?;

    let record = YieldActionRecord {
        action_id: state.yield_actions.len() as u64 + 1,
        yield_quote_id: yield_quote_id.to_owned(),
        owner_user_id,
        steps,
        final_tx_id,
        created_at: now,
    };
    state.yield_actions.push(record.clone());
    Ok(record)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_identity_claim(
    state: &mut LedgerState,
    owner_user_id: u64,
    username: &str,
    display_name: &str,
    tx_id: &str,
    program_id: &str,
    function_name: &str,
    now: u64,
) -> Result<IdentityClaimRow, SettleError> {
    let user = state.users.get(&owner_user_id).ok_or(SettleError::NotFound("user"))?;
    let wallet_address = user.wallet_address.clone();

    if let Some(existing) = state.identity_claims.get(username) {
        if existing.wallet_address != wallet_address {
            return Err(SettleError::Conflict("username is already claimed"));
        }
    }

    if let Some(current) = user.username.as_deref() {
        if current != username {
            return Err(SettleError::Conflict("account already has a username"));
        }
        // Re-claim of the same name: refresh the claim row only if it went
        // missing; the user row keeps its original claim tx.
        if let Some(existing) = state.identity_claims.get(username) {
            return Ok(existing.clone());
        }
    }

    let row = IdentityClaimRow {
        username: username.to_owned(),
        username_hash: hash_to_field(username),
        display_name_hash: hash_to_field(display_name),
        wallet_address,
        claim_tx_id: tx_id.to_owned(),
        program_id: program_id.to_owned(),
        function_name: function_name.to_owned(),
        claimed_at: now,
    };
    state.identity_claims.insert(username.to_owned(), row.clone());

    let user = state.users.get_mut(&owner_user_id).expect("user presence checked");
    user.username = Some(username.to_owned());
    user.display_name = Some(display_name.to_owned());
    user.username_claim_tx_id = Some(tx_id.to_owned());
    Ok(row)
}
