//! Declarative lock acquisition.
//!
//! Callers state *what they need* at a context — read (S), write (X), or
//! nothing (NL) — and [`LockUtil::ensure_sufficient`] figures out the least
//! permissive set of acquisitions, promotions, and escalations that gets
//! there, including the intent locks on every ancestor.

use std::sync::Arc;

use granite_error::Result;
use granite_types::Transaction;

use crate::{LockContext, LockType};

pub struct LockUtil;

impl LockUtil {
    /// Ensure `transaction` can perform actions requiring `request` at
    /// `context`. `request` must be one of NL, S, X.
    ///
    /// Does nothing when the effective lock already substitutes the
    /// request; otherwise fixes up the ancestor intents and then resolves
    /// this level:
    ///
    /// - held IX and requesting S: promote to SIX;
    /// - held intent lock: escalate, then promote if still insufficient;
    /// - held NL: plain acquire;
    /// - held S or X short of the request: promote.
    ///
    /// # Errors
    ///
    /// Propagates lock errors from the context layer.
    pub fn ensure_sufficient(
        transaction: &Arc<Transaction>,
        context: &Arc<LockContext>,
        request: LockType,
    ) -> Result<()> {
        debug_assert!(matches!(
            request,
            LockType::NL | LockType::S | LockType::X
        ));

        let effective = context.get_effective_lock_type(transaction.id());
        if LockType::substitutable(effective, request) {
            return Ok(());
        }

        ensure_ancestors(transaction, context.parent(), request.parent_lock())?;

        let explicit = context.get_explicit_lock_type(transaction.id());
        if explicit == LockType::IX && request == LockType::S {
            return context.promote(transaction, LockType::SIX);
        }
        if explicit.is_intent() {
            context.escalate(transaction)?;
            let escalated = context.get_explicit_lock_type(transaction.id());
            if !LockType::substitutable(escalated, request) {
                context.promote(transaction, request)?;
            }
            return Ok(());
        }
        if explicit == LockType::NL {
            return context.acquire(transaction, request);
        }
        context.promote(transaction, request)
    }
}

/// Walk to the root and back down, making sure every ancestor carries at
/// least `intent` (IS for reads, IX for writes): acquire it where nothing
/// is held, promote where the held lock does not substitute it.
fn ensure_ancestors(
    transaction: &Arc<Transaction>,
    context: Option<Arc<LockContext>>,
    intent: LockType,
) -> Result<()> {
    let Some(context) = context else {
        return Ok(());
    };
    ensure_ancestors(transaction, context.parent(), intent)?;

    let held = context.get_explicit_lock_type(transaction.id());
    if held == LockType::NL {
        context.acquire(transaction, intent)?;
    } else if !LockType::substitutable(held, intent) {
        context.promote(transaction, intent)?;
    }
    Ok(())
}
