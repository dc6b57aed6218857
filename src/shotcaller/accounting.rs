//! Post-dispatch bookkeeping: settle the ledger, then count vault usage.
//!
//! Runs only after the provider has answered and contains no suspension
//! point, so a request is either fully accounted or not at all.

use crate::billing::{CredentialSource, QuotaLedger, Reservation, Settlement};
use crate::error::ShotCallerError;
use crate::providers::ProviderKind;
use crate::vault::{CredentialLease, CredentialVault};

/// Input length in characters, roughly four per unit, at least one.
pub fn estimate_units(input: &str) -> u64 {
    let chars = input.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

/// Units to bill: what the provider reported, else the estimate.
pub fn units_consumed(reported: Option<u64>, estimated: u64) -> u64 {
    reported.unwrap_or(estimated)
}

pub(crate) struct Accounting<'a> {
    pub ledger: &'a QuotaLedger,
    pub vault: &'a CredentialVault,
}

impl Accounting<'_> {
    /// Settle first; a vault report failure after a successful settle is
    /// logged and does not fail the request.
    pub(crate) fn record(
        &self,
        reservation: Reservation,
        lease: Option<&CredentialLease>,
        model_id: &str,
        provider: ProviderKind,
        units: u64,
    ) -> Result<Settlement, ShotCallerError> {
        let source = if lease.is_some() {
            CredentialSource::Vault
        } else {
            CredentialSource::Caller
        };
        let settlement = self
            .ledger
            .settle(reservation, model_id, provider, source, units)?;

        if let Some(lease) = lease {
            if let Err(e) = self.vault.report_usage(lease, units) {
                tracing::error!(
                    provider = %provider,
                    credential = lease.credential_id(),
                    units,
                    "failed to record credential usage: {e:#}"
                );
            }
        }
        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up_and_never_hits_zero() {
        assert_eq!(estimate_units(""), 1);
        assert_eq!(estimate_units("abc"), 1);
        assert_eq!(estimate_units("abcd"), 1);
        assert_eq!(estimate_units("abcde"), 2);
        assert_eq!(estimate_units(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn estimate_counts_characters_not_bytes() {
        assert_eq!(estimate_units("가나다라"), 1);
        assert_eq!(estimate_units("가나다라마"), 2);
    }

    #[test]
    fn reported_usage_wins_over_estimate() {
        assert_eq!(units_consumed(Some(1234), 10), 1234);
        assert_eq!(units_consumed(None, 10), 10);
    }
}
