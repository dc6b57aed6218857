//! Admission control and settlement.
//!
//! A request is admitted by [`QuotaLedger::check_and_reserve`], which holds
//! its estimated cost as an in-memory reservation. The reservation is either
//! settled once the provider has answered or dropped, in which case the
//! hold is released and nothing else changes.

use super::rate_limiter::{RatePolicy, RateWindow};
use super::store::LedgerStore;
use super::{CredentialSource, UsageRecord, UsageSummary};
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::Denial;
use crate::providers::ProviderKind;
use crate::strategy::ProcessingStrategy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    pub starting_grant: u64,
    pub rate: RatePolicy,
}

impl From<&LedgerConfig> for LedgerSettings {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            starting_grant: config.starting_grant,
            rate: RatePolicy::new(config.rate_limit_per_window, config.rate_window_secs),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

/// In-memory state of one tenant.
#[derive(Debug, Default)]
struct TenantSlot {
    reserved: u64,
    window: RateWindow,
}

type SharedSlot = Arc<Mutex<TenantSlot>>;

/// Outcome of admission control.
#[derive(Debug)]
pub enum Admission {
    Allow(Reservation),
    Deny(Denial),
}

/// Blocks held for one admitted, unsettled request.
///
/// Dropping a reservation releases the hold without billing.
pub struct Reservation {
    tenant_id: String,
    strategy: ProcessingStrategy,
    held: u64,
    slot: SharedSlot,
}

impl Reservation {
    pub fn held_blocks(&self) -> u64 {
        self.held
    }

    fn release(&mut self, slot: &mut TenantSlot) {
        slot.reserved = slot.reserved.saturating_sub(self.held);
        self.held = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.held > 0 {
            let slot = Arc::clone(&self.slot);
            let mut guard = slot.lock();
            self.release(&mut guard);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("tenant_id", &self.tenant_id)
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

/// Result of settling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub blocks_deducted: u64,
    pub remaining_balance: u64,
    pub record: UsageRecord,
}

pub struct QuotaLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    settings: LedgerSettings,
    tenants: Mutex<HashMap<String, SharedSlot>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, settings: LedgerSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Current time on the ledger's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn slot(&self, tenant_id: &str) -> SharedSlot {
        let mut tenants = self.tenants.lock();
        Arc::clone(tenants.entry(tenant_id.to_string()).or_default())
    }

    /// Stored balance, or the starting grant for a tenant never persisted.
    fn stored_or_initial(&self, tenant_id: &str) -> Result<u64> {
        Ok(self
            .store
            .balance(tenant_id)?
            .unwrap_or(self.settings.starting_grant))
    }

    /// Admission control. Mutates nothing on `Deny`.
    pub fn check_and_reserve(
        &self,
        tenant_id: &str,
        strategy: &ProcessingStrategy,
        estimated_units: u64,
    ) -> Result<Admission> {
        let slot = self.slot(tenant_id);

        if strategy.is_unlimited {
            return Ok(Admission::Allow(Reservation {
                tenant_id: tenant_id.to_string(),
                strategy: *strategy,
                held: 0,
                slot,
            }));
        }

        let estimate = strategy.estimate_blocks(estimated_units);
        let now = self.clock.now();
        let mut guard = slot.lock();

        let balance = self.stored_or_initial(tenant_id)?;
        let available = balance.saturating_sub(guard.reserved);
        if available < estimate {
            tracing::warn!(
                tenant = tenant_id,
                required = estimate,
                available,
                "admission denied: insufficient balance"
            );
            return Ok(Admission::Deny(Denial::InsufficientBalance {
                required: estimate,
                available,
            }));
        }

        let rate_remaining = match guard.window.check(&self.settings.rate, now) {
            Ok(remaining) => remaining,
            Err(info) => {
                tracing::warn!(
                    tenant = tenant_id,
                    retry_after_secs = info.retry_after_secs,
                    "admission denied: rate limited"
                );
                return Ok(Admission::Deny(Denial::RateLimited(info)));
            }
        };

        guard.window.record(&self.settings.rate, now);
        guard.reserved = guard.reserved.saturating_add(estimate);
        drop(guard);

        tracing::debug!(
            tenant = tenant_id,
            held = estimate,
            rate_remaining,
            "admission granted"
        );
        Ok(Admission::Allow(Reservation {
            tenant_id: tenant_id.to_string(),
            strategy: *strategy,
            held: estimate,
            slot,
        }))
    }

    /// Bill a request that the provider answered. Consumes the reservation.
    pub fn settle(
        &self,
        mut reservation: Reservation,
        model_id: &str,
        provider: ProviderKind,
        credential_source: CredentialSource,
        units_consumed: u64,
    ) -> Result<Settlement> {
        let slot = Arc::clone(&reservation.slot);
        let mut guard = slot.lock();
        reservation.release(&mut guard);

        let tenant_id = reservation.tenant_id.as_str();
        let current = self.stored_or_initial(tenant_id)?;
        let owed = reservation.strategy.blocks_for(units_consumed);
        let blocks_deducted = owed.min(current);
        let remaining_balance = current - blocks_deducted;

        let record = UsageRecord {
            tenant_id: tenant_id.to_string(),
            model_id: model_id.to_string(),
            units_consumed,
            blocks_deducted,
            credential_source,
            provider,
            timestamp: self.clock.now(),
        };
        self.store
            .apply_settlement(tenant_id, remaining_balance, &record)?;
        drop(guard);

        tracing::info!(
            tenant = tenant_id,
            model = model_id,
            provider = %provider,
            source = credential_source.as_str(),
            units = units_consumed,
            blocks = blocks_deducted,
            remaining = remaining_balance,
            "settled"
        );
        Ok(Settlement {
            blocks_deducted,
            remaining_balance,
            record,
        })
    }

    /// Admin credit. Returns the new balance.
    pub fn grant_blocks(&self, tenant_id: &str, amount: u64) -> Result<u64> {
        let slot = self.slot(tenant_id);
        let _guard = slot.lock();
        let balance = self
            .stored_or_initial(tenant_id)?
            .saturating_add(amount);
        self.store.set_balance(tenant_id, balance)?;
        tracing::info!(tenant = tenant_id, amount, balance, "blocks granted");
        Ok(balance)
    }

    pub fn balance(&self, tenant_id: &str) -> Result<u64> {
        self.stored_or_initial(tenant_id)
    }

    /// Blocks currently held by in-flight requests.
    pub fn reserved(&self, tenant_id: &str) -> u64 {
        let slot = self.tenants.lock().get(tenant_id).cloned();
        slot.map_or(0, |s| s.lock().reserved)
    }

    pub fn usage(&self, tenant_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        self.store.recent_usage(tenant_id, limit)
    }

    pub fn usage_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<UsageSummary> {
        self.store.summary(from, to)
    }

    /// Forget tenants with no in-flight reservation and an idle rate window.
    /// Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let policy = self.settings.rate;
        let mut tenants = self.tenants.lock();
        let before = tenants.len();
        tenants.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let state = slot.lock();
            state.reserved > 0 || !state.window.is_idle(&policy, now)
        });
        before - tenants.len()
    }

    pub fn tracked_tenants(&self) -> usize {
        self.tenants.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MemoryLedgerStore;
    use crate::clock::ManualClock;
    use crate::registry::{ContentType, ModelGroup};
    use crate::strategy::{strategy_for_group, PricingTable};

    fn strategy(group: ModelGroup, byok: bool) -> ProcessingStrategy {
        strategy_for_group(group, byok, ContentType::Text, &PricingTable::default())
    }

    fn ledger_with(settings: LedgerSettings) -> (QuotaLedger, ManualClock) {
        let clock = ManualClock::default();
        let ledger = QuotaLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(clock.clone()),
            settings,
        );
        (ledger, clock)
    }

    fn ledger() -> QuotaLedger {
        ledger_with(LedgerSettings::default()).0
    }

    fn allow(admission: Admission) -> Reservation {
        match admission {
            Admission::Allow(r) => r,
            Admission::Deny(d) => panic!("expected allow, got {d}"),
        }
    }

    fn deny(admission: Admission) -> Denial {
        match admission {
            Admission::Allow(r) => panic!("expected deny, got {r:?}"),
            Admission::Deny(d) => d,
        }
    }

    #[test]
    fn heavy_requests_drain_ten_blocks_in_pairs() {
        let ledger = ledger();
        let heavy = strategy(ModelGroup::Heavy, false);
        let mut balances = Vec::new();
        for _ in 0..5 {
            let r = allow(ledger.check_and_reserve("u1", &heavy, 100).unwrap());
            let s = ledger
                .settle(r, "gpt-4.1", ProviderKind::OpenAi, CredentialSource::Vault, 100)
                .unwrap();
            balances.push(s.remaining_balance);
        }
        assert_eq!(balances, vec![8, 6, 4, 2, 0]);

        let denial = deny(ledger.check_and_reserve("u1", &heavy, 100).unwrap());
        assert_eq!(denial.reason(), "insufficient balance");
        assert_eq!(ledger.usage("u1", 100).unwrap().len(), 5);
    }

    #[test]
    fn unlimited_bypasses_balance_and_rate_checks() {
        let (ledger, _) = ledger_with(LedgerSettings {
            starting_grant: 0,
            rate: RatePolicy::new(1, 3600),
        });
        let fast_byok = strategy(ModelGroup::Fast, true);
        for _ in 0..10 {
            let r = allow(ledger.check_and_reserve("u1", &fast_byok, 50_000).unwrap());
            let s = ledger
                .settle(r, "gpt-4o-mini", ProviderKind::OpenAi, CredentialSource::Caller, 50_000)
                .unwrap();
            assert_eq!(s.blocks_deducted, 0);
            assert_eq!(s.remaining_balance, 0);
        }
    }

    #[test]
    fn fast_metered_deducts_per_thousand_units() {
        let ledger = ledger();
        let fast = strategy(ModelGroup::Fast, false);
        let r = allow(ledger.check_and_reserve("u1", &fast, 2500).unwrap());
        assert_eq!(r.held_blocks(), 3);
        let s = ledger
            .settle(r, "gpt-4o-mini", ProviderKind::OpenAi, CredentialSource::Vault, 1200)
            .unwrap();
        assert_eq!(s.blocks_deducted, 2);
        assert_eq!(s.remaining_balance, 8);
        assert_eq!(s.record.units_consumed, 1200);
    }

    #[test]
    fn settlement_floors_at_zero_and_records_actual_deduction() {
        let (ledger, _) = ledger_with(LedgerSettings {
            starting_grant: 3,
            rate: RatePolicy::new(0, 60),
        });
        let fast = strategy(ModelGroup::Fast, false);
        let r = allow(ledger.check_and_reserve("u1", &fast, 1000).unwrap());
        let s = ledger
            .settle(r, "gpt-4o-mini", ProviderKind::OpenAi, CredentialSource::Vault, 9000)
            .unwrap();
        assert_eq!(s.remaining_balance, 0);
        assert_eq!(s.blocks_deducted, 3);
        assert_eq!(ledger.balance("u1").unwrap(), 0);
    }

    #[test]
    fn reservations_block_overcommit_until_released() {
        let (ledger, _) = ledger_with(LedgerSettings {
            starting_grant: 2,
            rate: RatePolicy::new(0, 60),
        });
        let heavy = strategy(ModelGroup::Heavy, false);

        let first = allow(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
        assert_eq!(ledger.reserved("u1"), 2);
        let denial = deny(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
        assert_eq!(
            denial,
            Denial::InsufficientBalance {
                required: 2,
                available: 0
            }
        );

        drop(first);
        assert_eq!(ledger.reserved("u1"), 0);
        assert_eq!(ledger.balance("u1").unwrap(), 2);
        allow(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
    }

    #[test]
    fn dropped_reservation_leaves_no_trace() {
        let ledger = ledger();
        let heavy = strategy(ModelGroup::Heavy, false);
        let r = allow(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
        drop(r);
        assert_eq!(ledger.balance("u1").unwrap(), 10);
        assert!(ledger.usage("u1", 10).unwrap().is_empty());
    }

    #[test]
    fn rate_limit_denies_with_metadata_and_recovers() {
        let (ledger, clock) = ledger_with(LedgerSettings {
            starting_grant: 100,
            rate: RatePolicy::new(2, 60),
        });
        let specialty = strategy(ModelGroup::Specialty, false);
        for _ in 0..2 {
            let r = allow(ledger.check_and_reserve("u1", &specialty, 0).unwrap());
            ledger
                .settle(r, "dall-e-3", ProviderKind::OpenAi, CredentialSource::Vault, 1)
                .unwrap();
        }

        let denial = deny(ledger.check_and_reserve("u1", &specialty, 0).unwrap());
        let info = denial.rate_limit().cloned().unwrap();
        assert_eq!(info.limit, 2);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.retry_after_secs, 60);
        assert_eq!(ledger.reserved("u1"), 0);

        clock.advance(chrono::Duration::seconds(61));
        allow(ledger.check_and_reserve("u1", &specialty, 0).unwrap());
    }

    #[test]
    fn denial_mutates_nothing() {
        let (ledger, _) = ledger_with(LedgerSettings {
            starting_grant: 1,
            rate: RatePolicy::new(5, 60),
        });
        let heavy = strategy(ModelGroup::Heavy, false);
        deny(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
        assert_eq!(ledger.reserved("u1"), 0);
        assert_eq!(ledger.balance("u1").unwrap(), 1);
        assert!(ledger.usage("u1", 10).unwrap().is_empty());

        let specialty = strategy(ModelGroup::Specialty, false);
        let r = allow(ledger.check_and_reserve("u1", &specialty, 0).unwrap());
        drop(r);
    }

    #[test]
    fn grant_is_the_only_way_up() {
        let ledger = ledger();
        assert_eq!(ledger.grant_blocks("u1", 5).unwrap(), 15);
        assert_eq!(ledger.balance("u1").unwrap(), 15);
        assert_eq!(ledger.balance("someone-new").unwrap(), 10);
    }

    #[test]
    fn concurrent_admissions_cannot_overcommit() {
        let (ledger, _) = ledger_with(LedgerSettings {
            starting_grant: 2,
            rate: RatePolicy::new(0, 60),
        });
        let ledger = Arc::new(ledger);
        let heavy = strategy(ModelGroup::Heavy, false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.check_and_reserve("u1", &heavy, 0).unwrap())
            })
            .collect();
        let outcomes: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted = outcomes
            .iter()
            .filter(|a| matches!(a, Admission::Allow(_)))
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn prune_idle_keeps_tenants_with_live_reservations() {
        let (ledger, clock) = ledger_with(LedgerSettings {
            starting_grant: 10,
            rate: RatePolicy::new(10, 60),
        });
        let heavy = strategy(ModelGroup::Heavy, false);
        let held = allow(ledger.check_and_reserve("busy", &heavy, 0).unwrap());
        let done = allow(ledger.check_and_reserve("idle", &heavy, 0).unwrap());
        drop(done);

        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(ledger.prune_idle(), 1);
        assert_eq!(ledger.tracked_tenants(), 1);
        drop(held);
    }

    #[test]
    fn usage_summary_totals_by_provider() {
        let ledger = ledger();
        let heavy = strategy(ModelGroup::Heavy, false);
        for provider in [ProviderKind::OpenAi, ProviderKind::Anthropic] {
            let r = allow(ledger.check_and_reserve("u1", &heavy, 0).unwrap());
            ledger
                .settle(r, "m", provider, CredentialSource::Vault, 40)
                .unwrap();
        }
        let now = Utc::now();
        let summary = ledger
            .usage_summary(now - chrono::Duration::days(1), now + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(summary.request_count, 2);
        assert_eq!(summary.total_blocks, 4);
        assert_eq!(summary.total_units, 80);
        assert_eq!(summary.by_provider.len(), 2);
    }
}
