//! Scan and protection ticks, and the periodic drivers that run them.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::shutdown::Shutdown;
use crate::broker::{AccountSnapshot, Broker, BrokerError, MarketClock};
use crate::config::Config;
use crate::decision::{AbortReason, DecisionRecord, ReasonCode};
use crate::market_data::MarketDataProvider;
use crate::persistence::PersistenceManager;
use crate::risk::{
    CandidatePlan, DailyRiskState, DailyStateStore, PositionProtector, PositionStateStore, ProtectionReport, RiskManager,
    SafeguardsWindow,
};
use crate::strategy::{with_timeout, Candidate, OrderExecutor, Scanner};

/// Summary of one scan tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanTickReport {
    pub cycle_id: u64,
    pub market_open: bool,
    pub trading_day: Option<NaiveDate>,
    pub abort: Option<AbortReason>,
    pub protection: Option<ProtectionReport>,
    /// Ranked candidates that passed the gates
    pub candidates: Vec<Candidate>,
    /// (symbol, broker order id)
    pub accepted: Vec<(String, String)>,
    /// Approved plans held back by a dry run or the safeguards window
    pub suppressed: Vec<CandidatePlan>,
    pub rejected: Vec<(String, ReasonCode)>,
    pub decisions: Vec<DecisionRecord>,
}

enum CandidateOutcome {
    Accepted(String),
    Rejected(ReasonCode),
}

/// Owns every collaborator and runs the two periodic ticks.
///
/// Daily risk state and position state each sit behind their own lock;
/// a driver never starts a tick before its previous one finished.
pub struct TradingEngine {
    config: Config,
    universe: Vec<String>,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn MarketDataProvider>,
    scanner: Scanner,
    risk: Mutex<RiskManager>,
    protector: Mutex<PositionProtector>,
    executor: OrderExecutor,
    safeguards: SafeguardsWindow,
    persistence: PersistenceManager,
    shutdown: Arc<Shutdown>,
    cycle: AtomicU64,
    broker_timeout: Duration,
    dry_run: bool,
}

impl TradingEngine {
    /// Wire up the engine, resuming daily risk and protection state from `persistence`.
    pub fn new(
        config: Config,
        universe: Vec<String>,
        broker: Arc<dyn Broker>,
        provider: Arc<dyn MarketDataProvider>,
        persistence: PersistenceManager,
        shutdown: Arc<Shutdown>,
    ) -> Result<Self> {
        let broker_timeout = Duration::from_secs(config.scheduler.broker_timeout_secs);
        let daily_store: Arc<dyn DailyStateStore> = Arc::new(persistence.clone());
        let position_store: Arc<dyn PositionStateStore> = Arc::new(persistence.clone());

        let risk = RiskManager::load(config.risk.clone(), &config.execution, daily_store)?;
        let protector = PositionProtector::load(&config.execution, &config.risk, position_store, broker_timeout)?;

        Ok(Self {
            scanner: Scanner::new(&config),
            safeguards: SafeguardsWindow::from_config(&config.safeguards),
            executor: OrderExecutor::new(broker_timeout),
            risk: Mutex::new(risk),
            protector: Mutex::new(protector),
            config,
            universe,
            broker,
            provider,
            persistence,
            shutdown,
            cycle: AtomicU64::new(0),
            broker_timeout,
            dry_run: false,
        })
    }

    /// Plan orders without submitting any.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    async fn market_clock(&self) -> Result<MarketClock> {
        with_timeout(self.broker_timeout, self.broker.get_clock())
            .await
            .context("Failed to read market clock")
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot> {
        with_timeout(self.broker_timeout, self.broker.get_account_snapshot())
            .await
            .context("Failed to read account snapshot")
    }

    /// One protection pass, logging rather than returning failures.
    async fn protection_pass(&self, now: DateTime<Utc>) -> Option<ProtectionReport> {
        let safeguards_active = self.safeguards.is_active(now);
        let mut protector = self.protector.lock().await;
        match protector.run(self.broker.as_ref(), safeguards_active, now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Protection pass failed: {:#}", e);
                None
            }
        }
    }

    /// Protection driver tick: skipped while the market is closed.
    #[instrument(skip(self))]
    pub async fn run_protection_tick(&self) -> Result<Option<ProtectionReport>> {
        let clock = self.market_clock().await?;
        if !clock.is_open {
            debug!("Market closed; protection tick skipped");
            return Ok(None);
        }
        Ok(self.protection_pass(Utc::now()).await)
    }

    /// Scan driver tick: market check, protection, scan, then orders in rank order.
    #[instrument(skip(self), fields(cycle_id))]
    pub async fn run_scan_tick(&self) -> Result<ScanTickReport> {
        let cycle_id = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("cycle_id", cycle_id);
        let now = Utc::now();
        let mut report = ScanTickReport {
            cycle_id,
            ..ScanTickReport::default()
        };

        if self.config.kill_switch_engaged() {
            warn!("Kill switch engaged; scan cycle aborted");
            let outcome = self
                .scanner
                .scan(cycle_id, &self.universe, self.provider.as_ref(), true, self.shutdown.flag())
                .await;
            report.abort = outcome.abort;
            report.decisions = outcome.decisions;
            self.finish_cycle(&report.decisions);
            return Ok(report);
        }

        let clock = self.market_clock().await?;
        if !clock.is_open {
            debug!(next_open = ?clock.next_open, "Market closed; scan tick skipped");
            return Ok(report);
        }
        report.market_open = true;
        let today = clock.trading_day();
        report.trading_day = Some(today);

        if self.config.scheduler.protect_in_scan_tick && !self.dry_run {
            report.protection = self.protection_pass(now).await;
        }

        let account = self.account_snapshot().await?;
        let mut risk = self.risk.lock().await;
        risk.roll_day(today)?;
        if !self.dry_run {
            let released = risk.resolve_pending(&account)?;
            if !released.is_empty() {
                let mut protector = self.protector.lock().await;
                for symbol in &released {
                    protector.forget_entry(symbol);
                }
                info!(?released, "Unresolved entries absent at broker; reservations released");
            }
        }

        let mut outcome = self
            .scanner
            .scan(cycle_id, &self.universe, self.provider.as_ref(), false, self.shutdown.flag())
            .await;
        if outcome.abort.is_some() {
            report.abort = outcome.abort;
            report.decisions = outcome.decisions;
            self.finish_cycle(&report.decisions);
            return Ok(report);
        }

        let safeguards_active = self.safeguards.is_active(now);
        if self.dry_run || !safeguards_active {
            let reason = if self.dry_run {
                ReasonCode::DryRun
            } else {
                ReasonCode::SafeguardsInactive
            };
            for (symbol, result) in risk.plan_trades(&outcome.candidates, &account, today, now) {
                let Some(record) = outcome.decision_mut(&symbol) else {
                    continue;
                };
                let checked = result.and_then(|plan| {
                    risk.validator()
                        .build_plan(&plan.symbol, plan.qty, plan.prices, today)
                        .map(|_| plan)
                });
                match checked {
                    Ok(plan) => {
                        if reason == ReasonCode::SafeguardsInactive {
                            warn!(
                                target: "safeguards",
                                %symbol,
                                qty = %plan.qty,
                                entry = %plan.prices.entry,
                                "SAFEGUARDS inactive; entry suppressed"
                            );
                        } else {
                            info!(%symbol, qty = %plan.qty, entry = %plan.prices.entry, "Dry run; entry not submitted");
                        }
                        record.suppress(reason);
                        report.suppressed.push(plan);
                    }
                    Err(code) => {
                        record.reject(code);
                        report.rejected.push((symbol, code));
                    }
                }
            }
        } else {
            let mut account = account;
            for candidate in &outcome.candidates {
                let symbol = candidate.symbol.as_str();
                let Some(record) = outcome.decisions.iter_mut().find(|d| d.symbol == symbol) else {
                    continue;
                };
                if self.shutdown.is_triggered() {
                    record.skip(ReasonCode::CycleCancelled);
                    continue;
                }

                match self.process_candidate(&mut *risk, candidate, &mut account, today, now).await? {
                    CandidateOutcome::Accepted(order_id) => {
                        record.accept(order_id.clone());
                        report.accepted.push((symbol.to_string(), order_id));
                    }
                    CandidateOutcome::Rejected(code) => {
                        record.reject(code);
                        report.rejected.push((symbol.to_string(), code));
                    }
                }
            }
        }
        drop(risk);

        report.candidates = outcome.candidates;
        report.decisions = outcome.decisions;
        self.finish_cycle(&report.decisions);

        info!(
            candidates = report.candidates.len(),
            accepted = report.accepted.len(),
            suppressed = report.suppressed.len(),
            rejected = report.rejected.len(),
            "Scan tick complete"
        );
        Ok(report)
    }

    /// Risk check, plan, submit and bookkeeping for one ranked candidate.
    ///
    /// Broker failures stay local to the candidate; only a state store
    /// failure is returned as an error.
    async fn process_candidate(
        &self,
        risk: &mut RiskManager,
        candidate: &Candidate,
        account: &mut AccountSnapshot,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<CandidateOutcome> {
        let symbol = candidate.symbol.as_str();
        let plan = match risk.evaluate(candidate, account, today) {
            Ok(plan) => plan,
            Err(code) => {
                debug!(%symbol, reason = %code, "Candidate rejected by risk");
                return Ok(CandidateOutcome::Rejected(code));
            }
        };
        let order = match risk.validator().build_plan(symbol, plan.qty, plan.prices, today) {
            Ok(order) => order,
            Err(code) => return Ok(CandidateOutcome::Rejected(code)),
        };

        let reservation = risk.record_approval(&plan, now)?;
        match self.executor.submit(self.broker.as_ref(), &order).await {
            Ok(outcome) => {
                let order_id = outcome.ack().order_id.clone();
                self.protector.lock().await.register_entry(&order);
                risk.confirm(symbol)?;
                account.apply_entry(symbol, order.qty(), order.entry_price());
                Ok(CandidateOutcome::Accepted(order_id))
            }
            Err(BrokerError::Timeout(timeout)) => {
                warn!(%symbol, ?timeout, "Bracket submission unresolved; keeping the reservation");
                self.protector.lock().await.register_entry(&order);
                Ok(CandidateOutcome::Rejected(ReasonCode::BrokerUnavailable))
            }
            Err(e) => {
                let code = if e.is_transient() {
                    ReasonCode::BrokerUnavailable
                } else {
                    ReasonCode::BrokerRejected
                };
                warn!(%symbol, error = %e, reason = %code, "Bracket submission failed");
                risk.release(&reservation)?;
                Ok(CandidateOutcome::Rejected(code))
            }
        }
    }

    fn finish_cycle(&self, decisions: &[DecisionRecord]) {
        for record in decisions {
            record.emit();
        }
        if let Err(e) = self.persistence.record_decisions(decisions) {
            error!("Failed to persist decision records: {:#}", e);
        }
    }

    /// Remaining daily budget and the counters, for status output.
    pub async fn risk_summary(&self, buying_power: Decimal) -> (DailyRiskState, Option<Decimal>) {
        let risk = self.risk.lock().await;
        (risk.state().clone(), risk.remaining_daily_budget(buying_power))
    }

    /// Run the scan driver until shutdown.
    pub async fn run_scan_driver(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scheduler.scan_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.run_scan_tick().await {
                error!("Scan tick failed: {:#}", e);
            }
        }
        info!("Scan driver stopped");
    }

    /// Run the protection driver until shutdown.
    pub async fn run_protection_driver(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.scheduler.protection_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.run_protection_tick().await {
                error!("Protection tick failed: {:#}", e);
            }
        }
        info!("Protection driver stopped");
    }

    /// Run both drivers concurrently until shutdown.
    pub async fn run(&self) {
        info!(
            symbols = self.universe.len(),
            scan_interval_secs = self.config.scheduler.scan_interval_secs,
            protection_interval_secs = self.config.scheduler.protection_interval_secs,
            dry_run = self.dry_run,
            "Engine started"
        );
        tokio::join!(self.run_scan_driver(), self.run_protection_driver());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::decision::Verdict;
    use crate::market_data::{features, FeatureSet, MarketSnapshot, MockMarketDataProvider};
    use crate::risk::ProtectionStage;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.kill_switch.file = None;
        config.scheduler.protect_in_scan_tick = true;
        config
    }

    fn provider() -> MockMarketDataProvider {
        let mut provider = MockMarketDataProvider::new();
        provider.expect_fetch_snapshot().returning(|s| {
            Ok(MarketSnapshot {
                symbol: s.to_string(),
                price: dec!(100),
                avg_volume: dec!(2000000),
                volatility: dec!(2),
                market_cap: Some(dec!(50000000000)),
                trend_positive: Some(true),
                age_secs: 0,
            })
        });
        provider.expect_fetch_alt_features().returning(|_| {
            Ok(FeatureSet::new()
                .with(features::INSIDER_BUY_COUNT, dec!(3), Some(1))
                .with(features::HOUSE_PURCHASE_COUNT, dec!(1), Some(2)))
        });
        provider
    }

    fn engine(config: Config, broker: Arc<PaperBroker>, persistence: PersistenceManager) -> TradingEngine {
        TradingEngine::new(
            config,
            vec!["AAPL".to_string()],
            broker,
            Arc::new(provider()),
            persistence,
            Arc::new(Shutdown::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_tick_submits_bracket_and_is_idempotent() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let persistence = PersistenceManager::new(":memory:").unwrap();
        let engine = engine(test_config(), broker.clone(), persistence.clone());

        let report = engine.run_scan_tick().await.unwrap();
        assert!(report.market_open);
        assert_eq!(report.accepted.len(), 1);
        assert_eq!(report.decisions[0].verdict, Verdict::Accepted);

        let state = broker.get_state().await;
        assert_eq!(state.positions["AAPL"].qty, dec!(10));

        // Second tick: the position is open, the symbol was traded today
        let report = engine.run_scan_tick().await.unwrap();
        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected, vec![("AAPL".to_string(), ReasonCode::PositionOpen)]);

        let protection = report.protection.unwrap();
        assert_eq!(protection.positions, 1);

        let (daily, _) = engine.risk_summary(dec!(10000)).await;
        assert_eq!(daily.new_positions_today, 1);
        assert_eq!(daily.spent_today_usd, dec!(1000));
        assert_eq!(persistence.latest_decisions(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_without_touching_state() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let persistence = PersistenceManager::new(":memory:").unwrap();
        let engine = engine(test_config(), broker.clone(), persistence).with_dry_run(true);

        let report = engine.run_scan_tick().await.unwrap();
        assert_eq!(report.suppressed.len(), 1);
        assert_eq!(report.suppressed[0].qty, dec!(10));
        assert_eq!(report.decisions[0].verdict, Verdict::Suppressed);
        assert_eq!(report.decisions[0].reasons, vec![ReasonCode::DryRun]);

        assert!(broker.get_state().await.orders.is_empty());
        let (daily, _) = engine.risk_summary(dec!(10000)).await;
        assert_eq!(daily.new_positions_today, 0);
    }

    #[tokio::test]
    async fn test_expired_safeguards_suppress_entries() {
        let mut config = test_config();
        config.safeguards.started_at = Some(Utc::now() - chrono::Duration::days(10));
        config.safeguards.ttl_days = 7;
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let engine = engine(config, broker.clone(), PersistenceManager::new(":memory:").unwrap());

        let report = engine.run_scan_tick().await.unwrap();
        assert!(report.accepted.is_empty());
        assert_eq!(report.decisions[0].reasons, vec![ReasonCode::SafeguardsInactive]);
        assert!(broker.get_state().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_kill_switch_and_closed_market() {
        let mut config = test_config();
        config.kill_switch.enabled = true;
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let killed = engine(config, broker.clone(), PersistenceManager::new(":memory:").unwrap());
        let report = killed.run_scan_tick().await.unwrap();
        assert_eq!(report.abort, Some(AbortReason::KillSwitch));
        assert_eq!(report.decisions[0].reasons, vec![ReasonCode::KillSwitch]);

        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        broker.set_market_open(false).await;
        let closed = engine(test_config(), broker.clone(), PersistenceManager::new(":memory:").unwrap());
        let report = closed.run_scan_tick().await.unwrap();
        assert!(!report.market_open);
        assert!(report.decisions.is_empty());
        assert!(closed.run_protection_tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broker_rejection_releases_budget() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        broker
            .inject_failure(BrokerError::Rejected("insufficient buying power".to_string()))
            .await;
        let engine = engine(test_config(), broker.clone(), PersistenceManager::new(":memory:").unwrap());

        let report = engine.run_scan_tick().await.unwrap();
        assert_eq!(report.rejected, vec![("AAPL".to_string(), ReasonCode::BrokerRejected)]);
        let (daily, _) = engine.risk_summary(dec!(10000)).await;
        assert_eq!(daily.spent_today_usd, Decimal::ZERO);
        assert!(!daily.is_pending("AAPL"));
    }

    #[tokio::test]
    async fn test_unresolved_timeout_is_released_next_tick() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        broker.inject_failure(BrokerError::Timeout(Duration::from_secs(5))).await;
        let engine = engine(test_config(), broker.clone(), PersistenceManager::new(":memory:").unwrap());

        let report = engine.run_scan_tick().await.unwrap();
        assert_eq!(report.rejected, vec![("AAPL".to_string(), ReasonCode::BrokerUnavailable)]);
        let (daily, _) = engine.risk_summary(dec!(10000)).await;
        assert!(daily.is_pending("AAPL"));
        assert_eq!(daily.spent_today_usd, dec!(1000));

        // Nothing reached the broker, so the reservation is given back and the entry retried
        let report = engine.run_scan_tick().await.unwrap();
        assert_eq!(report.accepted.len(), 1);
        assert!(report.rejected.is_empty());

        let (daily, _) = engine.risk_summary(dec!(10000)).await;
        assert!(!daily.is_pending("AAPL"));
        assert_eq!(daily.new_positions_today, 1);
        assert_eq!(daily.spent_today_usd, dec!(1000));
        assert_eq!(broker.get_state().await.positions["AAPL"].qty, dec!(10));
    }

    #[tokio::test]
    async fn test_protection_tick_promotes_break_even() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let engine = engine(test_config(), broker.clone(), PersistenceManager::new(":memory:").unwrap());
        engine.run_scan_tick().await.unwrap();

        // Entry 100, stop 96: 1R at 104
        broker.mark_price("AAPL", dec!(104.5)).await;
        let report = engine.run_protection_tick().await.unwrap().unwrap();
        assert_eq!(report.applied, vec![("AAPL".to_string(), "break_even".to_string())]);

        let protector = engine.protector.lock().await;
        let state = protector.state("AAPL").unwrap();
        assert_eq!(state.stage, ProtectionStage::BreakEven);
        assert_eq!(state.current_stop(), dec!(100.10));
    }

    #[tokio::test]
    async fn test_drivers_stop_on_shutdown() {
        let broker = Arc::new(PaperBroker::new(dec!(10000)));
        let engine = Arc::new(engine(test_config(), broker, PersistenceManager::new(":memory:").unwrap()));
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.shutdown().trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(engine.cycle.load(Ordering::SeqCst) >= 1);
    }
}
